//! Server logging.
//!
//! The server is silent unless a subscriber is installed. `gpioctl debug`
//! logs to stderr; a detached server logs to a [`LogFile`] when `--log-file`
//! is given, since its stdio points at `/dev/null`.
//!
//! # Example
//!
//! ```rust,no_run
//! use gpioctl::logging::init_logging;
//!
//! fn main() -> anyhow::Result<()> {
//!     init_logging()?;
//!
//!     tracing::info!("Server started");
//!     Ok(())
//! }
//! ```

use anyhow::{Context, Result};
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

/// Expand `~` in a path to the home directory.
pub fn expand_path(path: &Path) -> PathBuf {
    let path_str = path.to_string_lossy();
    let expanded = shellexpand::tilde(&path_str);
    PathBuf::from(expanded.as_ref())
}

/// Where a detached server writes its log.
///
/// The path is made absolute on construction, because the detached process
/// runs from `/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFile {
    path: PathBuf,
    rotate: bool,
}

impl LogFile {
    /// Append to `path` (supports `~` expansion).
    pub fn new(path: impl AsRef<Path>) -> Self {
        let path = expand_path(path.as_ref());
        let path = if path.is_relative() {
            std::env::current_dir()
                .map(|cwd| cwd.join(&path))
                .unwrap_or(path)
        } else {
            path
        };
        Self {
            path,
            rotate: false,
        }
    }

    /// Rotate daily, keeping older logs as `<name>.YYYY-MM-DD`.
    pub fn rotating(mut self, rotate: bool) -> Self {
        self.rotate = rotate;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn rotate(&self) -> bool {
        self.rotate
    }

    /// Create the log location and check it is writable.
    ///
    /// The launcher calls this before detaching, while it can still report
    /// the failure.
    pub fn prepare(&self) -> Result<()> {
        if self.rotate {
            rotating_appender(&self.path).map(drop)
        } else {
            open_log_file(&self.path).map(drop)
        }
    }

    /// Install the global subscriber for this log.
    pub fn init(&self) -> Result<()> {
        if self.rotate {
            init_file_logging_with_rotation(&self.path)
        } else {
            init_file_logging(&self.path)
        }
    }
}

/// Log to stderr for a foreground server. `RUST_LOG` overrides the default
/// `debug` level.
pub fn init_logging() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"));

    let subscriber = tracing_subscriber::registry().with(filter).with(
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
            .with_thread_ids(false),
    );

    tracing::subscriber::set_global_default(subscriber).context("Failed to set subscriber")?;

    Ok(())
}

fn open_log_file(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).context("Failed to create log directory")?;
    }

    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open log file {}", path.display()))
}

/// Append logs to `path` (supports `~` expansion), creating parent
/// directories as needed.
pub fn init_file_logging(path: &Path) -> Result<()> {
    let file = open_log_file(&expand_path(path))?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let subscriber = tracing_subscriber::registry().with(filter).with(
        fmt::layer()
            .with_writer(file)
            .with_ansi(false)
            .with_target(true)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false),
    );

    tracing::subscriber::set_global_default(subscriber).context("Failed to set subscriber")?;

    Ok(())
}

#[cfg(feature = "log-rotation")]
fn rotating_appender(path: &Path) -> Result<tracing_appender::rolling::RollingFileAppender> {
    use tracing_appender::rolling::{RollingFileAppender, Rotation};

    let dir = path.parent().unwrap_or(Path::new("."));
    let name = path.file_name().context("Log file path has no file name")?;
    fs::create_dir_all(dir).context("Failed to create log directory")?;

    RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(name.to_string_lossy().into_owned())
        .build(dir)
        .with_context(|| format!("Failed to open log file {}", path.display()))
}

#[cfg(not(feature = "log-rotation"))]
fn rotating_appender(_path: &Path) -> Result<std::convert::Infallible> {
    anyhow::bail!("Log rotation needs gpioctl built with the `log-rotation` feature")
}

/// Initialize file logging with rotation (daily).
///
/// Similar to `init_file_logging` but rotates the file daily. Older logs
/// are kept as `<name>.YYYY-MM-DD` next to it.
#[cfg(feature = "log-rotation")]
pub fn init_file_logging_with_rotation(path: &Path) -> Result<()> {
    let file_appender = rotating_appender(&expand_path(path))?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let subscriber = tracing_subscriber::registry().with(filter).with(
        fmt::layer()
            .with_writer(file_appender)
            .with_ansi(false)
            .with_target(true),
    );

    tracing::subscriber::set_global_default(subscriber).context("Failed to set subscriber")?;

    Ok(())
}

#[cfg(not(feature = "log-rotation"))]
pub fn init_file_logging_with_rotation(path: &Path) -> Result<()> {
    rotating_appender(path).map(drop)
}
