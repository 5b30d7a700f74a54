//! Command-line surface.
//!
//! Every sub-command except `debug` runs as a client: it connects to the
//! current user's server (spawning one if needed), performs exactly one
//! exchange, and exits.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::backend::CdevBackend;
use crate::client::{ClientConfig, GpioctlClient};
use crate::lifecycle;
use crate::logging::{self, LogFile};
use crate::protocol::{LineRequestSpec, RequestId};
use crate::resolve::{self, ResolveOptions};
use crate::server::{GpioctlServer, ServerConfig};

/// Simple swiss-army knife for controlling GPIOs with persistence support.
///
/// Requested lines stay held by a background server after this command
/// exits, until they are released or the server is stopped.
#[derive(Debug, Parser)]
#[command(name = "gpioctl", version)]
pub struct Cli {
    /// Restrict line lookup to this chip (name, number or path).
    #[arg(short = 'c', long, global = true, value_name = "CHIP")]
    pub chip: Option<String>,

    /// Consumer label for requested lines.
    #[arg(short = 'C', long, global = true, value_name = "NAME")]
    pub consumer: Option<String>,

    /// Treat every line identifier as a name, even if it looks like a number.
    #[arg(short = 'B', long, global = true)]
    pub by_name: bool,

    /// Fail if a line name matches more than one line.
    #[arg(short = 's', long, global = true)]
    pub strict: bool,

    /// Treat requested lines as active-low.
    #[arg(short = 'l', long, global = true)]
    pub active_low: bool,

    /// Print results as JSON.
    #[arg(long, global = true)]
    pub json: bool,

    /// Seconds a spawned server stays alive with nothing to do.
    #[arg(
        long,
        global = true,
        env = "GPIOCTL_IDLE_TIMEOUT",
        value_name = "SECONDS",
        default_value_t = 60
    )]
    pub idle_timeout: u64,

    /// Log file for a spawned server.
    #[arg(long, global = true, env = "GPIOCTL_LOG_FILE", value_name = "PATH")]
    pub log_file: Option<PathBuf>,

    /// Rotate the spawned server's log file daily.
    #[arg(long, global = true, requires = "log_file")]
    pub log_rotate: bool,

    /// Abstract socket name, defaults to gpioctl-<uid>.
    #[arg(long, global = true, env = "GPIOCTL_SOCKET_NAME", hide = true)]
    pub socket_name: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Check that the server answers.
    Ping,
    /// Release every held line and stop the server.
    Stop,
    /// Request a set of GPIO lines.
    Request {
        /// Request the lines as outputs (implied by any LINE=VALUE).
        #[arg(short = 'o', long)]
        output: bool,

        /// Lines by name or offset, optionally with an output value.
        #[arg(required = true, value_name = "LINE[=VALUE]")]
        lines: Vec<LineArg>,
    },
    /// Release a set of requested GPIO lines.
    Release {
        /// Identifier printed by `request`.
        request: RequestId,
    },
    /// Run the server in the foreground with logging to stderr.
    Debug,
}

/// A line identifier with an optional output value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineArg {
    pub line: String,
    pub value: Option<u8>,
}

impl FromStr for LineArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (line, value) = match s.split_once('=') {
            Some((line, value)) => (line, Some(parse_value(value)?)),
            None => (s, None),
        };
        if line.is_empty() {
            return Err(format!("invalid line '{}'", s));
        }
        Ok(Self {
            line: line.to_string(),
            value,
        })
    }
}

fn parse_value(value: &str) -> Result<u8, String> {
    match value {
        "0" | "inactive" | "off" | "false" => Ok(0),
        "1" | "active" | "on" | "true" => Ok(1),
        other => Err(format!("invalid line value '{}'", other)),
    }
}

#[derive(Debug, Serialize)]
struct RequestOutput<'a> {
    request: &'a RequestId,
    #[serde(flatten)]
    spec: &'a LineRequestSpec,
}

#[derive(Debug, Serialize)]
struct StatusOutput<'a> {
    command: &'a str,
    ok: bool,
}

impl Cli {
    pub fn server_config(&self) -> ServerConfig {
        let name = self
            .socket_name
            .clone()
            .unwrap_or_else(lifecycle::default_socket_name);
        ServerConfig::new(name).with_idle_timeout(Duration::from_secs(self.idle_timeout))
    }

    pub fn client_config(&self) -> ClientConfig {
        let config = ClientConfig::new(self.server_config());
        match &self.log_file {
            Some(path) => config.with_log_file(LogFile::new(path).rotating(self.log_rotate)),
            None => config,
        }
    }

    /// Build the request for `lines` from the global options.
    pub fn line_request(&self, output: bool, lines: &[LineArg]) -> Result<LineRequestSpec> {
        let ids: Vec<String> = lines.iter().map(|l| l.line.clone()).collect();
        let resolved = resolve::resolve_lines(
            &ids,
            ResolveOptions {
                chip: self.chip.as_deref(),
                by_name: self.by_name,
                strict: self.strict,
            },
        )?;

        self.build_spec(resolved.chip_path, resolved.offsets, output, lines)
    }

    fn build_spec(
        &self,
        chip_path: String,
        offsets: Vec<u32>,
        output: bool,
        lines: &[LineArg],
    ) -> Result<LineRequestSpec> {
        let mut spec = LineRequestSpec::new(chip_path, offsets)?.with_active_low(self.active_low);
        if let Some(consumer) = &self.consumer {
            spec = spec.with_consumer(consumer.as_str())?;
        }
        if output || lines.iter().any(|l| l.value.is_some()) {
            let values = lines.iter().map(|l| l.value.unwrap_or(0)).collect();
            spec = spec.with_output_values(values)?;
        }
        Ok(spec)
    }

    fn print_status(&self, command: &str) -> Result<()> {
        if self.json {
            println!("{}", serde_json::to_string(&StatusOutput { command, ok: true })?);
        }
        Ok(())
    }
}

/// Execute the parsed command line.
pub fn run(cli: &Cli) -> Result<()> {
    match &cli.command {
        Command::Debug => debug_main(cli),
        Command::Ping => {
            connect(cli)?.ping()?;
            cli.print_status("ping")
        }
        Command::Stop => {
            connect(cli)?.stop()?;
            cli.print_status("stop")
        }
        Command::Request { output, lines } => request_main(cli, *output, lines),
        Command::Release { request } => {
            connect(cli)?.release(request)?;
            cli.print_status("release")
        }
    }
}

fn connect(cli: &Cli) -> Result<GpioctlClient> {
    GpioctlClient::connect_or_spawn(&cli.client_config())
}

fn request_main(cli: &Cli, output: bool, lines: &[LineArg]) -> Result<()> {
    let spec = cli.line_request(output, lines)?;
    let request = connect(cli)?.request(&spec)?;

    if cli.json {
        let out = RequestOutput {
            request: &request,
            spec: &spec,
        };
        println!("{}", serde_json::to_string(&out)?);
    } else {
        println!("{}", request);
    }
    Ok(())
}

fn debug_main(cli: &Cli) -> Result<()> {
    logging::init_logging()?;

    let config = cli.server_config();
    let server = GpioctlServer::bind(config, CdevBackend::new())?;
    let reason = server.serve().context("gpioctl server failed")?;
    if cli.json {
        println!("{}", serde_json::json!({ "stopped": reason.to_string() }));
    }
    Ok(())
}

/// Reject flag combinations clap cannot express.
pub fn validate(cli: &Cli) -> Result<()> {
    if cli.idle_timeout == 0 {
        bail!("idle timeout must be at least one second");
    }
    Ok(())
}
