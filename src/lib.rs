//! # gpioctl
//!
//! GPIO control daemon with persistence support.
//!
//! A GPIO line requested through the kernel character device reverts to its
//! default state as soon as the requesting process closes the file
//! descriptor. gpioctl keeps line requests alive in a long-running server so
//! that short-lived command invocations can request lines, exit, and leave
//! the lines driven.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use gpioctl::{ClientConfig, GpioctlClient, LineRequestSpec};
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = ClientConfig::default();
//!
//!     // Starts the per-user server if it is not running yet.
//!     let mut client = GpioctlClient::connect_or_spawn(&config)?;
//!     let spec = LineRequestSpec::new("/dev/gpiochip0", vec![2, 5])?
//!         .with_output_values(vec![1, 1])?;
//!     let id = client.request(&spec)?;
//!
//!     // Lines 2 and 5 stay high after this process exits.
//!     println!("{id}");
//!     Ok(())
//! }
//! ```
//!
//! ## Protocol Overview
//!
//! Clients talk to the server over an abstract UNIX socket named
//! `gpioctl-<uid>`. Each exchange is one fixed-size message from the client
//! followed by one fixed-size reply (see [`protocol`]):
//!
//! | Client sends       | Server replies               |
//! |--------------------|------------------------------|
//! | `PING`             | `OK`                         |
//! | `STOP`             | `OK` after releasing all     |
//! | `REQUEST(lines)`   | `REQ_OK(id)` or `ERROR(errno)` |
//! | `RELEASE(id)`      | `OK` or `ERROR(ENOENT)`      |

pub mod backend;
pub mod cli;
pub mod client;
pub mod error;
pub mod idle;
pub mod lifecycle;
pub mod logging;
pub mod protocol;
pub mod receiver;
pub mod registry;
pub mod resolve;
pub mod server;
pub mod signals;

// Re-exports for convenience
pub use backend::{CdevBackend, LineBackend};
pub use client::{ClientConfig, GpioctlClient};
pub use error::{ClientError, ProtocolError};
pub use lifecycle::{
    connect_or_spawn, default_socket_name, socket_name_for, start_server, try_connect,
};
pub use logging::LogFile;
pub use protocol::{
    LineRequestSpec, Message, MessageKind, RequestId, MAX_REQ_LINES, MESSAGE_SIZE,
};
pub use server::{GpioctlServer, ServerConfig, ShutdownReason};
