//! Daemon lifecycle utilities.
//!
//! Helpers for naming the per-user socket, connecting to a running server,
//! and starting a detached one on demand.

use anyhow::{bail, Context, Result};
use daemonize::{Daemonize, Outcome};
use std::ffi::CString;
use std::io;
use std::os::linux::net::SocketAddrExt;
use std::os::unix::net::{SocketAddr, UnixStream};

use crate::backend::LineBackend;
use crate::logging::LogFile;
use crate::server::{GpioctlServer, ServerConfig};

/// Name the detached server gives its process.
pub const SERVER_PROCESS_NAME: &str = "gpioctl server";

/// Abstract socket name for a user. Each user gets an independent daemon.
pub fn socket_name_for(uid: u32) -> String {
    format!("gpioctl-{}", uid)
}

/// Abstract socket name for the real user running this process.
pub fn default_socket_name() -> String {
    socket_name_for(nix::unistd::getuid().as_raw())
}

/// Connect to the server on `socket_name`.
///
/// # Returns
/// * `Ok(Some(stream))` - A server accepted the connection
/// * `Ok(None)` - Nothing is listening on the address
/// * `Err(_)` - Any other connection failure
pub fn try_connect(socket_name: &str) -> io::Result<Option<UnixStream>> {
    let addr = SocketAddr::from_abstract_name(socket_name.as_bytes())?;
    match UnixStream::connect_addr(&addr) {
        Ok(stream) => Ok(Some(stream)),
        Err(e) if matches!(e.raw_os_error(), Some(libc::ENOENT | libc::ECONNREFUSED)) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Start a detached server on the configured address.
///
/// The socket is bound and listening before the process detaches, so the
/// server is ready once this returns. The detached process is reparented
/// away from the caller's session, has its stdio on `/dev/null`, and logs to
/// `log_file` if one is given. A log file that cannot be opened fails here,
/// before anything is spawned.
///
/// Returns `Ok(())` in the launcher. The detached process never returns.
pub fn start_server<B: LineBackend>(
    config: ServerConfig,
    backend: B,
    log_file: Option<&LogFile>,
) -> Result<()> {
    if let Some(log_file) = log_file {
        log_file.prepare().context("Failed to set up the server log")?;
    }

    let server = match GpioctlServer::bind(config, backend) {
        Ok(server) => server,
        Err(e) if is_addr_in_use(&e) => {
            tracing::debug!("Another server won the race to bind the socket");
            return Ok(());
        }
        Err(e) => return Err(e),
    };

    match Daemonize::new().working_directory("/").execute() {
        Outcome::Parent(Ok(_)) => {
            // The detached child holds its own copy of the listening socket.
            drop(server);
            Ok(())
        }
        Outcome::Parent(Err(e)) => Err(e).context("Failed to spawn the server process"),
        Outcome::Child(Ok(_)) => run_detached(server, log_file),
        Outcome::Child(Err(_)) => std::process::exit(1),
    }
}

fn run_detached<B: LineBackend>(server: GpioctlServer<B>, log_file: Option<&LogFile>) -> ! {
    set_process_name(SERVER_PROCESS_NAME);

    if let Some(log_file) = log_file {
        if log_file.init().is_err() {
            std::process::exit(1);
        }
    }

    match server.serve() {
        Ok(_) => std::process::exit(0),
        Err(e) => {
            let message = format!("{:#}", e);
            tracing::error!(error = %message, "gpioctl server failed");
            std::process::exit(1)
        }
    }
}

/// Connect to the server, starting one first if none is listening.
///
/// `make_backend` is only called when a server has to be spawned. A failure
/// to connect after a successful spawn is fatal.
pub fn connect_or_spawn<B, F>(
    config: &ServerConfig,
    make_backend: F,
    log_file: Option<&LogFile>,
) -> Result<UnixStream>
where
    B: LineBackend,
    F: FnOnce() -> B,
{
    let socket_name = config.socket_name();
    if let Some(stream) = try_connect(socket_name).context("Failed to connect to server")? {
        return Ok(stream);
    }

    tracing::debug!(socket = socket_name, "No server running, starting one");
    start_server(config.clone(), make_backend(), log_file)?;

    match try_connect(socket_name).context("Failed to connect to server")? {
        Some(stream) => Ok(stream),
        None => bail!("Failed to connect to server: server did not start"),
    }
}

fn is_addr_in_use(err: &anyhow::Error) -> bool {
    err.chain()
        .filter_map(|cause| cause.downcast_ref::<io::Error>())
        .any(|io_err| io_err.kind() == io::ErrorKind::AddrInUse)
}

/// Set the kernel's name for the calling thread (shown by `ps` and `top`).
fn set_process_name(name: &str) {
    if let Ok(name) = CString::new(name) {
        // PR_SET_NAME copies at most 16 bytes including the terminator.
        unsafe {
            libc::prctl(libc::PR_SET_NAME, name.as_ptr() as libc::c_ulong, 0, 0, 0);
        }
    }
}
