//! gpioctl server implementation.
//!
//! The [`GpioctlServer`] owns every live line request on behalf of clients
//! that may have exited long ago. It runs a single-threaded epoll loop over
//! the listening socket, each client socket, a signalfd and the idle timer.
//! Handlers run to completion one event at a time, so the registries need no
//! locking.

use anyhow::{Context, Result};
use nix::errno::Errno;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use nix::sys::signal::Signal;
use nix::sys::socket::{getsockopt, sockopt};
use nix::unistd::{Uid, User};
use std::fmt;
use std::io::{self, Read};
use std::os::linux::net::SocketAddrExt;
use std::os::unix::net::{SocketAddr, UnixListener, UnixStream};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::backend::LineBackend;
use crate::idle::{IdleTimer, IdleTransition, DEFAULT_IDLE_TIMEOUT};
use crate::protocol::{self, LineRequestSpec, Message, RequestId, MESSAGE_SIZE};
use crate::receiver::{ClientId, Receiver};
use crate::registry::{
    ClientRegistry, ClientSession, LineRequestRecord, PeerIdentity, RequestRegistry,
};
use crate::signals::SignalSource;

const MAX_EPOLL_EVENTS: usize = 16;

/// Server settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    socket_name: String,
    idle_timeout: Duration,
}

impl ServerConfig {
    /// Settings for a server listening on the abstract address `socket_name`.
    pub fn new(socket_name: impl Into<String>) -> Self {
        Self {
            socket_name: socket_name.into(),
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }

    /// Set how long the server may sit unused before it exits.
    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn socket_name(&self) -> &str {
        &self.socket_name
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }
}

/// Why the event loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// A client sent STOP.
    StopRequested,
    /// SIGINT, SIGTERM or SIGQUIT arrived.
    Signal(Signal),
    /// Nothing used the server for a whole idle period.
    IdleTimeout,
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownReason::StopRequested => f.write_str("stop requested by client"),
            ShutdownReason::Signal(signal) => write!(f, "signal {}", signal),
            ShutdownReason::IdleTimeout => f.write_str("idle timer expired"),
        }
    }
}

/// gpioctl daemon server.
///
/// Binding and serving are separate steps: [`GpioctlServer::bind`] leaves the
/// socket listening, so a launcher can confirm readiness before it detaches
/// the process that later calls [`GpioctlServer::serve`].
///
/// # Example
///
/// ```rust,no_run
/// use gpioctl::{CdevBackend, GpioctlServer, ServerConfig};
///
/// let server = GpioctlServer::bind(ServerConfig::new("gpioctl-1000"), CdevBackend::new())?;
/// let reason = server.serve()?;
/// println!("server exited: {reason}");
/// # Ok::<(), anyhow::Error>(())
/// ```
pub struct GpioctlServer<B: LineBackend> {
    config: ServerConfig,
    listener: UnixListener,
    backend: B,
}

impl<B: LineBackend> GpioctlServer<B> {
    /// Bind and listen on the configured abstract address.
    ///
    /// Fails with `AddrInUse` if another server already owns the address.
    pub fn bind(config: ServerConfig, backend: B) -> Result<Self> {
        let addr = SocketAddr::from_abstract_name(config.socket_name.as_bytes())
            .context("Invalid server socket name")?;
        let listener = UnixListener::bind_addr(&addr)
            .with_context(|| format!("Failed to bind to the unix socket @{}", config.socket_name))?;

        Ok(Self {
            config,
            listener,
            backend,
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Serve until STOP, a terminating signal, or idle expiry, then release
    /// every client and every held request.
    ///
    /// Errors are environment failures (epoll, signalfd, timerfd) and are
    /// fatal to the process.
    pub fn serve(self) -> Result<ShutdownReason> {
        let mut event_loop = EventLoop::new(self)?;

        info!(
            socket = %event_loop.socket_name,
            idle_timeout_ms = event_loop.idle.period().as_millis() as u64,
            pid = std::process::id(),
            "gpioctl server started"
        );

        let stop = event_loop.run()?;
        let reason = event_loop.drain(stop);

        info!(reason = %reason, "gpioctl server stopped");
        Ok(reason)
    }
}

#[derive(Debug, Clone, Copy)]
enum Stop {
    Requested(ClientId),
    Signal(Signal),
    Idle,
}

struct EventLoop<B: LineBackend> {
    socket_name: String,
    listener: Option<UnixListener>,
    epoll: Epoll,
    signals: SignalSource,
    idle: IdleTimer,
    clients: ClientRegistry,
    requests: RequestRegistry<B::Handle>,
    backend: B,
    stop: Option<Stop>,
}

impl<B: LineBackend> EventLoop<B> {
    fn new(server: GpioctlServer<B>) -> Result<Self> {
        let GpioctlServer {
            config,
            listener,
            backend,
        } = server;

        listener
            .set_nonblocking(true)
            .context("Failed to make the server socket non-blocking")?;

        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)
            .context("Failed to create the epoll handle")?;
        let signals = SignalSource::new().context("Failed to set up signal handling")?;
        let idle = IdleTimer::new(config.idle_timeout).context("Failed to create the idle timer")?;

        epoll
            .add(&listener, readable(Receiver::Listener))
            .context("Failed to add the server socket to the epoll set")?;
        epoll
            .add(&signals, readable(Receiver::Signals))
            .context("Failed to add the signalfd to the epoll set")?;
        epoll
            .add(&idle, readable(Receiver::IdleTimer))
            .context("Failed to add the idle timer to the epoll set")?;

        Ok(Self {
            socket_name: config.socket_name,
            listener: Some(listener),
            epoll,
            signals,
            idle,
            clients: ClientRegistry::new(),
            requests: RequestRegistry::new(),
            backend,
            stop: None,
        })
    }

    /// Clients plus live requests.
    fn use_count(&self) -> usize {
        self.clients.len() + self.requests.len()
    }

    fn run(&mut self) -> Result<Stop> {
        let mut events = [EpollEvent::empty(); MAX_EPOLL_EVENTS];

        loop {
            if let Some(stop) = self.stop {
                return Ok(stop);
            }

            match self.idle.update(self.use_count()).context("Failed to update the idle timer")? {
                IdleTransition::Armed => debug!("Server is now idle, arming the idle timer"),
                IdleTransition::Disarmed => {
                    debug!("Server is now active, disarming the idle timer")
                }
                IdleTransition::Unchanged => {}
            }

            let ready = match self.epoll.wait(&mut events, EpollTimeout::NONE) {
                Ok(ready) => ready,
                Err(Errno::EINTR) => continue,
                Err(err) => return Err(err).context("Failed to poll file descriptors"),
            };

            for event in &events[..ready] {
                if self.stop.is_some() {
                    break;
                }
                match Receiver::from_token(event.data()) {
                    Some(Receiver::Listener) => self.accept_client(),
                    Some(Receiver::Signals) => self.signal_receive()?,
                    Some(Receiver::IdleTimer) => self.timer_receive()?,
                    Some(Receiver::Client(id)) => self.client_receive(id, event.events()),
                    None => warn!(token = event.data(), "Event for unknown receiver"),
                }
            }
        }
    }

    fn accept_client(&mut self) {
        let Some(listener) = &self.listener else {
            return;
        };

        let stream = match listener.accept() {
            Ok((stream, _)) => stream,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
            Err(e) => {
                warn!(error = %e, "Failed to accept client connection");
                return;
            }
        };

        let peer = match peer_identity(&stream) {
            Ok(peer) => peer,
            Err(e) => {
                warn!(error = %e, "Failed to get credentials from connected client");
                return;
            }
        };

        if let Err(e) = stream.set_nonblocking(true) {
            warn!(error = %e, pid = peer.pid, "Failed to configure client socket");
            return;
        }

        info!(pid = peer.pid, uid = peer.uid, user = %peer.user, "Accepted connection");

        let id = self.clients.insert(ClientSession::new(stream, peer));
        let registered = match self.clients.get(id) {
            Some(session) => self.epoll.add(session.stream(), readable(Receiver::Client(id))),
            None => return,
        };
        if let Err(e) = registered {
            warn!(error = %e, client = %id, "Failed to add the receiver to the epoll set");
            self.clients.remove(id);
        }
    }

    fn signal_receive(&mut self) -> Result<()> {
        if let Some(signal) = self.signals.drain().context("Failed to receive signal info")? {
            info!(signal = %signal, "Signal received");
            self.stop = Some(Stop::Signal(signal));
        }
        Ok(())
    }

    fn timer_receive(&mut self) -> Result<()> {
        if !self.idle.acknowledge().context("Failed to read timer data")? {
            return Ok(());
        }
        if self.use_count() == 0 {
            info!("Idle timer expired");
            self.stop = Some(Stop::Idle);
        }
        Ok(())
    }

    fn client_receive(&mut self, id: ClientId, flags: EpollFlags) {
        let Some(session) = self.clients.get(id) else {
            return;
        };
        let pid = session.peer().pid;

        let mut buf = [0u8; MESSAGE_SIZE];
        let mut stream = session.stream();
        let msg = match stream.read(&mut buf) {
            Ok(0) => {
                info!(pid, "Process hang up");
                self.drop_client(id);
                return;
            }
            Ok(n) => Message::decode(&buf[..n]),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                if flags.intersects(EpollFlags::EPOLLHUP | EpollFlags::EPOLLERR) {
                    info!(pid, "Process hang up");
                    self.drop_client(id);
                }
                return;
            }
            Err(e) => {
                warn!(error = %e, pid, "Failed to receive client data");
                self.drop_client(id);
                return;
            }
        };

        match msg {
            Ok(Message::Ping) => {
                debug!(pid, "Ping request received from client");
                self.reply(id, &Message::Ok);
            }
            Ok(Message::Stop) => {
                info!(pid, "Stop request received from client, exiting");
                self.stop = Some(Stop::Requested(id));
            }
            Ok(Message::Request(spec)) => self.handle_line_request(id, pid, &spec),
            Ok(Message::Release(request_id)) => self.handle_release(id, pid, &request_id),
            Ok(other) => {
                warn!(pid, kind = %other.kind(), "Unexpected message type received from client");
                self.drop_client(id);
            }
            Err(e) => {
                warn!(pid, error = %e, "Malformed message received from client");
                self.drop_client(id);
            }
        }
    }

    fn handle_line_request(&mut self, client: ClientId, pid: i32, spec: &LineRequestSpec) {
        debug!(
            pid,
            chip = spec.chip_path(),
            offsets = ?spec.offsets(),
            output = spec.output(),
            "Handling line request"
        );

        match self.backend.request_lines(spec) {
            Ok(handle) => {
                let offsets = spec.offsets().to_vec();
                let record = LineRequestRecord::new(handle, spec.chip_path(), offsets, pid);
                let request_id = self.requests.insert(record);
                info!(
                    pid,
                    request = %request_id,
                    chip = spec.chip_path(),
                    offsets = ?spec.offsets(),
                    "Lines requested"
                );
                self.reply(client, &Message::ReqOk(request_id));
            }
            Err(e) => {
                warn!(pid, error = %e, "Line request failed, sending back error response");
                self.reply(client, &Message::error_from(&e));
            }
        }
    }

    fn handle_release(&mut self, client: ClientId, pid: i32, request_id: &RequestId) {
        match self.requests.remove(request_id) {
            Some(record) => {
                info!(
                    pid,
                    request = %request_id,
                    chip = %record.chip_path,
                    offsets = ?record.offsets,
                    "Lines released"
                );
                drop(record.into_handle());
                self.reply(client, &Message::Ok);
            }
            None => {
                warn!(pid, request = %request_id, "Release of unknown request");
                self.reply(client, &Message::Error { errno: libc::ENOENT });
            }
        }
    }

    /// Send one message to a client; a failed send drops the session.
    fn reply(&mut self, id: ClientId, msg: &Message) {
        let Some(session) = self.clients.get(id) else {
            return;
        };
        let mut stream = session.stream();
        if let Err(e) = protocol::write_message(&mut stream, msg) {
            warn!(error = %e, pid = session.peer().pid, "Failed to send data to client");
            self.drop_client(id);
        }
    }

    fn drop_client(&mut self, id: ClientId) {
        if let Some(session) = self.clients.remove(id) {
            if let Err(e) = self.epoll.delete(session.stream()) {
                error!(
                    error = %e,
                    client = %id,
                    "Failed to remove the receiver from the epoll set"
                );
            }
            debug!(
                pid = session.peer().pid,
                connected_ms = session.connected_ms(),
                "Client dropped"
            );
        }
    }

    /// Tear everything down. The listener goes first so nobody can connect
    /// to a server that is going away; a client that sent STOP gets its OK
    /// only after every request is released and every other client dropped.
    fn drain(mut self, stop: Stop) -> ShutdownReason {
        info!(
            clients = self.clients.len(),
            requests = self.requests.len(),
            "gpioctl server exiting"
        );

        if let Some(listener) = self.listener.take() {
            let _ = self.epoll.delete(&listener);
        }

        for (request_id, record) in self.requests.drain() {
            debug!(
                request = %request_id,
                chip = %record.chip_path,
                offsets = ?record.offsets,
                owner_pid = record.owner_pid,
                "Releasing lines"
            );
            drop(record.into_handle());
        }

        let stopper = match stop {
            Stop::Requested(id) => Some(id),
            Stop::Signal(_) | Stop::Idle => None,
        };
        for id in self.clients.ids() {
            if Some(id) != stopper {
                self.drop_client(id);
            }
        }
        if let Some(id) = stopper {
            self.reply(id, &Message::Ok);
            self.drop_client(id);
        }

        match stop {
            Stop::Requested(_) => ShutdownReason::StopRequested,
            Stop::Signal(signal) => ShutdownReason::Signal(signal),
            Stop::Idle => ShutdownReason::IdleTimeout,
        }
    }
}

fn readable(rcv: Receiver) -> EpollEvent {
    EpollEvent::new(EpollFlags::EPOLLIN, rcv.token())
}

/// Resolve the connecting process from kernel peer credentials.
fn peer_identity(stream: &UnixStream) -> io::Result<PeerIdentity> {
    let creds = getsockopt(stream, sockopt::PeerCredentials)?;
    let user = User::from_uid(Uid::from_raw(creds.uid()))?
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("no user with uid {}", creds.uid()),
            )
        })?;

    Ok(PeerIdentity {
        pid: creds.pid(),
        uid: creds.uid(),
        user: user.name,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder() {
        let config = ServerConfig::new("gpioctl-test").with_idle_timeout(Duration::from_secs(5));
        assert_eq!(config.socket_name(), "gpioctl-test");
        assert_eq!(config.idle_timeout(), Duration::from_secs(5));
        assert_eq!(ServerConfig::new("x").idle_timeout(), DEFAULT_IDLE_TIMEOUT);
    }

    #[test]
    fn test_shutdown_reason_display() {
        assert_eq!(ShutdownReason::IdleTimeout.to_string(), "idle timer expired");
        assert_eq!(
            ShutdownReason::Signal(Signal::SIGTERM).to_string(),
            "signal SIGTERM"
        );
    }

    #[test]
    fn test_peer_identity_of_self() {
        let (a, _b) = UnixStream::pair().unwrap();
        let peer = peer_identity(&a).unwrap();
        assert_eq!(peer.pid as u32, std::process::id());
        assert_eq!(peer.uid, nix::unistd::getuid().as_raw());
        assert!(!peer.user.is_empty());
    }
}
