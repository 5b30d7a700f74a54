//! gpioctl client for talking to the daemon.
//!
//! Every operation is one exchange: send a message, wait a bounded time for
//! exactly one reply, check that it is the reply kind this operation expects.

use std::io;
use std::os::unix::net::UnixStream;
use std::time::Duration;

use crate::backend::{CdevBackend, LineBackend};
use crate::error::ClientError;
use crate::lifecycle;
use crate::logging::LogFile;
use crate::protocol::{self, LineRequestSpec, Message, MessageKind, RequestId};
use crate::server::ServerConfig;

/// How long a client waits for the server's reply.
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(10);

/// gpioctl client bound to one connection.
///
/// # Example
///
/// ```rust,no_run
/// use gpioctl::{GpioctlClient, LineRequestSpec};
///
/// // Connects to the current user's daemon, starting it if necessary.
/// let mut client = GpioctlClient::connect_or_spawn(&Default::default())?;
/// let spec = LineRequestSpec::new("/dev/gpiochip0", vec![2, 5])?.with_output_values(vec![1, 0])?;
/// let id = client.request(&spec)?;
/// println!("holding lines as {id}");
/// # Ok::<(), anyhow::Error>(())
/// ```
pub struct GpioctlClient {
    stream: UnixStream,
    timeout: Duration,
}

/// Client settings.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server settings, used to find the socket and to spawn a server.
    pub server: ServerConfig,
    pub timeout: Duration,
    /// Log for a server spawned by this client.
    pub log_file: Option<LogFile>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::new(lifecycle::default_socket_name()),
            timeout: DEFAULT_REPLY_TIMEOUT,
            log_file: None,
        }
    }
}

impl ClientConfig {
    pub fn new(server: ServerConfig) -> Self {
        Self {
            server,
            ..Default::default()
        }
    }

    /// Set the reply timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Log for a spawned server.
    pub fn with_log_file(mut self, log_file: LogFile) -> Self {
        self.log_file = Some(log_file);
        self
    }
}

impl GpioctlClient {
    /// Wrap an already connected stream.
    pub fn new(stream: UnixStream) -> Self {
        Self {
            stream,
            timeout: DEFAULT_REPLY_TIMEOUT,
        }
    }

    /// Connect to a running server; fails if none is listening.
    pub fn connect(socket_name: &str) -> Result<Self, ClientError> {
        match lifecycle::try_connect(socket_name).map_err(ClientError::Connect)? {
            Some(stream) => Ok(Self::new(stream)),
            None => Err(ClientError::Connect(io::Error::from_raw_os_error(libc::ECONNREFUSED))),
        }
    }

    /// Connect, spawning a detached server backed by the GPIO character
    /// device if none is listening.
    pub fn connect_or_spawn(config: &ClientConfig) -> anyhow::Result<Self> {
        Self::connect_or_spawn_with(config, CdevBackend::new)
    }

    /// Like [`GpioctlClient::connect_or_spawn`] with a custom backend for the
    /// spawned server.
    pub fn connect_or_spawn_with<B, F>(
        config: &ClientConfig,
        make_backend: F,
    ) -> anyhow::Result<Self>
    where
        B: LineBackend,
        F: FnOnce() -> B,
    {
        let log_file = config.log_file.as_ref();
        let stream = lifecycle::connect_or_spawn(&config.server, make_backend, log_file)?;
        Ok(Self::new(stream).with_timeout(config.timeout))
    }

    /// Set the reply timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Check the server is alive.
    pub fn ping(&mut self) -> Result<(), ClientError> {
        self.exchange_expect(&Message::Ping, MessageKind::Ok).map(drop)
    }

    /// Ask the server to release everything and exit.
    pub fn stop(&mut self) -> Result<(), ClientError> {
        self.exchange_expect(&Message::Stop, MessageKind::Ok).map(drop)
    }

    /// Have the server acquire and hold `spec`'s lines.
    pub fn request(&mut self, spec: &LineRequestSpec) -> Result<RequestId, ClientError> {
        match self.exchange_expect(&Message::Request(spec.clone()), MessageKind::ReqOk)? {
            Message::ReqOk(id) => Ok(id),
            other => Err(ClientError::UnexpectedReply(other.kind())),
        }
    }

    /// Release a request previously returned by [`GpioctlClient::request`].
    pub fn release(&mut self, id: &RequestId) -> Result<(), ClientError> {
        self.exchange_expect(&Message::Release(id.clone()), MessageKind::Ok)
            .map(drop)
    }

    /// Send one message and wait for one reply.
    pub fn exchange(&mut self, msg: &Message) -> Result<Message, ClientError> {
        self.stream.set_read_timeout(Some(self.timeout))?;
        self.stream.set_write_timeout(Some(self.timeout))?;

        protocol::write_message(&mut self.stream, msg)?;

        protocol::read_message(&mut self.stream).map_err(|e| match e.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => ClientError::Timeout,
            io::ErrorKind::UnexpectedEof => ClientError::Disconnected,
            _ => ClientError::Io(e),
        })
    }

    fn exchange_expect(
        &mut self,
        msg: &Message,
        expected: MessageKind,
    ) -> Result<Message, ClientError> {
        match self.exchange(msg)? {
            Message::Error { errno } => {
                Err(ClientError::Server(io::Error::from_raw_os_error(errno)))
            }
            reply if reply.kind() == expected => Ok(reply),
            reply => Err(ClientError::UnexpectedReply(reply.kind())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn scripted_server(reply: Option<Message>) -> (GpioctlClient, thread::JoinHandle<Message>) {
        let (client_side, mut server_side) = UnixStream::pair().unwrap();
        let handle = thread::spawn(move || {
            let received = protocol::read_message(&mut server_side).unwrap();
            match reply {
                Some(reply) => protocol::write_message(&mut server_side, &reply).unwrap(),
                // Keep the socket open past the client's timeout.
                None => thread::sleep(Duration::from_millis(300)),
            }
            received
        });
        (GpioctlClient::new(client_side), handle)
    }

    #[test]
    fn test_ping_ok() {
        let (mut client, server) = scripted_server(Some(Message::Ok));
        client.ping().unwrap();
        assert_eq!(server.join().unwrap(), Message::Ping);
    }

    #[test]
    fn test_error_reply_carries_errno() {
        let (mut client, _server) = scripted_server(Some(Message::Error { errno: libc::EBUSY }));
        let spec = LineRequestSpec::new("/dev/gpiochip0", vec![1]).unwrap();
        let err = client.request(&spec).unwrap_err();
        assert_eq!(err.errno(), Some(libc::EBUSY));
    }

    #[test]
    fn test_unexpected_reply_is_fatal() {
        let (mut client, _server) = scripted_server(Some(Message::Ping));
        assert!(matches!(
            client.stop(),
            Err(ClientError::UnexpectedReply(MessageKind::Ping))
        ));
    }

    #[test]
    fn test_request_returns_id() {
        let id = RequestId::new("req-9").unwrap();
        let (mut client, server) = scripted_server(Some(Message::ReqOk(id.clone())));
        let spec = LineRequestSpec::new("/dev/gpiochip0", vec![2, 5]).unwrap();
        assert_eq!(client.request(&spec).unwrap(), id);
        assert_eq!(server.join().unwrap(), Message::Request(spec));
    }

    #[test]
    fn test_reply_timeout() {
        let (client, _server) = scripted_server(None);
        let mut client = client.with_timeout(Duration::from_millis(50));
        assert!(matches!(client.ping(), Err(ClientError::Timeout)));
    }

    #[test]
    fn test_server_hangup_without_reply() {
        let (client_side, server_side) = UnixStream::pair().unwrap();
        drop(server_side);
        let mut client = GpioctlClient::new(client_side);
        assert!(client.ping().is_err());
    }

    #[test]
    fn test_connect_without_server() {
        let name = format!("gpioctl-test-noclient-{}", std::process::id());
        assert!(matches!(
            GpioctlClient::connect(&name),
            Err(ClientError::Connect(_))
        ));
    }
}
