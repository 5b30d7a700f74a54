//! Shared fixtures for the server tests: an in-memory GPIO backend and a
//! server running on a background thread.

#![allow(dead_code)]

use std::collections::HashSet;
use std::io;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use gpioctl::protocol::{self, Message};
use gpioctl::{
    GpioctlClient, GpioctlServer, LineBackend, LineRequestSpec, ServerConfig, ShutdownReason,
};

pub const FAKE_CHIP: &str = "/dev/gpiochip-fake";
pub const FAKE_CHIP_LINES: u32 = 8;

type HeldLines = Arc<Mutex<HashSet<(String, u32)>>>;

/// Backend that tracks held lines in memory and fails the way the kernel
/// does: `ENOENT` for a missing chip, `EINVAL` for an offset past the end,
/// `EBUSY` for a line someone already holds.
#[derive(Clone, Default)]
pub struct FakeBackend {
    held: HeldLines,
}

pub struct FakeHandle {
    lines: Vec<(String, u32)>,
    held: HeldLines,
}

impl Drop for FakeHandle {
    fn drop(&mut self) {
        let mut held = self.held.lock().unwrap();
        for line in &self.lines {
            held.remove(line);
        }
    }
}

impl FakeBackend {
    pub fn held(&self) -> usize {
        self.held.lock().unwrap().len()
    }

    pub fn is_held(&self, offset: u32) -> bool {
        self.held.lock().unwrap().contains(&(FAKE_CHIP.to_string(), offset))
    }
}

impl LineBackend for FakeBackend {
    type Handle = FakeHandle;

    fn request_lines(&mut self, spec: &LineRequestSpec) -> io::Result<FakeHandle> {
        if spec.chip_path() != FAKE_CHIP {
            return Err(io::Error::from_raw_os_error(libc::ENOENT));
        }
        if spec.offsets().iter().any(|&o| o >= FAKE_CHIP_LINES) {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }

        let lines: Vec<(String, u32)> = spec
            .offsets()
            .iter()
            .map(|&o| (spec.chip_path().to_string(), o))
            .collect();

        let mut held = self.held.lock().unwrap();
        if lines.iter().any(|line| held.contains(line)) {
            return Err(io::Error::from_raw_os_error(libc::EBUSY));
        }
        held.extend(lines.iter().cloned());

        Ok(FakeHandle {
            lines,
            held: Arc::clone(&self.held),
        })
    }
}

/// A server running on its own thread.
pub struct TestServer {
    pub socket_name: String,
    pub backend: FakeBackend,
    pub handle: JoinHandle<ShutdownReason>,
    pub thread: libc::pthread_t,
}

impl TestServer {
    pub fn client(&self) -> GpioctlClient {
        GpioctlClient::connect(&self.socket_name)
            .unwrap()
            .with_timeout(Duration::from_secs(5))
    }

    pub fn raw(&self) -> UnixStream {
        let stream = gpioctl::try_connect(&self.socket_name).unwrap().unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        stream
    }

    pub fn join(self) -> ShutdownReason {
        self.handle.join().unwrap()
    }
}

fn unique_socket_name(tag: &str) -> String {
    static COUNTER: AtomicUsize = AtomicUsize::new(0);
    format!(
        "gpioctl-test-{}-{}-{}",
        tag,
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::SeqCst)
    )
}

/// Start a server with a long idle timeout.
pub fn start_test_server(tag: &str) -> TestServer {
    start_test_server_with_idle(tag, Duration::from_secs(60))
}

pub fn start_test_server_with_idle(tag: &str, idle_timeout: Duration) -> TestServer {
    let socket_name = unique_socket_name(tag);
    let backend = FakeBackend::default();
    let config = ServerConfig::new(socket_name.clone()).with_idle_timeout(idle_timeout);

    // Bound before the thread starts, so clients can connect right away.
    let server = GpioctlServer::bind(config, backend.clone()).unwrap();

    let (tx, rx) = std::sync::mpsc::channel();
    let handle = thread::spawn(move || {
        tx.send(unsafe { libc::pthread_self() }).unwrap();
        server.serve().unwrap()
    });
    let thread = rx.recv().unwrap();

    TestServer {
        socket_name,
        backend,
        handle,
        thread,
    }
}

pub fn fake_spec(offsets: Vec<u32>) -> LineRequestSpec {
    LineRequestSpec::new(FAKE_CHIP, offsets).unwrap()
}

/// Send one message on a raw stream and read the reply.
pub fn exchange_raw(stream: &mut UnixStream, msg: &Message) -> io::Result<Message> {
    protocol::write_message(stream, msg)?;
    protocol::read_message(stream)
}
