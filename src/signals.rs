//! Termination signals delivered through a signalfd.
//!
//! SIGINT, SIGTERM and SIGQUIT are blocked in the serving thread so they
//! queue on the descriptor instead of killing the process. The event loop
//! reads them like any other readiness event.

use nix::sys::signal::{SigSet, Signal};
use nix::sys::signalfd::{SfdFlags, SignalFd};
use std::os::fd::{AsFd, BorrowedFd};

/// Signals that make the server drain and exit.
pub const TERMINATING_SIGNALS: [Signal; 3] = [Signal::SIGINT, Signal::SIGTERM, Signal::SIGQUIT];

pub struct SignalSource {
    fd: SignalFd,
}

impl SignalSource {
    /// Block the terminating signals in this thread and open the signalfd.
    pub fn new() -> nix::Result<Self> {
        let mut mask = SigSet::empty();
        for signal in TERMINATING_SIGNALS {
            mask.add(signal);
        }
        mask.thread_block()?;

        let fd = SignalFd::with_flags(&mask, SfdFlags::SFD_NONBLOCK | SfdFlags::SFD_CLOEXEC)?;
        Ok(Self { fd })
    }

    /// Read every queued signal and return the first terminating one.
    pub fn drain(&mut self) -> nix::Result<Option<Signal>> {
        let mut received = None;
        while let Some(info) = self.fd.read_signal()? {
            let signal = Signal::try_from(info.ssi_signo as i32).ok();
            if received.is_none() && signal.is_some_and(|s| TERMINATING_SIGNALS.contains(&s)) {
                received = signal;
            }
        }
        Ok(received)
    }
}

impl AsFd for SignalSource {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::pthread::{pthread_kill, pthread_self};
    use std::thread;

    #[test]
    fn test_signal_is_queued_not_delivered() {
        // Runs on its own thread so the mask does not leak into the harness.
        thread::spawn(|| {
            let mut source = SignalSource::new().unwrap();
            assert_eq!(source.drain().unwrap(), None);

            pthread_kill(pthread_self(), Signal::SIGTERM).unwrap();
            assert_eq!(source.drain().unwrap(), Some(Signal::SIGTERM));
            assert_eq!(source.drain().unwrap(), None);
        })
        .join()
        .unwrap();
    }
}
