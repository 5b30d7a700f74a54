//! Idle-timeout controller.
//!
//! The daemon exits on its own once it has had no clients and no held
//! requests for a full grace period. The countdown starts when the use-count
//! drops to zero and is cancelled as soon as it rises again.

use nix::errno::Errno;
use nix::sys::time::TimeSpec;
use nix::sys::timerfd::{ClockId, Expiration, TimerFd, TimerFlags, TimerSetTimeFlags};
use std::os::fd::{AsFd, BorrowedFd};
use std::time::Duration;

/// Grace period before an unused daemon exits.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// What [`IdleTimer::update`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleTransition {
    Armed,
    Disarmed,
    Unchanged,
}

/// Decide the timer change for the current use-count.
pub fn next_transition(armed: bool, use_count: usize) -> IdleTransition {
    match (armed, use_count) {
        (false, 0) => IdleTransition::Armed,
        (true, n) if n > 0 => IdleTransition::Disarmed,
        _ => IdleTransition::Unchanged,
    }
}

/// One-shot monotonic timer driven by the use-count.
pub struct IdleTimer {
    timer: TimerFd,
    period: Duration,
    armed: bool,
}

impl IdleTimer {
    /// Create a disarmed timer. A zero period is treated as one millisecond,
    /// since a zero expiration would disarm the timerfd instead.
    pub fn new(period: Duration) -> nix::Result<Self> {
        let period = period.max(Duration::from_millis(1));
        let timer = TimerFd::new(
            ClockId::CLOCK_MONOTONIC,
            TimerFlags::TFD_NONBLOCK | TimerFlags::TFD_CLOEXEC,
        )?;
        Ok(Self {
            timer,
            period,
            armed: false,
        })
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    /// Arm or disarm according to `use_count`.
    pub fn update(&mut self, use_count: usize) -> nix::Result<IdleTransition> {
        let transition = next_transition(self.armed, use_count);
        match transition {
            IdleTransition::Armed => {
                self.timer.set(
                    Expiration::OneShot(TimeSpec::from_duration(self.period)),
                    TimerSetTimeFlags::empty(),
                )?;
                self.armed = true;
            }
            IdleTransition::Disarmed => {
                self.timer.unset()?;
                self.armed = false;
            }
            IdleTransition::Unchanged => {}
        }
        Ok(transition)
    }

    /// Consume a readiness event. Returns `true` if the timer really expired.
    pub fn acknowledge(&mut self) -> nix::Result<bool> {
        match self.timer.wait() {
            Ok(()) => {
                self.armed = false;
                Ok(true)
            }
            Err(Errno::EAGAIN) => Ok(false),
            Err(err) => Err(err),
        }
    }
}

impl AsFd for IdleTimer {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.timer.as_fd()
    }
}
