//! Event sources multiplexed by the server's epoll set.
//!
//! Each registered file descriptor carries a `u64` token. The token encodes
//! which [`Receiver`] produced the readiness event so the loop can dispatch
//! with a plain `match`.

use std::fmt;

const TOKEN_LISTENER: u64 = 0;
const TOKEN_SIGNALS: u64 = 1;
const TOKEN_IDLE_TIMER: u64 = 2;
const FIRST_CLIENT_TOKEN: u64 = 16;

/// Identifier of a connected client session, unique per daemon lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClientId(u64);

impl ClientId {
    /// The first id handed out.
    pub const FIRST: ClientId = ClientId(0);

    pub fn next(self) -> ClientId {
        ClientId(self.0 + 1)
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

/// Something the event loop waits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Receiver {
    /// The listening socket; readable means a pending connection.
    Listener,
    /// The signalfd for SIGINT/SIGTERM/SIGQUIT.
    Signals,
    /// The idle timerfd.
    IdleTimer,
    /// A connected client session.
    Client(ClientId),
}

impl Receiver {
    pub fn token(self) -> u64 {
        match self {
            Receiver::Listener => TOKEN_LISTENER,
            Receiver::Signals => TOKEN_SIGNALS,
            Receiver::IdleTimer => TOKEN_IDLE_TIMER,
            Receiver::Client(ClientId(id)) => FIRST_CLIENT_TOKEN + id,
        }
    }

    /// Inverse of [`Receiver::token`]. Unassigned tokens yield `None`.
    pub fn from_token(token: u64) -> Option<Receiver> {
        match token {
            TOKEN_LISTENER => Some(Receiver::Listener),
            TOKEN_SIGNALS => Some(Receiver::Signals),
            TOKEN_IDLE_TIMER => Some(Receiver::IdleTimer),
            t if t >= FIRST_CLIENT_TOKEN => {
                Some(Receiver::Client(ClientId(t - FIRST_CLIENT_TOKEN)))
            }
            _ => None,
        }
    }
}
