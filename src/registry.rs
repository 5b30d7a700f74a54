//! Owned registries for client sessions and held line requests.
//!
//! A session or record lives in exactly one map and is dropped when it is
//! removed, which closes its socket or releases its lines.

use chrono::{DateTime, Local};
use std::collections::{BTreeMap, HashMap};
use std::os::unix::net::UnixStream;

use crate::protocol::RequestId;
use crate::receiver::ClientId;

/// Kernel-verified identity of a connected peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerIdentity {
    pub pid: i32,
    pub uid: u32,
    /// Login name from the password database.
    pub user: String,
}

/// One connected client.
#[derive(Debug)]
pub struct ClientSession {
    stream: UnixStream,
    peer: PeerIdentity,
    connected_at: DateTime<Local>,
}

impl ClientSession {
    pub fn new(stream: UnixStream, peer: PeerIdentity) -> Self {
        Self {
            stream,
            peer,
            connected_at: Local::now(),
        }
    }

    pub fn stream(&self) -> &UnixStream {
        &self.stream
    }

    pub fn peer(&self) -> &PeerIdentity {
        &self.peer
    }

    /// Milliseconds since the connection was accepted.
    pub fn connected_ms(&self) -> i64 {
        (Local::now() - self.connected_at).num_milliseconds()
    }
}

/// Sessions keyed by the id used as their epoll token.
#[derive(Debug)]
pub struct ClientRegistry {
    sessions: HashMap<ClientId, ClientSession>,
    next_id: ClientId,
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self {
            sessions: HashMap::new(),
            next_id: ClientId::FIRST,
        }
    }

    /// Register a session and return its fresh id.
    pub fn insert(&mut self, session: ClientSession) -> ClientId {
        let id = self.next_id;
        self.next_id = id.next();
        self.sessions.insert(id, session);
        id
    }

    pub fn get(&self, id: ClientId) -> Option<&ClientSession> {
        self.sessions.get(&id)
    }

    pub fn remove(&mut self, id: ClientId) -> Option<ClientSession> {
        self.sessions.remove(&id)
    }

    pub fn ids(&self) -> Vec<ClientId> {
        let mut ids: Vec<ClientId> = self.sessions.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

/// A held line request and what it was made for.
#[derive(Debug)]
pub struct LineRequestRecord<H> {
    handle: H,
    pub chip_path: String,
    pub offsets: Vec<u32>,
    /// Pid of the client that created the request. It may be gone by now.
    pub owner_pid: i32,
}

impl<H> LineRequestRecord<H> {
    pub fn new(handle: H, chip_path: impl Into<String>, offsets: Vec<u32>, owner_pid: i32) -> Self {
        Self {
            handle,
            chip_path: chip_path.into(),
            offsets,
            owner_pid,
        }
    }

    /// Give up the record, returning the handle so the caller decides when
    /// the lines go back.
    pub fn into_handle(self) -> H {
        self.handle
    }
}

/// Live line requests keyed by the identifier returned to clients.
///
/// Identifiers come from a counter and are never reused while the daemon
/// runs.
#[derive(Debug)]
pub struct RequestRegistry<H> {
    records: BTreeMap<RequestId, LineRequestRecord<H>>,
    next_seq: u64,
}

impl<H> Default for RequestRegistry<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H> RequestRegistry<H> {
    pub fn new() -> Self {
        Self {
            records: BTreeMap::new(),
            next_seq: 0,
        }
    }

    /// Store a record under a new identifier.
    pub fn insert(&mut self, record: LineRequestRecord<H>) -> RequestId {
        self.next_seq += 1;
        // "req-" plus a u64 always fits the identifier field.
        let id = RequestId::new(format!("req-{}", self.next_seq))
            .unwrap_or_else(|_| unreachable!("generated request id is always valid"));
        self.records.insert(id.clone(), record);
        id
    }

    pub fn remove(&mut self, id: &RequestId) -> Option<LineRequestRecord<H>> {
        self.records.remove(id)
    }

    /// Remove every record, in identifier order.
    pub fn drain(&mut self) -> impl Iterator<Item = (RequestId, LineRequestRecord<H>)> {
        std::mem::take(&mut self.records).into_iter()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> PeerIdentity {
        PeerIdentity {
            pid: 42,
            uid: 1000,
            user: "tester".into(),
        }
    }

    #[test]
    fn test_client_registry_insert_remove() {
        let mut clients = ClientRegistry::new();
        let (a, _a_peer) = UnixStream::pair().unwrap();
        let (b, _b_peer) = UnixStream::pair().unwrap();

        let first = clients.insert(ClientSession::new(a, peer()));
        let second = clients.insert(ClientSession::new(b, peer()));
        assert_ne!(first, second);
        assert_eq!(clients.len(), 2);
        assert_eq!(clients.ids(), vec![first, second]);

        let removed = clients.remove(first).unwrap();
        assert_eq!(removed.peer().pid, 42);
        assert!(clients.get(first).is_none());
        assert!(clients.remove(first).is_none());
        assert_eq!(clients.len(), 1);
    }

    #[test]
    fn test_dropping_session_closes_socket() {
        use std::io::Read;

        let mut clients = ClientRegistry::new();
        let (server_side, mut client_side) = UnixStream::pair().unwrap();
        let id = clients.insert(ClientSession::new(server_side, peer()));
        drop(clients.remove(id));

        let mut buf = [0u8; 1];
        assert_eq!(client_side.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_request_ids_never_reused() {
        let mut requests: RequestRegistry<u8> = RequestRegistry::new();
        let first = requests.insert(LineRequestRecord::new(1, "/dev/gpiochip0", vec![2, 5], 7));
        requests.remove(&first).unwrap();
        let second = requests.insert(LineRequestRecord::new(2, "/dev/gpiochip0", vec![2, 5], 7));

        assert_ne!(first, second);
        assert_eq!(first.as_str(), "req-1");
        assert_eq!(second.as_str(), "req-2");
        assert_eq!(requests.remove(&second).unwrap().into_handle(), 2);
    }

    #[test]
    fn test_request_drain_empties_registry() {
        let mut requests: RequestRegistry<&str> = RequestRegistry::new();
        requests.insert(LineRequestRecord::new("a", "/dev/gpiochip0", vec![1], 1));
        requests.insert(LineRequestRecord::new("b", "/dev/gpiochip1", vec![3], 1));

        let drained: Vec<_> = requests.drain().map(|(_, r)| r.into_handle()).collect();
        assert_eq!(drained, vec!["a", "b"]);
        assert!(requests.is_empty());
    }
}
