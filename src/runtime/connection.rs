//! Connection state machine and the registry that owns live connections.
//!
//! Connections live in a slab so the poll token is the slab key, with a
//! secondary index by client id for lookups and ordered reporting.

use bytes::{Buf, BytesMut};
use slab::Slab;
use std::collections::BTreeMap;
use std::fmt;
use std::io::{self, Read, Write};
use std::net::SocketAddr;

/// Identifier assigned to a client on accept. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClientId(pub u64);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of a connection: `Accepted -> Open -> (Errored | Closed)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Accepted but not yet greeted.
    Accepted,
    /// Registered and exchanging data.
    Open,
    /// A socket error was reported; closing follows.
    Errored,
    /// Terminal.
    Closed,
}

impl ConnState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnState::Accepted => "accepted",
            ConnState::Open => "open",
            ConnState::Errored => "errored",
            ConnState::Closed => "closed",
        }
    }
}

impl fmt::Display for ConnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single client connection.
///
/// `S` is the socket handle; the event loop uses `mio::net::TcpStream`.
#[derive(Debug)]
pub struct Connection<S> {
    pub id: ClientId,
    pub peer: SocketAddr,
    pub state: ConnState,
    pub stream: S,
    /// Registered for readable readiness with the poller.
    pub want_read: bool,
    /// Registered for writable readiness with the poller.
    pub want_write: bool,
    /// Bytes queued for the peer that the socket has not yet accepted.
    outbound: BytesMut,
}

/// Why a [`Connection::drain`] pass stopped.
#[derive(Debug)]
pub enum ReadEnd {
    /// Socket has no more data for now.
    WouldBlock,
    /// Peer closed its side.
    Eof,
    Failed(io::Error),
}

impl<S> Connection<S> {
    /// Create a connection in the `Accepted` state.
    pub fn new(id: ClientId, peer: SocketAddr, stream: S) -> Self {
        Self {
            id,
            peer,
            state: ConnState::Accepted,
            stream,
            want_read: true,
            want_write: false,
            outbound: BytesMut::new(),
        }
    }

    pub fn open(&mut self) {
        self.state = ConnState::Open;
    }

    /// Record a socket error. A closed connection stays closed.
    pub fn fail(&mut self) {
        if self.state != ConnState::Closed {
            self.state = ConnState::Errored;
        }
    }

    pub fn close(&mut self) {
        self.state = ConnState::Closed;
    }

    /// Whether the connection still counts as live for reporting.
    pub fn is_live(&self) -> bool {
        matches!(self.state, ConnState::Accepted | ConnState::Open)
    }

    /// Append bytes to the outbound queue.
    pub fn queue(&mut self, data: &[u8]) {
        self.outbound.extend_from_slice(data);
    }

    /// Bytes queued but not yet written.
    pub fn pending_len(&self) -> usize {
        self.outbound.len()
    }

    pub fn has_pending(&self) -> bool {
        !self.outbound.is_empty()
    }

    /// Drop `n` bytes from the front of the outbound queue after a write.
    fn consume(&mut self, n: usize) {
        self.outbound.advance(n.min(self.outbound.len()));
    }
}

impl<S: Read> Connection<S> {
    /// Read everything currently available into `into`.
    ///
    /// `scratch` is the per-syscall buffer. Bytes read before an EOF or error
    /// are kept in `into`.
    pub fn drain(&mut self, scratch: &mut [u8], into: &mut Vec<u8>) -> ReadEnd {
        loop {
            match self.stream.read(scratch) {
                Ok(0) => return ReadEnd::Eof,
                Ok(n) => into.extend_from_slice(&scratch[..n]),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return ReadEnd::WouldBlock,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return ReadEnd::Failed(e),
            }
        }
    }
}

impl<S: Write> Connection<S> {
    /// Write as much queued output as the socket accepts.
    ///
    /// Returns the number of bytes written; anything left stays queued.
    pub fn flush(&mut self) -> io::Result<usize> {
        let mut written = 0;
        while !self.outbound.is_empty() {
            match self.stream.write(&self.outbound) {
                Ok(0) => {
                    return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0"));
                }
                Ok(n) => {
                    self.consume(n);
                    written += n;
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(written)
    }
}

/// Registry of active connections.
///
/// Every id present maps to exactly one connection. Removal of an absent id
/// is a no-op.
pub struct ConnectionRegistry<S> {
    connections: Slab<Connection<S>>,
    by_id: BTreeMap<ClientId, usize>,
    max_connections: usize,
}

impl<S> ConnectionRegistry<S> {
    /// Create a new registry with specified maximum capacity.
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: Slab::with_capacity(max_connections.min(4096)),
            by_id: BTreeMap::new(),
            max_connections,
        }
    }

    /// Insert a connection and return its token.
    ///
    /// Gives the connection back if the registry is at capacity or the id is
    /// already present.
    pub fn add(&mut self, conn: Connection<S>) -> Result<usize, Connection<S>> {
        if self.is_full() || self.by_id.contains_key(&conn.id) {
            return Err(conn);
        }
        let id = conn.id;
        let token = self.connections.insert(conn);
        self.by_id.insert(id, token);
        Ok(token)
    }

    /// Remove a connection by id. Returns `None` if it was not present.
    pub fn remove(&mut self, id: ClientId) -> Option<Connection<S>> {
        let token = self.by_id.remove(&id)?;
        self.connections.try_remove(token)
    }

    pub fn lookup(&self, id: ClientId) -> Option<&Connection<S>> {
        self.by_id.get(&id).and_then(|&t| self.connections.get(t))
    }

    pub fn lookup_mut(&mut self, id: ClientId) -> Option<&mut Connection<S>> {
        let token = *self.by_id.get(&id)?;
        self.connections.get_mut(token)
    }

    /// Token under which `id` is registered with the poller.
    pub fn token_of(&self, id: ClientId) -> Option<usize> {
        self.by_id.get(&id).copied()
    }

    /// Token the next successful [`add`](Self::add) will return.
    pub fn next_token(&self) -> usize {
        self.connections.vacant_key()
    }

    pub fn get_mut_by_token(&mut self, token: usize) -> Option<&mut Connection<S>> {
        self.connections.get_mut(token)
    }

    pub fn contains(&self, id: ClientId) -> bool {
        self.by_id.contains_key(&id)
    }

    /// Number of registered connections.
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.max_connections
    }

    pub fn capacity(&self) -> usize {
        self.max_connections
    }

    /// Iterate over connections in ascending id order.
    pub fn iter(&self) -> impl Iterator<Item = &Connection<S>> {
        self.by_id
            .values()
            .filter_map(move |&token| self.connections.get(token))
    }

    /// Ids of all registered connections, ascending.
    pub fn ids(&self) -> Vec<ClientId> {
        self.by_id.keys().copied().collect()
    }
}
