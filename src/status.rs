//! Periodic status reporting.
//!
//! The reporter never touches connection state; it takes a snapshot of the
//! registry and logs it.

use crate::runtime::{ClientId, ConnState, Connection, ConnectionRegistry};
use chrono::{DateTime, Local};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tracing::info;

/// Running counters maintained by the event loop.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ServerStats {
    pub accepted: u64,
    pub rejected: u64,
    pub echo_units: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub socket_errors: u64,
    /// Queued output discarded because the connection closed first.
    pub unsent_dropped: u64,
}

/// Per-connection line of a status report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSnapshot {
    pub id: ClientId,
    pub peer: SocketAddr,
    pub state: ConnState,
}

impl<S> From<&Connection<S>> for ConnectionSnapshot {
    fn from(conn: &Connection<S>) -> Self {
        Self {
            id: conn.id,
            peer: conn.peer,
            state: conn.state,
        }
    }
}

/// Point-in-time view of the server.
#[derive(Debug, Clone)]
pub struct StatusReport {
    pub listening: bool,
    pub local_addr: Option<SocketAddr>,
    pub stats: ServerStats,
    pub taken_at: DateTime<Local>,
    pub connections: Vec<ConnectionSnapshot>,
}

impl StatusReport {
    /// Snapshot the live connections of `registry`, in id order.
    pub fn capture<S>(
        registry: &ConnectionRegistry<S>,
        local_addr: Option<SocketAddr>,
        stats: ServerStats,
    ) -> Self {
        Self {
            listening: local_addr.is_some(),
            local_addr,
            stats,
            taken_at: Local::now(),
            connections: registry
                .iter()
                .filter(|c| c.is_live())
                .map(ConnectionSnapshot::from)
                .collect(),
        }
    }

    pub fn log(&self) {
        info!(
            listening = self.listening,
            port = self.local_addr.map(|a| a.port()),
            connections = self.connections.len(),
            accepted = self.stats.accepted,
            rejected = self.stats.rejected,
            echo_units = self.stats.echo_units,
            bytes_in = self.stats.bytes_in,
            bytes_out = self.stats.bytes_out,
            socket_errors = self.stats.socket_errors,
            unsent_dropped = self.stats.unsent_dropped,
            time = %self.taken_at.format("%Y-%m-%d %H:%M:%S%.3f"),
            "Server status"
        );

        for conn in &self.connections {
            info!(
                client_id = conn.id.0,
                peer_addr = %conn.peer.ip(),
                peer_port = conn.peer.port(),
                state = %conn.state,
                "Client"
            );
        }
    }
}

/// Fixed-interval timer driven by the event loop's poll timeout.
#[derive(Debug)]
pub struct StatusReporter {
    interval: Duration,
    next_due: Instant,
}

impl StatusReporter {
    pub fn new(interval: Duration, now: Instant) -> Self {
        Self {
            interval,
            next_due: now + interval,
        }
    }

    /// Time left until the next report, zero if overdue.
    pub fn time_until_due(&self, now: Instant) -> Duration {
        self.next_due.saturating_duration_since(now)
    }

    /// If a report is due, advance the schedule and return true.
    ///
    /// Missed ticks are not replayed; the next report is one interval after
    /// `now`.
    pub fn poll_due(&mut self, now: Instant) -> bool {
        if now < self.next_due {
            return false;
        }
        self.next_due = now + self.interval;
        true
    }
}
