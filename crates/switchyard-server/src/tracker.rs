//! Connection lifecycle tracking.
//!
//! The [`ConnStateTracker`] maps every open connection to its last reported
//! [`ConnState`]. Hijacked and closed connections are removed rather than
//! stored, so the size of the map is the number of connections the drain
//! loop still has to wait for.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;

use parking_lot::RwLock;

/// Identity of one accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId {
    id: u64,
    peer: SocketAddr,
}

impl ConnectionId {
    /// Creates an identity from an accept sequence number and the peer address.
    #[must_use]
    pub fn new(id: u64, peer: SocketAddr) -> Self {
        Self { id, peer }
    }

    /// Accept sequence number, unique for the lifetime of a server.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Remote address.
    #[must_use]
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} ({})", self.id, self.peer)
    }
}

/// Lifecycle phase of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnState {
    /// Accepted; no request read yet.
    New,
    /// At least one request is executing.
    Active,
    /// Open with no request executing.
    Idle,
    /// Taken over by a protocol upgrade; no longer managed by the server.
    Hijacked,
    /// Closed.
    Closed,
}

impl ConnState {
    /// Returns `true` for the states that are kept in the tracker.
    #[must_use]
    pub fn is_open(self) -> bool {
        matches!(self, Self::New | Self::Active | Self::Idle)
    }
}

impl fmt::Display for ConnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::New => "new",
            Self::Active => "active",
            Self::Idle => "idle",
            Self::Hijacked => "hijacked",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Thread-safe map from open connection to lifecycle state.
///
/// # Example
///
/// ```rust
/// use switchyard_server::{ConnState, ConnStateTracker, ConnectionId};
///
/// let tracker = ConnStateTracker::new();
/// let id = ConnectionId::new(1, "127.0.0.1:50000".parse().unwrap());
///
/// tracker.record_transition(id, ConnState::New);
/// tracker.record_transition(id, ConnState::Active);
/// assert_eq!(tracker.snapshot().get(&id), Some(&ConnState::Active));
///
/// tracker.record_transition(id, ConnState::Closed);
/// assert_eq!(tracker.open_connections(), 0);
/// ```
#[derive(Debug, Default)]
pub struct ConnStateTracker {
    states: RwLock<HashMap<ConnectionId, ConnState>>,
}

impl ConnStateTracker {
    /// Creates an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies one lifecycle event.
    ///
    /// `New` inserts or overwrites. `Active` and `Idle` only update a
    /// connection that is already present. `Hijacked` and `Closed` remove it.
    pub fn record_transition(&self, id: ConnectionId, state: ConnState) {
        let mut states = self.states.write();
        match state {
            ConnState::New => {
                states.insert(id, state);
            }
            ConnState::Active | ConnState::Idle => {
                if let Some(current) = states.get_mut(&id) {
                    *current = state;
                }
            }
            ConnState::Hijacked | ConnState::Closed => {
                states.remove(&id);
            }
        }
        let open = states.len();
        drop(states);

        tracing::trace!(connection = %id, %state, open, "Connection state changed");
        switchyard_telemetry::metrics::set_open_connections(open);
    }

    /// Returns an owned copy of the current map.
    #[must_use]
    pub fn snapshot(&self) -> HashMap<ConnectionId, ConnState> {
        self.states.read().clone()
    }

    /// Number of open connections.
    #[must_use]
    pub fn open_connections(&self) -> usize {
        self.states.read().len()
    }
}
