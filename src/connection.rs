use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, MutexGuard, OnceLock},
    time::Duration,
};

use bytes::Bytes;
use tokio::{sync::mpsc, time::Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::protocol::{
    CLOSE_GOING_AWAY, CLOSE_NORMAL, REASON_CLOSED, REASON_HEARTBEAT_TIMEOUT, REASON_SHUTDOWN,
};

/// Minimum fraction of the frame interval between two accepted frames.
const RATE_LIMIT_SLACK: f64 = 0.9;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Connections enter the registry only once they authenticated.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuthState {
    Authenticated,
    Closing,
}

/// Messages queued for a connection's writer task.
#[derive(Clone, Debug, PartialEq)]
pub enum Outbound {
    Frame(Bytes),
    Text(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CloseReason {
    pub code: u16,
    pub reason: &'static str,
}

impl CloseReason {
    pub const HEARTBEAT_TIMEOUT: CloseReason = CloseReason {
        code: CLOSE_GOING_AWAY,
        reason: REASON_HEARTBEAT_TIMEOUT,
    };
    pub const SHUTDOWN: CloseReason = CloseReason {
        code: CLOSE_GOING_AWAY,
        reason: REASON_SHUTDOWN,
    };
    pub const NORMAL: CloseReason = CloseReason {
        code: CLOSE_NORMAL,
        reason: REASON_CLOSED,
    };
}

/// What the connection's own tasks keep after registering.
#[derive(Clone)]
pub struct ConnectionHandle {
    pub id: ConnectionId,
    pub cancel: CancellationToken,
    close_reason: Arc<OnceLock<CloseReason>>,
}

impl ConnectionHandle {
    /// Why the connection was told to close. Defaults to shutdown when the
    /// owning stage cancelled it.
    pub fn close_reason(&self) -> CloseReason {
        self.close_reason
            .get()
            .copied()
            .unwrap_or(CloseReason::SHUTDOWN)
    }

    /// Record `reason` unless one is already set, then cancel the connection.
    pub fn close(&self, reason: CloseReason) {
        let _ = self.close_reason.set(reason);
        self.cancel.cancel();
    }
}

struct Entry {
    state: AuthState,
    outbound: mpsc::Sender<Outbound>,
    cancel: CancellationToken,
    close_reason: Arc<OnceLock<CloseReason>>,
    last_heartbeat: Instant,
    last_frame: Option<Instant>,
}

impl Entry {
    fn close(&mut self, reason: CloseReason) {
        self.state = AuthState::Closing;
        let _ = self.close_reason.set(reason);
        self.cancel.cancel();
    }
}

/// Authenticated connections keyed by a stable id.
#[derive(Default)]
pub struct ConnectionRegistry {
    entries: Mutex<HashMap<ConnectionId, Entry>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ConnectionId, Entry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Add an authenticated connection. Its token is a child of `parent`.
    pub fn register(
        &self,
        outbound: mpsc::Sender<Outbound>,
        parent: &CancellationToken,
        now: Instant,
    ) -> ConnectionHandle {
        let id = ConnectionId::new();
        let cancel = parent.child_token();
        let close_reason = Arc::new(OnceLock::new());
        let entry = Entry {
            state: AuthState::Authenticated,
            outbound,
            cancel: cancel.clone(),
            close_reason: Arc::clone(&close_reason),
            last_heartbeat: now,
            last_frame: None,
        };
        let total = {
            let mut entries = self.lock();
            entries.insert(id, entry);
            entries.len()
        };
        log::info!("connection {} authenticated, {} active", id, total);
        ConnectionHandle {
            id,
            cancel,
            close_reason,
        }
    }

    pub fn remove(&self, id: ConnectionId) -> bool {
        let removed = self.lock().remove(&id);
        match removed {
            Some(entry) => {
                entry.cancel.cancel();
                log::info!("connection {} removed, {} remaining", id, self.len());
                true
            }
            None => false,
        }
    }

    /// Record a liveness message.
    pub fn touch(&self, id: ConnectionId, now: Instant) -> bool {
        match self.lock().get_mut(&id) {
            Some(entry) => {
                entry.last_heartbeat = now;
                true
            }
            None => false,
        }
    }

    /// Rate limit: accept a frame only if at least 0.9 x `interval` passed
    /// since the previously accepted one.
    pub fn admit_frame(&self, id: ConnectionId, now: Instant, interval: Duration) -> bool {
        let mut entries = self.lock();
        let Some(entry) = entries.get_mut(&id) else {
            return false;
        };
        if entry.state != AuthState::Authenticated {
            return false;
        }
        if let Some(last) = entry.last_frame {
            if now.saturating_duration_since(last) < interval.mul_f64(RATE_LIMIT_SLACK) {
                return false;
            }
        }
        entry.last_frame = Some(now);
        true
    }

    /// Close and drop every connection silent for longer than `timeout`.
    pub fn expire_stale(&self, now: Instant, timeout: Duration) -> Vec<ConnectionId> {
        let mut entries = self.lock();
        let stale: Vec<ConnectionId> = entries
            .iter()
            .filter(|(_, e)| now.saturating_duration_since(e.last_heartbeat) > timeout)
            .map(|(id, _)| *id)
            .collect();
        for id in &stale {
            if let Some(mut entry) = entries.remove(id) {
                entry.close(CloseReason::HEARTBEAT_TIMEOUT);
                log::warn!("connection {} missed heartbeats for {:?}, closing", id, timeout);
            }
        }
        stale
    }

    /// Outbound senders of every authenticated connection at this instant.
    pub fn subscribers(&self) -> Vec<(ConnectionId, mpsc::Sender<Outbound>)> {
        self.lock()
            .iter()
            .filter(|(_, e)| e.state == AuthState::Authenticated)
            .map(|(id, e)| (*id, e.outbound.clone()))
            .collect()
    }

    /// Drop connections found dead during a broadcast round.
    pub fn prune(&self, dead: &[ConnectionId]) -> usize {
        let mut entries = self.lock();
        let mut pruned = 0;
        for id in dead {
            if let Some(mut entry) = entries.remove(id) {
                entry.close(CloseReason::NORMAL);
                pruned += 1;
            }
        }
        if pruned > 0 {
            log::info!("pruned {} dead connections, {} remaining", pruned, entries.len());
        }
        pruned
    }

    pub fn close_all(&self, reason: CloseReason) -> usize {
        let drained: Vec<(ConnectionId, Entry)> = self.lock().drain().collect();
        let count = drained.len();
        for (_, mut entry) in drained {
            entry.close(reason);
        }
        if count > 0 {
            log::info!("closed {} connections: {}", count, reason.reason);
        }
        count
    }

    pub fn state(&self, id: ConnectionId) -> Option<AuthState> {
        self.lock().get(&id).map(|e| e.state)
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.lock().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[cfg(test)]
#[path = "connection_test.rs"]
mod connection_test;
