use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, error::TrySendError};
use uuid::Uuid;

use crate::error::RelayError;

/// Opaque handle for one live transport connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
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
        self.0.fmt(f)
    }
}

/// One outbound text frame, shared between every recipient of a broadcast.
pub type Frame = Arc<str>;

#[derive(Debug, Default)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub bytes: usize,
    /// Connections whose queue rejected the frame; the caller retires them.
    pub failed: Vec<ConnectionId>,
}

/// Every live transport, registered or not, with its bounded outbound queue.
#[derive(Debug, Default)]
pub struct ConnectionTable {
    senders: HashMap<ConnectionId, mpsc::Sender<Frame>>,
    order: Vec<ConnectionId>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&mut self, connection: ConnectionId, sender: mpsc::Sender<Frame>) {
        if self.senders.insert(connection, sender).is_none() {
            self.order.push(connection);
        }
    }

    /// Drops the outbound queue, which ends the connection's writer task.
    pub fn detach(&mut self, connection: ConnectionId) -> bool {
        if self.senders.remove(&connection).is_some() {
            self.order.retain(|id| *id != connection);
            true
        } else {
            false
        }
    }

    pub fn contains(&self, connection: ConnectionId) -> bool {
        self.senders.contains_key(&connection)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn send_to(&self, connection: ConnectionId, frame: Frame) -> Result<(), RelayError> {
        let sender = self
            .senders
            .get(&connection)
            .ok_or(RelayError::TransportWriteFailure {
                connection,
                reason: "not attached",
            })?;
        sender.try_send(frame).map_err(|err| {
            let reason = match err {
                TrySendError::Full(_) => "outbound queue full",
                TrySendError::Closed(_) => "outbound queue closed",
            };
            RelayError::TransportWriteFailure { connection, reason }
        })
    }

    pub fn broadcast(&self, frame: Frame) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        for connection in &self.order {
            match self.send_to(*connection, frame.clone()) {
                Ok(()) => {
                    report.delivered += 1;
                    report.bytes += frame.len();
                }
                Err(_) => report.failed.push(*connection),
            }
        }
        report
    }
}
