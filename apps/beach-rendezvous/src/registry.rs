use serde::{Deserialize, Serialize};

use crate::error::RelayError;
use crate::transport::ConnectionId;

/// A named participant bound to one live connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub name: String,
    #[serde(rename = "id")]
    pub connection: ConnectionId,
    /// Milliseconds since the Unix epoch.
    #[serde(rename = "date")]
    pub joined_at: i64,
}

/// Authoritative view of who is online, kept in registration order.
///
/// Names are display names and may repeat. Lookups by name always pick the
/// earliest registration still online.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    participants: Vec<Participant>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `name` to `connection`. A connection keeps its first binding;
    /// registering it again is rejected.
    pub fn register(
        &mut self,
        connection: ConnectionId,
        name: &str,
        joined_at: i64,
    ) -> Result<&Participant, RelayError> {
        if let Some(existing) = self.participant(connection) {
            return Err(RelayError::DuplicateRegistration {
                connection,
                name: existing.name.clone(),
            });
        }
        self.participants.push(Participant {
            name: name.to_string(),
            connection,
            joined_at,
        });
        Ok(&self.participants[self.participants.len() - 1])
    }

    pub fn unregister(&mut self, connection: ConnectionId) -> Option<Participant> {
        let index = self
            .participants
            .iter()
            .position(|p| p.connection == connection)?;
        Some(self.participants.remove(index))
    }

    pub fn resolve(&self, name: &str) -> Result<ConnectionId, RelayError> {
        self.participants
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.connection)
            .ok_or_else(|| RelayError::TargetOffline {
                target: name.to_string(),
            })
    }

    pub fn participant(&self, connection: ConnectionId) -> Option<&Participant> {
        self.participants
            .iter()
            .find(|p| p.connection == connection)
    }

    pub fn snapshot(&self) -> Vec<Participant> {
        self.participants.clone()
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }
}
