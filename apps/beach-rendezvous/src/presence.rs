use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::registry::{ConnectionRegistry, Participant};
use crate::transport::{BroadcastReport, ConnectionTable, Frame};

/// The full participant list, as pushed to every connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PresenceSnapshot {
    pub users: Vec<Participant>,
}

impl PresenceSnapshot {
    pub fn capture(registry: &ConnectionRegistry) -> Self {
        Self {
            users: registry.snapshot(),
        }
    }

    pub fn names(&self) -> Vec<&str> {
        self.users.iter().map(|p| p.name.as_str()).collect()
    }
}

/// Pushes complete snapshots, never deltas, to every connected transport.
#[derive(Debug, Default)]
pub struct PresenceBroadcaster {
    announcements: u64,
}

impl PresenceBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Captures the registry and sends it before returning, so broadcasts
    /// leave in the same order as the mutations that caused them.
    pub fn announce(
        &mut self,
        registry: &ConnectionRegistry,
        transport: &ConnectionTable,
    ) -> BroadcastReport {
        let snapshot = PresenceSnapshot::capture(registry);
        let frame: Frame = match serde_json::to_string(&snapshot) {
            Ok(json) => json.into(),
            Err(err) => {
                error!(error = %err, "failed to encode presence snapshot");
                return BroadcastReport::default();
            }
        };

        let report = transport.broadcast(frame);
        self.announcements += 1;
        counter!("rendezvous_presence_broadcasts_total", 1);
        debug!(
            participants = snapshot.users.len(),
            delivered = report.delivered,
            failed = report.failed.len(),
            "presence announced"
        );
        report
    }

    pub fn announcements(&self) -> u64 {
        self.announcements
    }
}
