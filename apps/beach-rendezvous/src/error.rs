use thiserror::Error;

use crate::transport::ConnectionId;

/// Failures inside the relay. None of these are ever sent back to the
/// originating client; each one degrades to a dropped envelope plus a log
/// line and a metric.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RelayError {
    #[error("no participant named {target:?} is online")]
    TargetOffline { target: String },
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),
    #[error("connection {connection} is already registered as {name:?}")]
    DuplicateRegistration {
        connection: ConnectionId,
        name: String,
    },
    #[error("write to connection {connection} failed: {reason}")]
    TransportWriteFailure {
        connection: ConnectionId,
        reason: &'static str,
    },
    #[error("{kind} from {from} to {to} does not match any pending offer")]
    OutOfOrder {
        kind: &'static str,
        from: ConnectionId,
        to: ConnectionId,
    },
}

impl RelayError {
    pub fn metric_label(&self) -> &'static str {
        match self {
            RelayError::TargetOffline { .. } => "target_offline",
            RelayError::MalformedEnvelope(_) => "malformed_envelope",
            RelayError::DuplicateRegistration { .. } => "duplicate_registration",
            RelayError::TransportWriteFailure { .. } => "transport_write_failure",
            RelayError::OutOfOrder { .. } => "out_of_order",
        }
    }
}
