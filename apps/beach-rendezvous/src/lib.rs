//! Rendezvous and signaling relay.
//!
//! Peers connect over `/ws`, register a display name, and exchange opaque
//! offer / answer / candidate envelopes addressed by name. Every change to
//! the set of registered peers is pushed to all connections as a full
//! presence snapshot. Media never passes through the relay.

pub mod cli;
pub mod config;
pub mod coordinator;
pub mod envelope;
pub mod error;
pub mod negotiation;
pub mod presence;
pub mod registry;
pub mod router;
pub mod routes;
pub mod telemetry;
pub mod transport;
pub mod websocket;

pub use coordinator::{CoordinatorConfig, CoordinatorHandle, CoordinatorStats, SignalingCoordinator};
pub use error::RelayError;
pub use transport::ConnectionId;
