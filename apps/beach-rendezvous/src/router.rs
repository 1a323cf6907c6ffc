use metrics::counter;
use tracing::{debug, info, warn};

use crate::envelope::Envelope;
use crate::error::RelayError;
use crate::negotiation::{SessionTracker, Transition};
use crate::registry::ConnectionRegistry;
use crate::transport::{ConnectionId, ConnectionTable};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Forwarded {
        to: ConnectionId,
        transition: Transition,
    },
    Broadcast {
        delivered: usize,
    },
    Dropped(RelayError),
}

impl Delivery {
    pub fn metric_label(&self) -> &'static str {
        match self {
            Delivery::Forwarded { .. } => "forwarded",
            Delivery::Broadcast { .. } => "broadcast",
            Delivery::Dropped(_) => "dropped",
        }
    }
}

#[derive(Debug)]
pub struct RouteOutcome {
    pub delivery: Delivery,
    /// Connections whose outbound queue failed while routing.
    pub failed: Vec<ConnectionId>,
}

/// Routes one envelope using borrowed coordinator state. Holds nothing
/// between calls.
pub struct MessageRouter<'a> {
    registry: &'a ConnectionRegistry,
    tracker: &'a mut SessionTracker,
    transport: &'a ConnectionTable,
    strict_negotiation: bool,
}

impl<'a> MessageRouter<'a> {
    pub fn new(
        registry: &'a ConnectionRegistry,
        tracker: &'a mut SessionTracker,
        transport: &'a ConnectionTable,
        strict_negotiation: bool,
    ) -> Self {
        Self {
            registry,
            tracker,
            transport,
            strict_negotiation,
        }
    }

    pub fn route(&mut self, from: ConnectionId, envelope: &Envelope) -> RouteOutcome {
        let outcome = match envelope.target() {
            Some(target) => self.forward(from, target, envelope),
            None => {
                // The sender is not excluded.
                let report = self.transport.broadcast(envelope.raw().clone());
                RouteOutcome {
                    delivery: Delivery::Broadcast {
                        delivered: report.delivered,
                    },
                    failed: report.failed,
                }
            }
        };

        counter!(
            "rendezvous_envelopes_routed_total",
            1,
            "kind" => envelope.kind().as_str(),
            "delivery" => outcome.delivery.metric_label()
        );
        outcome
    }

    fn forward(&mut self, from: ConnectionId, target: &str, envelope: &Envelope) -> RouteOutcome {
        let to = match self.registry.resolve(target) {
            Ok(to) => to,
            Err(err) => {
                warn!(
                    connection_id = %from,
                    target = %target,
                    kind = envelope.kind().as_str(),
                    "dropping envelope: target offline"
                );
                return dropped(err, Vec::new());
            }
        };

        let transition = self.tracker.observe(envelope.kind(), from, to);
        self.log_transition(from, to, transition);
        if self.strict_negotiation {
            if let Transition::UnexpectedAnswer { .. } = transition {
                return dropped(
                    RelayError::OutOfOrder {
                        kind: envelope.kind().as_str(),
                        from,
                        to,
                    },
                    Vec::new(),
                );
            }
        }

        match self.transport.send_to(to, envelope.raw().clone()) {
            Ok(()) => {
                debug!(
                    connection_id = %from,
                    target = %target,
                    to = %to,
                    kind = envelope.kind().as_str(),
                    "envelope forwarded"
                );
                RouteOutcome {
                    delivery: Delivery::Forwarded { to, transition },
                    failed: Vec::new(),
                }
            }
            Err(err) => {
                warn!(connection_id = %from, to = %to, error = %err, "forwarding failed");
                dropped(err, vec![to])
            }
        }
    }

    fn log_transition(&self, from: ConnectionId, to: ConnectionId, transition: Transition) {
        match transition {
            Transition::Opened => {
                debug!(caller = %from, receiver = %to, "negotiation opened");
            }
            Transition::Renegotiated { previous } => {
                info!(
                    caller = %from,
                    receiver = %to,
                    previous = previous.as_str(),
                    "renegotiation offer"
                );
                counter!("rendezvous_renegotiations_total", 1);
            }
            Transition::Established => {
                info!(caller = %to, receiver = %from, "negotiation established");
                counter!("rendezvous_sessions_established_total", 1);
            }
            Transition::UnexpectedAnswer { phase } => {
                warn!(
                    from = %from,
                    to = %to,
                    phase = phase.map(|p| p.as_str()).unwrap_or("absent"),
                    strict = self.strict_negotiation,
                    "answer without a pending offer"
                );
            }
            Transition::Candidate { phase: None } => {
                debug!(from = %from, to = %to, "candidate outside any tracked session");
            }
            Transition::Candidate { .. } | Transition::Untracked => {}
        }
    }
}

fn dropped(err: RelayError, failed: Vec<ConnectionId>) -> RouteOutcome {
    counter!("rendezvous_envelopes_dropped_total", 1, "reason" => err.metric_label());
    RouteOutcome {
        delivery: Delivery::Dropped(err),
        failed,
    }
}
