//! Per-pair negotiation phase tracking.
//!
//! A session is keyed by the ordered pair (caller, receiver): the caller is
//! whoever sent the offer. Sessions exist only to notice protocol violations
//! and to be discarded when either side goes away. Nothing here ever blocks
//! delivery of a candidate.

use std::collections::HashMap;

use crate::envelope::EnvelopeKind;
use crate::transport::ConnectionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PairKey {
    pub caller: ConnectionId,
    pub receiver: ConnectionId,
}

/// `None` from [`SessionTracker::phase`] is the absent state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationPhase {
    OfferPending,
    Established,
}

impl NegotiationPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            NegotiationPhase::OfferPending => "offer_pending",
            NegotiationPhase::Established => "established",
        }
    }
}

#[derive(Debug, Clone)]
struct NegotiationSession {
    phase: NegotiationPhase,
    offers: u32,
    candidates: u64,
}

/// What an observed envelope did to the pair's session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// First offer between the pair.
    Opened,
    /// Another offer while a session already existed.
    Renegotiated { previous: NegotiationPhase },
    /// Answer matched the pending offer.
    Established,
    /// Answer with no pending offer; `phase` is what the pair was in.
    UnexpectedAnswer { phase: Option<NegotiationPhase> },
    /// Candidate forwarded; `phase` is the session it belongs to, if any.
    Candidate { phase: Option<NegotiationPhase> },
    /// Envelope type the tracker does not follow.
    Untracked,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TeardownReport {
    pub sessions: usize,
    /// Sessions that never reached `Established`.
    pub abandoned: usize,
    pub candidates_discarded: u64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SessionCounts {
    pub offer_pending: usize,
    pub established: usize,
}

#[derive(Debug, Default)]
pub struct SessionTracker {
    sessions: HashMap<PairKey, NegotiationSession>,
}

impl SessionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an envelope travelling from `from` to `to`.
    pub fn observe(&mut self, kind: EnvelopeKind, from: ConnectionId, to: ConnectionId) -> Transition {
        match kind {
            EnvelopeKind::Offer => self.on_offer(PairKey {
                caller: from,
                receiver: to,
            }),
            EnvelopeKind::Answer => self.on_answer(PairKey {
                caller: to,
                receiver: from,
            }),
            EnvelopeKind::IceCandidate => self.on_candidate(from, to),
            EnvelopeKind::Register | EnvelopeKind::Other => Transition::Untracked,
        }
    }

    fn on_offer(&mut self, key: PairKey) -> Transition {
        match self.sessions.get_mut(&key) {
            Some(session) => {
                let previous = session.phase;
                session.phase = NegotiationPhase::OfferPending;
                session.offers += 1;
                Transition::Renegotiated { previous }
            }
            None => {
                self.sessions.insert(
                    key,
                    NegotiationSession {
                        phase: NegotiationPhase::OfferPending,
                        offers: 1,
                        candidates: 0,
                    },
                );
                Transition::Opened
            }
        }
    }

    fn on_answer(&mut self, key: PairKey) -> Transition {
        match self.sessions.get_mut(&key) {
            Some(session) if session.phase == NegotiationPhase::OfferPending => {
                session.phase = NegotiationPhase::Established;
                Transition::Established
            }
            Some(session) => Transition::UnexpectedAnswer {
                phase: Some(session.phase),
            },
            None => Transition::UnexpectedAnswer { phase: None },
        }
    }

    // Candidates flow both ways, so either orientation of the pair counts.
    fn on_candidate(&mut self, from: ConnectionId, to: ConnectionId) -> Transition {
        let forward = PairKey {
            caller: from,
            receiver: to,
        };
        let reverse = PairKey {
            caller: to,
            receiver: from,
        };
        let session = match self.sessions.get_mut(&forward) {
            Some(session) => Some(session),
            None => self.sessions.get_mut(&reverse),
        };
        match session {
            Some(session) => {
                session.candidates += 1;
                Transition::Candidate {
                    phase: Some(session.phase),
                }
            }
            None => Transition::Candidate { phase: None },
        }
    }

    pub fn phase(&self, caller: ConnectionId, receiver: ConnectionId) -> Option<NegotiationPhase> {
        self.sessions
            .get(&PairKey { caller, receiver })
            .map(|s| s.phase)
    }

    pub fn offers(&self, caller: ConnectionId, receiver: ConnectionId) -> u32 {
        self.sessions
            .get(&PairKey { caller, receiver })
            .map(|s| s.offers)
            .unwrap_or(0)
    }

    /// Drops every session `connection` takes part in, on either side.
    pub fn teardown(&mut self, connection: ConnectionId) -> TeardownReport {
        let mut report = TeardownReport::default();
        self.sessions.retain(|key, session| {
            if key.caller != connection && key.receiver != connection {
                return true;
            }
            report.sessions += 1;
            if session.phase != NegotiationPhase::Established {
                report.abandoned += 1;
                report.candidates_discarded += session.candidates;
            }
            false
        });
        report
    }

    pub fn counts(&self) -> SessionCounts {
        let mut counts = SessionCounts::default();
        for session in self.sessions.values() {
            match session.phase {
                NegotiationPhase::OfferPending => counts.offer_pending += 1,
                NegotiationPhase::Established => counts.established += 1,
            }
        }
        counts
    }
}
