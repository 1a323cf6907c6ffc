//! Inbound signaling envelopes.
//!
//! Only the routing header (`type`, `name`, `target`, `date`) is read.
//! The session description and candidate payloads stay opaque: the relay
//! forwards the original frame text untouched.

use serde_json::{json, Map, Value};

use crate::error::RelayError;
use crate::transport::Frame;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnvelopeKind {
    Register,
    Offer,
    Answer,
    IceCandidate,
    /// Any other `type`. Routed like the rest, never tracked.
    Other,
}

impl EnvelopeKind {
    fn from_wire(value: &str) -> Self {
        match value {
            // "username" is what the original browser client sends.
            "register" | "username" => EnvelopeKind::Register,
            "offer" => EnvelopeKind::Offer,
            "answer" => EnvelopeKind::Answer,
            "ice-candidate" => EnvelopeKind::IceCandidate,
            _ => EnvelopeKind::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EnvelopeKind::Register => "register",
            EnvelopeKind::Offer => "offer",
            EnvelopeKind::Answer => "answer",
            EnvelopeKind::IceCandidate => "ice-candidate",
            EnvelopeKind::Other => "other",
        }
    }
}

/// Top-level key reserved for presence snapshots.
const PRESENCE_KEY: &str = "users";

/// One parsed envelope together with the exact text it arrived as.
#[derive(Debug, Clone)]
pub struct Envelope {
    kind: EnvelopeKind,
    name: Option<String>,
    target: Option<String>,
    date: Option<i64>,
    raw: Frame,
}

impl Envelope {
    pub fn parse(raw: &str) -> Result<Self, RelayError> {
        if !raw.trim_start().starts_with('{') {
            return Err(RelayError::MalformedEnvelope(
                "envelope must be a JSON object".into(),
            ));
        }
        let fields: Map<String, Value> = serde_json::from_str(raw)
            .map_err(|err| RelayError::MalformedEnvelope(err.to_string()))?;
        if fields.contains_key(PRESENCE_KEY) {
            return Err(RelayError::MalformedEnvelope(
                "\"users\" is reserved for presence snapshots".into(),
            ));
        }
        let kind = fields
            .get("type")
            .and_then(Value::as_str)
            .map(EnvelopeKind::from_wire)
            .ok_or_else(|| RelayError::MalformedEnvelope("missing \"type\" field".into()))?;

        let target = match fields.get("target") {
            None | Some(Value::Null) => None,
            Some(Value::String(target)) => Some(target.clone()),
            Some(_) => {
                return Err(RelayError::MalformedEnvelope(
                    "\"target\" must be a string".into(),
                ))
            }
        };
        // `name` and `date` of the wrong type are ignored; the frame is
        // still forwarded as it arrived.
        let name = fields.get("name").and_then(Value::as_str).map(str::to_owned);
        let date = match kind {
            EnvelopeKind::Register => fields
                .get("date")
                .and_then(Value::as_f64)
                .filter(|d| d.is_finite())
                .map(|d| d as i64),
            _ => None,
        };

        Ok(Self {
            kind,
            name,
            target,
            date,
            raw: Frame::from(raw),
        })
    }

    pub fn kind(&self) -> EnvelopeKind {
        self.kind
    }

    pub fn sender_name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// The recipient name. An empty string counts as no target at all.
    pub fn target(&self) -> Option<&str> {
        self.target.as_deref().filter(|t| !t.is_empty())
    }

    pub fn date(&self) -> Option<i64> {
        self.date
    }

    /// The name a register envelope asks to bind, if it carries a usable one.
    pub fn registration_name(&self) -> Result<&str, RelayError> {
        match self.name.as_deref() {
            Some(name) if !name.trim().is_empty() => Ok(name),
            _ => Err(RelayError::MalformedEnvelope(
                "register envelope needs a non-empty \"name\"".into(),
            )),
        }
    }

    pub fn raw(&self) -> &Frame {
        &self.raw
    }
}

/// Builds the register envelope a client sends right after connecting.
pub fn register_frame(name: &str, date: i64) -> String {
    json!({ "type": "register", "name": name, "date": date }).to_string()
}
