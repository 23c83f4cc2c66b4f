use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::device::{DeviceContext, Platform};
use crate::ids::DeviceId;

/// Kind of a signaling envelope. Anything else on the wire fails to parse
/// and is dropped by the receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalKind {
    Offer,
    Answer,
    Candidate,
    Pair,
}

impl SignalKind {
    /// Offer/answer/candidate drive negotiation; `pair` is routed to pairing.
    pub fn is_negotiation(self) -> bool {
        !matches!(self, SignalKind::Pair)
    }
}

/// Envelope relayed verbatim by the rendezvous server between two device
/// rooms. `data` is opaque to the core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalEnvelope {
    pub from: DeviceId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_platform: Option<Platform>,
    pub to: DeviceId,
    #[serde(rename = "type")]
    pub kind: SignalKind,
    #[serde(default)]
    pub data: serde_json::Value,
    /// Milliseconds since the Unix epoch, stamped by the sender.
    pub timestamp: i64,
}

impl SignalEnvelope {
    pub fn new(local: &DeviceContext, to: DeviceId, kind: SignalKind, data: serde_json::Value) -> Self {
        Self {
            from: local.device_id.clone(),
            from_name: Some(local.device_name.clone()),
            from_platform: Some(local.platform),
            to,
            kind,
            data,
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_uses_wire_field_names() {
        let ctx = DeviceContext::new("a", "Laptop", Platform::Linux);
        let envelope = SignalEnvelope::new(&ctx, "b".into(), SignalKind::Candidate, json!({"x": 1}));
        let value: serde_json::Value = serde_json::to_value(&envelope).unwrap();

        assert_eq!(value["from"], "a");
        assert_eq!(value["fromName"], "Laptop");
        assert_eq!(value["fromPlatform"], "linux");
        assert_eq!(value["to"], "b");
        assert_eq!(value["type"], "candidate");
        assert_eq!(value["data"]["x"], 1);
        assert!(value["timestamp"].as_i64().unwrap() > 0);
    }

    #[test]
    fn test_envelope_without_optional_fields_parses() {
        let text = r#"{"from":"a","to":"b","type":"pair","data":null,"timestamp":1}"#;
        let envelope = SignalEnvelope::from_json(text).unwrap();
        assert_eq!(envelope.kind, SignalKind::Pair);
        assert!(envelope.from_name.is_none());
        assert!(!envelope.kind.is_negotiation());
    }

    #[test]
    fn test_unknown_kind_is_rejected() {
        let text = r#"{"from":"a","to":"b","type":"bogus","data":{},"timestamp":1}"#;
        assert!(SignalEnvelope::from_json(text).is_err());
    }
}
