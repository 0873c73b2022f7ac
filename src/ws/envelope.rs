use serde::de::Error as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::connection::RECONNECT_FAILED;
use super::error::WsError;
use crate::bus::WILDCARD;

/// Event types the client publishes itself; a server frame may not claim them.
const RESERVED: [&str; 2] = [WILDCARD, RECONNECT_FAILED];

/// Wire wrapper for every realtime frame: `{ "type": string, "data": any }`.
///
/// A frame without `data` carries `null`.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
}

impl Envelope {
    #[must_use]
    pub fn new<S: Into<String>>(kind: S, data: Value) -> Self {
        Self {
            kind: kind.into(),
            data,
        }
    }

    /// Parse an inbound text frame.
    ///
    /// Frames typed as [`WILDCARD`] or [`RECONNECT_FAILED`] are rejected, so subscribers of those
    /// keys only ever see what the client itself publishes.
    pub fn parse(text: &str) -> Result<Self, WsError> {
        let envelope: Self = serde_json::from_str(text).map_err(WsError::MalformedFrame)?;
        if envelope.kind.trim().is_empty() {
            return Err(WsError::MalformedFrame(serde_json::Error::custom(
                "envelope type is empty",
            )));
        }
        if RESERVED.contains(&envelope.kind.as_str()) {
            return Err(WsError::MalformedFrame(serde_json::Error::custom(format!(
                "envelope type {:?} is reserved",
                envelope.kind
            ))));
        }
        Ok(envelope)
    }

    pub fn to_text(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn parses_type_and_data() {
        let envelope =
            Envelope::parse(r#"{"type":"order.updated","data":{"id":7,"status":"paid"}}"#).unwrap();

        assert_eq!(envelope.kind, "order.updated");
        assert_eq!(envelope.data, json!({ "id": 7, "status": "paid" }));
    }

    #[test]
    fn missing_data_is_null() {
        let envelope = Envelope::parse(r#"{"type":"ping"}"#).unwrap();
        assert_eq!(envelope.data, Value::Null);
    }

    #[test]
    fn rejects_frames_outside_the_envelope_shape() {
        for text in [
            "not json",
            "[1,2,3]",
            r#"{"data":{}}"#,
            r#"{"type":42,"data":{}}"#,
            r#"{"type":"  ","data":{}}"#,
            r#"{"type":"*","data":{"type":"x","data":1}}"#,
            r#"{"type":"reconnect_failed","data":{"attempts":3}}"#,
        ] {
            assert!(
                matches!(Envelope::parse(text), Err(WsError::MalformedFrame(_))),
                "{text} should be rejected"
            );
        }
    }

    #[test]
    fn serializes_with_type_key() {
        let text = Envelope::new("chat.send", json!({ "body": "hi" }))
            .to_text()
            .unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value, json!({ "type": "chat.send", "data": { "body": "hi" } }));
    }
}
