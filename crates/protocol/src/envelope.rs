use serde::{Deserialize, Serialize};

/// Every frame on the socket, in both directions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub message_type: String,
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub ts: i64,
    #[serde(default)]
    pub payload: serde_json::Value,
}

pub fn parse_envelope(text: &str) -> anyhow::Result<Envelope> {
    Ok(serde_json::from_str(text)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_frames_without_optional_fields() {
        let env = parse_envelope(r#"{"type":"driver_offline"}"#).unwrap();
        assert_eq!(env.message_type, "driver_offline");
        assert!(env.payload.is_null());
        assert_eq!(env.ts, 0);
    }

    #[test]
    fn rejects_frames_without_type() {
        assert!(parse_envelope(r#"{"payload":{}}"#).is_err());
    }
}
