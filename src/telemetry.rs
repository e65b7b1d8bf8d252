use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::IngestError;

/// Parse a broker topic into (tenant slug, device key).
///
/// The only accepted grammar is `factories/<slug>/devices/<key>/telemetry`
/// with non-empty slug and key. Anything else is `InvalidTopic`.
pub fn parse_topic(topic: &str) -> Result<(&str, &str), IngestError> {
    let parts: Vec<&str> = topic.split('/').collect();

    if parts.len() != 5
        || parts[0] != "factories"
        || parts[2] != "devices"
        || parts[4] != "telemetry"
        || parts[1].is_empty()
        || parts[3].is_empty()
    {
        return Err(IngestError::InvalidTopic(topic.to_string()));
    }

    Ok((parts[1], parts[3]))
}

/// Render the topic for a (slug, key) pair. Inverse of [`parse_topic`].
pub fn render_topic(slug: &str, key: &str) -> String {
    format!("factories/{slug}/devices/{key}/telemetry")
}

/// Telemetry payload published by a device.
///
/// ```json
/// {"timestamp": "2024-01-15T10:30:00Z", "metrics": {"temperature": 45.5, "rpm": 1500}}
/// ```
///
/// `metrics` values stay as `serde_json::Number` so parameter discovery can
/// tell ints from floats. Non-numeric values fail deserialization outright.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryPayload {
    #[serde(default)]
    pub timestamp: Option<String>,
    pub metrics: BTreeMap<String, serde_json::Number>,
}

impl TelemetryPayload {
    /// Parse and validate a raw payload. Empty or missing metrics are
    /// rejected; a bad or absent timestamp is not (the orchestrator
    /// substitutes wall-clock time).
    pub fn parse(raw: &[u8]) -> Result<Self, IngestError> {
        let payload: TelemetryPayload = serde_json::from_slice(raw)
            .map_err(|e| IngestError::InvalidPayload(e.to_string()))?;
        if payload.metrics.is_empty() {
            return Err(IngestError::InvalidPayload("metrics cannot be empty".into()));
        }
        Ok(payload)
    }

    /// The device-declared timestamp, if present and parseable as RFC 3339.
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.timestamp
            .as_deref()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_valid_topic() {
        let (slug, key) = parse_topic("factories/vpc/devices/M01/telemetry").unwrap();
        assert_eq!(slug, "vpc");
        assert_eq!(key, "M01");
    }

    #[test]
    fn topic_round_trip() {
        let topic = "factories/vpc/devices/M01/telemetry";
        let (slug, key) = parse_topic(topic).unwrap();
        assert_eq!(render_topic(slug, key), topic);
    }

    #[test]
    fn reject_malformed_topics() {
        for topic in [
            "",
            "factories/vpc/devices/M01",
            "factories/vpc/devices/M01/telemetry/extra",
            "plants/vpc/devices/M01/telemetry",
            "factories/vpc/machines/M01/telemetry",
            "factories/vpc/devices/M01/data",
            "factories//devices/M01/telemetry",
            "factories/vpc/devices//telemetry",
        ] {
            assert!(parse_topic(topic).is_err(), "accepted: {topic}");
        }
    }

    #[test]
    fn parse_valid_payload() {
        let raw = br#"{"timestamp":"2024-01-15T10:00:00Z","metrics":{"temperature":45.5,"pressure":101.3,"rpm":1500}}"#;
        let payload = TelemetryPayload::parse(raw).unwrap();
        assert_eq!(payload.metrics.len(), 3);
        assert_eq!(
            payload.timestamp().unwrap().to_rfc3339(),
            "2024-01-15T10:00:00+00:00"
        );
        assert!(payload.metrics["rpm"].is_i64());
        assert!(!payload.metrics["temperature"].is_i64());
    }

    #[test]
    fn metrics_survive_round_trip() {
        let raw = br#"{"metrics":{"a":1,"b":2.5}}"#;
        let payload = TelemetryPayload::parse(raw).unwrap();
        let reparsed = TelemetryPayload::parse(&serde_json::to_vec(&payload).unwrap()).unwrap();
        assert_eq!(payload.metrics, reparsed.metrics);
    }

    #[test]
    fn reject_garbage() {
        assert!(TelemetryPayload::parse(b"invalid{{").is_err());
    }

    #[test]
    fn reject_empty_metrics() {
        assert!(TelemetryPayload::parse(br#"{"metrics":{}}"#).is_err());
        assert!(TelemetryPayload::parse(br#"{"timestamp":"2024-01-15T10:00:00Z"}"#).is_err());
    }

    #[test]
    fn reject_non_numeric_metric() {
        assert!(TelemetryPayload::parse(br#"{"metrics":{"temperature":"hot"}}"#).is_err());
        assert!(TelemetryPayload::parse(br#"{"metrics":{"temperature":null}}"#).is_err());
    }

    #[test]
    fn missing_timestamp_is_none() {
        let payload = TelemetryPayload::parse(br#"{"metrics":{"a":1}}"#).unwrap();
        assert!(payload.timestamp().is_none());
    }

    #[test]
    fn unparseable_timestamp_is_none() {
        let payload =
            TelemetryPayload::parse(br#"{"timestamp":"yesterday","metrics":{"a":1}}"#).unwrap();
        assert!(payload.timestamp().is_none());
    }
}
