use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::rule::Severity;

/// A durable record of a rule firing. Append-only except for two monotonic
/// transitions: `resolved_at` is set once and `notification_sent` flips
/// false→true exactly once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: i64,
    pub tenant_id: i64,
    pub rule_id: i64,
    pub device_id: i64,
    pub triggered_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub severity: Severity,
    pub message: String,
    /// Parameter-key → value at trigger time.
    pub telemetry_snapshot: serde_json::Value,
    pub notification_sent: bool,
}

/// New alert ready for insertion; the store assigns the id.
#[derive(Debug, Clone)]
pub struct NewAlert {
    pub tenant_id: i64,
    pub rule_id: i64,
    pub device_id: i64,
    pub triggered_at: DateTime<Utc>,
    pub severity: Severity,
    pub message: String,
    pub telemetry_snapshot: serde_json::Value,
}
