use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A physical emitter, identified by a tenant-unique `device_key`.
/// Auto-created on first telemetry sighting when not pre-registered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub id: i64,
    pub tenant_id: i64,
    pub device_key: String,
    pub name: Option<String>,
    pub manufacturer: Option<String>,
    pub model: Option<String>,
    pub region: Option<String>,
    pub is_active: bool,
    pub last_seen: Option<DateTime<Utc>>,
}
