use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An isolated factory. Every row the core touches carries `tenant_id`;
/// this is the security boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tenant {
    pub id: i64,
    pub slug: String,
    pub name: String,
    pub timezone: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Tenant {
    /// The tenant's IANA timezone, falling back to UTC when the stored
    /// name is unknown.
    pub fn tz(&self) -> chrono_tz::Tz {
        self.timezone.parse().unwrap_or(chrono_tz::UTC)
    }
}
