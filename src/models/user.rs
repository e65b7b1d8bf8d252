use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserRole {
    SuperAdmin,
    Admin,
}

impl UserRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SuperAdmin => "super_admin",
            Self::Admin => "admin",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "super_admin" => Self::SuperAdmin,
            _ => Self::Admin,
        }
    }
}

/// A tenant operator. The core only ever reads active users to fan out
/// notifications; creation, invites and login live in the HTTP facade.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub tenant_id: i64,
    pub email: String,
    pub whatsapp_number: Option<String>,
    pub role: UserRole,
    pub permissions: serde_json::Value,
    pub is_active: bool,
    pub invite_token: Option<String>,
    pub invited_at: Option<DateTime<Utc>>,
    pub last_login: Option<DateTime<Utc>>,
}
