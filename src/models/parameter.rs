use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Declared data type of a parameter, derived from the runtime numeric
/// kind on first sighting. `String` is reserved for future payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Float,
    Int,
    String,
}

impl DataType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Float => "float",
            Self::Int => "int",
            Self::String => "string",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "float" => Some(Self::Float),
            "int" => Some(Self::Int),
            "string" => Some(Self::String),
            _ => None,
        }
    }

    /// Derive the declared type from a JSON number.
    pub fn of_number(n: &serde_json::Number) -> Self {
        if n.is_i64() || n.is_u64() { Self::Int } else { Self::Float }
    }
}

/// A named numeric channel emitted by a device, discovered lazily.
/// `(device_id, parameter_key)` is unique.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Parameter {
    pub id: i64,
    pub tenant_id: i64,
    pub device_id: i64,
    pub parameter_key: String,
    pub display_name: Option<String>,
    pub unit: Option<String>,
    pub data_type: DataType,
    pub is_kpi_selected: bool,
    pub discovered_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
