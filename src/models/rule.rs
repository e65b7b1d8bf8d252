use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleScope {
    Device,
    Global,
}

impl RuleScope {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Device => "device",
            Self::Global => "global",
        }
    }

    /// Unknown values fall back to `Device`, the narrower scope.
    pub fn parse(s: &str) -> Self {
        match s {
            "global" => Self::Global,
            _ => Self::Device,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleType {
    Always,
    TimeWindow,
    DateRange,
}

impl ScheduleType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Always => "always",
            Self::TimeWindow => "time_window",
            Self::DateRange => "date_range",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "time_window" => Self::TimeWindow,
            "date_range" => Self::DateRange,
            _ => Self::Always,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "low" => Self::Low,
            "high" => Self::High,
            "critical" => Self::Critical,
            _ => Self::Medium,
        }
    }
}

/// A user-authored predicate over the latest metrics of a device.
///
/// `conditions` holds the raw JSON condition tree; it is parsed into
/// [`crate::rules::Condition`] at evaluation time so that a malformed tree
/// poisons only its own rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub id: i64,
    pub tenant_id: i64,
    pub name: String,
    pub description: Option<String>,
    pub scope: RuleScope,
    pub conditions: serde_json::Value,
    pub cooldown_minutes: i64,
    pub is_active: bool,
    pub schedule_type: ScheduleType,
    pub schedule_config: serde_json::Value,
    pub severity: Severity,
    pub notification_channels: NotificationChannels,
    pub created_by: Option<i64>,
}

/// Which delivery channels a rule fans out to.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct NotificationChannels {
    #[serde(default)]
    pub email: bool,
    #[serde(default)]
    pub whatsapp: bool,
}

/// Last-trigger bookkeeping for one (rule, device) pair. One row per pair
/// the rule has ever fired for; composite primary key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cooldown {
    pub rule_id: i64,
    pub device_id: i64,
    pub last_triggered: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_parse_falls_back_to_medium() {
        assert_eq!(Severity::parse("critical"), Severity::Critical);
        assert_eq!(Severity::parse("catastrophic"), Severity::Medium);
    }

    #[test]
    fn schedule_type_parse_falls_back_to_always() {
        assert_eq!(ScheduleType::parse("time_window"), ScheduleType::TimeWindow);
        assert_eq!(ScheduleType::parse("cron"), ScheduleType::Always);
    }

    #[test]
    fn channels_default_to_off() {
        let ch: NotificationChannels = serde_json::from_str("{}").unwrap();
        assert!(!ch.email);
        assert!(!ch.whatsapp);
        let ch: NotificationChannels =
            serde_json::from_str(r#"{"email":true,"whatsapp":false}"#).unwrap();
        assert!(ch.email);
        assert!(!ch.whatsapp);
    }
}
