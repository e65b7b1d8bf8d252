use crate::notify::{SmtpConfig, TwilioConfig};
use crate::worker::WorkerPools;

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[derive(Debug, Clone)]
pub struct ClickhouseConfig {
    pub url: String,
    pub database: String,
    pub user: String,
    pub password: String,
}

#[derive(Debug, Clone)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// Deployment configuration, read once from the environment at process
/// start. No hot reload.
#[derive(Debug, Clone)]
pub struct Config {
    pub db_path: String,
    pub clickhouse: ClickhouseConfig,
    pub redis_url: String,
    pub mqtt: MqttConfig,
    pub smtp: SmtpConfig,
    pub twilio: TwilioConfig,
    pub queue_high_water: usize,
    pub workers: WorkerPools,
    pub app_env: String,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            db_path: env_or("PLANTOPS_DB", "./plantops.db"),
            clickhouse: ClickhouseConfig {
                url: env_or("PLANTOPS_CLICKHOUSE_URL", "http://localhost:8123"),
                database: env_or("PLANTOPS_CLICKHOUSE_DATABASE", "plantops"),
                user: env_or("PLANTOPS_CLICKHOUSE_USER", "default"),
                password: env_or("PLANTOPS_CLICKHOUSE_PASSWORD", ""),
            },
            redis_url: env_or("PLANTOPS_REDIS_URL", "redis://localhost:6379"),
            mqtt: MqttConfig {
                host: env_or("PLANTOPS_MQTT_HOST", "localhost"),
                port: env_parse("PLANTOPS_MQTT_PORT", 1883),
                username: env_opt("PLANTOPS_MQTT_USERNAME"),
                password: env_opt("PLANTOPS_MQTT_PASSWORD"),
            },
            smtp: SmtpConfig {
                host: env_opt("PLANTOPS_SMTP_HOST"),
                port: env_parse("PLANTOPS_SMTP_PORT", 587),
                user: env_opt("PLANTOPS_SMTP_USER"),
                pass: env_opt("PLANTOPS_SMTP_PASS"),
                from: env_or("PLANTOPS_SMTP_FROM", "plantops@localhost"),
            },
            twilio: TwilioConfig {
                account_sid: env_opt("PLANTOPS_TWILIO_ACCOUNT_SID"),
                auth_token: env_opt("PLANTOPS_TWILIO_AUTH_TOKEN"),
                whatsapp_from: env_opt("PLANTOPS_TWILIO_WHATSAPP_FROM"),
            },
            queue_high_water: env_parse("PLANTOPS_QUEUE_HIGH_WATER", 10_000),
            workers: WorkerPools {
                rule_engine: env_parse("PLANTOPS_WORKERS_RULE_ENGINE", 1),
                notifications: env_parse("PLANTOPS_WORKERS_NOTIFICATIONS", 2),
                analytics: env_parse("PLANTOPS_WORKERS_ANALYTICS", 1),
                reporting: env_parse("PLANTOPS_WORKERS_REPORTING", 1),
            },
            app_env: env_or("PLANTOPS_APP_ENV", "development"),
        }
    }
}
