use std::sync::Arc;

use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};

use crate::error::TaskError;
use crate::jobs::NotifyTask;
use crate::models::alert::Alert;
use crate::store::Store;

#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: Option<String>,
    pub port: u16,
    pub user: Option<String>,
    pub pass: Option<String>,
    pub from: String,
}

/// Twilio credentials for the WhatsApp channel. All optional; the channel
/// skips gracefully when unconfigured.
#[derive(Debug, Clone, Default)]
pub struct TwilioConfig {
    pub account_sid: Option<String>,
    pub auth_token: Option<String>,
    pub whatsapp_from: Option<String>,
}

fn build_smtp_transport(cfg: &SmtpConfig) -> Option<AsyncSmtpTransport<Tokio1Executor>> {
    let host = cfg.host.as_deref()?;
    let mut builder = AsyncSmtpTransport::<Tokio1Executor>::relay(host).ok()?;
    builder = builder.port(cfg.port);
    if let (Some(user), Some(pass)) = (&cfg.user, &cfg.pass) {
        builder = builder.credentials(Credentials::new(user.clone(), pass.clone()));
    }
    Some(builder.build())
}

/// Denormalized context carried into every outbound message body.
struct AlertContext {
    alert: Alert,
    rule_name: String,
    device_name: String,
    device_key: String,
}

/// Fans one alert out to every active user of the owning tenant.
pub struct Notifier {
    store: Arc<Store>,
    smtp_config: SmtpConfig,
    smtp: Option<AsyncSmtpTransport<Tokio1Executor>>,
    twilio: TwilioConfig,
    http: reqwest::Client,
}

impl Notifier {
    pub fn new(store: Arc<Store>, smtp_config: SmtpConfig, twilio: TwilioConfig) -> Self {
        let smtp = build_smtp_transport(&smtp_config);
        if smtp.is_some() {
            tracing::info!("notifier: SMTP configured for email notifications");
        }
        if twilio.account_sid.is_some() && twilio.auth_token.is_some() {
            tracing::info!("notifier: Twilio configured for WhatsApp notifications");
        }
        Self {
            store,
            smtp_config,
            smtp,
            twilio,
            http: reqwest::Client::new(),
        }
    }

    /// Deliver one alert. Per-channel failures are isolated: an email
    /// failure never blocks a WhatsApp attempt for the same user, nor any
    /// attempt for another user. `notification_sent` is set after all
    /// attempts — it records "delivery was attempted", not "everyone
    /// received".
    pub async fn run_notify(&self, task: &NotifyTask) -> Result<(), TaskError> {
        let alert = self
            .store
            .get_alert(task.alert_id)
            .map_err(TaskError::retryable)?;
        let Some(alert) = alert else {
            tracing::warn!("notify for missing alert {}", task.alert_id);
            return Ok(());
        };

        let rule = self
            .store
            .get_rule(alert.tenant_id, alert.rule_id)
            .map_err(TaskError::retryable)?;
        let device = self
            .store
            .get_device_by_id(alert.tenant_id, alert.device_id)
            .map_err(TaskError::retryable)?;

        let ctx = AlertContext {
            rule_name: rule.map_or_else(|| "Unknown Rule".to_string(), |r| r.name),
            device_name: device
                .as_ref()
                .and_then(|d| d.name.clone())
                .or_else(|| device.as_ref().map(|d| d.device_key.clone()))
                .unwrap_or_else(|| "Unknown Device".to_string()),
            device_key: device.map_or_else(|| "Unknown".to_string(), |d| d.device_key),
            alert,
        };

        let users = self
            .store
            .active_users(ctx.alert.tenant_id)
            .map_err(TaskError::retryable)?;

        tracing::info!(
            "notification started: alert={} tenant={} users={} email={} whatsapp={}",
            ctx.alert.id,
            ctx.alert.tenant_id,
            users.len(),
            task.channels.email,
            task.channels.whatsapp,
        );

        for user in &users {
            if task.channels.email && !user.email.is_empty() {
                self.send_email(&user.email, &ctx).await;
            }
            if task.channels.whatsapp {
                if let Some(number) = user.whatsapp_number.as_deref() {
                    self.send_whatsapp(number, &ctx).await;
                }
            }
        }

        self.store
            .mark_notification_sent(ctx.alert.id)
            .map_err(TaskError::retryable)?;
        Ok(())
    }

    async fn send_email(&self, to_email: &str, ctx: &AlertContext) {
        let Some(transport) = &self.smtp else {
            tracing::debug!("email skipped: SMTP not configured");
            return;
        };

        let subject = format!(
            "[{}] Alert: {}",
            ctx.alert.severity.as_str().to_uppercase(),
            ctx.rule_name
        );
        let body = format!(
            "Alert Notification\n\n\
             Rule: {}\n\
             Device: {} ({})\n\
             Severity: {}\n\
             Triggered: {}\n\n\
             Message:\n{}\n\n\
             Telemetry Snapshot:\n{}\n",
            ctx.rule_name,
            ctx.device_name,
            ctx.device_key,
            ctx.alert.severity.as_str().to_uppercase(),
            ctx.alert.triggered_at.to_rfc3339(),
            ctx.alert.message,
            ctx.alert.telemetry_snapshot,
        );

        let from = match self.smtp_config.from.parse() {
            Ok(from) => from,
            Err(e) => {
                tracing::error!("email sender address invalid: {e}");
                return;
            }
        };
        let to = match to_email.parse() {
            Ok(to) => to,
            Err(e) => {
                tracing::error!("email to {} invalid: {e}", mask_email(to_email));
                return;
            }
        };

        let message = Message::builder()
            .from(from)
            .to(to)
            .subject(subject)
            .header(ContentType::TEXT_PLAIN)
            .body(body);
        match message {
            Ok(email) => {
                if let Err(e) = transport.send(email).await {
                    tracing::error!(
                        "email to {} failed for alert {}: {e}",
                        mask_email(to_email),
                        ctx.alert.id
                    );
                } else {
                    tracing::info!(
                        "email sent to {} for alert {}",
                        mask_email(to_email),
                        ctx.alert.id
                    );
                }
            }
            Err(e) => tracing::error!("failed to build email for alert {}: {e}", ctx.alert.id),
        }
    }

    async fn send_whatsapp(&self, to_number: &str, ctx: &AlertContext) {
        let (Some(sid), Some(token), Some(from)) = (
            self.twilio.account_sid.as_deref(),
            self.twilio.auth_token.as_deref(),
            self.twilio.whatsapp_from.as_deref(),
        ) else {
            tracing::debug!("whatsapp skipped: Twilio not configured");
            return;
        };

        let body = format!(
            "{} ALERT\n\nRule: {}\nDevice: {}\nTime: {}\n\n{}",
            ctx.alert.severity.as_str().to_uppercase(),
            ctx.rule_name,
            ctx.device_name,
            ctx.alert.triggered_at.to_rfc3339(),
            ctx.alert.message,
        );
        let url = format!("https://api.twilio.com/2010-04-01/Accounts/{sid}/Messages.json");
        let form = [
            ("From", format!("whatsapp:{from}")),
            ("To", format!("whatsapp:{to_number}")),
            ("Body", body),
        ];

        let result = self
            .http
            .post(&url)
            .basic_auth(sid, Some(token))
            .form(&form)
            .send()
            .await;
        match result {
            Ok(resp) if resp.status().is_success() => {
                tracing::info!(
                    "whatsapp sent to {} for alert {}",
                    mask_number(to_number),
                    ctx.alert.id
                );
            }
            Ok(resp) => tracing::error!(
                "whatsapp to {} rejected for alert {}: {}",
                mask_number(to_number),
                ctx.alert.id,
                resp.status()
            ),
            Err(e) => tracing::error!(
                "whatsapp to {} failed for alert {}: {e}",
                mask_number(to_number),
                ctx.alert.id
            ),
        }
    }
}

/// Recipient addresses are masked in logs.
fn mask_email(email: &str) -> String {
    match email.find('@') {
        Some(at) if at >= 3 => format!("{}***{}", &email[..3], &email[at..]),
        Some(at) => format!("***{}", &email[at..]),
        None => "***".to_string(),
    }
}

fn mask_number(number: &str) -> String {
    if number.len() > 7 {
        format!("{}***{}", &number[..4], &number[number.len() - 3..])
    } else {
        number.to_string()
    }
}
