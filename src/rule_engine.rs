use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;

use crate::error::TaskError;
use crate::jobs::{JobQueue, NotifyTask, RuleEvalTask, TaskEnvelope, TaskKind};
use crate::models::alert::NewAlert;
use crate::models::rule::Rule;
use crate::rules::{Condition, build_alert_message, evaluate};
use crate::schedule::is_rule_scheduled;
use crate::store::Store;

/// Evaluate all active rules for one (tenant, device) telemetry sample.
///
/// Rules are processed serially; a failure in one rule is logged with its
/// id and never affects the others. Only failures to load the rule set at
/// all bubble up (retryable — the sample would otherwise be lost).
pub async fn run_rule_eval(
    store: &Store,
    queue: &Arc<dyn JobQueue>,
    task: &RuleEvalTask,
) -> Result<(), TaskError> {
    let tenant = store
        .get_tenant(task.tenant_id)
        .map_err(TaskError::retryable)?;
    let Some(tenant) = tenant else {
        tracing::warn!("rule eval for missing tenant {}", task.tenant_id);
        return Ok(());
    };

    let rules = store
        .active_rules_for_device(task.tenant_id, task.device_id)
        .map_err(TaskError::retryable)?;

    tracing::info!(
        "rule evaluation started: tenant={} device={} rules={}",
        task.tenant_id,
        task.device_id,
        rules.len()
    );

    let tz = tenant.tz();
    for rule in rules {
        if let Err(e) = eval_one(store, queue, task, &rule, tz).await {
            tracing::error!(rule_id = rule.id, "rule.evaluation_error: {e:#}");
        }
    }

    Ok(())
}

async fn eval_one(
    store: &Store,
    queue: &Arc<dyn JobQueue>,
    task: &RuleEvalTask,
    rule: &Rule,
    tz: chrono_tz::Tz,
) -> anyhow::Result<()> {
    if !is_rule_scheduled(rule.schedule_type, &rule.schedule_config, task.timestamp, tz) {
        tracing::debug!("rule {} skipped: outside schedule", rule.id);
        return Ok(());
    }

    // Cheap pre-check; the materializing transaction re-checks under lock.
    if rule.cooldown_minutes > 0 {
        if let Some(cooldown) = store.get_cooldown(rule.id, task.device_id)? {
            if Utc::now() - cooldown.last_triggered
                < chrono::Duration::minutes(rule.cooldown_minutes)
            {
                tracing::info!(
                    "rule {} device {} in cooldown (last {})",
                    rule.id,
                    task.device_id,
                    cooldown.last_triggered.to_rfc3339()
                );
                return Ok(());
            }
        }
    }

    let condition: Condition = serde_json::from_value(rule.conditions.clone())
        .context("invalid condition tree")?;

    if !evaluate(&condition, &task.metrics) {
        return Ok(());
    }

    let alert = NewAlert {
        tenant_id: task.tenant_id,
        rule_id: rule.id,
        device_id: task.device_id,
        triggered_at: task.timestamp,
        severity: rule.severity,
        message: build_alert_message(&rule.name, &condition, &task.metrics),
        telemetry_snapshot: serde_json::to_value(&task.metrics)?,
    };

    let Some(alert_id) = store.try_trigger_alert(&alert, rule.cooldown_minutes, Utc::now())? else {
        tracing::info!(
            "rule {} device {} in cooldown (lost materialization race)",
            rule.id,
            task.device_id
        );
        return Ok(());
    };

    let notify = NotifyTask {
        alert_id,
        channels: rule.notification_channels,
    };
    queue
        .enqueue(&TaskEnvelope::new(TaskKind::Notify, &notify)?)
        .await
        .context("notify enqueue failed")?;

    tracing::info!(
        "alert triggered: tenant={} device={} rule={} alert={} severity={}",
        task.tenant_id,
        task.device_id,
        rule.id,
        alert_id,
        rule.severity.as_str()
    );
    Ok(())
}
