use std::sync::Arc;

use chrono::Utc;

use crate::cache::IdentityCache;
use crate::error::IngestError;
use crate::jobs::{JobQueue, QUEUE_RULE_ENGINE, RuleEvalTask, TaskEnvelope, TaskKind};
use crate::store::Store;
use crate::telemetry::{TelemetryPayload, parse_topic};
use crate::tsdb::{MetricsSink, build_points};

/// The per-message pipeline: parse → resolve → discover → write →
/// presence → dispatch.
///
/// `process` must never propagate a failure to the subscriber loop.
/// Parse and tenant errors drop the message; everything downstream of
/// identity resolution is best-effort and logged.
pub struct Ingestor {
    store: Arc<Store>,
    cache: IdentityCache,
    sink: Arc<dyn MetricsSink>,
    queue: Arc<dyn JobQueue>,
    queue_high_water: usize,
}

impl Ingestor {
    pub fn new(
        store: Arc<Store>,
        cache: IdentityCache,
        sink: Arc<dyn MetricsSink>,
        queue: Arc<dyn JobQueue>,
        queue_high_water: usize,
    ) -> Self {
        Self { store, cache, sink, queue, queue_high_water }
    }

    /// Handle one inbound broker message.
    pub async fn process(&self, topic: &str, payload: &[u8]) {
        let (slug, device_key) = match parse_topic(topic) {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::warn!("dropping message: {e}");
                return;
            }
        };

        let data = match TelemetryPayload::parse(payload) {
            Ok(data) => data,
            Err(e) => {
                tracing::warn!("dropping message on {topic}: {e}");
                return;
            }
        };

        // Device timestamp when present and parseable, server time otherwise.
        let ts = data.timestamp().unwrap_or_else(Utc::now);

        let tenant = match self.cache.resolve_tenant(slug).await {
            Ok(Some(tenant)) => tenant,
            Ok(None) => {
                tracing::warn!(
                    "dropping message for device_key={device_key}: {}",
                    IngestError::UnknownTenant(slug.to_string())
                );
                return;
            }
            Err(e) => {
                tracing::error!(
                    "dropping message for {slug}: {}",
                    IngestError::Store(e.to_string())
                );
                return;
            }
        };

        let device = match self.cache.resolve_or_create_device(tenant.id, device_key, ts).await {
            Ok(device) => device,
            Err(e) => {
                tracing::error!(
                    "dropping message for tenant={} key={device_key}: {}",
                    tenant.id,
                    IngestError::Store(e.to_string())
                );
                return;
            }
        };

        match self
            .store
            .discover_parameters(tenant.id, device.id, &data.metrics, Utc::now())
        {
            Ok(discovered) => {
                for key in discovered.iter().filter(|(_, new)| **new).map(|(k, _)| k) {
                    tracing::info!(
                        "parameter discovered: tenant={} device={} key={key}",
                        tenant.id, device.id
                    );
                }
            }
            Err(e) => {
                tracing::error!(
                    "parameter discovery failed for tenant={} device={}: {}",
                    tenant.id,
                    device.id,
                    IngestError::Store(e.to_string())
                );
            }
        }

        // The sink swallows its own failures; point loss is accepted.
        self.sink
            .write_batch(build_points(tenant.id, device.id, &data.metrics, ts))
            .await;

        if let Err(e) = self.store.touch_last_seen(tenant.id, device.id, ts) {
            tracing::warn!(
                "last_seen update failed for tenant={} device={}: {e}",
                tenant.id, device.id
            );
        }

        self.dispatch_rule_eval(tenant.id, device.id, &data, ts).await;

        tracing::info!(
            "telemetry processed: tenant={} device={} metrics={} ts={}",
            tenant.id,
            device.id,
            data.metrics.len(),
            ts.to_rfc3339(),
        );
    }

    async fn dispatch_rule_eval(
        &self,
        tenant_id: i64,
        device_id: i64,
        data: &TelemetryPayload,
        ts: chrono::DateTime<Utc>,
    ) {
        let task = RuleEvalTask {
            tenant_id,
            device_id,
            metrics: data.metrics.clone(),
            timestamp: ts,
        };
        let envelope = match TaskEnvelope::new(TaskKind::RuleEval, &task) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::error!("failed to build rule-eval task: {e}");
                return;
            }
        };
        if let Err(e) = self.queue.enqueue(&envelope).await {
            tracing::warn!(
                "rule dispatch failed for tenant={tenant_id} device={device_id}: {e}"
            );
            return;
        }

        // Backpressure is surfaced, not enforced: dropping rule evaluation
        // is worse than dropping telemetry.
        if let Ok(depth) = self.queue.depth(QUEUE_RULE_ENGINE).await {
            if depth > self.queue_high_water {
                tracing::warn!(
                    "rule_engine queue depth {depth} above high water {}",
                    self.queue_high_water
                );
            }
        }
    }
}
