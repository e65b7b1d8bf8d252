use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use clickhouse::Client;

use crate::error::IngestError;
use crate::rules::Metrics;

/// One sample row in `plantops.device_metrics`. Tenant, device and
/// parameter are rendered as string tags; the timestamp travels as epoch
/// nanoseconds into the `DateTime64(9)` column.
#[derive(Debug, Clone, PartialEq, clickhouse::Row, serde::Serialize)]
pub struct MetricPoint {
    pub timestamp: i64,
    pub tenant_id: String,
    pub device_id: String,
    pub parameter: String,
    pub value: f64,
}

/// Build the batch for one inbound message. A value that cannot be
/// coerced to a float is skipped without aborting the batch.
pub fn build_points(
    tenant_id: i64,
    device_id: i64,
    metrics: &Metrics,
    ts: DateTime<Utc>,
) -> Vec<MetricPoint> {
    let timestamp = ts.timestamp_nanos_opt().unwrap_or_default();
    metrics
        .iter()
        .filter_map(|(key, value)| {
            let Some(value) = value.as_f64() else {
                tracing::warn!("skipping non-coercible metric value for {key}");
                return None;
            };
            Some(MetricPoint {
                timestamp,
                tenant_id: tenant_id.to_string(),
                device_id: device_id.to_string(),
                parameter: key.clone(),
                value,
            })
        })
        .collect()
}

/// Destination for metric batches. The ClickHouse implementation swallows
/// every failure: telemetry-point loss is an accepted degradation, a
/// crashed ingest loop is not.
#[async_trait]
pub trait MetricsSink: Send + Sync {
    async fn write_batch(&self, points: Vec<MetricPoint>);
}

pub struct Tsdb {
    client: Client,
    write_timeout: Duration,
}

impl Tsdb {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            write_timeout: Duration::from_secs(10),
        }
    }
}

#[async_trait]
impl MetricsSink for Tsdb {
    async fn write_batch(&self, points: Vec<MetricPoint>) {
        if points.is_empty() {
            return;
        }
        let count = points.len();
        let result = tokio::time::timeout(self.write_timeout, async {
            let mut insert = self.client.insert("plantops.device_metrics")?;
            for point in &points {
                insert.write(point).await?;
            }
            insert.end().await
        })
        .await;

        match result {
            Ok(Ok(())) => tracing::debug!("wrote {count} metric point(s)"),
            Ok(Err(e)) => {
                tracing::error!("{}", IngestError::TimeSeries(format!("{count} points: {e}")));
            }
            Err(_) => {
                tracing::error!("{}", IngestError::TimeSeries(format!("{count} points: timed out")));
            }
        }
    }
}
