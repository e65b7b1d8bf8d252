use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};

use crate::models::rule::NotificationChannels;
use crate::rules::Metrics;

pub const QUEUE_RULE_ENGINE: &str = "rule_engine";
pub const QUEUE_NOTIFICATIONS: &str = "notifications";
pub const QUEUE_ANALYTICS: &str = "analytics";
pub const QUEUE_REPORTING: &str = "reporting";

/// Every named queue a worker can subscribe to.
pub const QUEUES: [&str; 4] = [
    QUEUE_RULE_ENGINE,
    QUEUE_NOTIFICATIONS,
    QUEUE_ANALYTICS,
    QUEUE_REPORTING,
];

/// Task kinds routed over the job runner, each bound to one queue and a
/// per-kind retry budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    RuleEval,
    Notify,
    Analytics,
    Report,
}

impl TaskKind {
    pub fn queue(self) -> &'static str {
        match self {
            Self::RuleEval => QUEUE_RULE_ENGINE,
            Self::Notify => QUEUE_NOTIFICATIONS,
            Self::Analytics => QUEUE_ANALYTICS,
            Self::Report => QUEUE_REPORTING,
        }
    }

    /// Transient failures retry up to this many times before dead-letter.
    pub fn max_retries(self) -> u32 {
        match self {
            Self::RuleEval | Self::Notify => 3,
            Self::Analytics | Self::Report => 1,
        }
    }
}

/// Evaluate all active rules for a device against one telemetry sample.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleEvalTask {
    pub tenant_id: i64,
    pub device_id: i64,
    pub metrics: Metrics,
    pub timestamp: DateTime<Utc>,
}

/// Fan one alert out to the rule's configured channels.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyTask {
    pub alert_id: i64,
    pub channels: NotificationChannels,
}

/// Run an opaque analytics or report executor for a job record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobTask {
    pub tenant_id: i64,
    pub job_id: String,
}

/// The wire form of a task: kind, payload, delivery bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEnvelope {
    pub id: String,
    pub kind: TaskKind,
    /// Deliveries attempted so far; the first delivery sees 0.
    pub attempt: u32,
    pub enqueued_at: DateTime<Utc>,
    pub payload: serde_json::Value,
}

impl TaskEnvelope {
    pub fn new<T: Serialize>(kind: TaskKind, payload: &T) -> anyhow::Result<Self> {
        Ok(Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            attempt: 0,
            enqueued_at: Utc::now(),
            payload: serde_json::to_value(payload)?,
        })
    }

    pub fn decode<T: for<'de> Deserialize<'de>>(&self) -> anyhow::Result<T> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

/// A reserved task plus the exact wire bytes needed to acknowledge it.
#[derive(Debug, Clone)]
pub struct Leased {
    pub envelope: TaskEnvelope,
    raw: String,
}

/// Backend-agnostic task dispatch with at-least-once delivery.
///
/// A reserved task sits on a per-worker processing list until it is
/// acked; worker loss leaves it there for `requeue_orphans` to recover,
/// so redelivery is possible and handlers must tolerate it.
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, envelope: &TaskEnvelope) -> anyhow::Result<()>;

    /// Block up to `timeout` for the next task on `queue`, moving it onto
    /// the worker's processing list.
    async fn reserve(
        &self,
        queue: &str,
        worker_id: &str,
        timeout: Duration,
    ) -> anyhow::Result<Option<Leased>>;

    /// Drop a handled task from the worker's processing list.
    async fn ack(&self, queue: &str, worker_id: &str, leased: &Leased) -> anyhow::Result<()>;

    /// Move tasks stranded on a worker's processing list back onto the
    /// queue. Called at worker startup.
    async fn requeue_orphans(&self, queue: &str, worker_id: &str) -> anyhow::Result<usize>;

    /// Record a task that exhausted its retries.
    async fn dead_letter(&self, envelope: &TaskEnvelope, error: &str) -> anyhow::Result<()>;

    /// Pending tasks on `queue`, surfaced for backpressure monitoring.
    async fn depth(&self, queue: &str) -> anyhow::Result<usize>;
}

// ── Redis implementation ──

const DEAD_LETTER_KEY: &str = "plantops:dead_letter";

fn queue_key(queue: &str) -> String {
    format!("plantops:queue:{queue}")
}

fn processing_key(queue: &str, worker_id: &str) -> String {
    format!("plantops:queue:{queue}:processing:{worker_id}")
}

pub struct RedisQueue {
    conn: ConnectionManager,
}

impl RedisQueue {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl JobQueue for RedisQueue {
    async fn enqueue(&self, envelope: &TaskEnvelope) -> anyhow::Result<()> {
        let raw = serde_json::to_string(envelope)?;
        let mut conn = self.conn.clone();
        conn.lpush::<_, _, ()>(queue_key(envelope.kind.queue()), raw).await?;
        Ok(())
    }

    async fn reserve(
        &self,
        queue: &str,
        worker_id: &str,
        timeout: Duration,
    ) -> anyhow::Result<Option<Leased>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn
            .blmove(
                queue_key(queue),
                processing_key(queue, worker_id),
                redis::Direction::Right,
                redis::Direction::Left,
                timeout.as_secs_f64(),
            )
            .await?;
        let Some(raw) = raw else { return Ok(None) };

        match serde_json::from_str::<TaskEnvelope>(&raw) {
            Ok(envelope) => Ok(Some(Leased { envelope, raw })),
            Err(e) => {
                // A task that cannot be decoded can never be handled;
                // drop it from the processing list so it does not loop.
                tracing::error!("dropping undecodable task on {queue}: {e}");
                conn.lrem::<_, _, ()>(processing_key(queue, worker_id), 1, raw).await?;
                Ok(None)
            }
        }
    }

    async fn ack(&self, queue: &str, worker_id: &str, leased: &Leased) -> anyhow::Result<()> {
        let mut conn = self.conn.clone();
        conn.lrem::<_, _, ()>(processing_key(queue, worker_id), 1, &leased.raw).await?;
        Ok(())
    }

    async fn requeue_orphans(&self, queue: &str, worker_id: &str) -> anyhow::Result<usize> {
        let mut conn = self.conn.clone();
        let mut moved = 0;
        loop {
            let raw: Option<String> = conn
                .lmove(
                    processing_key(queue, worker_id),
                    queue_key(queue),
                    redis::Direction::Right,
                    redis::Direction::Left,
                )
                .await?;
            if raw.is_none() {
                break;
            }
            moved += 1;
        }
        Ok(moved)
    }

    async fn dead_letter(&self, envelope: &TaskEnvelope, error: &str) -> anyhow::Result<()> {
        let record = serde_json::json!({
            "task": envelope,
            "error": error,
            "failed_at": Utc::now(),
        });
        let mut conn = self.conn.clone();
        conn.lpush::<_, _, ()>(DEAD_LETTER_KEY, record.to_string()).await?;
        Ok(())
    }

    async fn depth(&self, queue: &str) -> anyhow::Result<usize> {
        let mut conn = self.conn.clone();
        let len: usize = conn.llen(queue_key(queue)).await?;
        Ok(len)
    }
}

// ── In-memory implementation (tests) ──
