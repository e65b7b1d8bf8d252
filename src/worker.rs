use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::analytics::{self, JobExecutor};
use crate::error::TaskError;
use crate::jobs::{JobQueue, JobTask, Leased, NotifyTask, QUEUES, RuleEvalTask, TaskEnvelope, TaskKind};
use crate::notify::Notifier;
use crate::rule_engine;
use crate::store::Store;

/// Hard per-task limit; expiry terminates the handler.
const HARD_TIME_LIMIT: Duration = Duration::from_secs(3600);
/// Soft limit, surfaced to handlers as a deadline they can observe.
const SOFT_TIME_LIMIT: Duration = Duration::from_secs(3300);
const RESERVE_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_BACKOFF: Duration = Duration::from_secs(60);
const SWEEP_INTERVAL: Duration = Duration::from_secs(3600);
/// Completed task state is retained this long.
const JOB_RETENTION_HOURS: i64 = 24;

/// Consumers per named queue. `rule_engine` defaults to a single consumer
/// so tasks for the same (tenant, device) are processed in enqueue order.
#[derive(Debug, Clone)]
pub struct WorkerPools {
    pub rule_engine: usize,
    pub notifications: usize,
    pub analytics: usize,
    pub reporting: usize,
}

impl Default for WorkerPools {
    fn default() -> Self {
        Self { rule_engine: 1, notifications: 2, analytics: 1, reporting: 1 }
    }
}

impl WorkerPools {
    fn size_for(&self, queue: &str) -> usize {
        match queue {
            crate::jobs::QUEUE_RULE_ENGINE => self.rule_engine,
            crate::jobs::QUEUE_NOTIFICATIONS => self.notifications,
            crate::jobs::QUEUE_ANALYTICS => self.analytics,
            crate::jobs::QUEUE_REPORTING => self.reporting,
            _ => 1,
        }
    }
}

/// Everything a consumer needs to handle any task kind.
pub struct WorkerContext {
    pub store: Arc<Store>,
    pub queue: Arc<dyn JobQueue>,
    pub notifier: Arc<Notifier>,
    pub executor: Option<Arc<dyn JobExecutor>>,
}

/// Spawn the consumer pools plus the retention sweeper and run until the
/// shutdown flag flips.
pub async fn run(ctx: Arc<WorkerContext>, pools: WorkerPools, shutdown: watch::Receiver<bool>) {
    let mut handles = Vec::new();
    for queue_name in QUEUES {
        for index in 0..pools.size_for(queue_name) {
            let worker_id = format!("{queue_name}-{index}");
            handles.push(tokio::spawn(consumer_loop(
                ctx.clone(),
                queue_name,
                worker_id,
                shutdown.clone(),
            )));
        }
    }
    handles.push(tokio::spawn(sweeper_loop(ctx.store.clone(), shutdown.clone())));

    for handle in handles {
        let _ = handle.await;
    }
}

async fn consumer_loop(
    ctx: Arc<WorkerContext>,
    queue_name: &'static str,
    worker_id: String,
    mut shutdown: watch::Receiver<bool>,
) {
    // Recover tasks stranded by a previous run of this consumer.
    match ctx.queue.requeue_orphans(queue_name, &worker_id).await {
        Ok(0) => {}
        Ok(count) => tracing::info!("worker {worker_id}: requeued {count} orphaned task(s)"),
        Err(e) => tracing::warn!("worker {worker_id}: orphan recovery failed: {e}"),
    }

    tracing::info!("worker {worker_id}: consuming {queue_name}");
    loop {
        if *shutdown.borrow() {
            break;
        }
        let reserved = tokio::select! {
            _ = shutdown.changed() => break,
            reserved = ctx.queue.reserve(queue_name, &worker_id, RESERVE_TIMEOUT) => reserved,
        };
        match reserved {
            Ok(Some(leased)) => process_leased(&ctx, queue_name, &worker_id, leased).await,
            Ok(None) => {}
            Err(e) => {
                tracing::error!("worker {worker_id}: reserve failed: {e}");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
    tracing::info!("worker {worker_id}: stopped");
}

async fn process_leased(ctx: &WorkerContext, queue_name: &str, worker_id: &str, leased: Leased) {
    let envelope = leased.envelope.clone();
    let soft_deadline = Instant::now() + SOFT_TIME_LIMIT;

    let outcome = match tokio::time::timeout(
        HARD_TIME_LIMIT,
        handle_task(ctx, &envelope, soft_deadline),
    )
    .await
    {
        Ok(outcome) => outcome,
        Err(_) => Err(TaskError::Fatal("hard time limit exceeded".into())),
    };

    // The lease is always released; retries travel as a fresh delivery.
    if let Err(e) = ctx.queue.ack(queue_name, worker_id, &leased).await {
        tracing::warn!("worker {worker_id}: ack failed for task {}: {e}", envelope.id);
    }

    match outcome {
        Ok(()) => {}
        Err(TaskError::Retryable(msg)) if envelope.attempt < envelope.kind.max_retries() => {
            let mut retry = envelope.clone();
            retry.attempt += 1;
            let delay = backoff_delay(retry.attempt);
            tracing::warn!(
                "task {} ({:?}) attempt {} failed: {msg}; retrying in {delay:?}",
                retry.id, retry.kind, envelope.attempt
            );
            let queue = ctx.queue.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if let Err(e) = queue.enqueue(&retry).await {
                    tracing::error!("retry enqueue failed for task {}: {e}", retry.id);
                }
            });
        }
        Err(err) => {
            let msg = err.to_string();
            tracing::error!(
                "task {} ({:?}) dead-lettered after {} attempt(s): {msg}",
                envelope.id,
                envelope.kind,
                envelope.attempt + 1
            );
            if let Err(e) = ctx.queue.dead_letter(&envelope, &msg).await {
                tracing::error!("dead-letter write failed for task {}: {e}", envelope.id);
            }
            fail_job_record(ctx, &envelope, &msg).await;
        }
    }
}

async fn handle_task(
    ctx: &WorkerContext,
    envelope: &TaskEnvelope,
    soft_deadline: Instant,
) -> Result<(), TaskError> {
    match envelope.kind {
        TaskKind::RuleEval => {
            let task: RuleEvalTask = envelope.decode().map_err(TaskError::fatal)?;
            rule_engine::run_rule_eval(&ctx.store, &ctx.queue, &task).await
        }
        TaskKind::Notify => {
            let task: NotifyTask = envelope.decode().map_err(TaskError::fatal)?;
            ctx.notifier.run_notify(&task).await
        }
        TaskKind::Analytics | TaskKind::Report => {
            let task: JobTask = envelope.decode().map_err(TaskError::fatal)?;
            analytics::run_job(&ctx.store, ctx.executor.as_ref(), &task, soft_deadline).await
        }
    }
}

/// Surface a dead-lettered analytics/report task on its job record.
async fn fail_job_record(ctx: &WorkerContext, envelope: &TaskEnvelope, msg: &str) {
    if !matches!(envelope.kind, TaskKind::Analytics | TaskKind::Report) {
        return;
    }
    let Ok(task) = envelope.decode::<JobTask>() else { return };
    match ctx.store.mark_job_failed(&task.job_id, msg, Utc::now()) {
        Ok(true) => tracing::info!("job {} marked failed", task.job_id),
        Ok(false) => {}
        Err(e) => tracing::error!("failed to mark job {} failed: {e}", task.job_id),
    }
}

/// Exponential backoff with jitter: 1s, 2s, 4s, … capped at 60s.
fn backoff_delay(attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(6);
    let base = Duration::from_secs(1 << exp).min(MAX_BACKOFF);
    base + Duration::from_millis(rand::rng().random_range(0..500u64))
}

async fn sweeper_loop(store: Arc<Store>, mut shutdown: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(SWEEP_INTERVAL);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = interval.tick() => {}
        }
        if *shutdown.borrow() {
            break;
        }
        match store.prune_terminal_jobs(Utc::now() - chrono::Duration::hours(JOB_RETENTION_HOURS)) {
            Ok(0) => {}
            Ok(count) => tracing::info!("pruned {count} terminal job(s) past retention"),
            Err(e) => tracing::error!("job retention sweep failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::jobs::{QUEUE_ANALYTICS, QUEUE_RULE_ENGINE};
    use crate::jobs::memory::MemoryQueue;
    use crate::models::job::{Job, JobKind, JobStatus};
    use crate::notify::{Notifier, SmtpConfig, TwilioConfig};

    struct FailingExecutor;

    #[async_trait]
    impl JobExecutor for FailingExecutor {
        async fn execute(&self, _job: &Job, _soft: Instant) -> anyhow::Result<Option<String>> {
            anyhow::bail!("executor down")
        }
    }

    fn context(queue: Arc<MemoryQueue>, executor: Option<Arc<dyn JobExecutor>>) -> Arc<WorkerContext> {
        let store = Arc::new(Store::open(":memory:").unwrap());
        let notifier = Arc::new(Notifier::new(
            store.clone(),
            SmtpConfig { host: None, port: 587, user: None, pass: None, from: "plantops@localhost".into() },
            TwilioConfig::default(),
        ));
        Arc::new(WorkerContext { store, queue, notifier, executor })
    }

    #[test]
    fn backoff_grows_and_caps() {
        let first = backoff_delay(1);
        assert!(first >= Duration::from_secs(1) && first < Duration::from_millis(1500));
        let fourth = backoff_delay(4);
        assert!(fourth >= Duration::from_secs(8) && fourth < Duration::from_millis(8500));
        for attempt in [7, 20, u32::MAX] {
            let delay = backoff_delay(attempt);
            assert!(delay <= MAX_BACKOFF + Duration::from_millis(500));
        }
    }

    #[tokio::test]
    async fn undecodable_payload_is_dead_lettered() {
        let queue = Arc::new(MemoryQueue::new());
        let ctx = context(queue.clone(), None);

        let envelope = TaskEnvelope {
            id: "t1".into(),
            kind: TaskKind::RuleEval,
            attempt: 0,
            enqueued_at: Utc::now(),
            payload: json!("garbage"),
        };
        queue.enqueue(&envelope).await.unwrap();
        let leased = queue
            .reserve(QUEUE_RULE_ENGINE, "w", Duration::ZERO)
            .await
            .unwrap()
            .unwrap();

        process_leased(&ctx, QUEUE_RULE_ENGINE, "w", leased).await;
        assert_eq!(queue.dead_letters().len(), 1);
        assert_eq!(queue.depth(QUEUE_RULE_ENGINE).await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn retryable_failure_retries_then_dead_letters() {
        let queue = Arc::new(MemoryQueue::new());
        let ctx = context(queue.clone(), Some(Arc::new(FailingExecutor)));
        let tenant = ctx.store.create_tenant("vpc", "VPC", "UTC").unwrap();
        let now = Utc::now();
        ctx.store
            .create_job("job-1", tenant.id, JobKind::Analytics, "anomaly", &[], now, now)
            .unwrap();

        let task = JobTask { tenant_id: tenant.id, job_id: "job-1".into() };
        queue
            .enqueue(&TaskEnvelope::new(TaskKind::Analytics, &task).unwrap())
            .await
            .unwrap();

        // First delivery fails; analytics allows one retry.
        let leased = queue
            .reserve(QUEUE_ANALYTICS, "w", Duration::ZERO)
            .await
            .unwrap()
            .unwrap();
        process_leased(&ctx, QUEUE_ANALYTICS, "w", leased).await;
        assert!(queue.dead_letters().is_empty());

        // Let the backoff timer fire and the retry land back on the queue.
        tokio::time::sleep(Duration::from_secs(120)).await;
        tokio::task::yield_now().await;

        let leased = queue
            .reserve(QUEUE_ANALYTICS, "w", Duration::ZERO)
            .await
            .unwrap()
            .expect("retry should be requeued");
        assert_eq!(leased.envelope.attempt, 1);
        process_leased(&ctx, QUEUE_ANALYTICS, "w", leased).await;

        // Retry budget exhausted: dead-lettered and job marked failed.
        assert_eq!(queue.dead_letters().len(), 1);
        let job = ctx.store.get_job(tenant.id, "job-1").unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error_message.unwrap().contains("executor down"));
    }

    #[tokio::test]
    async fn successful_task_is_acked_once() {
        let queue = Arc::new(MemoryQueue::new());
        let ctx = context(queue.clone(), None);

        // Notify for a missing alert succeeds as a no-op.
        let task = NotifyTask { alert_id: 404, channels: Default::default() };
        queue
            .enqueue(&TaskEnvelope::new(TaskKind::Notify, &task).unwrap())
            .await
            .unwrap();
        let leased = queue
            .reserve(crate::jobs::QUEUE_NOTIFICATIONS, "w", Duration::ZERO)
            .await
            .unwrap()
            .unwrap();
        process_leased(&ctx, crate::jobs::QUEUE_NOTIFICATIONS, "w", leased).await;

        assert!(queue.dead_letters().is_empty());
        assert_eq!(
            queue
                .requeue_orphans(crate::jobs::QUEUE_NOTIFICATIONS, "w")
                .await
                .unwrap(),
            0
        );
    }
}
