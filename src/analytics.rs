use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::time::Instant;

use crate::error::TaskError;
use crate::jobs::JobTask;
use crate::models::job::{Job, JobStatus};
use crate::store::Store;

/// The opaque model/renderer behind an analytics or report job.
///
/// Implementations receive the job row and return the object-storage
/// location of their output (`<tenant-id>/analytics/<job-id>.json`,
/// `<tenant-id>/reports/<report-id>.<ext>`). The soft deadline is the
/// cooperative cancellation signal: past it, an executor should wrap up
/// and return what it has.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    async fn execute(&self, job: &Job, soft_deadline: Instant) -> anyhow::Result<Option<String>>;
}

/// Drive one job record through its lifecycle: pending → running →
/// complete/failed. Redelivery of a terminal job is a no-op; executor
/// failures bubble up as retryable and the runner marks the job failed
/// once retries are exhausted.
pub async fn run_job(
    store: &Store,
    executor: Option<&Arc<dyn JobExecutor>>,
    task: &JobTask,
    soft_deadline: Instant,
) -> Result<(), TaskError> {
    let job = store
        .get_job(task.tenant_id, &task.job_id)
        .map_err(TaskError::retryable)?;
    let Some(job) = job else {
        tracing::warn!("job task for missing job {}", task.job_id);
        return Ok(());
    };

    if matches!(job.status, JobStatus::Complete | JobStatus::Failed) {
        tracing::debug!("job {} already {}, skipping redelivery", job.id, job.status.as_str());
        return Ok(());
    }

    let Some(executor) = executor else {
        store
            .mark_job_failed(&job.id, "no executor configured for this worker", Utc::now())
            .map_err(TaskError::retryable)?;
        tracing::warn!("job {} failed: no {} executor configured", job.id, job.kind.as_str());
        return Ok(());
    };

    store
        .mark_job_running(&job.id, Utc::now())
        .map_err(TaskError::retryable)?;
    tracing::info!("job {} running: kind={} type={}", job.id, job.kind.as_str(), job.job_type);

    match executor.execute(&job, soft_deadline).await {
        Ok(result_url) => {
            store
                .mark_job_complete(&job.id, result_url.as_deref(), Utc::now())
                .map_err(TaskError::retryable)?;
            tracing::info!("job {} complete: result={:?}", job.id, result_url);
            Ok(())
        }
        // Leave the row in `running`; the runner retries and marks it
        // failed when the retry budget runs out.
        Err(e) => Err(TaskError::retryable(format!("executor failed: {e}"))),
    }
}
