use thiserror::Error;

/// Everything that can go wrong for a single inbound broker message.
/// Every variant is recovered locally by the ingest pipeline: the message
/// is dropped, the process keeps running.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("invalid topic: {0}")]
    InvalidTopic(String),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("unknown tenant: {0}")]
    UnknownTenant(String),

    #[error("identity store error: {0}")]
    Store(String),

    #[error("cache error: {0}")]
    Cache(String),

    #[error("time-series write error: {0}")]
    TimeSeries(String),
}

/// Failure modes for background task handlers. The job runner retries
/// `Retryable` up to the per-kind bound and dead-letters `Fatal` at once.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("retryable: {0}")]
    Retryable(String),

    #[error("fatal: {0}")]
    Fatal(String),
}

impl TaskError {
    pub fn retryable(e: impl std::fmt::Display) -> Self {
        Self::Retryable(e.to_string())
    }

    pub fn fatal(e: impl std::fmt::Display) -> Self {
        Self::Fatal(e.to_string())
    }
}
