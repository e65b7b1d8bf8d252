use std::sync::Arc;

use redis::aio::ConnectionManager;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use plantops::config::Config;
use plantops::jobs::{JobQueue, RedisQueue};
use plantops::notify::Notifier;
use plantops::store::Store;
use plantops::worker::{self, WorkerContext};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("plantops=debug")),
        )
        .init();

    let config = Config::from_env();

    let store = Arc::new(Store::open(&config.db_path)?);
    tracing::info!("relational store opened at {}", config.db_path);

    let redis_client = redis::Client::open(config.redis_url.clone())?;
    let redis_conn = ConnectionManager::new(redis_client).await?;
    tracing::info!("redis connected at {}", config.redis_url);

    let queue: Arc<dyn JobQueue> = Arc::new(RedisQueue::new(redis_conn));
    let notifier = Arc::new(Notifier::new(
        store.clone(),
        config.smtp.clone(),
        config.twilio.clone(),
    ));

    // Analytics/report executors are deployment-specific; without one,
    // those jobs are marked failed with an explanatory message.
    let ctx = Arc::new(WorkerContext {
        store,
        queue,
        notifier,
        executor: None,
    });

    tracing::info!("plantops-worker starting: pools={:?}", config.workers);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let pools = config.workers.clone();
    let runner = tokio::spawn(worker::run(ctx, pools, shutdown_rx));

    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => tracing::info!("SIGINT received, shutting down"),
        _ = sigterm.recv() => tracing::info!("SIGTERM received, shutting down"),
    }

    shutdown_tx.send(true).ok();
    let _ = runner.await;
    tracing::info!("plantops-worker stopped");
    Ok(())
}
