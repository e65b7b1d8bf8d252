use std::sync::Arc;
use std::time::Duration;

use redis::aio::ConnectionManager;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use tokio::signal::unix::{SignalKind, signal};
use tracing_subscriber::EnvFilter;

use plantops::cache::IdentityCache;
use plantops::config::Config;
use plantops::ingest::Ingestor;
use plantops::jobs::{JobQueue, RedisQueue};
use plantops::migrations;
use plantops::store::Store;
use plantops::tsdb::{MetricsSink, Tsdb};

const TELEMETRY_SUBSCRIPTION: &str = "factories/+/devices/+/telemetry";

/// Give up on the broker only while we have never connected; after the
/// first successful session, reconnect forever.
const BOOT_CONNECT_ATTEMPTS: u32 = 10;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("plantops=debug")),
        )
        .init();

    let config = Config::from_env();

    migrations::run(
        &config.clickhouse.url,
        &config.clickhouse.user,
        &config.clickhouse.password,
    )
    .await?;

    let ch = clickhouse::Client::default()
        .with_url(&config.clickhouse.url)
        .with_database(&config.clickhouse.database)
        .with_user(&config.clickhouse.user)
        .with_password(&config.clickhouse.password);

    let store = Arc::new(Store::open(&config.db_path)?);
    tracing::info!("relational store opened at {}", config.db_path);

    // One Redis connection serves the identity cache and the job queue.
    // The queue is load-bearing, so a dead Redis is a fatal startup error.
    let redis_client = redis::Client::open(config.redis_url.clone())?;
    let redis_conn = ConnectionManager::new(redis_client).await?;
    tracing::info!("redis connected at {}", config.redis_url);

    let queue: Arc<dyn JobQueue> = Arc::new(RedisQueue::new(redis_conn.clone()));
    let cache = IdentityCache::new(store.clone(), Some(redis_conn));
    let sink: Arc<dyn MetricsSink> = Arc::new(Tsdb::new(ch));
    let ingestor = Ingestor::new(store, cache, sink, queue, config.queue_high_water);

    let mut options = MqttOptions::new(
        format!("plantops-ingest-{}", uuid::Uuid::new_v4().simple()),
        &config.mqtt.host,
        config.mqtt.port,
    );
    options.set_keep_alive(Duration::from_secs(30));
    if let (Some(user), Some(pass)) = (&config.mqtt.username, &config.mqtt.password) {
        options.set_credentials(user, pass);
    }
    let (client, mut eventloop) = AsyncClient::new(options, 64);

    tracing::info!(
        "plantops-ingest starting: broker={}:{}",
        config.mqtt.host,
        config.mqtt.port
    );

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut retry_delay = Duration::from_secs(1);
    let mut connected_once = false;
    let mut boot_attempts = 0u32;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("SIGINT received, shutting down");
                break;
            }
            _ = sigterm.recv() => {
                tracing::info!("SIGTERM received, shutting down");
                break;
            }
            event = eventloop.poll() => match event {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    connected_once = true;
                    retry_delay = Duration::from_secs(1);
                    tracing::info!("mqtt connected to {}:{}", config.mqtt.host, config.mqtt.port);
                    // (Re)subscribe on every new session.
                    if let Err(e) = client.subscribe(TELEMETRY_SUBSCRIPTION, QoS::AtLeastOnce).await {
                        tracing::error!("mqtt subscribe failed: {e}");
                    } else {
                        tracing::info!("mqtt subscribed to {TELEMETRY_SUBSCRIPTION}");
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    // One message at a time: all synchronous pipeline steps
                    // complete before the next message is accepted.
                    ingestor.process(&publish.topic, &publish.payload).await;
                }
                Ok(_) => {}
                Err(e) => {
                    if !connected_once {
                        boot_attempts += 1;
                        if boot_attempts >= BOOT_CONNECT_ATTEMPTS {
                            anyhow::bail!(
                                "broker unreachable after {boot_attempts} attempts: {e}"
                            );
                        }
                    }
                    tracing::error!("mqtt connection error: {e}; retrying in {retry_delay:?}");
                    tokio::time::sleep(retry_delay).await;
                    retry_delay = (retry_delay * 2).min(Duration::from_secs(60));
                }
            }
        }
    }

    Ok(())
}
