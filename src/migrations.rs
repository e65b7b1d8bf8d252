use clickhouse::Client;

/// Ordered list of DDL statements to ensure the telemetry schema exists.
/// Every statement is idempotent (`IF NOT EXISTS`) so safe to run on every
/// startup.
const MIGRATIONS: &[&str] = &[
    // ── Database ──
    "CREATE DATABASE IF NOT EXISTS plantops",

    // ── Metric samples: one row per (parameter, value) pair ──
    r"CREATE TABLE IF NOT EXISTS plantops.device_metrics
(
    timestamp DateTime64(9, 'UTC') CODEC(Delta, ZSTD(1)),
    tenant_id LowCardinality(String),
    device_id LowCardinality(String),
    parameter LowCardinality(String),
    value     Float64
)
ENGINE = MergeTree()
PARTITION BY toDate(timestamp)
ORDER BY (tenant_id, device_id, parameter, timestamp)
SETTINGS index_granularity = 8192",
];

pub async fn run(url: &str, user: &str, password: &str) -> anyhow::Result<()> {
    let client = Client::default()
        .with_url(url)
        .with_user(user)
        .with_password(password);

    tracing::info!("running clickhouse migrations ({} statements)", MIGRATIONS.len());

    for (i, sql) in MIGRATIONS.iter().enumerate() {
        let preview: String = sql.chars().take(80).collect();
        tracing::debug!("migration {}/{}: {}...", i + 1, MIGRATIONS.len(), preview);
        client.query(sql).execute().await.map_err(|e| {
            tracing::error!("migration {}/{} failed: {e}", i + 1, MIGRATIONS.len());
            e
        })?;
    }

    tracing::info!("clickhouse migrations complete");
    Ok(())
}
