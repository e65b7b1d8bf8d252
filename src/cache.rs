use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::IngestError;
use crate::models::device::Device;
use crate::models::tenant::Tenant;
use crate::store::Store;

/// Positive-entry TTL. Configuration edits become visible within this
/// window; misses are never cached.
const CACHE_TTL_SECS: u64 = 60;

/// Per-operation budget. A slow cache degrades to the store, it never
/// stalls the pipeline.
const CACHE_TIMEOUT: Duration = Duration::from_secs(1);

/// Short-TTL mirror of the tenant and device hot paths.
///
/// The cache is advisory: every failure (unreachable, timeout, decode)
/// logs a warning and falls through to the relational store, so an outage
/// costs throughput, never correctness.
pub struct IdentityCache {
    store: Arc<Store>,
    redis: Option<ConnectionManager>,
}

impl IdentityCache {
    pub fn new(store: Arc<Store>, redis: Option<ConnectionManager>) -> Self {
        Self { store, redis }
    }

    /// Look up a tenant by slug, cache-through with a 60 s TTL.
    /// `None` means unknown tenant; misses are not negatively cached.
    pub async fn resolve_tenant(&self, slug: &str) -> anyhow::Result<Option<Tenant>> {
        let cache_key = format!("tenant:slug:{slug}");
        if let Some(tenant) = self.cache_get::<Tenant>(&cache_key).await {
            tracing::debug!("tenant cache hit: {slug}");
            return Ok(Some(tenant));
        }

        let tenant = self.store.get_tenant_by_slug(slug)?;
        if let Some(ref tenant) = tenant {
            self.cache_put(&cache_key, tenant).await;
        }
        Ok(tenant)
    }

    /// Look up a device by (tenant, key), auto-registering it on first
    /// sighting so new devices are usable without operator action.
    pub async fn resolve_or_create_device(
        &self,
        tenant_id: i64,
        device_key: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Device> {
        let cache_key = format!("device:{tenant_id}:{device_key}");
        if let Some(device) = self.cache_get::<Device>(&cache_key).await {
            tracing::debug!("device cache hit: {tenant_id}/{device_key}");
            return Ok(device);
        }

        let (device, created) = self.store.get_or_create_device(tenant_id, device_key, now)?;
        if created {
            tracing::info!(
                "device auto-registered: tenant={tenant_id} key={device_key} id={}",
                device.id
            );
        }
        self.cache_put(&cache_key, &device).await;
        Ok(device)
    }

    async fn cache_get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let conn = self.redis.as_ref()?;
        let mut conn = conn.clone();
        let raw = tokio::time::timeout(CACHE_TIMEOUT, conn.get::<_, Option<String>>(key)).await;
        match raw {
            Ok(Ok(Some(raw))) => match serde_json::from_str(&raw) {
                Ok(value) => Some(value),
                Err(e) => {
                    tracing::warn!("{}", IngestError::Cache(format!("decode failed for {key}: {e}")));
                    None
                }
            },
            Ok(Ok(None)) => None,
            Ok(Err(e)) => {
                tracing::warn!("{}", IngestError::Cache(format!("read failed for {key}: {e}")));
                None
            }
            Err(_) => {
                tracing::warn!("{}", IngestError::Cache(format!("read timed out for {key}")));
                None
            }
        }
    }

    async fn cache_put<T: Serialize>(&self, key: &str, value: &T) {
        let Some(conn) = self.redis.as_ref() else { return };
        let Ok(raw) = serde_json::to_string(value) else { return };
        let mut conn = conn.clone();
        let result = tokio::time::timeout(
            CACHE_TIMEOUT,
            conn.set_ex::<_, _, ()>(key, raw, CACHE_TTL_SECS),
        )
        .await;
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!("{}", IngestError::Cache(format!("write failed for {key}: {e}")));
            }
            Err(_) => {
                tracing::warn!("{}", IngestError::Cache(format!("write timed out for {key}")));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    // The cache degrades to the store when no Redis connection exists;
    // these exercise that path end to end.

    #[tokio::test]
    async fn resolves_tenant_without_cache() {
        let store = Arc::new(Store::open(":memory:").unwrap());
        store.create_tenant("vpc", "VPC", "UTC").unwrap();
        let cache = IdentityCache::new(store, None);

        let tenant = cache.resolve_tenant("vpc").await.unwrap().unwrap();
        assert_eq!(tenant.slug, "vpc");
        assert!(cache.resolve_tenant("ghost").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn auto_creates_device_without_cache() {
        let store = Arc::new(Store::open(":memory:").unwrap());
        let tenant = store.create_tenant("vpc", "VPC", "UTC").unwrap();
        let cache = IdentityCache::new(store.clone(), None);
        let now = ts("2024-01-15T10:00:00Z");

        let first = cache.resolve_or_create_device(tenant.id, "M01", now).await.unwrap();
        let second = cache.resolve_or_create_device(tenant.id, "M01", now).await.unwrap();
        assert_eq!(first.id, second.id);
        assert!(first.is_active);
        assert_eq!(store.get_device(tenant.id, "M01").unwrap().unwrap().id, first.id);
    }
}
