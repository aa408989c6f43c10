//! Metadata records as Redis strings with a native expiry.
//!
//! The value is the JSON record and the key is `{prefix}{id}`. Keys are
//! written with `PX` set to the record's expiration, so Redis evicts them on
//! its own and the sweeper only has to reclaim blobs for this backend.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_redis::{Config, Pool, Runtime};
use futures::{
    StreamExt, TryStreamExt,
    stream::{self, BoxStream},
};
use redis::AsyncCommands;
use std::{fmt::Display, sync::Arc, time::Duration};

use super::MetadataStore;
use crate::models::{MetadataRecord, ObjectId};
use crate::services::{
    clock::Clock,
    error::{StoreError, StoreResult},
};

/// Keys requested per `SCAN` round-trip.
const SCAN_COUNT: usize = 100;

/// Configuration for the Redis metadata backend.
#[derive(Debug, Clone)]
pub struct RedisConfig {
    /// Redis connection URL (e.g. `redis://127.0.0.1:6379`).
    pub url: String,

    /// Prepended to every key. Empty means keys are bare identifiers.
    pub prefix: String,

    /// Number of connections in the `deadpool-redis` pool.
    pub pool_size: usize,

    /// Timeout for acquiring a pooled connection.
    pub connection_timeout: Duration,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: String::from("redis://127.0.0.1:6379"),
            prefix: String::new(),
            pool_size: 10,
            connection_timeout: Duration::from_secs(5),
        }
    }
}

pub struct RedisMetadataStore {
    pool: Pool,
    prefix: String,
    clock: Arc<dyn Clock>,
}

fn backend(err: impl Display) -> StoreError {
    StoreError::Redis(err.to_string())
}

impl RedisMetadataStore {
    /// Build the connection pool. No connection is opened until first use.
    pub fn new(config: &RedisConfig, clock: Arc<dyn Clock>) -> StoreResult<Self> {
        let pool = Config::from_url(&config.url)
            .builder()
            .map(|b| {
                b.max_size(config.pool_size)
                    .wait_timeout(Some(config.connection_timeout))
                    .runtime(Runtime::Tokio1)
                    .build()
            })
            .map_err(backend)?
            .map_err(backend)?;

        Ok(Self {
            pool,
            prefix: config.prefix.clone(),
            clock,
        })
    }

    fn key(&self, id: &ObjectId) -> String {
        render_key(&self.prefix, id.as_str())
    }

    async fn conn(&self) -> StoreResult<deadpool_redis::Connection> {
        self.pool.get().await.map_err(backend)
    }
}

fn render_key(prefix: &str, id: &str) -> String {
    format!("{prefix}{id}")
}

/// `MATCH` pattern for every key under `prefix`, with glob metacharacters in
/// the prefix escaped so they match literally.
fn scan_pattern(prefix: &str) -> String {
    let mut pattern = String::with_capacity(prefix.len() + 1);
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('*');
    pattern
}

/// The identifier part of a scanned key, or `None` if it is outside `prefix`.
fn strip_key(prefix: &str, key: &str) -> Option<String> {
    key.strip_prefix(prefix).map(str::to_string)
}

/// Milliseconds until `expiration`, at least 1 so an already-expired record
/// is still written with an expiry rather than persisting forever.
fn ttl_millis(expiration: DateTime<Utc>, now: DateTime<Utc>) -> u64 {
    (expiration - now).num_milliseconds().max(1) as u64
}

#[async_trait]
impl MetadataStore for RedisMetadataStore {
    async fn insert(&self, record: &MetadataRecord) -> StoreResult<()> {
        let value = serde_json::to_string(record).map_err(StoreError::write)?;
        let ttl = ttl_millis(record.expiration, self.clock.now());

        let mut conn = self.conn().await.map_err(StoreError::write)?;
        let () = conn
            .pset_ex(self.key(&record.id), value, ttl)
            .await
            .map_err(StoreError::write)?;
        Ok(())
    }

    async fn get(&self, id: &ObjectId) -> StoreResult<MetadataRecord> {
        let mut conn = self.conn().await?;
        let value: Option<String> = conn.get(self.key(id)).await.map_err(backend)?;

        match value {
            Some(value) => Ok(serde_json::from_str(&value)?),
            None => Err(StoreError::NotFound(id.to_string())),
        }
    }

    async fn delete(&self, id: &ObjectId) -> StoreResult<()> {
        if !id.is_expired_at(self.clock.now()) {
            return Err(StoreError::NotExpired(id.to_string()));
        }

        let mut conn = self.conn().await?;
        let _removed: i64 = conn.del(self.key(id)).await.map_err(backend)?;
        Ok(())
    }

    /// Cursor-based `SCAN` over `{prefix}*`, one page per round-trip.
    ///
    /// The sweeper skips this backend's metadata pass because Redis evicts
    /// keys itself, so this serves ad-hoc inspection of the keyspace.
    fn ids(&self) -> BoxStream<'_, StoreResult<String>> {
        let pattern = scan_pattern(&self.prefix);

        stream::try_unfold(Some(0u64), move |cursor| {
            let pattern = pattern.clone();
            async move {
                let Some(cursor) = cursor else {
                    return Ok(None);
                };

                let mut conn = self.conn().await?;
                let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                    .arg(cursor)
                    .arg("MATCH")
                    .arg(&pattern)
                    .arg("COUNT")
                    .arg(SCAN_COUNT)
                    .query_async(&mut conn)
                    .await
                    .map_err(backend)?;

                let ids: Vec<StoreResult<String>> = keys
                    .into_iter()
                    .filter_map(|key| strip_key(&self.prefix, &key))
                    .map(Ok)
                    .collect();
                let next = (next != 0).then_some(next);
                Ok::<_, StoreError>(Some((stream::iter(ids), next)))
            }
        })
        .try_flatten()
        .boxed()
    }

    fn expires_natively(&self) -> bool {
        true
    }

    fn backend_name(&self) -> &'static str {
        "redis"
    }

    async fn health_check(&self) -> StoreResult<()> {
        let mut conn = self.conn().await?;
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(backend)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::clock::SystemClock;
    use chrono::Duration as ChronoDuration;

    #[test]
    fn default_values() {
        let cfg = RedisConfig::default();
        assert_eq!(cfg.url, "redis://127.0.0.1:6379");
        assert_eq!(cfg.prefix, "");
        assert_eq!(cfg.pool_size, 10);
        assert_eq!(cfg.connection_timeout, Duration::from_secs(5));
    }

    #[test]
    fn keys_are_bare_ids_unless_prefixed() {
        assert_eq!(render_key("", "1-abc"), "1-abc");
        assert_eq!(render_key("tempstash:", "1-abc"), "tempstash:1-abc");
    }

    #[test]
    fn scan_pattern_escapes_glob_characters_in_prefix() {
        assert_eq!(scan_pattern(""), "*");
        assert_eq!(scan_pattern("tempstash:"), "tempstash:*");
        assert_eq!(scan_pattern("a*b?[c]\\"), "a\\*b\\?\\[c\\]\\\\*");
    }

    #[test]
    fn scanned_keys_are_stripped_back_to_ids() {
        assert_eq!(strip_key("", "1-abc").as_deref(), Some("1-abc"));
        assert_eq!(
            strip_key("tempstash:", "tempstash:1-abc").as_deref(),
            Some("1-abc")
        );
        assert_eq!(strip_key("tempstash:", "other:1-abc"), None);
        assert_eq!(
            strip_key("tempstash:", &render_key("tempstash:", "7-xyz")).as_deref(),
            Some("7-xyz")
        );
    }

    #[test]
    fn ttl_tracks_expiration_and_never_drops_to_zero() {
        let now = Utc::now();
        assert_eq!(ttl_millis(now + ChronoDuration::seconds(10), now), 10_000);
        assert_eq!(ttl_millis(now, now), 1);
        assert_eq!(ttl_millis(now - ChronoDuration::seconds(5), now), 1);
    }

    #[test]
    fn store_builds_without_connecting_and_expires_natively() {
        let store = RedisMetadataStore::new(&RedisConfig::default(), Arc::new(SystemClock)).unwrap();
        assert!(store.expires_natively());
        assert_eq!(store.backend_name(), "redis");
    }

    #[tokio::test]
    async fn delete_before_expiry_is_refused_without_io() {
        let store = RedisMetadataStore::new(&RedisConfig::default(), Arc::new(SystemClock)).unwrap();
        let id = ObjectId::generate(Utc::now() + ChronoDuration::hours(1));
        assert!(matches!(store.delete(&id).await, Err(StoreError::NotExpired(_))));
    }
}
