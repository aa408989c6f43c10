//! Metadata records in a SQLite table, via `sqlx`.
//!
//! SQLite has no native expiry, so `delete` checks the stored expiration
//! before removing a row.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{
    StreamExt, TryStreamExt,
    stream::{self, BoxStream},
};
use sqlx::{FromRow, SqlitePool};
use std::sync::Arc;
use tracing::debug;

use super::MetadataStore;
use crate::models::{MetadataRecord, ObjectId};
use crate::services::{
    clock::Clock,
    error::{StoreError, StoreResult},
};

const SCHEMA: &str = include_str!("../../../migrations/0001_init.sql");

/// Keys fetched per enumeration round-trip.
const PAGE_SIZE: usize = 500;

#[derive(FromRow)]
struct RecordRow {
    id: String,
    file_name: String,
    expiration: DateTime<Utc>,
    length: i64,
}

impl TryFrom<RecordRow> for MetadataRecord {
    type Error = StoreError;

    fn try_from(row: RecordRow) -> Result<Self, Self::Error> {
        Ok(MetadataRecord {
            id: row.id.parse()?,
            file_name: row.file_name,
            expiration: row.expiration,
            length: row.length.max(0) as u64,
        })
    }
}

#[derive(Clone)]
pub struct SqliteMetadataStore {
    /// Shared SQLite connection pool.
    pub db: Arc<SqlitePool>,
    clock: Arc<dyn Clock>,
}

impl SqliteMetadataStore {
    pub fn new(db: Arc<SqlitePool>, clock: Arc<dyn Clock>) -> Self {
        Self { db, clock }
    }

    /// Apply the embedded schema. Safe to run repeatedly.
    pub async fn migrate(&self) -> StoreResult<()> {
        let statements = SCHEMA
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();

        debug!("Running {} migration statements...", statements.len());

        for stmt in statements {
            debug!("Executing migration SQL: {}", stmt);
            sqlx::query(stmt).execute(&*self.db).await?;
        }
        Ok(())
    }

    async fn fetch(&self, id: &ObjectId) -> StoreResult<Option<MetadataRecord>> {
        sqlx::query_as::<_, RecordRow>(
            "SELECT id, file_name, expiration, length FROM objects WHERE id = ?",
        )
        .bind(id.as_str())
        .fetch_optional(&*self.db)
        .await?
        .map(MetadataRecord::try_from)
        .transpose()
    }
}

#[async_trait]
impl MetadataStore for SqliteMetadataStore {
    async fn insert(&self, record: &MetadataRecord) -> StoreResult<()> {
        let length = i64::try_from(record.length).map_err(StoreError::write)?;

        sqlx::query(
            r#"
            INSERT INTO objects (id, file_name, expiration, length)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                file_name = excluded.file_name,
                expiration = excluded.expiration,
                length = excluded.length
            "#,
        )
        .bind(record.id.as_str())
        .bind(&record.file_name)
        .bind(record.expiration)
        .bind(length)
        .execute(&*self.db)
        .await
        .map_err(StoreError::write)?;

        Ok(())
    }

    async fn get(&self, id: &ObjectId) -> StoreResult<MetadataRecord> {
        self.fetch(id)
            .await?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn delete(&self, id: &ObjectId) -> StoreResult<()> {
        let Some(record) = self.fetch(id).await? else {
            return Ok(());
        };
        if !record.is_expired_at(self.clock.now()) {
            return Err(StoreError::NotExpired(id.to_string()));
        }

        sqlx::query("DELETE FROM objects WHERE id = ?")
            .bind(id.as_str())
            .execute(&*self.db)
            .await?;
        Ok(())
    }

    /// Keyset pagination over the primary key.
    fn ids(&self) -> BoxStream<'_, StoreResult<String>> {
        stream::try_unfold(Some(String::new()), move |cursor| async move {
            let Some(after) = cursor else {
                return Ok(None);
            };

            let page: Vec<String> =
                sqlx::query_scalar("SELECT id FROM objects WHERE id > ? ORDER BY id LIMIT ?")
                    .bind(&after)
                    .bind(PAGE_SIZE as i64)
                    .fetch_all(&*self.db)
                    .await?;

            let next = if page.len() == PAGE_SIZE {
                page.last().cloned()
            } else {
                None
            };
            let items = stream::iter(page.into_iter().map(Ok::<_, StoreError>));
            Ok::<_, StoreError>(Some((items, next)))
        })
        .try_flatten()
        .boxed()
    }

    fn backend_name(&self) -> &'static str {
        "sqlite"
    }

    async fn health_check(&self) -> StoreResult<()> {
        let one: i64 = sqlx::query_scalar("SELECT 1").fetch_one(&*self.db).await?;
        if one == 1 {
            Ok(())
        } else {
            Err(StoreError::Io(std::io::Error::other(format!(
                "unexpected result: {one}"
            ))))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::clock::ManualClock;
    use chrono::Duration;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn store() -> (ManualClock, SqliteMetadataStore) {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let clock = ManualClock::new(Utc::now());
        let store = SqliteMetadataStore::new(Arc::new(pool), Arc::new(clock.clone()));
        store.migrate().await.unwrap();
        store.migrate().await.unwrap();
        (clock, store)
    }

    #[tokio::test]
    async fn insert_get_and_overwrite() {
        let (clock, store) = store().await;
        let id = ObjectId::generate(clock.now() + Duration::minutes(10));

        store.insert(&MetadataRecord::new(id.clone(), "a.bin", 3)).await.unwrap();
        let second = MetadataRecord::new(id.clone(), "b.bin", 4);
        store.insert(&second).await.unwrap();

        assert_eq!(store.get(&id).await.unwrap(), second);
    }

    #[tokio::test]
    async fn get_missing_is_not_found() {
        let (clock, store) = store().await;
        let id = ObjectId::generate(clock.now());
        assert!(matches!(store.get(&id).await, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn delete_requires_expiry_then_is_idempotent() {
        let (clock, store) = store().await;
        let id = ObjectId::generate(clock.now() + Duration::seconds(1));
        store.insert(&MetadataRecord::new(id.clone(), "a", 1)).await.unwrap();

        assert!(matches!(store.delete(&id).await, Err(StoreError::NotExpired(_))));

        clock.advance(Duration::seconds(2));
        store.delete(&id).await.unwrap();
        store.delete(&id).await.unwrap();
        assert!(store.get(&id).await.is_err());
    }

    #[tokio::test]
    async fn ids_pages_through_every_row() {
        let (clock, store) = store().await;
        let total = PAGE_SIZE + 7;
        for _ in 0..total {
            let id = ObjectId::generate(clock.now());
            store.insert(&MetadataRecord::new(id, "f", 0)).await.unwrap();
        }

        let ids: Vec<String> = store.ids().try_collect().await.unwrap();
        assert_eq!(ids.len(), total);
        let mut sorted = ids.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(sorted.len(), total);
    }

    #[tokio::test]
    async fn health_check_runs_query() {
        let (_clock, store) = store().await;
        store.health_check().await.unwrap();
    }
}
