//! Postgres-backed entity store.
//!
//! Schema:
//!
//! ```sql
//! CREATE TABLE shardmap_entities (
//!     kind    TEXT   NOT NULL,
//!     name    TEXT   NOT NULL,
//!     version BIGINT NOT NULL,
//!     body    JSONB  NOT NULL,
//!     PRIMARY KEY (kind, name)
//! );
//! CREATE TABLE shardmap_outbox (
//!     id         BIGSERIAL PRIMARY KEY,
//!     task       JSONB       NOT NULL,
//!     created_at TIMESTAMPTZ NOT NULL DEFAULT now()
//! );
//! ```
//!
//! ## Error Mapping
//!
//! | Scenario | EntityStore error |
//! |----------|-------------------|
//! | unique violation (`23505`) on insert of an entity expected absent | `Conflict` |
//! | version guard on update matched no row | `Conflict` |
//! | serialization failure (`40001`) | `Conflict` |
//! | anything else | `Backend` |
//!
//! The sync [`EntityStore`] methods bridge into the async implementation with
//! `Handle::block_on`, so they must be called from a blocking context inside a
//! tokio runtime (e.g. `spawn_blocking`).

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value as JsonValue;
use sqlx::{PgPool, Postgres, Row};
use tracing::instrument;

use shardmap_core::ExpectedVersion;

use super::r#trait::{CommitBatch, EntityKey, EntityStore, OutboxEntry, StoreError, VersionedEntity};
use crate::queue::Task;

#[derive(Debug, Clone)]
pub struct PostgresEntityStore {
    pool: Arc<PgPool>,
}

impl PostgresEntityStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        for statement in [
            "CREATE TABLE IF NOT EXISTS shardmap_entities (
                kind TEXT NOT NULL, name TEXT NOT NULL, version BIGINT NOT NULL,
                body JSONB NOT NULL, PRIMARY KEY (kind, name))",
            "CREATE TABLE IF NOT EXISTS shardmap_outbox (
                id BIGSERIAL PRIMARY KEY, task JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now())",
        ] {
            sqlx::query(statement)
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        }
        Ok(())
    }

    #[instrument(skip(self), fields(key = %key), err)]
    pub async fn load(&self, key: &EntityKey) -> Result<Option<VersionedEntity>, StoreError> {
        let row = sqlx::query("SELECT version, body FROM shardmap_entities WHERE kind = $1 AND name = $2")
            .bind(&key.kind)
            .bind(&key.name)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("load", e))?;

        row.map(|row| {
            Ok(VersionedEntity {
                version: row.try_get::<i64, _>("version").map_err(|e| map_sqlx_error("load", e))? as u64,
                body: row.try_get("body").map_err(|e| map_sqlx_error("load", e))?,
            })
        })
        .transpose()
    }

    /// Apply a batch atomically.
    ///
    /// Written keys are guarded by their expectation in the write itself
    /// (`INSERT` for absent, `UPDATE ... WHERE version = $n` otherwise); keys
    /// that were only read are re-checked under `FOR SHARE`.
    #[instrument(
        skip(self, batch),
        fields(writes = batch.writes.len(), tasks = batch.tasks.len()),
        err
    )]
    pub async fn apply(&self, batch: CommitBatch) -> Result<(), StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let expectations: HashMap<&EntityKey, ExpectedVersion> =
            batch.expectations.iter().map(|(k, v)| (k, *v)).collect();

        for (key, expected) in &batch.expectations {
            if batch.writes_key(key) {
                continue;
            }
            let current = current_version(&mut tx, key).await?;
            if !expected.matches(current) {
                return Err(StoreError::Conflict(format!(
                    "{key}: expected {expected:?}, found {current}"
                )));
            }
        }

        for (key, body) in &batch.writes {
            match expectations.get(key).copied().unwrap_or(ExpectedVersion::Any) {
                ExpectedVersion::Exact(0) => insert(&mut tx, key, body).await?,
                ExpectedVersion::Exact(version) => update(&mut tx, key, body, version).await?,
                ExpectedVersion::Any => upsert(&mut tx, key, body).await?,
            }
        }

        for task in &batch.tasks {
            let payload = serde_json::to_value(task).map_err(|e| StoreError::Encode {
                key: task.path.clone(),
                message: e.to_string(),
            })?;
            sqlx::query("INSERT INTO shardmap_outbox (task) VALUES ($1)")
                .bind(payload)
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("insert_outbox", e))?;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))
    }

    pub async fn load_outbox(&self, limit: usize) -> Result<Vec<OutboxEntry>, StoreError> {
        let rows = sqlx::query("SELECT id, task FROM shardmap_outbox ORDER BY id ASC LIMIT $1")
            .bind(limit as i64)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("load_outbox", e))?;

        rows.into_iter()
            .map(|row| {
                let id: i64 = row.try_get("id").map_err(|e| map_sqlx_error("load_outbox", e))?;
                let task: JsonValue = row.try_get("task").map_err(|e| map_sqlx_error("load_outbox", e))?;
                let task: Task = serde_json::from_value(task).map_err(|e| StoreError::Decode {
                    key: format!("outbox:{id}"),
                    message: e.to_string(),
                })?;
                Ok(OutboxEntry { id: id as u64, task })
            })
            .collect()
    }

    pub async fn delete_outbox(&self, ids: &[u64]) -> Result<(), StoreError> {
        let ids: Vec<i64> = ids.iter().map(|id| *id as i64).collect();
        sqlx::query("DELETE FROM shardmap_outbox WHERE id = ANY($1)")
            .bind(&ids)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete_outbox", e))?;
        Ok(())
    }
}

async fn current_version(
    tx: &mut sqlx::Transaction<'_, Postgres>,
    key: &EntityKey,
) -> Result<u64, StoreError> {
    let row = sqlx::query("SELECT version FROM shardmap_entities WHERE kind = $1 AND name = $2 FOR SHARE")
        .bind(&key.kind)
        .bind(&key.name)
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("check_version", e))?;
    match row {
        Some(row) => Ok(row
            .try_get::<i64, _>("version")
            .map_err(|e| map_sqlx_error("check_version", e))? as u64),
        None => Ok(0),
    }
}

async fn insert(
    tx: &mut sqlx::Transaction<'_, Postgres>,
    key: &EntityKey,
    body: &JsonValue,
) -> Result<(), StoreError> {
    sqlx::query("INSERT INTO shardmap_entities (kind, name, version, body) VALUES ($1, $2, 1, $3)")
        .bind(&key.kind)
        .bind(&key.name)
        .bind(body)
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("insert_entity", e))?;
    Ok(())
}

async fn update(
    tx: &mut sqlx::Transaction<'_, Postgres>,
    key: &EntityKey,
    body: &JsonValue,
    version: u64,
) -> Result<(), StoreError> {
    let result = sqlx::query(
        "UPDATE shardmap_entities SET body = $3, version = version + 1
         WHERE kind = $1 AND name = $2 AND version = $4",
    )
    .bind(&key.kind)
    .bind(&key.name)
    .bind(body)
    .bind(version as i64)
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("update_entity", e))?;

    if result.rows_affected() == 0 {
        return Err(StoreError::Conflict(format!(
            "{key}: expected version {version} no longer current"
        )));
    }
    Ok(())
}

async fn upsert(
    tx: &mut sqlx::Transaction<'_, Postgres>,
    key: &EntityKey,
    body: &JsonValue,
) -> Result<(), StoreError> {
    sqlx::query(
        "INSERT INTO shardmap_entities (kind, name, version, body) VALUES ($1, $2, 1, $3)
         ON CONFLICT (kind, name)
         DO UPDATE SET body = EXCLUDED.body, version = shardmap_entities.version + 1",
    )
    .bind(&key.kind)
    .bind(&key.name)
    .bind(body)
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("upsert_entity", e))?;
    Ok(())
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {operation}: {}", db_err.message());
            match db_err.code().as_deref() {
                Some("23505") | Some("40001") => StoreError::Conflict(msg),
                _ => StoreError::Backend(msg),
            }
        }
        sqlx::Error::PoolClosed => StoreError::Backend(format!("connection pool closed in {operation}")),
        other => StoreError::Backend(format!("{operation}: {other}")),
    }
}

fn runtime() -> Result<tokio::runtime::Handle, StoreError> {
    tokio::runtime::Handle::try_current().map_err(|_| {
        StoreError::Backend(
            "PostgresEntityStore requires a tokio runtime; call it from spawn_blocking".to_string(),
        )
    })
}

impl EntityStore for PostgresEntityStore {
    fn get(&self, key: &EntityKey) -> Result<Option<VersionedEntity>, StoreError> {
        runtime()?.block_on(self.load(key))
    }

    fn commit(&self, batch: CommitBatch) -> Result<(), StoreError> {
        runtime()?.block_on(self.apply(batch))
    }

    fn pending_outbox(&self, limit: usize) -> Result<Vec<OutboxEntry>, StoreError> {
        runtime()?.block_on(self.load_outbox(limit))
    }

    fn ack_outbox(&self, ids: &[u64]) -> Result<(), StoreError> {
        runtime()?.block_on(self.delete_outbox(ids))
    }
}
