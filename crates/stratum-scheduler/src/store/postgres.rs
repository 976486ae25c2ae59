//! PostgreSQL document store implementation.
//!
//! Documents live as JSONB rows scoped by `(database, collection)`, so the
//! logical collections (`aggregate`, `metadata`, `measurements`, `data`,
//! `data_<interval>`) share one physical table. The opaque measurement
//! selector is executed with JSONB containment and never interpreted here.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use tracing::warn;

use crate::config::StoreConfig;
use crate::error::{Result, SchedulerError};
use crate::types::{collection_name, AggregationPolicy, DataDocument, DatabaseMetadata, Measurement};

use super::{
    collect_latest_measurements, data_document_from_parts, decode_policy, metadata_from_document,
    DocumentStore,
};

/// PostgreSQL-backed document store.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connect to PostgreSQL and create a new store.
    ///
    /// The required table is created if it doesn't exist.
    pub async fn new(config: &StoreConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.url)
            .await?;

        let store = Self { pool };
        store.ensure_schema().await?;

        Ok(store)
    }

    /// Create a store from an existing connection pool.
    pub async fn from_pool(pool: PgPool) -> Result<Self> {
        let store = Self { pool };
        store.ensure_schema().await?;
        Ok(store)
    }

    /// Ensure the documents table and its indexes exist.
    async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS documents (
                database TEXT NOT NULL,
                collection TEXT NOT NULL,
                id TEXT NOT NULL,
                doc JSONB NOT NULL,
                PRIMARY KEY (database, collection, id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_documents_identifier
            ON documents (database, collection, (doc->>'identifier'))
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_documents_doc
            ON documents USING GIN (doc jsonb_path_ops)
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    fn rows_to_data_documents(db: &str, rows: &[sqlx::postgres::PgRow]) -> Vec<DataDocument> {
        rows.iter()
            .filter_map(|row| {
                let id: String = row.get("id");
                let doc: Value = row.get("doc");
                let parsed = data_document_from_parts(&id, &doc);
                if parsed.is_none() {
                    warn!(db = %db, id = %id, "skipping malformed data document");
                }
                parsed
            })
            .collect()
    }
}

/// Authorisation failures on policy listing are swallowed per the store
/// contract; everything else surfaces.
fn is_permission_denied(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.code().as_deref() == Some("42501"))
}

#[async_trait]
impl DocumentStore for PostgresStore {
    async fn list_databases(&self) -> Result<Vec<String>> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT database FROM documents ORDER BY database
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(|row| row.get("database")).collect())
    }

    async fn list_policies(&self, db: &str) -> Result<Vec<AggregationPolicy>> {
        let rows = sqlx::query(
            r#"
            SELECT id, doc FROM documents
            WHERE database = $1 AND collection = 'aggregate'
            ORDER BY id
            "#,
        )
        .bind(db)
        .fetch_all(&self.pool)
        .await;

        let rows = match rows {
            Ok(rows) => rows,
            Err(e) if is_permission_denied(&e) => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut policies = Vec::new();
        for row in &rows {
            let id: String = row.get("id");
            let doc: Value = row.get("doc");
            match decode_policy(&doc) {
                Ok(policy) => policies.push(policy),
                Err(e) => {
                    warn!(db = %db, id = %id, error = %e, "skipping malformed policy");
                }
            }
        }
        Ok(policies)
    }

    async fn fetch_metadata(&self, db: &str) -> Result<DatabaseMetadata> {
        let row = sqlx::query(
            r#"
            SELECT doc FROM documents
            WHERE database = $1 AND collection = 'metadata'
            ORDER BY id
            LIMIT 1
            "#,
        )
        .bind(db)
        .fetch_optional(&self.pool)
        .await?;

        let row = row.ok_or_else(|| SchedulerError::Metadata {
            db: db.to_owned(),
            reason: "no metadata record".to_owned(),
        })?;
        let doc: Value = row.get("doc");
        metadata_from_document(db, &doc)
    }

    async fn fetch_measurements(
        &self,
        db: &str,
        selector: &Value,
        metadata: &DatabaseMetadata,
    ) -> Result<HashMap<String, Measurement>> {
        let rows = sqlx::query(
            r#"
            SELECT doc FROM documents
            WHERE database = $1 AND collection = 'measurements' AND doc @> $2
            "#,
        )
        .bind(db)
        .bind(selector)
        .fetch_all(&self.pool)
        .await?;

        let docs: Vec<Value> = rows.iter().map(|row| row.get("doc")).collect();
        Ok(collect_latest_measurements(db, docs.iter(), metadata))
    }

    async fn fetch_dirty(
        &self,
        db: &str,
        interval: i64,
        since: i64,
        identifiers: &HashSet<String>,
    ) -> Result<Vec<DataDocument>> {
        let mut wanted: Vec<String> = identifiers.iter().cloned().collect();
        wanted.sort();

        let rows = sqlx::query(
            r#"
            SELECT id, doc FROM documents
            WHERE database = $1 AND collection = $2
              AND (doc->>'updated')::bigint >= $3
              AND doc->>'identifier' = ANY($4)
            ORDER BY id
            "#,
        )
        .bind(db)
        .bind(collection_name(interval))
        .bind(since)
        .bind(&wanted)
        .fetch_all(&self.pool)
        .await?;

        Ok(Self::rows_to_data_documents(db, &rows))
    }

    async fn refetch_by_ids(
        &self,
        db: &str,
        interval: i64,
        ids: &[String],
    ) -> Result<Vec<DataDocument>> {
        let rows = sqlx::query(
            r#"
            SELECT id, doc FROM documents
            WHERE database = $1 AND collection = $2 AND id = ANY($3)
            ORDER BY id
            "#,
        )
        .bind(db)
        .bind(collection_name(interval))
        .bind(ids)
        .fetch_all(&self.pool)
        .await?;

        Ok(Self::rows_to_data_documents(db, &rows))
    }

    async fn clear_dirty(&self, db: &str, interval: i64, ids: &[String]) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE documents
            SET doc = doc - 'updated' - 'updated_start' - 'updated_end'
            WHERE database = $1 AND collection = $2 AND id = ANY($3)
            "#,
        )
        .bind(db)
        .bind(collection_name(interval))
        .bind(ids)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn set_last_run(&self, db: &str, policy: &str, last_run: i64) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE documents
            SET doc = jsonb_set(doc, '{last_run}', to_jsonb($3::bigint), true)
            WHERE database = $1 AND collection = 'aggregate' AND doc->>'name' = $2
            "#,
        )
        .bind(db)
        .bind(policy)
        .bind(last_run)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(SchedulerError::store(format!(
                "policy {policy} not found in database {db}"
            )));
        }

        Ok(())
    }
}

impl std::fmt::Debug for PostgresStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresStore").finish_non_exhaustive()
    }
}
