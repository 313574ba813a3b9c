//! Postgres-backed `Store`.
//!
//! Grounded directly in `automations::executors::update_heartbeat` and
//! `automations::server::ready_tasks_iter`'s optimistic-concurrency idiom:
//! a conditional mutation is an `UPDATE ... WHERE <predicate>` whose
//! affected-row count (not an error) tells the caller whether it won. We
//! use the runtime `sqlx::query`/`query_as` API rather than the
//! compile-time-checked `sqlx::query!` macros, since those require a live
//! database or a committed `.sqlx` query cache at build time that this
//! repository does not ship (see DESIGN.md).

use super::{ExpectedCounter, PutOutcome, Store, StoredRow};
use crate::error::{Error, Result};
use crate::model::RowId;

pub struct PostgresStore {
    pool: sqlx::PgPool,
}

impl PostgresStore {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }

    /// DDL for the single logical table. Callers run this once at startup
    /// (or via an external migration) — no ORM migration runner is in
    /// scope here, matching spec §1's "underlying key-value store" being
    /// an external collaborator.
    pub const CREATE_TABLE_SQL: &'static str = r#"
        CREATE TABLE IF NOT EXISTS coordinator_rows (
            row_id     TEXT PRIMARY KEY,
            counter    BIGINT NOT NULL,
            payload    JSONB NOT NULL,
            updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
        )
    "#;

    /// Runs `CREATE_TABLE_SQL`. Idempotent; safe to call on every startup.
    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(Self::CREATE_TABLE_SQL)
            .execute(&self.pool)
            .await
            .map_err(Self::transient)?;
        Ok(())
    }

    fn transient(err: sqlx::Error) -> Error {
        Error::TransientStore(anyhow::anyhow!(err))
    }
}

#[async_trait::async_trait]
impl Store for PostgresStore {
    async fn get(&self, row_id: &RowId) -> Result<Option<StoredRow>> {
        let row: Option<(String, i64, serde_json::Value)> = sqlx::query_as(
            "SELECT row_id, counter, payload FROM coordinator_rows WHERE row_id = $1",
        )
        .bind(row_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(Self::transient)?;

        Ok(row.map(|(row_id, counter, payload)| StoredRow {
            row_id: RowId::from_raw(row_id),
            counter: counter as u64,
            payload,
        }))
    }

    async fn conditional_put(
        &self,
        row_id: &RowId,
        expected: ExpectedCounter,
        payload: serde_json::Value,
    ) -> Result<PutOutcome> {
        let affected = match expected {
            ExpectedCounter::Absent => {
                sqlx::query(
                    "INSERT INTO coordinator_rows (row_id, counter, payload, updated_at)
                     VALUES ($1, 1, $2, now())
                     ON CONFLICT (row_id) DO NOTHING",
                )
                .bind(row_id.as_str())
                .bind(&payload)
                .execute(&self.pool)
                .await
                .map_err(Self::transient)?
                .rows_affected()
            }
            ExpectedCounter::Is(expected_counter) => {
                sqlx::query(
                    "UPDATE coordinator_rows
                     SET counter = counter + 1, payload = $3, updated_at = now()
                     WHERE row_id = $1 AND counter = $2",
                )
                .bind(row_id.as_str())
                .bind(expected_counter as i64)
                .bind(&payload)
                .execute(&self.pool)
                .await
                .map_err(Self::transient)?
                .rows_affected()
            }
        };

        if affected == 1 {
            let next = match expected {
                ExpectedCounter::Absent => 1,
                ExpectedCounter::Is(c) => c + 1,
            };
            Ok(PutOutcome::Written(next))
        } else {
            Ok(PutOutcome::Conflict)
        }
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<StoredRow>> {
        let rows: Vec<(String, i64, serde_json::Value)> = sqlx::query_as(
            "SELECT row_id, counter, payload FROM coordinator_rows WHERE row_id LIKE $1",
        )
        .bind(format!("{prefix}%"))
        .fetch_all(&self.pool)
        .await
        .map_err(Self::transient)?;

        Ok(rows
            .into_iter()
            .map(|(row_id, counter, payload)| StoredRow {
                row_id: RowId::from_raw(row_id),
                counter: counter as u64,
                payload,
            })
            .collect())
    }

    async fn delete(&self, row_id: &RowId, expected_counter: u64) -> Result<PutOutcome> {
        let affected = sqlx::query("DELETE FROM coordinator_rows WHERE row_id = $1 AND counter = $2")
            .bind(row_id.as_str())
            .bind(expected_counter as i64)
            .execute(&self.pool)
            .await
            .map_err(Self::transient)?
            .rows_affected();

        if affected == 1 {
            Ok(PutOutcome::Written(expected_counter + 1))
        } else {
            Ok(PutOutcome::Conflict)
        }
    }
}
