//! PostgreSQL-backed connection registry
//!
//! Durable implementation of [`ConnectionStore`] shared by every gateway
//! instance. Table schema:
//!
//! ```sql
//! CREATE TABLE connections (
//!     connection_id TEXT PRIMARY KEY,
//!     connected_at  TIMESTAMPTZ NOT NULL,
//!     actor_id      TEXT,
//!     stream_id     UUID,
//!     last_sequence BIGINT NOT NULL DEFAULT 0,
//!     expires_at    TIMESTAMPTZ NOT NULL
//! );
//!
//! CREATE INDEX connections_actor_idx ON connections (actor_id, stream_id);
//! ```
//!
//! `expires_at` is refreshed on every write; queries filter expired rows so
//! a crashed gateway's leftovers disappear from fanout even before a
//! background sweep deletes them.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::connection::{Connection, ConnectionError, ConnectionStore, CONNECTION_TTL_SECS};

/// PostgreSQL identifiers are capped at 63 bytes
const MAX_TABLE_NAME_LEN: usize = 63;

/// The table name is interpolated into queries, so it is checked against
/// the identifier grammar before any query is built: first character a
/// letter or underscore, remainder alphanumeric or underscore.
fn validate_table_name(table: &str) -> Result<(), ConnectionError> {
    let valid = !table.is_empty()
        && table.len() <= MAX_TABLE_NAME_LEN
        && table
            .chars()
            .next()
            .is_some_and(|c| c.is_alphabetic() || c == '_')
        && table.chars().skip(1).all(|c| c.is_alphanumeric() || c == '_');

    if valid {
        Ok(())
    } else {
        Err(ConnectionError::InvalidData(format!(
            "invalid table name: {table:?}"
        )))
    }
}

/// PostgreSQL implementation of [`ConnectionStore`]
pub struct PostgresConnectionStore {
    pool: PgPool,
    table: String,
}

impl PostgresConnectionStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            table: "connections".to_string(),
        }
    }

    /// Use a non-default registry table. The name must satisfy the
    /// identifier grammar; rejection is fatal at construction.
    pub fn with_table(pool: PgPool, table: impl Into<String>) -> Result<Self, ConnectionError> {
        let table = table.into();
        validate_table_name(&table)?;
        Ok(Self { pool, table })
    }

    fn expiry() -> DateTime<Utc> {
        Utc::now() + Duration::seconds(CONNECTION_TTL_SECS)
    }

    // Sequence numbers live in BIGINT columns; values beyond i64::MAX are
    // not representable and get rejected rather than silently truncated.
    fn sequence_to_db(sequence: u64) -> Result<i64, ConnectionError> {
        i64::try_from(sequence)
            .map_err(|_| ConnectionError::InvalidData(format!("sequence {sequence} overflows")))
    }

    fn sequence_from_db(sequence: i64) -> u64 {
        sequence.max(0) as u64
    }

    fn storage_error(e: sqlx::Error) -> ConnectionError {
        ConnectionError::retryable(format!("registry error: {e}"))
    }

    fn row_to_connection(row: &sqlx::postgres::PgRow) -> Result<Connection, ConnectionError> {
        let map = |e: sqlx::Error| ConnectionError::InvalidData(e.to_string());

        let last_sequence: i64 = row.try_get("last_sequence").map_err(map)?;

        Ok(Connection {
            connection_id: row.try_get("connection_id").map_err(map)?,
            connected_at: row.try_get("connected_at").map_err(map)?,
            actor_id: row.try_get("actor_id").map_err(map)?,
            stream_id: row.try_get("stream_id").map_err(map)?,
            last_sequence: Self::sequence_from_db(last_sequence),
            expires_at: row.try_get("expires_at").map_err(map)?,
        })
    }
}

#[async_trait]
impl ConnectionStore for PostgresConnectionStore {
    async fn register(
        &self,
        connection_id: &str,
        actor_id: Option<&str>,
    ) -> Result<(), ConnectionError> {
        sqlx::query(&format!(
            r#"
            INSERT INTO {} (
                connection_id, connected_at, actor_id, stream_id,
                last_sequence, expires_at
            )
            VALUES ($1, $2, $3, NULL, 0, $4)
            ON CONFLICT (connection_id) DO UPDATE SET
                connected_at = EXCLUDED.connected_at,
                actor_id = EXCLUDED.actor_id,
                stream_id = NULL,
                last_sequence = 0,
                expires_at = EXCLUDED.expires_at
            "#,
            self.table
        ))
        .bind(connection_id)
        .bind(Utc::now())
        .bind(actor_id)
        .bind(Self::expiry())
        .execute(&self.pool)
        .await
        .map_err(Self::storage_error)?;

        Ok(())
    }

    async fn subscribe(
        &self,
        connection_id: &str,
        stream_id: Uuid,
        actor_id: &str,
        last_sequence: u64,
    ) -> Result<(), ConnectionError> {
        let sequence = Self::sequence_to_db(last_sequence)?;

        // On conflict the original connected_at is left untouched, so a
        // re-subscribe does not look like a fresh connection
        sqlx::query(&format!(
            r#"
            INSERT INTO {} (
                connection_id, connected_at, actor_id, stream_id,
                last_sequence, expires_at
            )
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (connection_id) DO UPDATE SET
                actor_id = EXCLUDED.actor_id,
                stream_id = EXCLUDED.stream_id,
                last_sequence = EXCLUDED.last_sequence,
                expires_at = EXCLUDED.expires_at
            "#,
            self.table
        ))
        .bind(connection_id)
        .bind(Utc::now())
        .bind(actor_id)
        .bind(stream_id)
        .bind(sequence)
        .bind(Self::expiry())
        .execute(&self.pool)
        .await
        .map_err(Self::storage_error)?;

        Ok(())
    }

    async fn unregister(&self, connection_id: &str) -> Result<(), ConnectionError> {
        // DELETE of a missing key affects zero rows; idempotent
        sqlx::query(&format!(
            "DELETE FROM {} WHERE connection_id = $1",
            self.table
        ))
        .bind(connection_id)
        .execute(&self.pool)
        .await
        .map_err(Self::storage_error)?;

        Ok(())
    }

    async fn get_connections(&self, actor_id: &str) -> Result<Vec<Connection>, ConnectionError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT connection_id, connected_at, actor_id, stream_id,
                   last_sequence, expires_at
            FROM {}
            WHERE actor_id = $1 AND expires_at > $2
            "#,
            self.table
        ))
        .bind(actor_id)
        .bind(Utc::now())
        .fetch_all(&self.pool)
        .await
        .map_err(Self::storage_error)?;

        rows.iter().map(Self::row_to_connection).collect()
    }

    async fn update_sequence(
        &self,
        connection_id: &str,
        last_sequence: u64,
    ) -> Result<(), ConnectionError> {
        let sequence = Self::sequence_to_db(last_sequence)?;

        // Conditional max-write: the bus gives no ordering guarantee, so a
        // blind SET would let a reordered notification regress the
        // watermark.
        sqlx::query(&format!(
            r#"
            UPDATE {}
            SET last_sequence = GREATEST(last_sequence, $2),
                expires_at = $3
            WHERE connection_id = $1
            "#,
            self.table
        ))
        .bind(connection_id)
        .bind(sequence)
        .bind(Self::expiry())
        .execute(&self.pool)
        .await
        .map_err(Self::storage_error)?;

        Ok(())
    }
}
