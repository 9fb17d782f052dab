//! Postgres-backed listing repository.
//!
//! The fan-in decision runs inside one transaction holding a row-level
//! write lock on the listing, so concurrent completions for the same
//! listing serialize and exactly one of them can observe the final state
//! transition.

use async_trait::async_trait;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tracing::{debug, instrument};

use super::{CompletedValidation, ListingRepository, RepositoryError};

/// Default connection pool size; one connection per in-flight transaction.
const DEFAULT_MAX_CONNECTIONS: u32 = 10;

/// Listing repository over a shared Postgres pool.
#[derive(Debug, Clone)]
pub struct PostgresListingRepository {
    pool: PgPool,
}

impl PostgresListingRepository {
    /// Wraps an existing pool.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connects a new pool to the given DSN.
    pub async fn connect(dsn: &str) -> Result<Self, RepositoryError> {
        let pool = PgPoolOptions::new()
            .max_connections(DEFAULT_MAX_CONNECTIONS)
            .connect(dsn)
            .await?;
        Ok(Self { pool })
    }

    /// Returns the underlying pool.
    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl ListingRepository for PostgresListingRepository {
    #[instrument(skip(self, completion), fields(file_id = %completion.file_id, listing_id = %completion.listing_id))]
    async fn complete_file_validation(
        &self,
        completion: CompletedValidation,
    ) -> Result<bool, RepositoryError> {
        let mut tx = self.pool.begin().await?;

        // Serialize sibling completions for this listing.
        sqlx::query("SELECT 1 FROM listings WHERE id = $1 FOR UPDATE")
            .bind(&completion.listing_id)
            .execute(&mut *tx)
            .await?;

        for generated_key in &completion.generated_keys {
            sqlx::query(
                "INSERT INTO listing_files \
                 (id, listing_id, file_path, file_type, status, is_generated, source_file_id) \
                 VALUES ($1, $2, $3, 'IMAGE', 'VALID', TRUE, $4)",
            )
            .bind(uuid::Uuid::new_v4().to_string())
            .bind(&completion.listing_id)
            .bind(generated_key)
            .bind(&completion.file_id)
            .execute(&mut *tx)
            .await?;
        }

        let metadata = serde_json::Value::Object(completion.metadata.clone());

        if let Some(new_file_key) = &completion.new_file_key {
            // A rewritten key may be the listing thumbnail; keep it in sync.
            let is_thumbnail: Option<bool> = sqlx::query_scalar(
                "SELECT lf.file_path = l.thumbnail_path \
                 FROM listing_files lf JOIN listings l ON l.id = $1 \
                 WHERE lf.id = $2",
            )
            .bind(&completion.listing_id)
            .bind(&completion.file_id)
            .fetch_optional(&mut *tx)
            .await?
            .flatten();

            if is_thumbnail == Some(true) {
                sqlx::query("UPDATE listings SET thumbnail_path = $1 WHERE id = $2")
                    .bind(new_file_key)
                    .bind(&completion.listing_id)
                    .execute(&mut *tx)
                    .await?;
            }

            sqlx::query("UPDATE listing_files SET status = 'VALID', file_path = $1 WHERE id = $2")
                .bind(new_file_key)
                .bind(&completion.file_id)
                .execute(&mut *tx)
                .await?;
        } else if completion.file_warning.is_some() {
            sqlx::query(
                "UPDATE listing_files SET status = 'VALID', error_message = $1, \
                 metadata = COALESCE(metadata, '{}'::jsonb) || $2 WHERE id = $3",
            )
            .bind(&completion.file_warning)
            .bind(&metadata)
            .bind(&completion.file_id)
            .execute(&mut *tx)
            .await?;
        } else {
            sqlx::query(
                "UPDATE listing_files SET status = 'VALID', \
                 metadata = COALESCE(metadata, '{}'::jsonb) || $1 WHERE id = $2",
            )
            .bind(&metadata)
            .bind(&completion.file_id)
            .execute(&mut *tx)
            .await?;
        }

        let pending: i64 = sqlx::query_scalar(
            "SELECT count(*) FROM listing_files WHERE listing_id = $1 AND status = 'PENDING'",
        )
        .bind(&completion.listing_id)
        .fetch_one(&mut *tx)
        .await?;

        if pending > 0 {
            debug!(pending, "siblings still pending, listing stays open");
            tx.commit().await?;
            return Ok(false);
        }

        let failed: i64 = sqlx::query_scalar(
            "SELECT count(*) FROM listing_files \
             WHERE listing_id = $1 AND status IN ('FAILED', 'INVALID')",
        )
        .bind(&completion.listing_id)
        .fetch_one(&mut *tx)
        .await?;

        if failed > 0 {
            sqlx::query("UPDATE listings SET status = 'REJECTED' WHERE id = $1")
                .bind(&completion.listing_id)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            debug!(failed, "listing rejected");
            return Ok(false);
        }

        // The status guard makes activation idempotent under redelivery:
        // only the call that flips the row reports true.
        let activated = sqlx::query(
            "UPDATE listings SET status = 'ACTIVE' WHERE id = $1 AND status <> 'ACTIVE'",
        )
        .bind(&completion.listing_id)
        .execute(&mut *tx)
        .await?
        .rows_affected()
            > 0;

        tx.commit().await?;
        debug!(activated, "listing fan-in complete");
        Ok(activated)
    }

    #[instrument(skip(self, error))]
    async fn mark_file_invalid(&self, file_id: &str, error: &str) -> Result<(), RepositoryError> {
        sqlx::query("UPDATE listing_files SET status = 'INVALID', error_message = $1 WHERE id = $2")
            .bind(error)
            .bind(file_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    #[instrument(skip(self, error))]
    async fn mark_file_failed(&self, file_id: &str, error: &str) -> Result<(), RepositoryError> {
        sqlx::query("UPDATE listing_files SET status = 'FAILED', error_message = $1 WHERE id = $2")
            .bind(error)
            .bind(file_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
