//! Listing persistence: per-file terminal status and the fan-in decision.
//!
//! `complete_file_validation` is the join point: N workers validate N files
//! of one listing in parallel, and exactly one call may observe the last
//! PENDING sibling turning terminal. The listing row lock serializes that
//! decision.

mod memory;
mod postgres;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use memory::InMemoryListingRepository;
pub use postgres::PostgresListingRepository;

use crate::pipeline::Metadata;

/// Terminal and pending states of a listing file row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FileStatus {
    /// Awaiting validation.
    Pending,
    /// Validated successfully.
    Valid,
    /// Rejected for bad input; the user must re-upload.
    Invalid,
    /// An internal fault stopped processing; eligible for reprocessing.
    Failed,
}

impl FileStatus {
    /// Database string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Valid => "VALID",
            Self::Invalid => "INVALID",
            Self::Failed => "FAILED",
        }
    }

    /// Whether this status ends the file's lifecycle.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// Lifecycle states of a listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ListingStatus {
    /// Files are still being validated.
    PendingValidation,
    /// Every file validated; the listing is live.
    Active,
    /// At least one file failed validation.
    Rejected,
}

impl ListingStatus {
    /// Database string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PendingValidation => "PENDING_VALIDATION",
            Self::Active => "ACTIVE",
            Self::Rejected => "REJECTED",
        }
    }
}

/// Arguments for the fan-in update of one validated file.
#[derive(Debug, Clone, Default)]
pub struct CompletedValidation {
    /// The file row being finalized.
    pub file_id: String,
    /// The owning listing.
    pub listing_id: String,
    /// Replacement object key (normalized images); `None` keeps the
    /// original key and persists warning/metadata instead.
    pub new_file_key: Option<String>,
    /// Object keys of generated sibling artifacts (model renders).
    pub generated_keys: Vec<String>,
    /// Non-fatal defect to surface with the file.
    pub file_warning: Option<String>,
    /// Validation/processing context to merge into the row's metadata.
    pub metadata: Metadata,
}

/// Repository errors. The worker treats all of them as transient.
#[derive(Debug, Error)]
pub enum RepositoryError {
    /// Query or connection failure.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// The referenced row does not exist.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Which table the lookup targeted.
        entity: &'static str,
        /// The missing id.
        id: String,
    },
}

impl RepositoryError {
    /// Creates a not-found error.
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }
}

/// Transactional listing persistence consumed by the worker.
#[async_trait]
pub trait ListingRepository: Send + Sync {
    /// Marks a file VALID and decides the listing's fate inside one
    /// transaction.
    ///
    /// Returns `true` only from the call that performed the
    /// PENDING_VALIDATION -> ACTIVE transition; every other call (siblings
    /// still pending, listing rejected, already active) returns `false`.
    async fn complete_file_validation(
        &self,
        completion: CompletedValidation,
    ) -> Result<bool, RepositoryError>;

    /// Marks a file INVALID with a user-facing reason.
    async fn mark_file_invalid(&self, file_id: &str, error: &str) -> Result<(), RepositoryError>;

    /// Marks a file FAILED with an operator-facing reason.
    async fn mark_file_failed(&self, file_id: &str, error: &str) -> Result<(), RepositoryError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_status_strings() {
        assert_eq!(FileStatus::Pending.as_str(), "PENDING");
        assert_eq!(FileStatus::Valid.as_str(), "VALID");
        assert_eq!(FileStatus::Invalid.as_str(), "INVALID");
        assert_eq!(FileStatus::Failed.as_str(), "FAILED");
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!FileStatus::Pending.is_terminal());
        assert!(FileStatus::Valid.is_terminal());
        assert!(FileStatus::Invalid.is_terminal());
        assert!(FileStatus::Failed.is_terminal());
    }

    #[test]
    fn test_listing_status_strings() {
        assert_eq!(ListingStatus::PendingValidation.as_str(), "PENDING_VALIDATION");
        assert_eq!(ListingStatus::Active.as_str(), "ACTIVE");
        assert_eq!(ListingStatus::Rejected.as_str(), "REJECTED");
    }
}
