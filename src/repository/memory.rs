//! In-memory listing repository.
//!
//! The deterministic stand-in for Postgres used by tests, benches, and the
//! binary's local mode. One mutex over the whole state plays the role of
//! the listing row lock: completions serialize exactly like the
//! transactional implementation.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use super::{
    CompletedValidation, FileStatus, ListingRepository, ListingStatus, RepositoryError,
};
use crate::pipeline::Metadata;

/// One simulated `listing_files` row.
#[derive(Debug, Clone)]
pub struct FileRow {
    /// Row id.
    pub id: String,
    /// Owning listing.
    pub listing_id: String,
    /// Current object key.
    pub file_path: Option<String>,
    /// Lifecycle status.
    pub status: FileStatus,
    /// Error or warning message.
    pub error_message: Option<String>,
    /// Merged metadata.
    pub metadata: Metadata,
    /// Whether the row was produced by processing rather than upload.
    pub is_generated: bool,
    /// Source file for generated rows.
    pub source_file_id: Option<String>,
}

/// One simulated `listings` row.
#[derive(Debug, Clone)]
pub struct ListingRow {
    /// Row id.
    pub id: String,
    /// Lifecycle status.
    pub status: ListingStatus,
    /// Current thumbnail object key.
    pub thumbnail_path: Option<String>,
}

#[derive(Debug, Default)]
struct State {
    files: HashMap<String, FileRow>,
    listings: HashMap<String, ListingRow>,
    generated_seq: u64,
}

/// Mutex-serialized in-memory repository.
#[derive(Debug, Default)]
pub struct InMemoryListingRepository {
    state: Mutex<State>,
}

impl InMemoryListingRepository {
    /// Creates an empty repository.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a listing with PENDING file rows (test setup helper).
    pub fn seed(&self, listing_id: &str, file_ids: &[&str]) {
        let mut state = self.lock();
        state.listings.insert(
            listing_id.to_string(),
            ListingRow {
                id: listing_id.to_string(),
                status: ListingStatus::PendingValidation,
                thumbnail_path: None,
            },
        );
        for file_id in file_ids {
            state.files.insert(
                (*file_id).to_string(),
                FileRow {
                    id: (*file_id).to_string(),
                    listing_id: listing_id.to_string(),
                    file_path: None,
                    status: FileStatus::Pending,
                    error_message: None,
                    metadata: Metadata::new(),
                    is_generated: false,
                    source_file_id: None,
                },
            );
        }
    }

    /// Sets a listing's thumbnail key (test setup helper).
    pub fn set_thumbnail(&self, listing_id: &str, thumbnail_path: &str) {
        let mut state = self.lock();
        if let Some(listing) = state.listings.get_mut(listing_id) {
            listing.thumbnail_path = Some(thumbnail_path.to_string());
        }
    }

    /// Sets a file's current object key (test setup helper).
    pub fn set_file_path(&self, file_id: &str, file_path: &str) {
        let mut state = self.lock();
        if let Some(file) = state.files.get_mut(file_id) {
            file.file_path = Some(file_path.to_string());
        }
    }

    /// Snapshot of a file row.
    #[must_use]
    pub fn file(&self, file_id: &str) -> Option<FileRow> {
        self.lock().files.get(file_id).cloned()
    }

    /// Snapshot of a listing row.
    #[must_use]
    pub fn listing(&self, listing_id: &str) -> Option<ListingRow> {
        self.lock().listings.get(listing_id).cloned()
    }

    /// Rows generated from a given source file.
    #[must_use]
    pub fn generated_for(&self, source_file_id: &str) -> Vec<FileRow> {
        self.lock()
            .files
            .values()
            .filter(|f| f.source_file_id.as_deref() == Some(source_file_id))
            .cloned()
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        // A poisoned lock means a panicking test thread; the state itself
        // is still coherent for inspection.
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl ListingRepository for InMemoryListingRepository {
    async fn complete_file_validation(
        &self,
        completion: CompletedValidation,
    ) -> Result<bool, RepositoryError> {
        let mut state = self.lock();

        let rewritten = {
            let Some(file) = state.files.get_mut(&completion.file_id) else {
                // Mirror the SQL UPDATE on a missing row: nothing happens.
                return Ok(false);
            };
            file.status = FileStatus::Valid;
            if let Some(new_file_key) = &completion.new_file_key {
                let old_path = file.file_path.replace(new_file_key.clone());
                Some((new_file_key.clone(), old_path))
            } else {
                if let Some(warning) = &completion.file_warning {
                    file.error_message = Some(warning.clone());
                }
                for (key, value) in &completion.metadata {
                    file.metadata.insert(key.clone(), value.clone());
                }
                None
            }
        };

        if let Some((new_file_key, old_path)) = rewritten {
            if let Some(listing) = state.listings.get_mut(&completion.listing_id) {
                if old_path.is_some() && listing.thumbnail_path == old_path {
                    listing.thumbnail_path = Some(new_file_key);
                }
            }
        }

        for generated_key in &completion.generated_keys {
            state.generated_seq += 1;
            let id = format!("gen-{}", state.generated_seq);
            state.files.insert(
                id.clone(),
                FileRow {
                    id,
                    listing_id: completion.listing_id.clone(),
                    file_path: Some(generated_key.clone()),
                    status: FileStatus::Valid,
                    error_message: None,
                    metadata: Metadata::new(),
                    is_generated: true,
                    source_file_id: Some(completion.file_id.clone()),
                },
            );
        }

        let pending = state
            .files
            .values()
            .filter(|f| f.listing_id == completion.listing_id && f.status == FileStatus::Pending)
            .count();
        if pending > 0 {
            return Ok(false);
        }

        let failed = state
            .files
            .values()
            .filter(|f| {
                f.listing_id == completion.listing_id
                    && matches!(f.status, FileStatus::Failed | FileStatus::Invalid)
            })
            .count();

        let Some(listing) = state.listings.get_mut(&completion.listing_id) else {
            return Ok(false);
        };

        if failed > 0 {
            listing.status = ListingStatus::Rejected;
            return Ok(false);
        }

        if listing.status == ListingStatus::Active {
            return Ok(false);
        }
        listing.status = ListingStatus::Active;
        Ok(true)
    }

    async fn mark_file_invalid(&self, file_id: &str, error: &str) -> Result<(), RepositoryError> {
        let mut state = self.lock();
        if let Some(file) = state.files.get_mut(file_id) {
            file.status = FileStatus::Invalid;
            file.error_message = Some(error.to_string());
        }
        Ok(())
    }

    async fn mark_file_failed(&self, file_id: &str, error: &str) -> Result<(), RepositoryError> {
        let mut state = self.lock();
        if let Some(file) = state.files.get_mut(file_id) {
            file.status = FileStatus::Failed;
            file.error_message = Some(error.to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn completion(file_id: &str, listing_id: &str, key: Option<&str>) -> CompletedValidation {
        CompletedValidation {
            file_id: file_id.to_string(),
            listing_id: listing_id.to_string(),
            new_file_key: key.map(str::to_string),
            ..CompletedValidation::default()
        }
    }

    #[tokio::test]
    async fn test_single_file_activates_listing() {
        let repo = InMemoryListingRepository::new();
        repo.seed("L", &["f1"]);

        let activated = repo
            .complete_file_validation(completion("f1", "L", Some("u/L/f1.webp")))
            .await
            .unwrap();

        assert!(activated);
        assert_eq!(repo.file("f1").unwrap().status, FileStatus::Valid);
        assert_eq!(repo.listing("L").unwrap().status, ListingStatus::Active);
    }

    #[tokio::test]
    async fn test_pending_sibling_blocks_activation() {
        let repo = InMemoryListingRepository::new();
        repo.seed("L", &["a", "b"]);

        let activated = repo
            .complete_file_validation(completion("a", "L", Some("u/L/a.webp")))
            .await
            .unwrap();

        assert!(!activated);
        assert_eq!(
            repo.listing("L").unwrap().status,
            ListingStatus::PendingValidation
        );
    }

    #[tokio::test]
    async fn test_invalid_sibling_rejects_listing() {
        let repo = InMemoryListingRepository::new();
        repo.seed("L", &["a", "b"]);
        repo.mark_file_invalid("a", "corrupt upload").await.unwrap();

        let activated = repo
            .complete_file_validation(completion("b", "L", Some("u/L/b.webp")))
            .await
            .unwrap();

        assert!(!activated);
        assert_eq!(repo.listing("L").unwrap().status, ListingStatus::Rejected);
    }

    #[tokio::test]
    async fn test_failed_sibling_rejects_listing() {
        let repo = InMemoryListingRepository::new();
        repo.seed("L", &["a", "b"]);
        repo.mark_file_failed("a", "internal fault").await.unwrap();

        let activated = repo
            .complete_file_validation(completion("b", "L", Some("u/L/b.webp")))
            .await
            .unwrap();

        assert!(!activated);
        assert_eq!(repo.listing("L").unwrap().status, ListingStatus::Rejected);
    }

    #[tokio::test]
    async fn test_redelivery_does_not_activate_twice() {
        let repo = InMemoryListingRepository::new();
        repo.seed("L", &["f1"]);

        let first = repo
            .complete_file_validation(completion("f1", "L", Some("u/L/f1.webp")))
            .await
            .unwrap();
        let second = repo
            .complete_file_validation(completion("f1", "L", Some("u/L/f1.webp")))
            .await
            .unwrap();

        assert!(first);
        assert!(!second, "a redelivered completion must not re-activate");
    }

    #[tokio::test]
    async fn test_generated_rows_inserted_valid() {
        let repo = InMemoryListingRepository::new();
        repo.seed("L", &["m1"]);

        let mut c = completion("m1", "L", None);
        c.generated_keys = vec!["u/L/m1/iso.webp".to_string(), "u/L/m1/top.webp".to_string()];
        c.file_warning = Some("side view failed".to_string());
        c.metadata.insert("faces".to_string(), 4.into());

        let activated = repo.complete_file_validation(c).await.unwrap();

        assert!(activated);
        let generated = repo.generated_for("m1");
        assert_eq!(generated.len(), 2);
        assert!(generated.iter().all(|g| g.status == FileStatus::Valid && g.is_generated));

        let file = repo.file("m1").unwrap();
        assert_eq!(file.error_message.as_deref(), Some("side view failed"));
        assert_eq!(file.metadata.get("faces").and_then(|v| v.as_u64()), Some(4));
    }

    #[tokio::test]
    async fn test_thumbnail_follows_key_rewrite() {
        let repo = InMemoryListingRepository::new();
        repo.seed("L", &["f1"]);
        repo.set_file_path("f1", "raw/in.jpg");
        repo.set_thumbnail("L", "raw/in.jpg");

        repo.complete_file_validation(completion("f1", "L", Some("u/L/f1.webp")))
            .await
            .unwrap();

        assert_eq!(
            repo.listing("L").unwrap().thumbnail_path.as_deref(),
            Some("u/L/f1.webp")
        );
    }

    #[tokio::test]
    async fn test_unknown_file_is_a_noop() {
        let repo = InMemoryListingRepository::new();
        repo.seed("L", &["f1"]);

        let activated = repo
            .complete_file_validation(completion("ghost", "L", None))
            .await
            .unwrap();

        assert!(!activated);
        assert_eq!(repo.file("f1").unwrap().status, FileStatus::Pending);
    }
}
