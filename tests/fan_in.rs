//! Fan-in properties: N concurrent completions for one listing must
//! produce exactly one activation, and any failure must reject.

use std::sync::Arc;

use validation_worker::pipeline::Metadata;
use validation_worker::repository::{
    CompletedValidation, FileStatus, InMemoryListingRepository, ListingRepository, ListingStatus,
};

fn completion(file_id: &str, listing_id: &str) -> CompletedValidation {
    CompletedValidation {
        file_id: file_id.to_string(),
        listing_id: listing_id.to_string(),
        new_file_key: Some(format!("u/{listing_id}/{file_id}.webp")),
        generated_keys: Vec::new(),
        file_warning: None,
        metadata: Metadata::new(),
    }
}

#[tokio::test]
async fn exactly_one_activation_across_concurrent_completions() {
    for round in 0..20 {
        let repo = Arc::new(InMemoryListingRepository::new());
        let file_ids: Vec<String> = (0..8).map(|i| format!("f{round}-{i}")).collect();
        let refs: Vec<&str> = file_ids.iter().map(String::as_str).collect();
        repo.seed("L", &refs);

        let mut handles = Vec::new();
        for file_id in &file_ids {
            let repo = Arc::clone(&repo);
            let completion = completion(file_id, "L");
            handles.push(tokio::spawn(async move {
                repo.complete_file_validation(completion).await.unwrap()
            }));
        }

        let mut activations = 0;
        for handle in handles {
            if handle.await.unwrap() {
                activations += 1;
            }
        }

        assert_eq!(activations, 1, "round {round}: exactly one call may activate");
        assert_eq!(repo.listing("L").unwrap().status, ListingStatus::Active);
        for file_id in &file_ids {
            assert_eq!(repo.file(file_id).unwrap().status, FileStatus::Valid);
        }
    }
}

#[tokio::test]
async fn zero_activations_when_any_file_failed() {
    for round in 0..20 {
        let repo = Arc::new(InMemoryListingRepository::new());
        let file_ids: Vec<String> = (0..8).map(|i| format!("f{round}-{i}")).collect();
        let refs: Vec<&str> = file_ids.iter().map(String::as_str).collect();
        repo.seed("L", &refs);

        // One sibling fails up front; the other seven complete concurrently.
        repo.mark_file_invalid(&file_ids[0], "corrupt").await.unwrap();

        let mut handles = Vec::new();
        for file_id in &file_ids[1..] {
            let repo = Arc::clone(&repo);
            let completion = completion(file_id, "L");
            handles.push(tokio::spawn(async move {
                repo.complete_file_validation(completion).await.unwrap()
            }));
        }

        let mut activations = 0;
        for handle in handles {
            if handle.await.unwrap() {
                activations += 1;
            }
        }

        assert_eq!(activations, 0, "round {round}: no activation with a failed sibling");
        assert_eq!(repo.listing("L").unwrap().status, ListingStatus::Rejected);
    }
}

#[tokio::test]
async fn listing_never_leaves_terminal_state() {
    let repo = Arc::new(InMemoryListingRepository::new());
    repo.seed("L", &["a", "b"]);
    repo.mark_file_failed("a", "boom").await.unwrap();

    // "b" completes: listing rejects.
    let activated = repo.complete_file_validation(completion("b", "L")).await.unwrap();
    assert!(!activated);
    assert_eq!(repo.listing("L").unwrap().status, ListingStatus::Rejected);

    // A redelivered completion for "b" must not resurrect the listing.
    let activated = repo.complete_file_validation(completion("b", "L")).await.unwrap();
    assert!(!activated);
    assert_eq!(repo.listing("L").unwrap().status, ListingStatus::Rejected);
}
