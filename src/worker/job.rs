//! Ingress job payload parsing.
//!
//! The wire payload is JSON with a known field set. Parsing is two-staged:
//! a tolerant envelope decode (so a payload with some fields missing still
//! yields the ids needed for error reporting), then strict validation that
//! names every missing field.

use serde::Deserialize;
use uuid::Uuid;

/// Raw wire shape; every field optional so partial payloads still decode.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JobEnvelope {
    /// Opaque correlation id; generated when absent.
    pub trace_id: Option<String>,
    /// The file row under validation.
    pub file_id: Option<String>,
    /// The owning listing.
    pub listing_id: Option<String>,
    /// The uploading user.
    pub user_id: Option<String>,
    /// Object-store key of the uploaded file.
    pub file_key: Option<String>,
    /// Declared kind: `image` or `model`.
    pub file_type: Option<String>,
}

/// A fully validated job.
#[derive(Debug, Clone)]
pub struct Job {
    /// Correlation id, present on every log line and error message.
    pub trace_id: String,
    /// The file row under validation.
    pub file_id: String,
    /// The owning listing.
    pub listing_id: String,
    /// The uploading user.
    pub user_id: String,
    /// Object-store key of the uploaded file.
    pub file_key: String,
    /// Declared kind, dispatched on later (unknown kinds are a permanent
    /// failure at dispatch, not a parse failure).
    pub file_type: String,
}

impl JobEnvelope {
    /// Decodes the raw payload, or reports it as undecodable.
    pub fn decode(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }

    /// Validates required fields, returning the missing field names
    /// otherwise.
    pub fn into_job(self) -> Result<Job, Vec<&'static str>> {
        let mut missing = Vec::new();
        if self.file_id.is_none() {
            missing.push("file_id");
        }
        if self.listing_id.is_none() {
            missing.push("listing_id");
        }
        if self.user_id.is_none() {
            missing.push("user_id");
        }
        if self.file_key.is_none() {
            missing.push("file_key");
        }
        if self.file_type.is_none() {
            missing.push("file_type");
        }
        if !missing.is_empty() {
            return Err(missing);
        }

        // The unwraps above were just ruled out; destructure instead of
        // re-checking.
        let (Some(file_id), Some(listing_id), Some(user_id), Some(file_key), Some(file_type)) = (
            self.file_id,
            self.listing_id,
            self.user_id,
            self.file_key,
            self.file_type,
        ) else {
            return Err(vec!["file_id"]);
        };

        Ok(Job {
            trace_id: self
                .trace_id
                .unwrap_or_else(|| Uuid::new_v4().simple().to_string()),
            file_id,
            listing_id,
            user_id,
            file_key,
            file_type,
        })
    }
}

impl Job {
    /// Extension of the uploaded file key, lowercased; empty when the key
    /// has none.
    #[must_use]
    pub fn file_extension(&self) -> String {
        std::path::Path::new(&self.file_key)
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default()
    }
}
