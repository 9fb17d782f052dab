//! Asset Validation Worker Library
//!
//! A durable background service that consumes file-validation jobs from a
//! message bus, runs a staged validation-and-transformation pipeline over
//! images and 3D models, uploads derived artifacts to object storage, and
//! advances the owning listing through its state machine.
//!
//! # Architecture
//!
//! - [`bus`] - Event bus seam: JetStream adapter with dead-lettering, plus
//!   a deterministic in-memory bus
//! - [`pipeline`] - Validator/processor contracts and the two-phase
//!   execution engine
//! - [`validators`] - Concrete image and model checks
//! - [`processors`] - WebP normalization and multi-angle model rendering
//! - [`mesh`] - STL decoding and mesh structure queries
//! - [`provider`] - Object storage access with scoped temp files
//! - [`repository`] - Transactional file/listing persistence (fan-in)
//! - [`worker`] - Per-message orchestration, concurrency envelope, shutdown
//! - [`config`] - Environment-driven settings

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]

pub mod bus;
pub mod config;
pub mod mesh;
pub mod pipeline;
pub mod processors;
pub mod provider;
pub mod repository;
pub mod validators;
pub mod worker;

// Re-export commonly used types
pub use bus::{EventBus, InMemoryEventBus, IncomingMessage, MessageHandler, NatsEventBus};
pub use config::{Mode, Settings};
pub use pipeline::{
    AssetContext, ValidationPipeline, ValidationPolicy, ValidationResult, Validator,
};
pub use provider::{FileProvider, LocalFileProvider, S3FileProvider};
pub use repository::{
    CompletedValidation, InMemoryListingRepository, ListingRepository, PostgresListingRepository,
};
pub use worker::{Job, ValidationWorker, WorkerOptions};
