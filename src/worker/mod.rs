//! The validation worker: per-message orchestration and lifecycle.
//!
//! `handle` is the reliability boundary. Business logic reports its outcome
//! as a [`JobError`] sum type, matched exactly once here and mapped onto
//! bus acknowledgment: success and permanent failures ack (permanent ones
//! after marking the file INVALID), transient failures nak with a delay so
//! the broker redelivers. Errors in the ack/mark calls themselves propagate
//! to the bus adapter, whose delivery budget bounds them.

mod job;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{Instrument, debug, error, info, info_span, warn};

pub use job::{Job, JobEnvelope};

use crate::bus::{
    BusError, EventBus, HandlerError, IncomingMessage, IndexListingEvent, MessageHandler,
    SubscribeOptions, publish_event,
};
use crate::pipeline::{
    AssetContext, Metadata, ModelProcessingOutput, Processor, ValidationPipeline,
    ValidationPolicy, ValidationResult,
};
use crate::processors::{ModelRenderer, WebpNormalizer};
use crate::provider::FileProvider;
use crate::repository::{CompletedValidation, ListingRepository};
use crate::validators::image::{FileTypeValidator, ImageIntegrityValidator, ResolutionValidator};
use crate::validators::model::{
    FileSizeValidator, MeshLoadValidator, ModelComplexityValidator, ModelFileTypeValidator,
};

/// Default number of concurrently processed jobs.
pub const DEFAULT_CONCURRENCY: usize = 10;

/// Default redelivery delay for transient failures.
pub const DEFAULT_NAK_DELAY: Duration = Duration::from_secs(5);

/// Job outcome classification, matched once at the handler boundary.
#[derive(Debug, Error)]
pub enum JobError {
    /// The job can never succeed (bad payload, failed validation); retrying
    /// would waste the delivery budget.
    #[error("permanent failure: {reason}")]
    Permanent {
        /// What went wrong.
        reason: String,
    },

    /// Infrastructure hiccup (storage, database); the broker should
    /// redeliver.
    #[error("transient failure: {reason}")]
    Transient {
        /// What went wrong.
        reason: String,
    },
}

impl JobError {
    /// Creates a permanent failure.
    pub fn permanent(reason: impl Into<String>) -> Self {
        Self::Permanent {
            reason: reason.into(),
        }
    }

    /// Creates a transient failure.
    pub fn transient(reason: impl Into<String>) -> Self {
        Self::Transient {
            reason: reason.into(),
        }
    }
}

/// Errors from worker startup and shutdown.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// Subscription setup failed.
    #[error("bus error: {0}")]
    Bus(#[from] BusError),

    /// Signal handler registration failed.
    #[error("failed to install signal handler: {0}")]
    Signal(#[from] std::io::Error),
}

/// Worker wiring knobs.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Maximum jobs in flight; also the subscription's in-flight cap.
    pub concurrency: usize,
    /// Subject delivering validation jobs.
    pub ingress_topic: String,
    /// Subject for listing activation events.
    pub index_topic: String,
    /// Redelivery delay requested on transient failures.
    pub nak_delay: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            ingress_topic: "validation.start".to_string(),
            index_topic: "index_listing".to_string(),
            nak_delay: DEFAULT_NAK_DELAY,
        }
    }
}

/// Orchestrates one validation job per bus message.
pub struct ValidationWorker {
    provider: Arc<dyn FileProvider>,
    repository: Arc<dyn ListingRepository>,
    bus: Arc<dyn EventBus>,
    policy: Arc<ValidationPolicy>,
    options: WorkerOptions,
    image_pipeline: Arc<ValidationPipeline>,
    model_pipeline: Arc<ValidationPipeline>,
    webp: Arc<WebpNormalizer>,
    renderer: Arc<ModelRenderer>,
    semaphore: Arc<Semaphore>,
}

impl ValidationWorker {
    /// Builds a worker with the standard image and model pipelines.
    #[must_use]
    pub fn new(
        provider: Arc<dyn FileProvider>,
        repository: Arc<dyn ListingRepository>,
        bus: Arc<dyn EventBus>,
        policy: ValidationPolicy,
        options: WorkerOptions,
    ) -> Self {
        let image_pipeline = ValidationPipeline::new(vec![
            Box::new(FileTypeValidator),
            Box::new(ResolutionValidator),
            Box::new(ImageIntegrityValidator),
        ]);
        let model_pipeline = ValidationPipeline::new(vec![
            Box::new(FileSizeValidator),
            Box::new(ModelFileTypeValidator::default()),
            Box::new(MeshLoadValidator),
            Box::new(ModelComplexityValidator),
        ]);

        let concurrency = options.concurrency.max(1);
        Self {
            provider,
            repository,
            bus,
            policy: Arc::new(policy),
            options,
            image_pipeline: Arc::new(image_pipeline),
            model_pipeline: Arc::new(model_pipeline),
            webp: Arc::new(WebpNormalizer::new(80.0)),
            renderer: Arc::new(ModelRenderer),
            semaphore: Arc::new(Semaphore::new(concurrency)),
        }
    }

    /// Subscribes to the ingress topic and blocks until an interrupt or
    /// terminate signal arrives, then drains in-flight jobs.
    pub async fn start(self: Arc<Self>) -> Result<(), WorkerError> {
        let options = SubscribeOptions {
            max_in_flight: self.options.concurrency,
            manual_ack: true,
            on_failure: None,
        };
        let handler: Arc<dyn MessageHandler> = self.clone();
        self.bus
            .subscribe(&self.options.ingress_topic, handler, options)
            .await?;

        info!(
            topic = %self.options.ingress_topic,
            concurrency = self.options.concurrency,
            "worker started, waiting for jobs"
        );

        shutdown_signal().await?;
        warn!("shutdown signal received, draining in-flight jobs");

        // Every permit back in the semaphore means every job has finished.
        let drain = self
            .semaphore
            .acquire_many(self.options.concurrency.max(1) as u32)
            .await;
        drop(drain);
        info!("worker drained, shutting down");
        Ok(())
    }

    async fn process_job(&self, job: &Job) -> Result<(), JobError> {
        match job.file_type.as_str() {
            "image" => self.process_image(job).await,
            "model" => self.process_model(job).await,
            other => Err(JobError::permanent(format!(
                "unsupported file type: {other}"
            ))),
        }
    }

    async fn process_image(&self, job: &Job) -> Result<(), JobError> {
        let scoped = self
            .provider
            .get_file(&job.file_key)
            .await
            .map_err(|e| JobError::transient(format!("download failed: {e}")))?;

        let stage = {
            let pipeline = Arc::clone(&self.image_pipeline);
            let webp = Arc::clone(&self.webp);
            let policy = Arc::clone(&self.policy);
            let path = scoped.path().to_path_buf();
            let trace_id = job.trace_id.clone();
            tokio::task::spawn_blocking(move || {
                run_image_stage(&pipeline, &webp, &policy, &path, &trace_id)
            })
            .await
            .map_err(|e| JobError::transient(format!("processing task failed: {e}")))?
        }
        .map_err(JobError::permanent)?;

        let public_key = format!(
            "{}/{}/{}.webp",
            job.user_id, job.listing_id, job.file_id
        );
        debug!(key = %public_key, "uploading normalized image");
        let upload = self.provider.store_image(&stage.output_path, &public_key).await;
        let _ = tokio::fs::remove_file(&stage.output_path).await;
        upload.map_err(|e| JobError::transient(format!("storage upload failed: {e}")))?;

        // The scoped download is dropped here, unlinking the input temp.
        drop(scoped);

        self.finalize(job, Some(public_key), Vec::new(), None, stage.metadata)
            .await
    }

    async fn process_model(&self, job: &Job) -> Result<(), JobError> {
        let local_path = self
            .provider
            .get_file_temp(&job.file_key)
            .await
            .map_err(|e| JobError::transient(format!("download failed: {e}")))?;

        // Backstop: everything tracked here is unlinked when the job exits,
        // whatever path it takes.
        let mut cleanup = FileCleanup::default();
        cleanup.track(local_path.clone());

        let stage_result = {
            let pipeline = Arc::clone(&self.model_pipeline);
            let renderer = Arc::clone(&self.renderer);
            let policy = Arc::clone(&self.policy);
            let path = local_path.clone();
            let trace_id = job.trace_id.clone();
            tokio::task::spawn_blocking(move || {
                run_model_stage(&pipeline, &renderer, &policy, &path, &trace_id)
            })
            .await
            .map_err(|e| JobError::transient(format!("processing task failed: {e}")))?
        };

        let stage = match stage_result {
            Ok(stage) => {
                for render in &stage.output.generated_image_paths {
                    cleanup.track(render.clone());
                }
                stage
            }
            Err(reason) => return Err(JobError::permanent(reason)),
        };

        let extension = job.file_extension();
        let product_key = if extension.is_empty() {
            format!("{}/{}/{}", job.user_id, job.listing_id, job.file_id)
        } else {
            format!(
                "{}/{}/{}.{extension}",
                job.user_id, job.listing_id, job.file_id
            )
        };
        debug!(key = %product_key, "uploading validated original");
        let upload = self
            .provider
            .store_product_file(&local_path, &product_key)
            .await;
        cleanup.remove_now(&local_path);
        upload.map_err(|e| JobError::transient(format!("storage upload failed: {e}")))?;

        let mut generated_keys = Vec::with_capacity(stage.output.generated_image_paths.len());
        for render in &stage.output.generated_image_paths {
            let angle = view_name(render);
            let render_key = format!(
                "{}/{}/{}/{angle}.webp",
                job.user_id, job.listing_id, job.file_id
            );
            debug!(key = %render_key, "uploading render");
            let upload = self.provider.store_image(render, &render_key).await;
            cleanup.remove_now(render);
            upload.map_err(|e| JobError::transient(format!("storage upload failed: {e}")))?;
            generated_keys.push(render_key);
        }

        self.finalize(job, None, generated_keys, stage.warning, stage.metadata)
            .await
    }

    async fn finalize(
        &self,
        job: &Job,
        new_file_key: Option<String>,
        generated_keys: Vec<String>,
        file_warning: Option<String>,
        metadata: Metadata,
    ) -> Result<(), JobError> {
        let completion = CompletedValidation {
            file_id: job.file_id.clone(),
            listing_id: job.listing_id.clone(),
            new_file_key,
            generated_keys,
            file_warning,
            metadata,
        };

        let activated = self
            .repository
            .complete_file_validation(completion)
            .await
            .map_err(|e| JobError::transient(format!("database update failed: {e}")))?;

        if activated {
            info!(listing_id = %job.listing_id, "listing activated, publishing index event");
            let event = IndexListingEvent::new(&self.options.index_topic, &job.listing_id);
            // Best effort: the DB transition is the authoritative signal,
            // so a publish failure must not fail the job.
            if let Err(e) = publish_event(self.bus.as_ref(), &event).await {
                error!(listing_id = %job.listing_id, error = %e, "failed to publish index event");
            }
        }

        Ok(())
    }
}

#[async_trait]
impl MessageHandler for ValidationWorker {
    async fn handle(&self, message: &dyn IncomingMessage) -> Result<(), HandlerError> {
        // The subscription's in-flight cap matches the semaphore size, so
        // waiting here only happens if the broker overshoots.
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|e| -> HandlerError { Box::new(e) })?;

        let envelope = match JobEnvelope::decode(message.payload()) {
            Ok(envelope) => envelope,
            Err(e) => {
                error!(error = %e, "message is not valid JSON, discarding");
                message.ack().await.map_err(into_handler_error)?;
                return Ok(());
            }
        };

        let file_id_for_errors = envelope.file_id.clone();
        let (job, outcome) = match envelope.into_job() {
            Ok(job) => {
                let span = info_span!(
                    "job",
                    trace_id = %job.trace_id,
                    file_id = %job.file_id,
                    listing_id = %job.listing_id
                );
                let outcome = async {
                    info!("processing job");
                    self.process_job(&job).await
                }
                .instrument(span)
                .await;
                (Some(job), outcome)
            }
            Err(missing) => (
                None,
                Err(JobError::permanent(format!(
                    "missing required fields: {}",
                    missing.join(", ")
                ))),
            ),
        };

        let trace_id = job.as_ref().map_or("unknown", |j| j.trace_id.as_str());

        match outcome {
            Ok(()) => {
                info!(trace_id, "job complete, acknowledging message");
                message.ack().await.map_err(into_handler_error)?;
            }
            Err(JobError::Permanent { reason }) => {
                error!(trace_id, %reason, "permanent failure, marking file invalid");
                if let Some(file_id) = job.as_ref().map(|j| j.file_id.as_str()).or(file_id_for_errors.as_deref()) {
                    let detail = format!("{reason} (ref {trace_id})");
                    self.repository
                        .mark_file_invalid(file_id, &detail)
                        .await
                        .map_err(into_handler_error)?;
                }
                // Ack so the poison job leaves the queue.
                message.ack().await.map_err(into_handler_error)?;
            }
            Err(JobError::Transient { reason }) => {
                warn!(trace_id, %reason, "transient failure, requesting redelivery");
                message
                    .nak(self.options.nak_delay)
                    .await
                    .map_err(into_handler_error)?;
            }
        }

        Ok(())
    }
}

fn into_handler_error<E: std::error::Error + Send + Sync + 'static>(e: E) -> HandlerError {
    Box::new(e)
}

struct ImageStage {
    output_path: PathBuf,
    metadata: Metadata,
}

/// CPU-bound image stage: validate, then normalize. Runs on the blocking
/// pool; never touches the async runtime.
fn run_image_stage(
    pipeline: &ValidationPipeline,
    webp: &WebpNormalizer,
    policy: &ValidationPolicy,
    path: &Path,
    trace_id: &str,
) -> Result<ImageStage, String> {
    let context = AssetContext::new(path, trace_id, "image");
    let results = pipeline.run(&context, policy);
    let mut metadata = merged_metadata(&results);
    first_failure(&results)?;

    let processed = webp.process(&context);
    if !processed.success {
        return Err(format!(
            "processing failed in {}: {}",
            processed.processor_name,
            processed
                .error_message
                .unwrap_or_else(|| "no detail".to_string())
        ));
    }
    for (key, value) in processed.metadata {
        metadata.insert(key, value);
    }

    let output_path = processed
        .output
        .ok_or_else(|| "processor succeeded but returned no output path".to_string())?;

    Ok(ImageStage {
        output_path,
        metadata,
    })
}

struct ModelStage {
    output: ModelProcessingOutput,
    warning: Option<String>,
    metadata: Metadata,
}

/// CPU-bound model stage: validate, then render previews.
fn run_model_stage(
    pipeline: &ValidationPipeline,
    renderer: &ModelRenderer,
    policy: &ValidationPolicy,
    path: &Path,
    trace_id: &str,
) -> Result<ModelStage, String> {
    let context = AssetContext::new(path, trace_id, "model");
    let results = pipeline.run(&context, policy);
    let mut metadata = merged_metadata(&results);
    first_failure(&results)?;

    let processed = renderer.process(&context);
    if !processed.success {
        return Err(format!(
            "processing failed in {}: {}",
            processed.processor_name,
            processed
                .error_message
                .unwrap_or_else(|| "no detail".to_string())
        ));
    }
    for (key, value) in processed.metadata.clone() {
        metadata.insert(key, value);
    }

    let output = processed
        .output
        .ok_or_else(|| "renderer succeeded but returned no output".to_string())?;

    Ok(ModelStage {
        output,
        warning: processed.warning,
        metadata,
    })
}

/// Converts the first failed result into a stage error message.
fn first_failure(results: &[ValidationResult]) -> Result<(), String> {
    match results.iter().find(|r| !r.is_valid) {
        Some(failure) => {
            let code = failure
                .error_code
                .map(|code| format!(" [{code}]"))
                .unwrap_or_default();
            Err(format!(
                "validation failed in {}: {}{code}",
                failure.validator_name,
                failure.error_message.as_deref().unwrap_or("no detail")
            ))
        }
        None => Ok(()),
    }
}

/// Folds every result's metadata into one map; later validators win ties.
fn merged_metadata(results: &[ValidationResult]) -> Metadata {
    let mut merged = Metadata::new();
    for result in results {
        for (key, value) in &result.metadata {
            merged.insert(key.clone(), value.clone());
        }
    }
    merged
}

/// Derives the view name from a render file like `part_iso.webp`.
fn view_name(path: &Path) -> &str {
    path.file_stem()
        .and_then(|s| s.to_str())
        .and_then(|stem| stem.rsplit('_').next())
        .unwrap_or("view")
}

/// Removes tracked files on drop; `remove_now` deletes eagerly and leaves
/// the entry as a no-op for the drop pass.
#[derive(Debug, Default)]
struct FileCleanup {
    paths: Vec<PathBuf>,
}

impl FileCleanup {
    fn track(&mut self, path: PathBuf) {
        self.paths.push(path);
    }

    fn remove_now(&self, path: &Path) {
        if let Err(e) = std::fs::remove_file(path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %path.display(), error = %e, "failed to remove local file");
            }
        }
    }
}

impl Drop for FileCleanup {
    fn drop(&mut self) {
        for path in &self.paths {
            if let Err(e) = std::fs::remove_file(path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %e, "failed to remove local file");
                }
            }
        }
    }
}

#[cfg(unix)]
async fn shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate = signal(SignalKind::terminate())?;
    let mut interrupt = signal(SignalKind::interrupt())?;
    tokio::select! {
        _ = terminate.recv() => {}
        _ = interrupt.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}
