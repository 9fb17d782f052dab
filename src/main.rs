//! Service entry point for the validation worker.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, warn};
use validation_worker::bus::NatsEventBus;
use validation_worker::config::{Mode, Settings};
use validation_worker::provider::{LocalFileProvider, S3FileProvider};
use validation_worker::repository::{InMemoryListingRepository, PostgresListingRepository};
use validation_worker::worker::{ValidationWorker, WorkerOptions};
use validation_worker::{EventBus, FileProvider, InMemoryEventBus, ListingRepository};
use validation_worker::pipeline::ValidationPolicy;

/// Startup dependency attempts before giving up with a non-zero exit.
const STARTUP_RETRY_ATTEMPTS: u32 = 30;

/// Delay between startup connection attempts.
const STARTUP_RETRY_DELAY: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let settings = Settings::from_env().context("failed to read environment settings")?;
    info!(mode = ?settings.mode, "validation worker starting");

    let (provider, repository, bus): (
        Arc<dyn FileProvider>,
        Arc<dyn ListingRepository>,
        Arc<dyn EventBus>,
    ) = match settings.mode {
        Mode::Local => {
            info!(root = %settings.local_root, "running in local mode with in-memory dependencies");
            let provider = LocalFileProvider::new(&settings.local_root)
                .context("failed to prepare local storage root")?;
            (
                Arc::new(provider),
                Arc::new(InMemoryListingRepository::new()),
                Arc::new(InMemoryEventBus::new(settings.max_deliver)),
            )
        }
        Mode::Production => {
            let s3 = settings
                .s3
                .as_ref()
                .context("S3 configuration is required in production mode")?;
            let provider =
                S3FileProvider::new(&s3.endpoint_url, &s3.access_key, &s3.secret_key).await;

            let nats_endpoint = settings
                .nats_endpoint
                .clone()
                .context("NATS endpoint is required in production mode")?;
            let client = wait_for_connection("NATS", || {
                let endpoint = nats_endpoint.clone();
                let name = settings.worker_name.clone();
                async move {
                    async_nats::ConnectOptions::new()
                        .name(name)
                        .connect(endpoint)
                        .await
                        .map_err(anyhow::Error::from)
                }
            })
            .await?;

            let bus = NatsEventBus::new(
                client,
                settings.stream_name.clone(),
                settings.worker_name.clone(),
                settings.consumer_group.clone(),
                settings.max_deliver,
            );

            let dsn = settings
                .db_dsn
                .clone()
                .context("database DSN is required in production mode")?;
            let repository = wait_for_connection("Postgres", || {
                let dsn = dsn.clone();
                async move {
                    PostgresListingRepository::connect(&dsn)
                        .await
                        .map_err(anyhow::Error::from)
                }
            })
            .await?;

            (Arc::new(provider), Arc::new(repository), Arc::new(bus))
        }
    };

    let options = WorkerOptions {
        concurrency: settings.concurrency,
        ingress_topic: settings.ingress_topic.clone(),
        index_topic: settings.index_topic.clone(),
        nak_delay: settings.nak_delay,
    };

    let worker = Arc::new(ValidationWorker::new(
        provider,
        repository,
        bus,
        ValidationPolicy::default(),
        options,
    ));

    info!("validation worker fully initialized");
    worker.start().await.context("worker terminated abnormally")?;
    Ok(())
}

/// Bounded connect-with-retry: transient refusals get retried, anything
/// still failing after the budget aborts startup.
async fn wait_for_connection<T, F, Fut>(name: &str, mut connect: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    info!(dependency = name, "connecting");
    let mut attempts = 0u32;
    loop {
        match connect().await {
            Ok(value) => {
                info!(dependency = name, "connected");
                return Ok(value);
            }
            Err(e) => {
                attempts += 1;
                if attempts >= STARTUP_RETRY_ATTEMPTS {
                    return Err(e.context(format!(
                        "{name} unreachable after {STARTUP_RETRY_ATTEMPTS} attempts"
                    )));
                }
                warn!(
                    dependency = name,
                    attempt = attempts,
                    error = %e,
                    "connection failed, retrying"
                );
                tokio::time::sleep(STARTUP_RETRY_DELAY).await;
            }
        }
    }
}
