//! Environment-driven worker settings.
//!
//! There are no CLI flags: deployment selects behavior entirely through
//! environment variables, with local mode falling back to in-memory
//! dependencies for development and tests.

use std::time::Duration;

use thiserror::Error;

use crate::bus::DEFAULT_MAX_DELIVER;
use crate::worker::DEFAULT_CONCURRENCY;

/// Errors while reading the environment.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required variable is absent or empty.
    #[error("missing required environment variable: {name}")]
    Missing {
        /// The variable name.
        name: &'static str,
    },

    /// A variable is present but unparseable.
    #[error("invalid value for {name}: {value}")]
    Invalid {
        /// The variable name.
        name: &'static str,
        /// The offending value.
        value: String,
    },
}

/// Which dependency set the worker runs against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// In-memory bus and repository, local filesystem storage.
    Local,
    /// NATS, Postgres, and S3-compatible storage.
    Production,
}

/// S3-compatible storage settings.
#[derive(Debug, Clone)]
pub struct S3Settings {
    /// Endpoint URL (scheme optional; https assumed).
    pub endpoint_url: String,
    /// Access key id.
    pub access_key: String,
    /// Secret access key.
    pub secret_key: String,
}

/// Complete worker configuration.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Dependency mode.
    pub mode: Mode,
    /// NATS endpoint (production mode).
    pub nats_endpoint: Option<String>,
    /// Postgres DSN (production mode).
    pub db_dsn: Option<String>,
    /// S3 settings (production mode).
    pub s3: Option<S3Settings>,
    /// Root directory for local-mode storage.
    pub local_root: String,
    /// Maximum concurrent jobs.
    pub concurrency: usize,
    /// Durable consumer identity.
    pub worker_name: String,
    /// Delivery group shared across replicas.
    pub consumer_group: String,
    /// Stream carrying the ingress subject.
    pub stream_name: String,
    /// Subject delivering validation jobs.
    pub ingress_topic: String,
    /// Subject for listing activation events.
    pub index_topic: String,
    /// Delivery budget before dead-lettering.
    pub max_deliver: u32,
    /// Redelivery delay for transient failures.
    pub nak_delay: Duration,
}

impl Settings {
    /// Reads settings from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when a production-mode requirement is absent
    /// or a numeric variable fails to parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mode = match optional("VALIDATION_WORKER_MODE").as_deref() {
            Some("local") => Mode::Local,
            _ => Mode::Production,
        };

        let concurrency = parse_var("VALIDATION_WORKER_CONCURRENCY", DEFAULT_CONCURRENCY)?;
        let max_deliver = parse_var("VALIDATION_WORKER_MAX_DELIVERIES", DEFAULT_MAX_DELIVER)?;
        let nak_delay_seconds: f64 = parse_var("VALIDATION_WORKER_NACK_DELAY_SECONDS", 5.0)?;

        let (nats_endpoint, db_dsn, s3) = match mode {
            Mode::Local => (None, None, None),
            Mode::Production => (
                Some(required("NATS_ENDPOINT")?),
                Some(required("DB_DSN")?),
                Some(S3Settings {
                    endpoint_url: required("S3_ENDPOINT")?,
                    access_key: required("VALIDATION_WORKER_S3_ACCESS_KEY")?,
                    secret_key: required("VALIDATION_WORKER_S3_SECRET_ACCESS_KEY")?,
                }),
            ),
        };

        Ok(Self {
            mode,
            nats_endpoint,
            db_dsn,
            s3,
            local_root: optional("VALIDATION_WORKER_LOCAL_ROOT")
                .unwrap_or_else(|| "./storage".to_string()),
            concurrency,
            worker_name: optional("VALIDATION_WORKER_NAME")
                .unwrap_or_else(|| "validation-worker".to_string()),
            consumer_group: optional("VALIDATION_WORKER_CONSUMER_GROUP")
                .unwrap_or_else(|| "validation_workers".to_string()),
            stream_name: optional("VALIDATION_WORKER_STREAM")
                .unwrap_or_else(|| "VALIDATE".to_string()),
            ingress_topic: required("VALIDATION_WORKER_EVENT_SUBJECT")?,
            index_topic: required("EVENT_INDEX_LISTING")?,
            max_deliver,
            nak_delay: Duration::from_secs_f64(nak_delay_seconds.max(0.0)),
        })
    }
}

fn optional(name: &'static str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn required(name: &'static str) -> Result<String, ConfigError> {
    optional(name).ok_or(ConfigError::Missing { name })
}

fn parse_var<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match optional(name) {
        Some(value) => value
            .parse()
            .map_err(|_| ConfigError::Invalid { name, value }),
        None => Ok(default),
    }
}
