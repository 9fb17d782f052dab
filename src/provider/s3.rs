//! S3-compatible provider (AWS, MinIO, LocalStack).

use std::path::Path;

use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::config::{Credentials, Region};
use aws_sdk_s3::primitives::ByteStream;
use tracing::{debug, instrument};

use super::{
    FileProvider, INCOMING_FILES_BUCKET, PRODUCT_FILES_BUCKET, PUBLIC_FILES_BUCKET, ProviderError,
    ScopedFile, temp_file_for_key,
};

/// Region placeholder for endpoints that ignore it (MinIO requires one to
/// be set even though it is not used for routing).
const DEFAULT_REGION: &str = "us-east-1";

/// Provider backed by an S3-compatible object store.
#[derive(Debug, Clone)]
pub struct S3FileProvider {
    client: Client,
}

impl S3FileProvider {
    /// Creates a provider against a custom endpoint with static credentials.
    ///
    /// Starts from the ambient AWS configuration (region, proxy, retry
    /// settings from the environment), then overrides endpoint and
    /// credentials. Path-style addressing is forced so bucket names never
    /// have to resolve through DNS, which is what MinIO-style deployments
    /// expect.
    pub async fn new(endpoint_url: &str, access_key: &str, secret_key: &str) -> Self {
        let base = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .load()
            .await;
        let endpoint = normalize_endpoint(endpoint_url);
        let credentials = Credentials::new(access_key, secret_key, None, None, "worker-env");
        let config = aws_sdk_s3::config::Builder::from(&base)
            .endpoint_url(endpoint)
            .region(Region::new(DEFAULT_REGION.to_string()))
            .credentials_provider(credentials)
            .force_path_style(true)
            .build();

        Self {
            client: Client::from_conf(config),
        }
    }

    /// Wraps an already-configured client (used when the ambient AWS config
    /// should drive endpoint and credentials).
    #[must_use]
    pub fn from_client(client: Client) -> Self {
        Self { client }
    }

    #[instrument(skip(self, source), fields(source = %source.display()))]
    async fn upload(&self, bucket: &str, source: &Path, dest_key: &str) -> Result<(), ProviderError> {
        let body = ByteStream::from_path(source)
            .await
            .map_err(|e| ProviderError::io(source, std::io::Error::other(e)))?;

        self.client
            .put_object()
            .bucket(bucket)
            .key(dest_key)
            .body(body)
            .send()
            .await
            .map_err(|e| ProviderError::backend(dest_key, e.to_string()))?;

        debug!(bucket, key = dest_key, "uploaded object");
        Ok(())
    }
}

/// Prefixes a scheme when the configured endpoint omits one.
fn normalize_endpoint(endpoint: &str) -> String {
    if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        endpoint.to_string()
    } else {
        format!("https://{endpoint}")
    }
}

#[async_trait]
impl FileProvider for S3FileProvider {
    async fn get_file(&self, key: &str) -> Result<ScopedFile, ProviderError> {
        let mut object = self
            .client
            .get_object()
            .bucket(INCOMING_FILES_BUCKET)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                let service_err = e.into_service_error();
                if service_err.is_no_such_key() {
                    ProviderError::not_found(key)
                } else {
                    ProviderError::backend(key, service_err.to_string())
                }
            })?;

        let tmp = temp_file_for_key(key).map_err(|e| ProviderError::io(key, e))?;
        let mut file = tokio::fs::File::create(tmp.path())
            .await
            .map_err(|e| ProviderError::io(tmp.path(), e))?;

        while let Some(chunk) = object
            .body
            .try_next()
            .await
            .map_err(|e| ProviderError::backend(key, e.to_string()))?
        {
            tokio::io::AsyncWriteExt::write_all(&mut file, &chunk)
                .await
                .map_err(|e| ProviderError::io(tmp.path(), e))?;
        }
        tokio::io::AsyncWriteExt::flush(&mut file)
            .await
            .map_err(|e| ProviderError::io(tmp.path(), e))?;
        drop(file);

        debug!(key, path = %tmp.path().display(), "downloaded incoming object");
        Ok(ScopedFile::new(tmp.into_temp_path()))
    }

    async fn store_image(&self, source: &Path, dest_key: &str) -> Result<(), ProviderError> {
        self.upload(PUBLIC_FILES_BUCKET, source, dest_key).await
    }

    async fn store_product_file(
        &self,
        source: &Path,
        dest_key: &str,
    ) -> Result<(), ProviderError> {
        self.upload(PRODUCT_FILES_BUCKET, source, dest_key).await
    }
}
