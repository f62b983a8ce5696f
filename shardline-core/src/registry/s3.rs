use super::StorageClient;
use crate::{NodeConfig, Result, ShardlineError};
use async_trait::async_trait;
use object_store::aws::AmazonS3Builder;
use object_store::{ClientOptions, ObjectStore, RetryConfig};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

const MAX_RETRIES: usize = 2;

/// S3-compatible node accessed with path-style requests.
pub struct S3StorageClient {
    node: String,
    bucket: String,
    store: Arc<dyn ObjectStore>,
    closed: AtomicBool,
}

impl S3StorageClient {
    pub fn connect(
        node: &NodeConfig,
        connect_timeout: Duration,
        request_timeout: Duration,
        allow_http: bool,
    ) -> Result<Self> {
        let options = ClientOptions::new()
            .with_connect_timeout(connect_timeout)
            .with_timeout(request_timeout);

        let retry = RetryConfig {
            max_retries: MAX_RETRIES,
            retry_timeout: request_timeout,
            ..RetryConfig::default()
        };

        let mut builder = AmazonS3Builder::new()
            .with_endpoint(node.endpoint.trim())
            .with_region(&node.region)
            .with_bucket_name(&node.bucket)
            .with_allow_http(allow_http)
            .with_virtual_hosted_style_request(false)
            .with_client_options(options)
            .with_retry(retry);

        if !node.access_key.is_empty() {
            builder = builder
                .with_access_key_id(&node.access_key)
                .with_secret_access_key(&node.secret_key);
        }

        let store = builder.build().map_err(|err| ShardlineError::ClientBuild {
            node: node.name.clone(),
            reason: err.to_string(),
        })?;

        Ok(Self {
            node: node.name.clone(),
            bucket: node.bucket.clone(),
            store: Arc::new(store),
            closed: AtomicBool::new(false),
        })
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }
}

#[async_trait]
impl StorageClient for S3StorageClient {
    fn node_name(&self) -> &str {
        &self.node
    }

    fn store(&self) -> Arc<dyn ObjectStore> {
        self.store.clone()
    }

    async fn probe(&self) -> Result<()> {
        self.store
            .list_with_delimiter(None)
            .await
            .map_err(|err| ShardlineError::Probe {
                node: self.node.clone(),
                reason: err.to_string(),
            })?;
        Ok(())
    }

    fn close(&self) -> Result<()> {
        // The HTTP connection pool is released when the last store handle drops.
        if self.closed.swap(true, Ordering::AcqRel) {
            tracing::debug!("Storage client for node {} was already closed", self.node);
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
