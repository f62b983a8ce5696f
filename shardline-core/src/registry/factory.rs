use super::{S3StorageClient, StorageClient};
use crate::{NodeConfig, Result, ShardlineError};
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Builds the client for one node. Must not perform network I/O.
pub trait ClientFactory: Send + Sync {
    fn build(&self, node: &NodeConfig) -> Result<Arc<dyn StorageClient>>;
}

#[derive(Debug, Clone)]
pub struct S3ClientFactory {
    connect_timeout: Duration,
    request_timeout: Duration,
    allow_http: bool,
}

impl S3ClientFactory {
    pub fn builder() -> S3ClientFactoryBuilder {
        S3ClientFactoryBuilder::new()
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }
}

impl ClientFactory for S3ClientFactory {
    fn build(&self, node: &NodeConfig) -> Result<Arc<dyn StorageClient>> {
        let endpoint = node.endpoint.trim();
        if endpoint.is_empty() {
            return Err(ShardlineError::ClientBuild {
                node: node.name.clone(),
                reason: "endpoint cannot be empty".to_string(),
            });
        }

        if !self.allow_http && endpoint.starts_with("http://") {
            return Err(ShardlineError::ClientBuild {
                node: node.name.clone(),
                reason: format!("plain http endpoint '{}' is not allowed", endpoint),
            });
        }

        let client = S3StorageClient::connect(
            node,
            self.connect_timeout,
            self.request_timeout,
            self.allow_http,
        )?;
        Ok(Arc::new(client))
    }
}

#[derive(Debug, Clone, Default)]
pub struct S3ClientFactoryBuilder {
    connect_timeout: Option<Duration>,
    request_timeout: Option<Duration>,
    allow_http: Option<bool>,
}

impl S3ClientFactoryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    pub fn allow_http(mut self, allow: bool) -> Self {
        self.allow_http = Some(allow);
        self
    }

    fn resolve_timeout(value: Option<Duration>, default: Duration, name: &str) -> Result<Duration> {
        let timeout = value.unwrap_or(default);
        if timeout.is_zero() {
            return Err(ShardlineError::Config(format!(
                "{} must be greater than zero",
                name
            )));
        }

        Ok(timeout)
    }

    pub fn build(&self) -> Result<S3ClientFactory> {
        let connect_timeout =
            Self::resolve_timeout(self.connect_timeout, DEFAULT_CONNECT_TIMEOUT, "connect_timeout")?;
        let request_timeout =
            Self::resolve_timeout(self.request_timeout, DEFAULT_REQUEST_TIMEOUT, "request_timeout")?;

        if request_timeout < connect_timeout {
            return Err(ShardlineError::Config(format!(
                "request_timeout ({:?}) cannot be shorter than connect_timeout ({:?})",
                request_timeout, connect_timeout
            )));
        }

        Ok(S3ClientFactory {
            connect_timeout,
            request_timeout,
            allow_http: self.allow_http.unwrap_or(true),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn test_builder_defaults() {
        let factory = assert_ok!(S3ClientFactory::builder().build());
        assert_eq!(factory.connect_timeout(), DEFAULT_CONNECT_TIMEOUT);
        assert_eq!(factory.request_timeout(), DEFAULT_REQUEST_TIMEOUT);
    }

    #[test]
    fn test_builder_rejects_bad_timeouts() {
        assert_err!(
            S3ClientFactory::builder()
                .connect_timeout(Duration::ZERO)
                .build()
        );
        assert_err!(
            S3ClientFactory::builder()
                .connect_timeout(Duration::from_secs(10))
                .request_timeout(Duration::from_secs(1))
                .build()
        );
    }

    #[test]
    fn test_build_rejects_empty_endpoint() {
        let factory = assert_ok!(S3ClientFactory::builder().build());
        let err = factory.build(&NodeConfig::new("n1", " ")).err().unwrap();
        assert!(matches!(err, ShardlineError::ClientBuild { .. }));
    }

    #[test]
    fn test_build_rejects_http_when_disallowed() {
        let factory = assert_ok!(S3ClientFactory::builder().allow_http(false).build());
        assert!(factory.build(&NodeConfig::new("n1", "http://n1:9000")).is_err());
    }

    #[test]
    fn test_build_does_not_connect() {
        let factory = assert_ok!(S3ClientFactory::builder().build());
        let node = NodeConfig::new("n1", "http://127.0.0.1:1").with_credentials("ak", "sk");
        let client = factory.build(&node).unwrap();
        assert_eq!(client.node_name(), "n1");
        assert!(!client.is_closed());
    }
}
