//! Node sources — where the inventory gets its node list.
//!
//! The inventory only needs `list_nodes()`. Two real sources exist: an HTTP
//! endpoint serving a JSON array of nodes, and a JSON file on disk. A fixed
//! in-memory list is provided for wiring and tests.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use thiserror::Error;
use tracing::debug;

use virtflow_core::config::InventoryConfig;
use virtflow_core::{ConfigError, Node};

use crate::error::{SchedulerError, SchedulerResult};

/// Why a node list could not be fetched. Always transient from the
/// inventory's point of view.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("invalid source url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("connection to {0} failed")]
    Connect(String),

    #[error("request failed: {0}")]
    Request(String),

    #[error("source returned HTTP {0}")]
    Status(u16),

    #[error("source timed out after {0:?}")]
    Timeout(Duration),

    #[error("failed to read node list: {0}")]
    Io(String),

    #[error("failed to decode node list: {0}")]
    Decode(String),
}

/// The node-source collaborator.
#[async_trait]
pub trait NodeSource: Send + Sync {
    /// Fetch the full current node list.
    async fn list_nodes(&self) -> Result<Vec<Node>, SourceError>;

    /// Human-readable origin, for logs.
    fn describe(&self) -> String;
}

// ── HTTP ──────────────────────────────────────────────────────────

/// Fetches `GET <url>` and decodes a JSON array of nodes.
#[derive(Debug, Clone)]
pub struct HttpNodeSource {
    uri: http::Uri,
    /// `host:port` to connect to.
    address: String,
    timeout: Duration,
}

impl HttpNodeSource {
    pub fn new(url: &str, timeout: Duration) -> Result<Self, SourceError> {
        let invalid = |reason: &str| SourceError::InvalidUrl {
            url: url.to_string(),
            reason: reason.to_string(),
        };

        let uri: http::Uri = url.parse().map_err(|e: http::uri::InvalidUri| invalid(&e.to_string()))?;
        if uri.scheme_str() != Some("http") {
            return Err(invalid("only http:// sources are supported"));
        }
        let authority = uri.authority().ok_or_else(|| invalid("missing host"))?;
        let address = format!("{}:{}", authority.host(), authority.port_u16().unwrap_or(80));

        Ok(Self {
            uri,
            address,
            timeout,
        })
    }

    async fn fetch(&self) -> Result<Bytes, SourceError> {
        let stream = tokio::net::TcpStream::connect(&self.address)
            .await
            .map_err(|e| {
                debug!(error = %e, address = %self.address, "node source connection failed");
                SourceError::Connect(self.address.clone())
            })?;

        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| SourceError::Request(e.to_string()))?;

        // Drive the connection in the background.
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let path = self
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let req = http::Request::builder()
            .method("GET")
            .uri(path)
            .header("host", self.address.as_str())
            .header("accept", "application/json")
            .header("user-agent", "virtflow-scheduler/0.1")
            .body(Empty::<Bytes>::new())
            .map_err(|e| SourceError::Request(e.to_string()))?;

        let resp = sender
            .send_request(req)
            .await
            .map_err(|e| SourceError::Request(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(SourceError::Status(resp.status().as_u16()));
        }

        let body = resp
            .into_body()
            .collect()
            .await
            .map_err(|e| SourceError::Request(e.to_string()))?;
        Ok(body.to_bytes())
    }
}

#[async_trait]
impl NodeSource for HttpNodeSource {
    async fn list_nodes(&self) -> Result<Vec<Node>, SourceError> {
        let body = tokio::time::timeout(self.timeout, self.fetch())
            .await
            .map_err(|_| SourceError::Timeout(self.timeout))??;
        decode_nodes(&body)
    }

    fn describe(&self) -> String {
        self.uri.to_string()
    }
}

// ── File ──────────────────────────────────────────────────────────

/// Reads a JSON array of nodes from a file on every refresh.
#[derive(Debug, Clone)]
pub struct FileNodeSource {
    path: PathBuf,
}

impl FileNodeSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl NodeSource for FileNodeSource {
    async fn list_nodes(&self) -> Result<Vec<Node>, SourceError> {
        let raw = tokio::fs::read(&self.path)
            .await
            .map_err(|e| SourceError::Io(format!("{}: {e}", self.path.display())))?;
        decode_nodes(&raw)
    }

    fn describe(&self) -> String {
        format!("file://{}", self.path.display())
    }
}

// ── Static ────────────────────────────────────────────────────────

/// A fixed node list.
#[derive(Debug, Clone, Default)]
pub struct StaticNodeSource {
    nodes: Vec<Node>,
}

impl StaticNodeSource {
    pub fn new(nodes: Vec<Node>) -> Self {
        Self { nodes }
    }
}

#[async_trait]
impl NodeSource for StaticNodeSource {
    async fn list_nodes(&self) -> Result<Vec<Node>, SourceError> {
        Ok(self.nodes.clone())
    }

    fn describe(&self) -> String {
        format!("static ({} nodes)", self.nodes.len())
    }
}

/// Build the configured node source. The HTTP source wins when both are set.
pub fn source_from_config(config: &InventoryConfig) -> SchedulerResult<Arc<dyn NodeSource>> {
    if let Some(url) = &config.source_url {
        let source = HttpNodeSource::new(url, config.fetch_timeout()).map_err(|e| {
            ConfigError::InvalidValue {
                key: "inventory.source_url".to_string(),
                message: e.to_string(),
            }
        })?;
        return Ok(Arc::new(source));
    }
    if let Some(path) = &config.source_file {
        return Ok(Arc::new(FileNodeSource::new(path.clone())));
    }
    Err(SchedulerError::Configuration(ConfigError::MissingRequired {
        key: "inventory.source_url".to_string(),
        hint: "Set inventory.source_url or inventory.source_file.".to_string(),
    }))
}

fn decode_nodes(raw: &[u8]) -> Result<Vec<Node>, SourceError> {
    serde_json::from_slice(raw).map_err(|e| SourceError::Decode(e.to_string()))
}
