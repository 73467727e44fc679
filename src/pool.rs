//! Connection pool for backend HTTP connections
//!
//! One pooled hyper client is shared by every session. Sessions only hand it a
//! request whose body is a pump sink and get back the backend response with a
//! boxed body; pooling and keep-alive stay inside the client.

use async_trait::async_trait;
use http_body_util::BodyExt;
use hyper::{Request, Response};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::error::Error as StdError;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::config::ClientConfig;
use crate::error::{BoxError, GatewayBody};
use crate::pump::PumpBody;

/// Error type for connection pool operations
#[derive(Debug, Error)]
pub enum PoolError {
    /// Error from the HTTP client (connect, write, or response head)
    #[error("{0}")]
    Client(String),

    /// Error building a request
    #[error("request build error: {0}")]
    RequestBuild(String),
}

impl From<hyper_util::client::legacy::Error> for PoolError {
    fn from(err: hyper_util::client::legacy::Error) -> Self {
        PoolError::Client(error_chain(&err))
    }
}

/// Render an error and its sources as `outer: inner: root`
fn error_chain(err: &dyn StdError) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

/// Sends one outbound request and yields the backend response head
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, req: Request<PumpBody>) -> Result<Response<GatewayBody>, PoolError>;
}

/// Statistics for the connection pool
#[derive(Debug, Default)]
pub struct PoolStats {
    /// Total number of requests sent through the pool
    pub total_requests: AtomicU64,
    /// Requests that failed before a response head arrived
    pub failed_requests: AtomicU64,
}

impl PoolStats {
    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failed_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn get_failed_requests(&self) -> u64 {
        self.failed_requests.load(Ordering::Relaxed)
    }
}

/// Configuration for the connection pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum idle connections per host
    pub max_idle_per_host: usize,
    /// Idle connection timeout
    pub idle_timeout: Duration,
    /// TCP connect timeout
    pub connect_timeout: Duration,
    /// TCP keepalive interval
    pub tcp_keepalive: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(90),
            connect_timeout: Duration::from_secs(3),
            tcp_keepalive: Some(Duration::from_secs(60)),
        }
    }
}

impl From<&ClientConfig> for PoolConfig {
    fn from(config: &ClientConfig) -> Self {
        Self {
            // Without keep-alive nothing is kept idle, so every request dials anew
            max_idle_per_host: if config.keep_alive {
                config.pool_max_idle_per_host
            } else {
                0
            },
            idle_timeout: config.pool_idle_timeout(),
            connect_timeout: config.connect_timeout(),
            tcp_keepalive: config.tcp_keepalive(),
        }
    }
}

/// A connection pool for HTTP connections to backend servers
pub struct ConnectionPool {
    client: Client<HttpConnector, PumpBody>,
    stats: Arc<PoolStats>,
    config: PoolConfig,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);
        connector.set_connect_timeout(Some(config.connect_timeout));
        connector.set_keepalive(config.tcp_keepalive);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector);

        debug!(
            max_idle = config.max_idle_per_host,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            connect_timeout_ms = config.connect_timeout.as_millis() as u64,
            "Connection pool initialized"
        );

        Self {
            client,
            stats: Arc::new(PoolStats::default()),
            config,
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn stats(&self) -> Arc<PoolStats> {
        Arc::clone(&self.stats)
    }
}

#[async_trait]
impl Transport for ConnectionPool {
    async fn send(&self, req: Request<PumpBody>) -> Result<Response<GatewayBody>, PoolError> {
        if req.uri().authority().is_none() {
            return Err(PoolError::RequestBuild(format!(
                "outbound URI has no authority: {}",
                req.uri()
            )));
        }

        self.stats.record_request();

        let response = match self.client.request(req).await {
            Ok(response) => response,
            Err(e) => {
                self.stats.record_failure();
                return Err(e.into());
            }
        };

        let (parts, body) = response.into_parts();
        let boxed_body = body.map_err(|e| -> BoxError { Box::new(e) }).boxed();

        Ok(Response::from_parts(parts, boxed_body))
    }
}
