//! Inbound HTTP server: accept loop, filter chain, one proxy session per request

use crate::error::{error_response, GatewayBody, GatewayErrorCode};
use crate::filter::{FilterChain, FilterDecision};
use crate::session::{ProxySession, SessionContext};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";

/// The gateway's inbound HTTP server
pub struct GatewayServer {
    bind_addr: SocketAddr,
    context: Arc<SessionContext>,
    filters: FilterChain,
    shutdown_rx: watch::Receiver<bool>,
}

impl GatewayServer {
    pub fn new(
        bind_addr: SocketAddr,
        context: Arc<SessionContext>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            context,
            filters: FilterChain::allow_all(),
            shutdown_rx,
        }
    }

    pub fn with_filters(mut self, filters: FilterChain) -> Self {
        self.filters = filters;
        self
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let addr = listener.local_addr()?;
        info!(
            addr = %addr,
            prefix = %self.context.gateway_prefix,
            "Gateway listening (HTTP/1.1 and HTTP/2)"
        );

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            let context = Arc::clone(&self.context);
                            let filters = self.filters.clone();
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, peer, context, filters).await {
                                    debug!(addr = %peer, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Gateway shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection<S>(
    stream: S,
    peer: SocketAddr,
    context: Arc<SessionContext>,
    filters: FilterChain,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let context = Arc::clone(&context);
        let filters = filters.clone();
        async move { Ok::<_, Infallible>(handle_request(req, context, &filters, peer).await) }
    });

    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    req: Request<Incoming>,
    context: Arc<SessionContext>,
    filters: &FilterChain,
    peer: SocketAddr,
) -> Response<GatewayBody> {
    // Correlation only; the id is never added to forwarded headers
    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    debug!(method = %req.method(), uri = %req.uri(), peer = %peer, request_id, "Incoming request");

    let (parts, body) = req.into_parts();
    if let FilterDecision::Deny { reason } = filters.evaluate(&parts) {
        info!(request_id, reason, "Request rejected by filter chain");
        return error_response(GatewayErrorCode::RequestRejected, "request invalidate");
    }

    ProxySession::new(context, request_id)
        .handle(Request::from_parts(parts, body))
        .await
}
