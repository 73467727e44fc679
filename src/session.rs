//! One proxied request from resolution to the last response byte
//!
//! States: `Init -> Resolving -> Forwarding -> AwaitingResponse ->
//! StreamingResponse -> Done`, with `Failed` reachable from any non-terminal
//! state. `handle` drives the session up to the point where the backend's
//! response head is known and returns the caller's response; the rest of the
//! session (response streaming, finalization) runs on a spawned task that owns
//! the session from then on.
//!
//! The resolved timeout bounds backend setup only (connect, send, response
//! head). Once streaming starts there is no deadline, and nothing is retried.

use http_body_util::BodyExt;
use hyper::body::{Body, Bytes};
use hyper::ext::ReasonPhrase;
use hyper::header::{HeaderValue, HOST};
use hyper::http::request::Parts;
use hyper::{Request, Response, StatusCode, Uri};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, warn};

use crate::config::Config;
use crate::error::{BoxError, GatewayBody, GatewayError};
use crate::pool::Transport;
use crate::pump::{self, Framing, PumpBody, PumpError, PumpHandle, PumpSummary};
use crate::registry::{Instance, ServiceRegistry};
use crate::resolver::{BackendResolver, Resolution};
use crate::{rewrite, timeout};

/// Read-only capabilities shared by every session
pub struct SessionContext {
    pub gateway_prefix: String,
    /// Host header value sent to every backend
    pub backend_host: HeaderValue,
    /// Setup timeout used when the instance carries no valid `timeout` metadata
    pub default_timeout: Duration,
    /// Pump high-water mark, in frames
    pub pump_capacity: usize,
    pub resolver: BackendResolver,
    pub transport: Arc<dyn Transport>,
}

impl SessionContext {
    pub fn from_config(
        config: &Config,
        registry: Arc<dyn ServiceRegistry>,
        transport: Arc<dyn Transport>,
    ) -> anyhow::Result<Self> {
        let backend_host = HeaderValue::from_str(&config.server.backend_host_header)
            .map_err(|e| anyhow::anyhow!("Invalid backend_host_header: {}", e))?;

        Ok(Self {
            gateway_prefix: config.server.gateway_prefix.clone(),
            backend_host,
            default_timeout: config.client.connect_timeout(),
            pump_capacity: config.server.pump_buffer_chunks,
            resolver: BackendResolver::new(registry),
            transport,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Init,
    Resolving,
    Forwarding,
    AwaitingResponse,
    StreamingResponse,
    Done,
    Failed { status: StatusCode, message: String },
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Done | SessionState::Failed { .. })
    }

    pub fn name(&self) -> &'static str {
        match self {
            SessionState::Init => "init",
            SessionState::Resolving => "resolving",
            SessionState::Forwarding => "forwarding",
            SessionState::AwaitingResponse => "awaiting_response",
            SessionState::StreamingResponse => "streaming_response",
            SessionState::Done => "done",
            SessionState::Failed { .. } => "failed",
        }
    }
}

/// Aborts the client->backend pump if dropped while still holding it
struct PumpGuard(Option<PumpHandle>);

impl PumpGuard {
    fn abort(mut self) {
        if let Some(handle) = self.0.take() {
            handle.abort();
        }
    }

    async fn finished(mut self) -> Result<PumpSummary, PumpError> {
        match self.0.take() {
            Some(handle) => handle.finished().await,
            None => Err(PumpError::Cancelled),
        }
    }
}

impl Drop for PumpGuard {
    fn drop(&mut self) {
        if let Some(handle) = self.0.take() {
            handle.abort();
        }
    }
}

pub struct ProxySession {
    ctx: Arc<SessionContext>,
    request_id: String,
    service: String,
    instance: Option<Instance>,
    state: watch::Sender<SessionState>,
}

impl ProxySession {
    pub fn new(ctx: Arc<SessionContext>, request_id: impl Into<String>) -> Self {
        let (state, _) = watch::channel(SessionState::Init);
        Self {
            ctx,
            request_id: request_id.into(),
            service: String::new(),
            instance: None,
            state,
        }
    }

    /// Observe state transitions, including those after `handle` has returned
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    fn instance_id(&self) -> String {
        self.instance
            .as_ref()
            .map(Instance::authority)
            .unwrap_or_default()
    }

    fn transition(&self, next: SessionState) {
        let current = self.state.borrow().clone();
        if current.is_terminal() {
            return;
        }
        debug!(
            request_id = %self.request_id,
            service = %self.service,
            from = current.name(),
            to = next.name(),
            "Session transition"
        );
        self.state.send_replace(next);
    }

    fn fail(&self, err: GatewayError) -> Response<GatewayBody> {
        match &err {
            GatewayError::ServiceNotFound(_) => {
                warn!(request_id = %self.request_id, service = %self.service, error = %err, "Service not found")
            }
            _ => error!(
                request_id = %self.request_id,
                service = %self.service,
                instance = %self.instance_id(),
                error = %err,
                "Proxy session failed"
            ),
        }
        self.transition(SessionState::Failed {
            status: err.status_code(),
            message: err.to_string(),
        });
        err.into_response()
    }

    /// Run the session for an already filter-approved request
    pub async fn handle<B>(mut self, req: Request<B>) -> Response<GatewayBody>
    where
        B: Body<Data = Bytes> + Send + Unpin + 'static,
        B::Error: Into<BoxError> + Send,
    {
        let ctx = Arc::clone(&self.ctx);

        self.transition(SessionState::Resolving);
        let service = rewrite::service_name(&ctx.gateway_prefix, req.uri().path()).map(str::to_string);
        self.service = service.clone().unwrap_or_default();

        let instance = match (service.as_deref(), ctx.resolver.resolve(service.as_deref()).await) {
            (Some(_), Resolution::Found(instance)) => instance,
            _ => return self.fail(GatewayError::ServiceNotFound(self.service.clone())),
        };
        self.instance = Some(instance.clone());

        let full_path = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let path = rewrite::rewrite(&ctx.gateway_prefix, &self.service, full_path);
        let setup_timeout = timeout::resolve(Some(&instance), ctx.default_timeout);
        self.transition(SessionState::Forwarding);

        let (parts, body) = req.into_parts();
        let request_framing = Framing::from_headers(&parts.headers);
        let (request_pump, request_sink) = pump::couple(body, request_framing, ctx.pump_capacity);

        let outbound = match build_outbound(&parts, &instance, &path, &ctx.backend_host, request_sink) {
            Ok(outbound) => outbound,
            Err(e) => return self.fail(e),
        };

        debug!(
            request_id = %self.request_id,
            service = %self.service,
            instance = %instance.authority(),
            method = %parts.method,
            path = %path,
            timeout_ms = setup_timeout.as_millis() as u64,
            chunked = request_framing.is_chunked(),
            "Forwarding request"
        );

        let request_pump = PumpGuard(Some(request_pump.with_label("client->backend").start()));

        let response = match tokio::time::timeout(setup_timeout, ctx.transport.send(outbound)).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                request_pump.abort();
                return self.fail(GatewayError::Transport(e.to_string()));
            }
            Err(_) => {
                request_pump.abort();
                return self.fail(GatewayError::SetupTimeout {
                    timeout_ms: setup_timeout.as_millis() as u64,
                });
            }
        };
        self.transition(SessionState::AwaitingResponse);

        let (backend_parts, backend_body) = response.into_parts();
        let response_framing = Framing::from_headers(&backend_parts.headers);
        let (response_pump, response_sink) =
            pump::couple(backend_body, response_framing, ctx.pump_capacity);

        let mut response = Response::new(response_sink.boxed());
        *response.status_mut() = backend_parts.status;
        *response.headers_mut() = backend_parts.headers;
        if let Some(reason) = backend_parts.extensions.get::<ReasonPhrase>() {
            response.extensions_mut().insert(reason.clone());
        }

        debug!(
            request_id = %self.request_id,
            service = %self.service,
            status = backend_parts.status.as_u16(),
            chunked = response_framing.is_chunked(),
            "Backend response head received"
        );

        self.transition(SessionState::StreamingResponse);
        let response_pump = response_pump
            .with_label("backend->client")
            .relay_error_notice()
            .start();
        tokio::spawn(self.finish(response_pump, request_pump));

        response
    }

    async fn finish(self, response_pump: PumpHandle, request_pump: PumpGuard) {
        match response_pump.finished().await {
            Ok(summary) => {
                debug!(
                    request_id = %self.request_id,
                    service = %self.service,
                    bytes = summary.bytes,
                    pauses = summary.pauses,
                    "Response streamed"
                );
                self.transition(SessionState::Done);
                // The request body may still be flowing (full duplex); let it end on its own
                if let Err(e) = request_pump.finished().await {
                    debug!(request_id = %self.request_id, error = %e, "Request body pump ended early");
                }
            }
            Err(PumpError::Source(message)) => {
                request_pump.abort();
                let err = GatewayError::Stream(message);
                error!(
                    request_id = %self.request_id,
                    service = %self.service,
                    instance = %self.instance_id(),
                    error = %err,
                    "Backend response stream failed"
                );
                self.transition(SessionState::Failed {
                    status: err.status_code(),
                    message: err.to_string(),
                });
            }
            Err(PumpError::SinkClosed) | Err(PumpError::Cancelled) => {
                request_pump.abort();
                let err = GatewayError::ClientGone;
                warn!(
                    request_id = %self.request_id,
                    service = %self.service,
                    instance = %self.instance_id(),
                    "Client disconnected before response completed"
                );
                self.transition(SessionState::Failed {
                    status: err.status_code(),
                    message: err.to_string(),
                });
            }
        }
    }
}

/// Outbound request: same method, rewritten path, inbound headers with `Host` replaced
fn build_outbound(
    parts: &Parts,
    instance: &Instance,
    path: &str,
    backend_host: &HeaderValue,
    body: PumpBody,
) -> Result<Request<PumpBody>, GatewayError> {
    let uri: Uri = format!("http://{}{}", instance.authority(), path)
        .parse()
        .map_err(|e| GatewayError::Transport(format!("invalid backend URI: {}", e)))?;

    let mut request = Request::new(body);
    *request.method_mut() = parts.method.clone();
    *request.uri_mut() = uri;

    let headers = request.headers_mut();
    *headers = parts.headers.clone();
    headers.remove(HOST);
    headers.insert(HOST, backend_host.clone());

    Ok(request)
}
