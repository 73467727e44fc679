//! Gateway error taxonomy and the JSON responses the gateway produces itself

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use thiserror::Error;

/// Boxed error used by every body flowing through the gateway
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Body type of every response the gateway returns
pub type GatewayBody = BoxBody<Bytes, BoxError>;

/// Failures a proxy session can end with
#[derive(Debug, Error)]
pub enum GatewayError {
    /// No service name, unknown service, or no healthy instance
    #[error("service not found: {0}")]
    ServiceNotFound(String),

    /// Connecting to or sending the request to the backend failed
    #[error("{0}")]
    Transport(String),

    /// Backend did not answer within the setup timeout
    #[error("the timeout period of {timeout_ms}ms has been exceeded")]
    SetupTimeout { timeout_ms: u64 },

    /// Backend response body failed mid-stream
    #[error("backend stream error: {0}")]
    Stream(String),

    /// Caller went away before the response completed
    #[error("client disconnected")]
    ClientGone,
}

impl GatewayError {
    pub fn code(&self) -> GatewayErrorCode {
        match self {
            GatewayError::ServiceNotFound(_) => GatewayErrorCode::ServiceNotFound,
            GatewayError::Transport(_) => GatewayErrorCode::ConnectionFailed,
            GatewayError::SetupTimeout { .. } => GatewayErrorCode::RequestTimeout,
            GatewayError::Stream(_) | GatewayError::ClientGone => GatewayErrorCode::StreamError,
        }
    }

    pub fn status_code(&self) -> StatusCode {
        self.code().status_code()
    }

    pub fn into_response(self) -> Response<GatewayBody> {
        error_response(self.code(), self.to_string())
    }
}

/// Error codes for responses produced by the gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GatewayErrorCode {
    /// Service name missing or not resolvable
    ServiceNotFound,
    /// Request denied by the filter chain
    RequestRejected,
    /// Failed to connect to or send to the backend
    ConnectionFailed,
    /// Backend setup timed out
    RequestTimeout,
    /// Backend response stream failed
    StreamError,
}

impl GatewayErrorCode {
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayErrorCode::ServiceNotFound => StatusCode::NOT_FOUND,
            GatewayErrorCode::RequestRejected => StatusCode::FORBIDDEN,
            GatewayErrorCode::ConnectionFailed
            | GatewayErrorCode::RequestTimeout
            | GatewayErrorCode::StreamError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Value of the X-Gateway-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            GatewayErrorCode::ServiceNotFound => "SERVICE_NOT_FOUND",
            GatewayErrorCode::RequestRejected => "REQUEST_REJECTED",
            GatewayErrorCode::ConnectionFailed => "CONNECTION_FAILED",
            GatewayErrorCode::RequestTimeout => "REQUEST_TIMEOUT",
            GatewayErrorCode::StreamError => "STREAM_ERROR",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: GatewayErrorCode,
    pub message: String,
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: GatewayErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Wrap a complete byte payload as a gateway body
pub fn full_body(data: impl Into<Bytes>) -> GatewayBody {
    Full::new(data.into()).map_err(|never| match never {}).boxed()
}

/// Create a JSON error response with an X-Gateway-Error header
pub fn error_response(code: GatewayErrorCode, message: impl Into<String>) -> Response<GatewayBody> {
    let body = ErrorResponse::new(code, message).to_json();

    let mut response = Response::new(full_body(body));
    *response.status_mut() = code.status_code();
    let headers = response.headers_mut();
    headers.insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("application/json"),
    );
    headers.insert(
        "x-gateway-error",
        hyper::header::HeaderValue::from_static(code.as_header_value()),
    );
    response
}
