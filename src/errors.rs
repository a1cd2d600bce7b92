use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

/// Error shape emitted by vLLM's OpenAI-compatible frontend. The sidecar
/// mimics it so clients see a single error format regardless of which hop
/// failed.
#[derive(Debug, Serialize)]
struct ErrorEnvelope {
    object: &'static str,
    message: String,
    #[serde(rename = "type")]
    kind: &'static str,
    param: &'static str,
    code: u16,
}

fn envelope(status: StatusCode, kind: &'static str, message: String) -> Response {
    let body = ErrorEnvelope {
        object: "error",
        message,
        kind,
        param: "",
        code: status.as_u16(),
    };
    (status, Json(body)).into_response()
}

/// 400 `BadRequestError` envelope, used for malformed client bodies.
pub fn bad_request(err: impl std::fmt::Display) -> Response {
    envelope(StatusCode::BAD_REQUEST, "BadRequestError", err.to_string())
}

/// 502 `BadGateway` envelope, used for internal handler-lookup failures.
pub fn bad_gateway(err: impl std::fmt::Display) -> Response {
    envelope(StatusCode::BAD_GATEWAY, "BadGateway", err.to_string())
}

/// Failures raised while building or talking to upstream workers.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("invalid upstream target '{target}': {reason}")]
    InvalidTarget { target: String, reason: String },

    #[error("failed to build upstream client: {0}")]
    ClientBuild(#[source] reqwest::Error),

    #[error("upstream request failed: {0}")]
    Upstream(#[from] reqwest::Error),

    #[error("TLS configuration: {0}")]
    Tls(String),

    #[error("allowlist validator: {0}")]
    Allowlist(String),

    #[error("server error: {0}")]
    Server(#[from] std::io::Error),
}
