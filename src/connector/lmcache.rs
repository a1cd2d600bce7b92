//! Deprecated LMCache protocol runner.
//!
//! Same two-phase shape as NIXL v2, but the KV routing fields ride at the
//! top level of the body: the prefill request announces `do_remote_decode`,
//! and the decode request flips to `do_remote_prefill` with the peer's
//! `remote_host`/`remote_port` echoed back when present.

use axum::body::Body;
use axum::extract::Request;
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use serde_json::{json, Map, Value};
use tracing::{debug, error};

use super::{
    pin_prefill_limits, request_id, SavedFields, FIELD_DO_REMOTE_DECODE, FIELD_DO_REMOTE_PREFILL,
    FIELD_REMOTE_HOST, FIELD_REMOTE_PORT,
};
use crate::errors;
use crate::headers;
use crate::server::AppState;

pub(crate) async fn run(state: &AppState, req: Request, prefill_host_port: &str) -> Response {
    debug!(peer = prefill_host_port, "running LMCache protocol");

    let (mut parts, body) = req.into_parts();
    let raw = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(raw) => raw,
        Err(err) => {
            return (StatusCode::BAD_REQUEST, err.to_string()).into_response();
        }
    };

    let mut completion_request: Map<String, Value> = match serde_json::from_slice(&raw) {
        Ok(map) => map,
        Err(err) => return errors::bad_request(err),
    };

    let request_id = request_id();
    let Ok(request_id_value) = HeaderValue::from_str(&request_id) else {
        return errors::bad_gateway("failed to encode request id");
    };
    parts
        .headers
        .append(headers::REQUEST_ID, request_id_value);

    // Prefill stage.
    let saved = SavedFields::capture(&completion_request);
    completion_request.insert(FIELD_DO_REMOTE_DECODE.to_string(), json!(true));
    completion_request.insert(FIELD_DO_REMOTE_PREFILL.to_string(), json!(false));
    pin_prefill_limits(&mut completion_request);

    let prefill_body = match serde_json::to_vec(&completion_request) {
        Ok(body) => body,
        Err(err) => return errors::bad_request(err),
    };

    let prefill_handler = match state.peers.get(prefill_host_port) {
        Ok(handler) => handler,
        Err(err) => {
            error!(request_id = %request_id, peer = prefill_host_port, error = %err, "no handler for prefill target");
            return errors::bad_gateway(err);
        }
    };

    debug!(request_id = %request_id, peer = prefill_host_port, "sending request to prefiller");
    let captured = match prefill_handler
        .capture(&parts, Bytes::from(prefill_body))
        .await
    {
        Ok(captured) => captured,
        Err(err) => {
            error!(request_id = %request_id, peer = prefill_host_port, error = %err, "prefill request failed");
            return StatusCode::BAD_GATEWAY.into_response();
        }
    };

    if !captured.status().is_success() {
        error!(request_id = %request_id, code = %captured.status(), "prefill request failed");
        return captured.status().into_response();
    }

    let prefiller_response: Map<String, Value> = match serde_json::from_slice(captured.body()) {
        Ok(map) => map,
        Err(err) => return errors::bad_request(err),
    };

    // Decode stage.
    saved.restore(&mut completion_request);
    completion_request.remove(FIELD_DO_REMOTE_DECODE);
    completion_request.insert(FIELD_DO_REMOTE_PREFILL.to_string(), json!(true));
    for field in [FIELD_REMOTE_HOST, FIELD_REMOTE_PORT] {
        if let Some(value) = prefiller_response.get(field) {
            completion_request.insert(field.to_string(), value.clone());
        }
    }

    let decode_body = match serde_json::to_vec(&completion_request) {
        Ok(body) => body,
        Err(err) => return errors::bad_request(err),
    };

    debug!(request_id = %request_id, "sending request to decoder");
    let decode_request = Request::from_parts(parts, Body::from(decode_body));
    state.decoder.serve(decode_request).await
}
