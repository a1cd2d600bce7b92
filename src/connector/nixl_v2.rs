//! NIXL v2 protocol runner.
//!
//! One prefill round-trip against the chosen peer, then one decode request
//! against the local decoder with the peer's `kv_transfer_params` threaded
//! through. Client-visible fields clobbered by the prefill rewrite are
//! restored before the decode request.

use axum::body::Body;
use axum::extract::Request;
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use serde_json::{Map, Value};
use tracing::{debug, error, warn};

use super::{
    outbound_kv_transfer_params, pin_prefill_limits, request_id, SavedFields,
    FIELD_KV_TRANSFER_PARAMS,
};
use crate::errors;
use crate::headers;
use crate::server::AppState;

pub(crate) async fn run(state: &AppState, req: Request, prefill_host_port: &str) -> Response {
    debug!(peer = prefill_host_port, "running NIXL protocol v2");

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
    completion_request.insert(
        FIELD_KV_TRANSFER_PARAMS.to_string(),
        outbound_kv_transfer_params(),
    );
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

    let kv_transfer_params = match prefiller_response.get(FIELD_KV_TRANSFER_PARAMS) {
        Some(params) => params.clone(),
        None => {
            warn!(request_id = %request_id, "missing 'kv_transfer_params' field in prefiller response");
            Value::Null
        }
    };
    debug!(request_id = %request_id, ?kv_transfer_params, "received prefiller response");

    // Decode stage.
    saved.restore(&mut completion_request);
    completion_request.insert(FIELD_KV_TRANSFER_PARAMS.to_string(), kv_transfer_params);

    let decode_body = match serde_json::to_vec(&completion_request) {
        Ok(body) => body,
        Err(err) => return errors::bad_request(err),
    };

    debug!(request_id = %request_id, "sending request to decoder");
    let decode_request = Request::from_parts(parts, Body::from(decode_body));
    state.decoder.serve(decode_request).await
}
