use http::header::HeaderName;
use http::HeaderMap;

/// Advisory header carrying the current prefill target as `host:port`.
pub const PREFILLER_HOST_PORT: HeaderName = HeaderName::from_static("x-prefiller-host-port");

/// Legacy prefill target header; may carry a full URL or a bare `host:port`.
/// Honored only when the current header is absent.
pub const PREFILLER_URL: HeaderName = HeaderName::from_static("x-prefiller-url");

/// Sibling decoder key into the data-parallel table.
pub const DATA_PARALLEL_HOST_PORT: HeaderName =
    HeaderName::from_static("x-data-parallel-host-port");

/// Correlation id attached to both the prefill and the decode sub-request.
pub const REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");

/// Whether a request header should be forwarded to an upstream worker.
///
/// Hop-by-hop headers stay on this hop. `host` belongs to the upstream and
/// `content-length` is recomputed from the (possibly rewritten) body.
fn forward_request_header(name: &str) -> bool {
    !matches!(
        name,
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
            | "host"
            | "content-length"
    )
}

/// Whether an upstream response header should be forwarded to the client.
///
/// Framing headers are re-derived by the local HTTP stack since the body is
/// re-streamed.
fn forward_response_header(name: &str) -> bool {
    !matches!(
        name,
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
            | "content-length"
    )
}

/// Copy the forwardable subset of `headers` for an upstream request.
pub fn request_headers(headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if forward_request_header(name.as_str()) {
            out.append(name.clone(), value.clone());
        }
    }
    out
}

/// Copy the forwardable subset of an upstream response's headers.
pub fn response_headers(headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if forward_response_header(name.as_str()) {
            out.append(name.clone(), value.clone());
        }
    }
    out
}
