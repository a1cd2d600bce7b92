use std::time::Duration;

use axum::body::Body;
use axum::extract::Request;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use http::header::{CONTENT_LENGTH, TRANSFER_ENCODING};
use http::request::Parts;
use reqwest::{Client, Url};
use tracing::{error, info};

use crate::capture::CapturedResponse;
use crate::errors::ProxyError;
use crate::headers;

/// A reverse-proxy handler bound to one upstream origin.
///
/// Each handler owns its `reqwest::Client` and therefore its own connection
/// pool and TLS configuration, so a cached handler keeps warm connections to
/// its worker. Handlers carry no per-request state and are shared freely
/// across request tasks.
#[derive(Debug)]
pub struct UpstreamProxy {
    origin: Url,
    client: Client,
}

impl UpstreamProxy {
    /// Build a handler for `origin` (scheme + host + port).
    ///
    /// No request timeout is set: inference responses can stream for minutes.
    /// For `https` origins the client speaks TLS 1.2+ through rustls, which
    /// limits TLS 1.2 to the forward-secret ECDHE AES-GCM / ChaCha20 suites.
    pub fn new(origin: Url, insecure_skip_verify: bool) -> Result<Self, ProxyError> {
        let mut builder = Client::builder()
            .use_rustls_tls()
            .min_tls_version(reqwest::tls::Version::TLS_1_2)
            .connect_timeout(Duration::from_secs(10))
            .tcp_nodelay(true)
            .tcp_keepalive(Some(Duration::from_secs(30)));

        if origin.scheme() == "https" && insecure_skip_verify {
            builder = builder.danger_accept_invalid_certs(true);
        }

        let client = builder.build().map_err(ProxyError::ClientBuild)?;
        Ok(Self { origin, client })
    }

    pub fn origin(&self) -> &Url {
        &self.origin
    }

    fn target_url(&self, path: &str, query: Option<&str>) -> Url {
        let mut url = self.origin.clone();
        url.set_path(path);
        url.set_query(query);
        url
    }

    /// Streaming pass-through: forward `req` to the upstream and stream the
    /// reply back unchanged.
    ///
    /// Transport failures yield `502 Bad Gateway`. A refused connection is
    /// logged at info (the decoder is simply not up yet); anything else is a
    /// real proxy error.
    pub async fn serve(&self, req: Request) -> Response {
        let (parts, body) = req.into_parts();
        let url = self.target_url(parts.uri.path(), parts.uri.query());

        let has_body = parts.headers.contains_key(CONTENT_LENGTH)
            || parts.headers.contains_key(TRANSFER_ENCODING);

        let mut builder = self
            .client
            .request(parts.method.clone(), url)
            .headers(headers::request_headers(&parts.headers));
        if has_body {
            builder = builder.body(reqwest::Body::wrap_stream(body.into_data_stream()));
        }

        match builder.send().await {
            Ok(upstream) => {
                let mut response = Response::builder().status(upstream.status());
                if let Some(out) = response.headers_mut() {
                    *out = headers::response_headers(upstream.headers());
                }
                response
                    .body(Body::from_stream(upstream.bytes_stream()))
                    .unwrap_or_else(|err| {
                        error!(error = %err, "failed to assemble upstream response");
                        StatusCode::BAD_GATEWAY.into_response()
                    })
            }
            Err(err) if err.is_connect() => {
                info!(origin = %self.origin, error = %err, "upstream refused connection, waiting for it to become ready");
                StatusCode::BAD_GATEWAY.into_response()
            }
            Err(err) => {
                error!(origin = %self.origin, error = %err, "proxy error");
                StatusCode::BAD_GATEWAY.into_response()
            }
        }
    }

    /// Send a sub-request with a rewritten body and collect the whole reply
    /// into a buffered sink.
    ///
    /// The method, path, and forwardable headers are taken from the original
    /// request's `parts`; the content length follows the new body.
    pub async fn capture(&self, parts: &Parts, body: Bytes) -> Result<CapturedResponse, ProxyError> {
        let url = self.target_url(parts.uri.path(), parts.uri.query());

        let mut upstream = self
            .client
            .request(parts.method.clone(), url)
            .headers(headers::request_headers(&parts.headers))
            .body(body)
            .send()
            .await?;

        let mut sink = CapturedResponse::new();
        sink.record_status(upstream.status());
        sink.record_headers(upstream.headers());
        while let Some(chunk) = upstream.chunk().await? {
            sink.write(&chunk);
        }
        Ok(sink)
    }
}
