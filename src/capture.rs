use bytes::{Bytes, BytesMut};
use http::{HeaderMap, StatusCode};

/// In-memory recorder for a prefill peer's reply.
///
/// The two-phase protocol must inspect the peer's status and parse its body
/// before deciding whether to run the decode phase, so the reply is collected
/// here instead of being streamed anywhere. Used only in-process.
#[derive(Debug, Default)]
pub struct CapturedResponse {
    status: Option<StatusCode>,
    headers: HeaderMap,
    body: BytesMut,
}

impl CapturedResponse {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an explicit status. Later calls overwrite earlier ones.
    pub fn record_status(&mut self, status: StatusCode) {
        self.status = Some(status);
    }

    /// Merge a set of response headers into the recording.
    pub fn record_headers(&mut self, headers: &HeaderMap) {
        for (name, value) in headers {
            self.headers.append(name.clone(), value.clone());
        }
    }

    /// Append body bytes. Writing before any explicit status records 200.
    pub fn write(&mut self, chunk: &[u8]) {
        if self.status.is_none() {
            self.status = Some(StatusCode::OK);
        }
        self.body.extend_from_slice(chunk);
    }

    pub fn status(&self) -> StatusCode {
        self.status.unwrap_or(StatusCode::OK)
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn into_body(self) -> Bytes {
        self.body.freeze()
    }
}
