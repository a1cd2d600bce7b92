pub mod lmcache;
pub mod nixl_v2;

use once_cell::sync::Lazy;
use serde_json::{json, Map, Value};
use uuid::Uuid;

pub const FIELD_KV_TRANSFER_PARAMS: &str = "kv_transfer_params";
pub const FIELD_MAX_TOKENS: &str = "max_tokens";
pub const FIELD_MAX_COMPLETION_TOKENS: &str = "max_completion_tokens";
pub const FIELD_DO_REMOTE_PREFILL: &str = "do_remote_prefill";
pub const FIELD_DO_REMOTE_DECODE: &str = "do_remote_decode";
pub const FIELD_REMOTE_BLOCK_IDS: &str = "remote_block_ids";
pub const FIELD_REMOTE_ENGINE_ID: &str = "remote_engine_id";
pub const FIELD_REMOTE_HOST: &str = "remote_host";
pub const FIELD_REMOTE_PORT: &str = "remote_port";
pub const FIELD_STREAM: &str = "stream";
pub const FIELD_STREAM_OPTIONS: &str = "stream_options";

// Node identifier for time-based request ids, fixed for the process life.
static UUID_NODE_ID: Lazy<[u8; 6]> = Lazy::new(|| {
    let seed = Uuid::new_v4();
    let mut node = [0u8; 6];
    node.copy_from_slice(&seed.as_bytes()[10..]);
    node
});

/// Fresh correlation id shared by the prefill and decode sub-requests of one
/// client request.
pub(crate) fn request_id() -> String {
    Uuid::now_v1(&UUID_NODE_ID).to_string()
}

/// Client-supplied fields the prefill rewrite clobbers. Presence matters:
/// a field the client omitted must stay absent on the decode request.
#[derive(Debug)]
pub(crate) struct SavedFields {
    stream: Option<Value>,
    stream_options: Option<Value>,
    max_tokens: Option<Value>,
    max_completion_tokens: Option<Value>,
}

impl SavedFields {
    pub fn capture(body: &Map<String, Value>) -> Self {
        Self {
            stream: body.get(FIELD_STREAM).cloned(),
            stream_options: body.get(FIELD_STREAM_OPTIONS).cloned(),
            max_tokens: body.get(FIELD_MAX_TOKENS).cloned(),
            max_completion_tokens: body.get(FIELD_MAX_COMPLETION_TOKENS).cloned(),
        }
    }

    /// Undo the prefill rewrite on `body`, restoring each field to the
    /// client's original value or removing it if the client never sent it.
    pub fn restore(&self, body: &mut Map<String, Value>) {
        body.remove(FIELD_STREAM);
        if let Some(stream) = &self.stream {
            body.insert(FIELD_STREAM.to_string(), stream.clone());
        }
        if let Some(stream_options) = &self.stream_options {
            body.insert(FIELD_STREAM_OPTIONS.to_string(), stream_options.clone());
        }
        body.remove(FIELD_MAX_TOKENS);
        if let Some(max_tokens) = &self.max_tokens {
            body.insert(FIELD_MAX_TOKENS.to_string(), max_tokens.clone());
        }
        body.remove(FIELD_MAX_COMPLETION_TOKENS);
        if let Some(max_completion_tokens) = &self.max_completion_tokens {
            body.insert(
                FIELD_MAX_COMPLETION_TOKENS.to_string(),
                max_completion_tokens.clone(),
            );
        }
    }
}

/// Rewrite `body` into prefill form: a single forced token, no streaming.
pub(crate) fn pin_prefill_limits(body: &mut Map<String, Value>) {
    body.insert(FIELD_STREAM.to_string(), json!(false));
    body.remove(FIELD_STREAM_OPTIONS);
    body.insert(FIELD_MAX_TOKENS.to_string(), json!(1));
    body.insert(FIELD_MAX_COMPLETION_TOKENS.to_string(), json!(1));
}

/// The outbound `kv_transfer_params` object announcing remote decode to the
/// prefill worker. The routing hints are filled in by the peer's reply.
pub(crate) fn outbound_kv_transfer_params() -> Value {
    json!({
        "do_remote_decode": true,
        "do_remote_prefill": false,
        "remote_engine_id": null,
        "remote_block_ids": null,
        "remote_host": null,
        "remote_port": null,
    })
}
