//! In-pod reverse proxy for disaggregated prefill/decode LLM serving.
//!
//! The sidecar fronts a local decoder and, when the previous hop advertises
//! a prefill peer, runs the two-phase protocol: prefill remotely, thread the
//! KV-transfer parameters into the decode request, stream the decoder's
//! reply to the client.

pub mod allowlist;
pub mod capture;
pub mod config;
pub mod connector;
pub mod data_parallel;
pub mod errors;
pub mod headers;
pub mod logging;
pub mod peer_cache;
pub mod server;
pub mod tls;
pub mod upstream;
