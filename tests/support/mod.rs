#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use axum_server::Handle;
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use pd_sidecar::config::ProxyConfig;
use pd_sidecar::server::ProxyServer;

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Prefill,
    Decode,
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum Proto {
    NixlV2,
    Lmcache,
}

#[derive(Clone)]
pub struct RecordedRequest {
    pub path: String,
    pub request_id: Option<String>,
    pub body: Map<String, Value>,
}

struct MockState {
    role: Role,
    proto: Proto,
    fail_status: Option<StatusCode>,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
}

/// In-process stand-in for a vLLM worker: records every request and answers
/// the way a worker of the given role would.
pub struct MockWorker {
    pub addr: SocketAddr,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
    task: JoinHandle<()>,
}

impl MockWorker {
    pub async fn spawn(role: Role, proto: Proto) -> Self {
        Self::start(role, proto, None, 0).await
    }

    /// Bind to an exact port (for the contiguous-port data-parallel layout).
    pub async fn spawn_on(role: Role, proto: Proto, port: u16) -> Self {
        Self::start(role, proto, None, port).await
    }

    /// A worker that answers every request with `status`.
    pub async fn spawn_failing(status: StatusCode) -> Self {
        Self::start(Role::Prefill, Proto::NixlV2, Some(status), 0).await
    }

    async fn start(role: Role, proto: Proto, fail_status: Option<StatusCode>, port: u16) -> Self {
        let requests = Arc::new(Mutex::new(Vec::new()));
        let state = Arc::new(MockState {
            role,
            proto,
            fail_status,
            requests: requests.clone(),
        });
        let app = Router::new().fallback(record).with_state(state);

        let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let task = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            addr,
            requests,
            task,
        }
    }

    pub fn host_port(&self) -> String {
        format!("127.0.0.1:{}", self.addr.port())
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.host_port())
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().clone()
    }
}

impl Drop for MockWorker {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn record(State(state): State<Arc<MockState>>, req: Request) -> Response {
    let path = req.uri().path().to_string();
    let request_id = req
        .headers()
        .get("x-request-id")
        .and_then(|value| value.to_str().ok())
        .map(String::from);

    let bytes = axum::body::to_bytes(req.into_body(), usize::MAX)
        .await
        .unwrap();
    let body: Map<String, Value> = if bytes.is_empty() {
        Map::new()
    } else {
        serde_json::from_slice(&bytes).unwrap_or_default()
    };

    state.requests.lock().push(RecordedRequest {
        path,
        request_id,
        body,
    });

    if let Some(status) = state.fail_status {
        return (status, "mock worker failure").into_response();
    }

    let reply = match (state.role, state.proto) {
        (Role::Prefill, Proto::NixlV2) => json!({
            "id": "cmpl-prefill",
            "object": "chat.completion",
            "kv_transfer_params": {
                "do_remote_decode": false,
                "do_remote_prefill": true,
                "remote_engine_id": "engine-1",
                "remote_block_ids": [1, 2, 3],
                "remote_host": "10.0.0.9",
                "remote_port": 5600
            }
        }),
        (Role::Prefill, Proto::Lmcache) => json!({
            "id": "cmpl-prefill",
            "object": "chat.completion",
            "remote_host": "10.0.0.9",
            "remote_port": 5600
        }),
        (Role::Decode, _) => json!({
            "id": "cmpl-decode",
            "object": "chat.completion",
            "choices": []
        }),
    };
    Json(reply).into_response()
}

/// A running sidecar under test. Aborted (not drained) on drop.
pub struct TestSidecar {
    pub port: u16,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl TestSidecar {
    pub async fn start(config: ProxyConfig) -> Self {
        let port = config.port;
        let secure = config.secure_proxy;
        let server = ProxyServer::new(config).unwrap();

        let handle = Handle::new();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn({
            let handle = handle.clone();
            let shutdown = shutdown.clone();
            async move {
                server.start(handle, shutdown).await.unwrap();
            }
        });

        wait_until_ready(port, secure).await;
        Self {
            port,
            shutdown,
            task,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://127.0.0.1:{}{}", self.port, path)
    }

    pub fn https_url(&self, path: &str) -> String {
        format!("https://127.0.0.1:{}{}", self.port, path)
    }
}

impl Drop for TestSidecar {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.task.abort();
    }
}

async fn wait_until_ready(port: u16, secure: bool) {
    let client = reqwest::Client::builder()
        .danger_accept_invalid_certs(true)
        .build()
        .unwrap();
    let scheme = if secure { "https" } else { "http" };
    let url = format!("{scheme}://127.0.0.1:{port}/health");

    for _ in 0..250 {
        if let Ok(resp) = client.get(&url).send().await {
            if resp.status() == StatusCode::OK {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("sidecar on port {port} did not become ready");
}

/// Reserve a free TCP port by binding to 0 and dropping the listener.
pub fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

/// Reserve two consecutive free ports, for layouts that assume contiguity.
pub fn free_port_pair() -> (u16, u16) {
    for _ in 0..50 {
        let first = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = first.local_addr().unwrap().port();
        if port == u16::MAX {
            continue;
        }
        if let Ok(second) = std::net::TcpListener::bind(("127.0.0.1", port + 1)) {
            drop(second);
            drop(first);
            return (port, port + 1);
        }
    }
    panic!("could not find two consecutive free ports");
}
