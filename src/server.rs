use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::allowlist::AllowlistValidator;
use crate::config::{Connector, ProxyConfig};
use crate::connector::{lmcache, nixl_v2};
use crate::data_parallel::{self, DataParallelTable};
use crate::errors::ProxyError;
use crate::headers;
use crate::peer_cache::PeerProxyCache;
use crate::tls;
use crate::upstream::UpstreamProxy;

/// OpenAI chat completions path.
pub const CHAT_COMPLETIONS_PATH: &str = "/v1/chat/completions";

/// Legacy completions path.
pub const COMPLETIONS_PATH: &str = "/v1/completions";

/// In-flight requests get this long to finish after a shutdown signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(60);

/// Header reads are bounded even though bodies are not (inference responses
/// can stream for a very long time).
const HEADER_READ_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_HEADER_BYTES: usize = 1 << 20;

/// Shared request-handling state, immutable once the listeners start.
pub struct AppState {
    pub config: ProxyConfig,
    pub decoder: Arc<UpstreamProxy>,
    pub peers: PeerProxyCache,
    pub allowlist: Arc<AllowlistValidator>,
    pub data_parallel: DataParallelTable,
}

/// The sidecar's HTTP(S) front door.
pub struct ProxyServer {
    state: Arc<AppState>,
    tls: Option<RustlsConfig>,
}

impl ProxyServer {
    pub fn new(config: ProxyConfig) -> Result<Self, ProxyError> {
        let decoder = Arc::new(UpstreamProxy::new(
            config.decoder_url()?,
            config.decoder_insecure_skip_verify,
        )?);

        let peers = PeerProxyCache::new(
            config.prefiller_use_tls,
            config.prefiller_insecure_skip_verify,
        );

        let allowlist = if config.enable_ssrf_protection {
            AllowlistValidator::watching(
                &config.inference_pool_namespace,
                &config.inference_pool_name,
            )
        } else {
            AllowlistValidator::disabled()
        };

        let data_parallel = data_parallel::build_table(&config, decoder.clone())?;

        let tls = if config.secure_proxy {
            let rustls = tls::server_config(config.cert_path.as_deref())?;
            Some(RustlsConfig::from_config(Arc::new(rustls)))
        } else {
            None
        };

        Ok(Self {
            state: Arc::new(AppState {
                config,
                decoder,
                peers,
                allowlist,
                data_parallel,
            }),
            tls,
        })
    }

    /// Serve until `shutdown` fires, then drain in-flight requests for up to
    /// 60 seconds. Sibling listeners share the same handle and drain with
    /// the main listener.
    pub async fn start(
        self,
        handle: Handle,
        shutdown: CancellationToken,
    ) -> Result<(), ProxyError> {
        self.state.allowlist.start().await?;

        for (listen_port, decoder) in
            data_parallel::siblings(&self.state.config, &self.state.data_parallel)
        {
            let app = Router::new()
                .fallback(sibling_passthrough)
                .with_state(decoder);
            let addr = SocketAddr::from(([0, 0, 0, 0], listen_port));
            info!(%addr, "starting data-parallel sibling listener");
            let tls = self.tls.clone();
            let handle = handle.clone();
            tokio::spawn(async move {
                if let Err(err) = serve(addr, app, tls, handle).await {
                    error!(%addr, error = %err, "sibling listener failed");
                }
            });
        }

        {
            let state = self.state.clone();
            let handle = handle.clone();
            tokio::spawn(async move {
                shutdown.cancelled().await;
                info!("shutting down");
                state.allowlist.stop();
                handle.graceful_shutdown(Some(SHUTDOWN_GRACE));
            });
        }

        let addr = SocketAddr::from(([0, 0, 0, 0], self.state.config.port));
        info!(%addr, secure = self.tls.is_some(), "starting");
        let app = build_router(self.state.clone());
        serve(addr, app, self.tls, handle).await?;
        Ok(())
    }
}

/// Route table: health, the two orchestrated completion paths, and a
/// pass-through for everything else.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route(CHAT_COMPLETIONS_PATH, post(chat_completions))
        .route(COMPLETIONS_PATH, post(chat_completions))
        .fallback(decoder_passthrough)
        .with_state(state)
}

async fn serve(
    addr: SocketAddr,
    app: Router,
    tls: Option<RustlsConfig>,
    handle: Handle,
) -> std::io::Result<()> {
    let service = app.into_make_service_with_connect_info::<SocketAddr>();

    match tls {
        Some(tls) => {
            let mut server = axum_server::bind_rustls(addr, tls).handle(handle);
            server
                .http_builder()
                .http1()
                .timer(hyper_util::rt::TokioTimer::new())
                .header_read_timeout(HEADER_READ_TIMEOUT)
                .max_buf_size(MAX_HEADER_BYTES);
            server.serve(service).await
        }
        None => {
            let mut server = axum_server::bind(addr).handle(handle);
            server
                .http_builder()
                .http1()
                .timer(hyper_util::rt::TokioTimer::new())
                .header_read_timeout(HEADER_READ_TIMEOUT)
                .max_buf_size(MAX_HEADER_BYTES);
            server.serve(service).await
        }
    }
}

async fn health() -> StatusCode {
    StatusCode::OK
}

async fn decoder_passthrough(State(state): State<Arc<AppState>>, req: Request) -> Response {
    state.decoder.serve(req).await
}

async fn sibling_passthrough(State(decoder): State<Arc<UpstreamProxy>>, req: Request) -> Response {
    decoder.serve(req).await
}

/// Dispatcher for the completion endpoints.
///
/// Priority: data-parallel sibling dispatch, then the two-phase protocol
/// when a prefill target is advertised, else plain pass-through.
async fn chat_completions(State(state): State<Arc<AppState>>, req: Request) -> Response {
    if let Some(value) = req.headers().get(&headers::DATA_PARALLEL_HOST_PORT) {
        let key = value.to_str().unwrap_or("");
        return match state.data_parallel.get(key) {
            Some(handler) => {
                debug!(to = key, "data parallel routing");
                handler.serve(req).await
            }
            None => {
                warn!(key, "no data-parallel handler for target");
                StatusCode::BAD_REQUEST.into_response()
            }
        };
    }

    let prefill_target = req
        .headers()
        .get(&headers::PREFILLER_HOST_PORT)
        .or_else(|| req.headers().get(&headers::PREFILLER_URL))
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned);

    let Some(prefill_target) = prefill_target else {
        debug!("skip disaggregated prefill");
        return state.decoder.serve(req).await;
    };

    if !state.allowlist.is_allowed(&prefill_target) {
        let client = req
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|info| info.0.to_string())
            .unwrap_or_default();
        let user_agent = req
            .headers()
            .get(http::header::USER_AGENT)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default();
        error!(
            peer = %prefill_target,
            client = %client,
            user_agent,
            path = req.uri().path(),
            "SSRF protection: prefill target not in allowlist"
        );
        return (
            StatusCode::FORBIDDEN,
            "Forbidden: prefill target not allowed by SSRF protection",
        )
            .into_response();
    }
    debug!(peer = %prefill_target, "SSRF protection: prefill target allowed");

    match state.config.connector {
        Connector::NixlV2 => nixl_v2::run(&state, req, &prefill_target).await,
        Connector::Lmcache => lmcache::run(&state, req, &prefill_target).await,
    }
}
