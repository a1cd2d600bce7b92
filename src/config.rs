use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use reqwest::Url;

use crate::errors::ProxyError;

/// P/D connector protocol spoken between the sidecar and its workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Connector {
    /// NIXL v2: KV-transfer parameters ride in a `kv_transfer_params`
    /// sub-object (default).
    #[value(name = "nixlv2")]
    NixlV2,
    /// Deprecated LMCache protocol with top-level KV fields.
    #[value(name = "lmcache")]
    Lmcache,
}

#[derive(Debug, Parser)]
#[command(name = "pd-sidecar", about = "Reverse proxy for disaggregated prefill/decode serving")]
pub struct Args {
    /// The port the sidecar is listening on.
    #[arg(long, default_value_t = 8000)]
    pub port: u16,

    /// The port the local vLLM decoder is listening on.
    #[arg(long = "vllm-port", default_value_t = 8001)]
    pub vllm_port: u16,

    /// The vLLM DATA-PARALLEL-SIZE value.
    #[arg(long = "data-parallel-size", default_value_t = 1)]
    pub data_parallel_size: usize,

    /// The P/D connector being used.
    #[arg(long, value_enum, default_value_t = Connector::NixlV2)]
    pub connector: Connector,

    /// Use TLS when sending requests to prefillers.
    #[arg(long = "prefiller-use-tls", default_value_t = false)]
    pub prefiller_use_tls: bool,

    /// Use TLS when sending requests to the decoder.
    #[arg(long = "decoder-use-tls", default_value_t = false)]
    pub decoder_use_tls: bool,

    /// Skip TLS verification for requests to prefillers.
    #[arg(long = "prefiller-tls-insecure-skip-verify", default_value_t = false)]
    pub prefiller_insecure_skip_verify: bool,

    /// Skip TLS verification for requests to the decoder.
    #[arg(long = "decoder-tls-insecure-skip-verify", default_value_t = false)]
    pub decoder_insecure_skip_verify: bool,

    /// Serve the sidecar itself over TLS.
    #[arg(long = "secure-proxy", default_value_t = true, action = clap::ArgAction::Set)]
    pub secure_proxy: bool,

    /// Directory holding `tls.crt` and `tls.key` for the secure proxy. When
    /// unset, a self-signed certificate is generated (for testing).
    #[arg(long = "cert-path")]
    pub cert_path: Option<PathBuf>,

    /// Enforce the InferencePool allowlist on prefill targets.
    #[arg(long = "enable-ssrf-protection", default_value_t = false)]
    pub enable_ssrf_protection: bool,

    /// Namespace of the InferencePool to watch.
    #[arg(long = "inference-pool-namespace", env = "INFERENCE_POOL_NAMESPACE", default_value = "")]
    pub inference_pool_namespace: String,

    /// Name of the InferencePool to watch.
    #[arg(long = "inference-pool-name", env = "INFERENCE_POOL_NAME", default_value = "")]
    pub inference_pool_name: String,
}

/// Startup configuration error; these abort the process with exit code 1.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("--inference-pool-namespace (or INFERENCE_POOL_NAMESPACE) is required when --enable-ssrf-protection is set")]
    MissingPoolNamespace,

    #[error("--inference-pool-name (or INFERENCE_POOL_NAME) is required when --enable-ssrf-protection is set")]
    MissingPoolName,

    #[error("POD_IP must be set when --data-parallel-size is greater than 1")]
    MissingPodIp,
}

/// Immutable sidecar configuration, built once at startup.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub port: u16,
    pub decoder_port: u16,
    pub data_parallel_size: usize,
    pub connector: Connector,
    pub prefiller_use_tls: bool,
    pub decoder_use_tls: bool,
    pub prefiller_insecure_skip_verify: bool,
    pub decoder_insecure_skip_verify: bool,
    pub secure_proxy: bool,
    pub cert_path: Option<PathBuf>,
    pub enable_ssrf_protection: bool,
    pub inference_pool_namespace: String,
    pub inference_pool_name: String,
    /// This pod's IP, used to key the data-parallel table.
    pub pod_ip: String,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            port: 8000,
            decoder_port: 8001,
            data_parallel_size: 1,
            connector: Connector::NixlV2,
            prefiller_use_tls: false,
            decoder_use_tls: false,
            prefiller_insecure_skip_verify: false,
            decoder_insecure_skip_verify: false,
            secure_proxy: true,
            cert_path: None,
            enable_ssrf_protection: false,
            inference_pool_namespace: String::new(),
            inference_pool_name: String::new(),
            pod_ip: String::new(),
        }
    }
}

impl ProxyConfig {
    /// Fold parsed CLI arguments and the `POD_IP` environment variable into
    /// a validated configuration.
    pub fn from_args(args: Args) -> Result<Self, ConfigError> {
        let pod_ip = std::env::var("POD_IP").unwrap_or_default();

        let config = Self {
            port: args.port,
            decoder_port: args.vllm_port,
            data_parallel_size: args.data_parallel_size.max(1),
            connector: args.connector,
            prefiller_use_tls: args.prefiller_use_tls,
            decoder_use_tls: args.decoder_use_tls,
            prefiller_insecure_skip_verify: args.prefiller_insecure_skip_verify,
            decoder_insecure_skip_verify: args.decoder_insecure_skip_verify,
            secure_proxy: args.secure_proxy,
            cert_path: args.cert_path,
            enable_ssrf_protection: args.enable_ssrf_protection,
            inference_pool_namespace: args.inference_pool_namespace,
            inference_pool_name: args.inference_pool_name,
            pod_ip,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.enable_ssrf_protection {
            if self.inference_pool_namespace.is_empty() {
                return Err(ConfigError::MissingPoolNamespace);
            }
            if self.inference_pool_name.is_empty() {
                return Err(ConfigError::MissingPoolName);
            }
        }
        // A sibling table keyed by ":<port>" would never match an incoming
        // header, so a missing POD_IP cannot be papered over.
        if self.data_parallel_size > 1 && self.pod_ip.is_empty() {
            return Err(ConfigError::MissingPodIp);
        }
        Ok(())
    }

    pub fn decoder_scheme(&self) -> &'static str {
        if self.decoder_use_tls {
            "https"
        } else {
            "http"
        }
    }

    /// URL of the primary local decoder.
    pub fn decoder_url(&self) -> Result<Url, ProxyError> {
        let target = format!("{}://localhost:{}", self.decoder_scheme(), self.decoder_port);
        Url::parse(&target).map_err(|err| ProxyError::InvalidTarget {
            target,
            reason: err.to_string(),
        })
    }
}
