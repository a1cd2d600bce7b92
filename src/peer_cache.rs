use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use reqwest::Url;
use tracing::debug;

use crate::errors::ProxyError;
use crate::upstream::UpstreamProxy;

/// At most this many distinct prefill peers keep a live handler. The
/// scheduler concentrates traffic on a small set of peers, so 16 covers the
/// working set while bounding idle connection pools.
const CACHE_CAPACITY: usize = 16;

/// Lazily built, bounded cache of prefill peer handlers keyed by normalized
/// `host:port`.
pub struct PeerProxyCache {
    cache: Mutex<LruCache<String, Arc<UpstreamProxy>>>,
    scheme: &'static str,
    insecure_skip_verify: bool,
}

impl PeerProxyCache {
    pub fn new(use_tls: bool, insecure_skip_verify: bool) -> Self {
        let capacity = NonZeroUsize::new(CACHE_CAPACITY).expect("nonzero capacity");
        Self {
            cache: Mutex::new(LruCache::new(capacity)),
            scheme: if use_tls { "https" } else { "http" },
            insecure_skip_verify,
        }
    }

    /// Return the handler for `host_port`, building and caching it on first
    /// use. Inputs that normalize to the same key share one handler.
    ///
    /// The legacy prefill header may carry a full `http://host:port` URL;
    /// the prefix is stripped before the scheme configured for prefillers is
    /// applied.
    pub fn get(&self, host_port: &str) -> Result<Arc<UpstreamProxy>, ProxyError> {
        let key = host_port.strip_prefix("http://").unwrap_or(host_port);

        let mut cache = self.cache.lock();
        if let Some(handler) = cache.get(key) {
            return Ok(handler.clone());
        }

        let target = format!("{}://{}", self.scheme, key);
        let origin = Url::parse(&target).map_err(|err| ProxyError::InvalidTarget {
            target: host_port.to_string(),
            reason: err.to_string(),
        })?;
        if origin.host_str().is_none() {
            return Err(ProxyError::InvalidTarget {
                target: host_port.to_string(),
                reason: "missing host".to_string(),
            });
        }

        debug!(peer = key, "building prefiller proxy handler");
        let handler = Arc::new(UpstreamProxy::new(origin, self.insecure_skip_verify)?);
        cache.put(key.to_string(), handler.clone());
        Ok(handler)
    }
}
