use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ApiResource, DynamicObject};
use kube::core::GroupVersionKind;
use kube::runtime::{reflector, watcher, watcher::Config, WatchStreamExt};
use kube::{Client, ResourceExt};
use parking_lot::RwLock;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::ProxyError;

const INFERENCE_POOL_GROUP: &str = "inference.networking.x-k8s.io";
const INFERENCE_POOL_VERSION: &str = "v1alpha2";
const INFERENCE_POOL_KIND: &str = "InferencePool";

struct PodWatch {
    token: CancellationToken,
    store: reflector::Store<Pod>,
}

/// SSRF protection for prefill targets.
///
/// When enabled, the validator watches a single InferencePool and the pods
/// its selector matches, and keeps the set of permitted hosts (pod IPs and
/// pod names) current. The request path only ever takes the read lock.
pub struct AllowlistValidator {
    enabled: bool,
    namespace: String,
    pool_name: String,
    allowed: RwLock<HashSet<String>>,
    pod_watchers: RwLock<HashMap<String, PodWatch>>,
    root: CancellationToken,
}

impl AllowlistValidator {
    /// Validator that allows every target (SSRF protection off).
    pub fn disabled() -> Arc<Self> {
        Arc::new(Self {
            enabled: false,
            namespace: String::new(),
            pool_name: String::new(),
            allowed: RwLock::new(HashSet::new()),
            pod_watchers: RwLock::new(HashMap::new()),
            root: CancellationToken::new(),
        })
    }

    /// Validator that watches `namespace/pool_name` once started.
    pub fn watching(namespace: impl Into<String>, pool_name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            enabled: true,
            namespace: namespace.into(),
            pool_name: pool_name.into(),
            allowed: RwLock::new(HashSet::new()),
            pod_watchers: RwLock::new(HashMap::new()),
            root: CancellationToken::new(),
        })
    }

    #[cfg(test)]
    pub(crate) fn seeded<I, S>(targets: I) -> Arc<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Arc::new(Self {
            enabled: true,
            namespace: "test".to_string(),
            pool_name: "test-pool".to_string(),
            allowed: RwLock::new(targets.into_iter().map(Into::into).collect()),
            pod_watchers: RwLock::new(HashMap::new()),
            root: CancellationToken::new(),
        })
    }

    /// Begin watching cluster state. No-op when protection is disabled.
    pub async fn start(self: &Arc<Self>) -> Result<(), ProxyError> {
        if !self.enabled {
            return Ok(());
        }

        info!(
            namespace = %self.namespace,
            pool = %self.pool_name,
            "starting SSRF protection allowlist validator"
        );

        let client = Client::try_default().await.map_err(|err| {
            ProxyError::Allowlist(format!(
                "failed to create Kubernetes client (is the sidecar running in a pod with RBAC for inferencepools.{INFERENCE_POOL_GROUP}?): {err}"
            ))
        })?;

        tokio::spawn(Arc::clone(self).watch_pool(client));
        Ok(())
    }

    /// Stop all watchers: every per-pool token first, then the root token.
    pub fn stop(&self) {
        if !self.enabled {
            return;
        }
        info!("stopping allowlist validator");
        {
            let mut watchers = self.pod_watchers.write();
            for (_, watch) in watchers.drain() {
                watch.token.cancel();
            }
        }
        self.root.cancel();
    }

    /// Membership test for a prefill target. Only the host part of
    /// `host_port` is compared; any port on an allowed host is allowed.
    pub fn is_allowed(&self, host_port: &str) -> bool {
        if !self.enabled {
            return true;
        }
        let host = host_of(host_port);
        let allowed = self.allowed.read().contains(host);
        debug!(host, allowed, "allowlist check");
        allowed
    }

    /// Main watch loop over the configured InferencePool.
    async fn watch_pool(self: Arc<Self>, client: Client) {
        let gvk = GroupVersionKind::gvk(
            INFERENCE_POOL_GROUP,
            INFERENCE_POOL_VERSION,
            INFERENCE_POOL_KIND,
        );
        let resource = ApiResource::from_gvk(&gvk);
        let pools: Api<DynamicObject> =
            Api::namespaced_with(client.clone(), &self.namespace, &resource);
        let config = Config::default().fields(&format!("metadata.name={}", self.pool_name));

        let mut events = watcher(pools, config).default_backoff().boxed();
        loop {
            tokio::select! {
                _ = self.root.cancelled() => break,
                event = events.next() => match event {
                    Some(Ok(watcher::Event::Apply(pool)))
                    | Some(Ok(watcher::Event::InitApply(pool))) => {
                        info!(pool = %pool.name_any(), "inference pool observed");
                        Self::watch_pods_for_pool(&self, &client, &pool);
                    }
                    Some(Ok(watcher::Event::Delete(pool))) => {
                        info!(pool = %pool.name_any(), "inference pool deleted");
                        self.drop_pool(&pool.name_any());
                        self.rebuild();
                    }
                    Some(Ok(watcher::Event::Init)) | Some(Ok(watcher::Event::InitDone)) => {}
                    Some(Err(err)) => warn!(error = %err, "inference pool watch error"),
                    None => break,
                },
            }
        }
    }

    /// Create (or replace) the pod watcher for a pool. The pool's selector
    /// may have changed, so any previous watcher for the same pool is
    /// cancelled before the new one is installed.
    fn watch_pods_for_pool(this: &Arc<Self>, client: &Client, pool: &DynamicObject) {
        let pool_name = pool.name_any();
        let Some(selector) = pool_selector(pool) else {
            warn!(pool = %pool_name, "inference pool has no usable selector");
            return;
        };

        let token = this.root.child_token();
        let (store, writer) = reflector::store::<Pod>();
        {
            let mut watchers = this.pod_watchers.write();
            if let Some(previous) = watchers.insert(
                pool_name.clone(),
                PodWatch {
                    token: token.clone(),
                    store,
                },
            ) {
                previous.token.cancel();
            }
        }

        let pods: Api<Pod> = Api::namespaced(client.clone(), &this.namespace);
        let config = Config::default().labels(&selector);
        let validator = Arc::clone(this);

        tokio::spawn(async move {
            let mut stream = reflector(writer, watcher(pods, config))
                .default_backoff()
                .touched_objects()
                .boxed();
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    item = stream.next() => match item {
                        Some(Ok(pod)) => {
                            debug!(pod = %pod.name_any(), "pod event");
                            validator.rebuild();
                        }
                        Some(Err(err)) => warn!(error = %err, "pod watch error"),
                        None => break,
                    },
                }
            }
        });

        debug!(pool = %pool_name, selector = %selector, "watching pods for inference pool");
    }

    fn drop_pool(&self, pool_name: &str) {
        let mut watchers = self.pod_watchers.write();
        if let Some(watch) = watchers.remove(pool_name) {
            watch.token.cancel();
        }
    }

    /// Full recomputation of the allowed set from every pod store.
    ///
    /// Lock order: allowed-set write lock before the watcher-table read
    /// lock.
    fn rebuild(&self) {
        let mut allowed = self.allowed.write();
        let watchers = self.pod_watchers.read();

        allowed.clear();
        for watch in watchers.values() {
            for pod in watch.store.state() {
                let Some(ip) = pod
                    .status
                    .as_ref()
                    .and_then(|status| status.pod_ip.clone())
                    .filter(|ip| !ip.is_empty())
                else {
                    continue;
                };
                allowed.insert(ip);
                let name = pod.name_any();
                if !name.is_empty() {
                    allowed.insert(name);
                }
            }
        }

        info!(targets = allowed.len(), "rebuilt allowlist");
    }
}

/// Label selector string for an InferencePool's `.spec.selector` map.
fn pool_selector(pool: &DynamicObject) -> Option<String> {
    let selector = pool.data.get("spec")?.get("selector")?.as_object()?;
    if selector.is_empty() {
        return None;
    }
    let parts: Vec<String> = selector
        .iter()
        .map(|(key, value)| match value {
            Value::String(s) => format!("{key}={s}"),
            other => format!("{key}={other}"),
        })
        .collect();
    Some(parts.join(","))
}

/// Extract the host part of a `host:port` string.
///
/// Bracketed IPv6 hosts lose their brackets; a string that does not parse as
/// `host:port` (bare hostname, bare IPv6 address) is returned whole.
fn host_of(host_port: &str) -> &str {
    if let Some(rest) = host_port.strip_prefix('[') {
        if let Some(end) = rest.find(']') {
            if rest[end + 1..].starts_with(':') {
                return &rest[..end];
            }
        }
        return host_port;
    }
    match host_port.matches(':').count() {
        1 => host_port.split(':').next().unwrap_or(host_port),
        _ => host_port,
    }
}
