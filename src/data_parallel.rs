//! Data-parallel fan-out support.
//!
//! With `--data-parallel-size N > 1` the node runs N decoder processes on
//! contiguous ports. The sidecar exposes them through contiguous front ports
//! and keeps a table from advertised `host:port` keys to the pass-through
//! handler of the matching decoder. The table is filled before any listener
//! serves traffic and is never written afterwards, so reads take no lock.

use std::sync::Arc;

use indexmap::IndexMap;
use reqwest::Url;

use crate::config::ProxyConfig;
use crate::errors::ProxyError;
use crate::upstream::UpstreamProxy;

pub type DataParallelTable = IndexMap<String, Arc<UpstreamProxy>>;

/// Build the dispatch table: `podIP:frontPort` for the primary decoder, then
/// `podIP:frontPort+rank` -> `localhost:decoderPort+rank` for each sibling.
pub fn build_table(
    config: &ProxyConfig,
    primary: Arc<UpstreamProxy>,
) -> Result<DataParallelTable, ProxyError> {
    let mut table = IndexMap::new();
    table.insert(format!("{}:{}", config.pod_ip, config.port), primary);

    for rank in 1..config.data_parallel_size {
        let front_port = config.port + rank as u16;
        let decoder_port = config.decoder_port + rank as u16;
        let target = format!("{}://localhost:{}", config.decoder_scheme(), decoder_port);
        let origin = Url::parse(&target).map_err(|err| ProxyError::InvalidTarget {
            target: target.clone(),
            reason: err.to_string(),
        })?;
        let handler = Arc::new(UpstreamProxy::new(
            origin,
            config.decoder_insecure_skip_verify,
        )?);
        table.insert(format!("{}:{}", config.pod_ip, front_port), handler);
    }

    Ok(table)
}

/// The sibling listeners to launch: `(listen port, pass-through handler)`
/// for each rank past the primary.
pub fn siblings(
    config: &ProxyConfig,
    table: &DataParallelTable,
) -> Vec<(u16, Arc<UpstreamProxy>)> {
    (1..config.data_parallel_size)
        .filter_map(|rank| {
            let front_port = config.port + rank as u16;
            let key = format!("{}:{}", config.pod_ip, front_port);
            table.get(&key).map(|handler| (front_port, handler.clone()))
        })
        .collect()
}
