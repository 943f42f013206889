//! Cluster wiring: configuration, the published ring snapshot, per-node
//! pools, and batch dispatch.

use crate::{
    message::{Cause, Message, MsgBatch, MsgBatchAllocator, Protocol},
    pool::Pool,
    ring::{HashMethod, Ring},
};
use serde::Deserialize;
use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
    time::Duration,
};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Distribution {
    Ketama,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClusterConfig {
    pub name: String,

    #[serde(rename = "type", alias = "cache_type")]
    pub cache_type: Protocol,

    #[serde(default = "defaults::hash_method")]
    pub hash_method: HashMethod,

    #[serde(default = "defaults::distribution")]
    pub distribution: Distribution,

    /// `addr:weight` or `addr:weight alias` entries.
    pub servers: Vec<String>,

    #[serde(default = "defaults::timeout_ms")]
    pub dial_timeout_ms: u64,

    #[serde(default = "defaults::timeout_ms")]
    pub read_timeout_ms: u64,

    #[serde(default = "defaults::timeout_ms")]
    pub write_timeout_ms: u64,

    /// Pool capacity per backend.
    #[serde(default = "defaults::node_connections")]
    pub node_connections: usize,

    /// Requests decoded into one pipeline slot before dispatch.
    #[serde(default = "defaults::max_pipeline")]
    pub max_pipeline: usize,
}

mod defaults {
    use super::{Distribution, HashMethod};

    pub fn hash_method() -> HashMethod {
        HashMethod::Ketama
    }

    pub fn distribution() -> Distribution {
        Distribution::Ketama
    }

    pub fn timeout_ms() -> u64 {
        1000
    }

    pub fn node_connections() -> usize {
        2
    }

    pub fn max_pipeline() -> usize {
        128
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error("cluster '{0}' has no servers")]
    NoServers(String),

    #[error("invalid server entry '{0}'")]
    InvalidServer(String),
}

struct ServerEntry {
    node: String,
    addr: String,
    weight: usize,
}

/// One proxied cluster: the ring snapshot, one pool per backend node, and
/// the timeouts every session inherits.
pub struct Cluster {
    pub name: String,
    pub proto: Protocol,
    hash_method: HashMethod,
    ring: RwLock<Arc<Ring>>,
    pools: RwLock<HashMap<String, Pool>>,
    dial_timeout: Duration,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
    node_connections: usize,
    max_pipeline: usize,
    wait_timeout: Duration,
}

impl Cluster {
    pub fn new(config: &ClusterConfig) -> Result<Arc<Self>, ClusterError> {
        let entries = parse_servers(&config.servers)?;
        if entries.is_empty() {
            return Err(ClusterError::NoServers(config.name.clone()));
        }

        let opt_timeout = |ms: u64| (ms > 0).then(|| Duration::from_millis(ms));
        let cluster = Self {
            name: config.name.clone(),
            proto: config.cache_type,
            hash_method: config.hash_method,
            ring: RwLock::new(Arc::new(Ring::build(&ring_nodes(&entries), config.hash_method))),
            pools: RwLock::new(HashMap::new()),
            dial_timeout: Duration::from_millis(config.dial_timeout_ms.max(1)),
            read_timeout: opt_timeout(config.read_timeout_ms),
            write_timeout: opt_timeout(config.write_timeout_ms),
            node_connections: config.node_connections,
            max_pipeline: config.max_pipeline.max(1),
            wait_timeout: Duration::from_millis(
                config.dial_timeout_ms.max(1) + config.read_timeout_ms + config.write_timeout_ms,
            ),
        };
        {
            let mut pools = cluster.pools.write().unwrap();
            for entry in &entries {
                pools.insert(entry.node.clone(), cluster.make_pool(entry));
            }
        }
        info!(
            cluster = %cluster.name,
            nodes = entries.len(),
            "cluster ready"
        );
        Ok(Arc::new(cluster))
    }

    fn make_pool(&self, entry: &ServerEntry) -> Pool {
        Pool::new(
            &self.name,
            &entry.node,
            &entry.addr,
            self.proto,
            self.node_connections,
            self.dial_timeout,
            self.read_timeout,
            self.write_timeout,
        )
    }

    /// The ring-update interface: rebuilds the ring from a new server list
    /// and publishes it atomically. In-flight dispatch rounds keep the
    /// snapshot they started with.
    pub fn update_servers(&self, servers: &[String]) -> Result<(), ClusterError> {
        let entries = parse_servers(servers)?;
        if entries.is_empty() {
            return Err(ClusterError::NoServers(self.name.clone()));
        }
        let ring = Arc::new(Ring::build(&ring_nodes(&entries), self.hash_method));
        {
            let mut pools = self.pools.write().unwrap();
            pools.retain(|node, _| entries.iter().any(|entry| entry.node == *node));
            for entry in &entries {
                if !pools.contains_key(&entry.node) {
                    pools.insert(entry.node.clone(), self.make_pool(entry));
                }
            }
        }
        *self.ring.write().unwrap() = ring;
        info!(cluster = %self.name, nodes = entries.len(), "ring updated");
        Ok(())
    }

    /// The current ring snapshot. A dispatch round holds one snapshot from
    /// its first key to its last.
    pub fn ring(&self) -> Arc<Ring> {
        self.ring.read().unwrap().clone()
    }

    /// Groups messages into per-backend batches under one ring snapshot.
    pub fn dispatch(&self, msgs: &[Message], mba: &mut MsgBatchAllocator) {
        let ring = self.ring();
        for msg in msgs {
            match ring.lookup(msg.request().key()) {
                Some(node) => mba.add_msg(node, msg.clone()),
                None => msg.set_err(Cause::Io),
            }
        }
    }

    /// Runs one forked sub-batch on a pooled connection in its own task.
    pub fn spawn_handle(self: &Arc<Self>, node: String, batch: MsgBatch) {
        let cluster = self.clone();
        tokio::spawn(async move {
            let pool = cluster.pools.read().unwrap().get(&node).cloned();
            let Some(pool) = pool else {
                warn!(cluster = %cluster.name, node = %node, "no pool for node");
                batch.done_with_error(&cluster.name, &node, Cause::Io);
                return;
            };
            match pool.acquire().await {
                Ok(mut handler) => handler.handle(&batch).await,
                Err(cause) => batch.done_with_error(&cluster.name, &node, cause),
            }
        });
    }

    pub fn allocator(&self) -> MsgBatchAllocator {
        MsgBatchAllocator::new(self.wait_timeout)
    }

    pub fn max_pipeline(&self) -> usize {
        self.max_pipeline
    }
}

fn ring_nodes(entries: &[ServerEntry]) -> Vec<(String, usize)> {
    entries
        .iter()
        .map(|entry| (entry.node.clone(), entry.weight))
        .collect()
}

/// Parses `host:port:weight` with an optional trailing alias. The alias, if
/// present, names the node on the ring; the address is what gets dialed.
fn parse_servers(servers: &[String]) -> Result<Vec<ServerEntry>, ClusterError> {
    servers
        .iter()
        .map(|entry| {
            let invalid = || ClusterError::InvalidServer(entry.clone());
            let mut parts = entry.split_whitespace();
            let spec = parts.next().ok_or_else(invalid)?;
            let alias = parts.next();
            if parts.next().is_some() {
                return Err(invalid());
            }
            let (addr, weight) = spec.rsplit_once(':').ok_or_else(invalid)?;
            if !addr.contains(':') {
                return Err(invalid());
            }
            let weight: usize = weight.parse().map_err(|_| invalid())?;
            if weight == 0 {
                return Err(invalid());
            }
            Ok(ServerEntry {
                node: alias.unwrap_or(addr).to_owned(),
                addr: addr.to_owned(),
                weight,
            })
        })
        .collect()
}
