//! In-process clusters and the connector that reaches them

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

use tfs_common::{Error, Result};
use tfs_proto::{Connector, DataService, NameService};

use crate::data_server::MemoryDataServer;
use crate::name_server::MemoryNameServer;
use crate::store::{ClusterStore, StoreConfig};

/// A name server and its data servers sharing one store
pub struct MemoryCluster {
    pub store: Arc<ClusterStore>,
    pub name: Arc<MemoryNameServer>,
    pub data: Vec<Arc<MemoryDataServer>>,
}

impl MemoryCluster {
    #[must_use]
    pub fn new(ns_addr: &str, data_addrs: Vec<String>, config: StoreConfig) -> Self {
        let store = Arc::new(ClusterStore::new(config, data_addrs.clone()));
        let name = Arc::new(MemoryNameServer::new(ns_addr, Arc::clone(&store)));
        let data = data_addrs
            .into_iter()
            .map(|addr| Arc::new(MemoryDataServer::new(addr, Arc::clone(&store))))
            .collect();
        Self { store, name, data }
    }

    #[must_use]
    pub fn data_server(&self, addr: &str) -> Option<&Arc<MemoryDataServer>> {
        self.data.iter().find(|ds| ds.addr() == addr)
    }

    /// Sum of a data-server counter over all data servers
    #[must_use]
    pub fn total(&self, pick: impl Fn(&MemoryDataServer) -> &AtomicU64) -> u64 {
        self.data
            .iter()
            .map(|ds| pick(ds).load(Ordering::SeqCst))
            .sum()
    }
}

/// Registry of in-process clusters addressed by name
#[derive(Default)]
pub struct MemoryNetwork {
    names: RwLock<HashMap<String, Arc<MemoryNameServer>>>,
    data: RwLock<HashMap<String, Arc<MemoryDataServer>>>,
    connects: AtomicU64,
}

impl MemoryNetwork {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Create a cluster reachable at `ns_addr` with `data_servers` data
    /// servers.
    pub fn add_cluster(
        &self,
        ns_addr: &str,
        cluster_id: u8,
        data_servers: usize,
    ) -> Arc<MemoryCluster> {
        let data_addrs = (0..data_servers).map(|i| format!("{ns_addr}/ds{i}")).collect();
        let config = StoreConfig {
            cluster_id,
            server_id: (u64::from(cluster_id) << 32) | 1,
            ..StoreConfig::default()
        };
        let cluster = Arc::new(MemoryCluster::new(ns_addr, data_addrs, config));
        self.register(&cluster);
        cluster
    }

    pub fn register(&self, cluster: &MemoryCluster) {
        self.names
            .write()
            .insert(cluster.name.addr().to_string(), Arc::clone(&cluster.name));
        let mut data = self.data.write();
        for ds in &cluster.data {
            data.insert(ds.addr().to_string(), Arc::clone(ds));
        }
        info!(ns = cluster.name.addr(), data_servers = cluster.data.len(), "registered cluster");
    }

    /// Number of connections opened through this network
    #[must_use]
    pub fn connect_count(&self) -> u64 {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MemoryNetwork {
    async fn connect_name(&self, addr: &str) -> Result<Arc<dyn NameService>> {
        let server = self
            .names
            .read()
            .get(addr)
            .cloned()
            .ok_or_else(|| Error::ConnectionFailed(format!("no name server at {addr}")))?;
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(server)
    }

    async fn connect_data(&self, addr: &str) -> Result<Arc<dyn DataService>> {
        let server = self
            .data
            .read()
            .get(addr)
            .cloned()
            .ok_or_else(|| Error::ConnectionFailed(format!("no data server at {addr}")))?;
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(server)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_registered_cluster() {
        let net = MemoryNetwork::new();
        let cluster = net.add_cluster("ns-a:8108", 2, 3);
        assert_eq!(cluster.data.len(), 3);

        let ns = net.connect_name("ns-a:8108").await.unwrap();
        assert_eq!(ns.cluster_info().await.unwrap().cluster_id, 2);
        assert!(net.connect_data("ns-a:8108/ds1").await.is_ok());
        assert_eq!(net.connect_count(), 2);

        let err = net.connect_name("ns-b:8108").await.err().unwrap();
        assert!(err.is_retryable());
    }
}
