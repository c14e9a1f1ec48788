//! Connection cache
//!
//! Keeps one live service handle per server address. Connections are opened
//! without holding the cache lock; racing tasks converge on whichever handle
//! lands in the map first.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use tfs_common::Result;
use tfs_proto::{Connector, DataService, NameService};

struct CachedConn<S: ?Sized> {
    service: Arc<S>,
    /// Milliseconds since the cache epoch
    last_used: AtomicU64,
}

type ConnMap<S> = RwLock<HashMap<String, CachedConn<S>>>;

/// Cache of name-server and data-server connections
pub struct ConnectionCache {
    connector: Arc<dyn Connector>,
    names: ConnMap<dyn NameService>,
    data: ConnMap<dyn DataService>,
    max_connections: usize,
    epoch: Instant,
}

impl ConnectionCache {
    pub fn new(connector: Arc<dyn Connector>, max_connections: usize) -> Self {
        Self {
            connector,
            names: RwLock::new(HashMap::new()),
            data: RwLock::new(HashMap::new()),
            max_connections: max_connections.max(1),
            epoch: Instant::now(),
        }
    }

    fn clock(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    /// Handle for the name server at `addr`, connecting if necessary
    pub async fn name(&self, addr: &str) -> Result<Arc<dyn NameService>> {
        self.get_or_connect(&self.names, addr, self.connector.connect_name(addr))
            .await
    }

    /// Handle for the data server at `addr`, connecting if necessary
    pub async fn data(&self, addr: &str) -> Result<Arc<dyn DataService>> {
        self.get_or_connect(&self.data, addr, self.connector.connect_data(addr))
            .await
    }

    async fn get_or_connect<S, F>(
        &self,
        map: &ConnMap<S>,
        addr: &str,
        connect: F,
    ) -> Result<Arc<S>>
    where
        S: ?Sized,
        F: Future<Output = Result<Arc<S>>>,
    {
        if let Some(conn) = map.read().get(addr) {
            conn.last_used.store(self.clock(), Ordering::Relaxed);
            return Ok(Arc::clone(&conn.service));
        }

        // Connect without holding the lock
        let service = connect.await.map_err(|e| {
            warn!("Failed to connect to {}: {}", addr, e);
            e
        })?;

        let mut conns = map.write();
        if let Some(conn) = conns.get(addr) {
            // Another task connected while we were making the network call
            conn.last_used.store(self.clock(), Ordering::Relaxed);
            return Ok(Arc::clone(&conn.service));
        }

        if conns.len() >= self.max_connections {
            let oldest = conns
                .iter()
                .min_by_key(|(_, c)| c.last_used.load(Ordering::Relaxed))
                .map(|(k, _)| k.clone());
            if let Some(oldest) = oldest {
                conns.remove(&oldest);
                debug!("Evicted connection to {}", oldest);
            }
        }

        conns.insert(
            addr.to_string(),
            CachedConn {
                service: Arc::clone(&service),
                last_used: AtomicU64::new(self.clock()),
            },
        );
        drop(conns);

        info!("Connected to {}", addr);
        Ok(service)
    }

    /// Forget the connection to `addr`; the next call reconnects.
    pub fn invalidate(&self, addr: &str) {
        let removed =
            self.names.write().remove(addr).is_some() | self.data.write().remove(addr).is_some();
        if removed {
            debug!("Invalidated connection to {}", addr);
        }
    }

    /// Drop connections idle for longer than `ttl`. Returns how many went.
    pub fn expire_idle(&self, ttl: Duration) -> usize {
        let now = self.clock();
        let ttl = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
        retain_fresh(&self.names, now, ttl) + retain_fresh(&self.data, now, ttl)
    }

    /// Number of cached connections of both kinds
    #[must_use]
    pub fn len(&self) -> usize {
        self.names.read().len() + self.data.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.names.write().clear();
        self.data.write().clear();
    }
}

fn retain_fresh<S: ?Sized>(map: &ConnMap<S>, now: u64, ttl: u64) -> usize {
    let mut conns = map.write();
    let before = conns.len();
    conns.retain(|_, c| now.saturating_sub(c.last_used.load(Ordering::Relaxed)) <= ttl);
    before - conns.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use tfs_common::{BlockId, Error};
    use tfs_proto::{
        ApplyLeaseRequest, BlockLocation, ClusterInfo, CreateFileRequest, Lease, NewFile,
    };

    struct Stub;

    #[async_trait]
    impl NameService for Stub {
        async fn cluster_info(&self) -> Result<ClusterInfo> {
            Ok(ClusterInfo {
                cluster_id: 1,
                server_id: 1,
            })
        }
        async fn get_block(&self, block_id: BlockId) -> Result<BlockLocation> {
            Err(Error::not_found(block_id.to_string()))
        }
        async fn create_file(&self, _req: CreateFileRequest) -> Result<NewFile> {
            Err(Error::internal("unused"))
        }
        async fn apply_lease(&self, _req: ApplyLeaseRequest) -> Result<Lease> {
            Err(Error::internal("unused"))
        }
        async fn release_lease(&self, _lease_id: u64) -> Result<()> {
            Ok(())
        }
    }

    /// Connector that counts connects and yields before answering
    #[derive(Default)]
    struct CountingConnector {
        connects: AtomicUsize,
    }

    #[async_trait]
    impl Connector for CountingConnector {
        async fn connect_name(&self, addr: &str) -> Result<Arc<dyn NameService>> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            tokio::task::yield_now().await;
            if addr.starts_with("bad") {
                return Err(Error::ConnectionFailed(addr.to_string()));
            }
            Ok(Arc::new(Stub))
        }
        async fn connect_data(&self, addr: &str) -> Result<Arc<dyn DataService>> {
            Err(Error::ConnectionFailed(addr.to_string()))
        }
    }

    #[tokio::test]
    async fn test_connection_reused() {
        let connector = Arc::new(CountingConnector::default());
        let cache = ConnectionCache::new(connector.clone(), 8);

        cache.name("ns:1").await.unwrap();
        cache.name("ns:1").await.unwrap();
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len(), 1);

        cache.invalidate("ns:1");
        cache.name("ns:1").await.unwrap();
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failed_connect_not_cached() {
        let connector = Arc::new(CountingConnector::default());
        let cache = ConnectionCache::new(connector, 8);
        assert!(cache.name("bad:1").await.is_err());
        assert!(cache.data("ds:1").await.is_err());
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_capacity_evicts_least_recently_used() {
        let connector = Arc::new(CountingConnector::default());
        let cache = ConnectionCache::new(connector, 2);
        cache.name("a").await.unwrap();
        cache.name("b").await.unwrap();
        cache.name("c").await.unwrap();
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test]
    async fn test_racing_connects_converge() {
        let connector = Arc::new(CountingConnector::default());
        let cache = Arc::new(ConnectionCache::new(connector, 8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                tokio::spawn(async move { cache.name("ns:1").await.unwrap() })
            })
            .collect();
        let mut services = Vec::new();
        for h in handles {
            services.push(h.await.unwrap());
        }
        assert_eq!(cache.len(), 1);
        let cached = cache.name("ns:1").await.unwrap();
        assert!(services.iter().all(|s| Arc::ptr_eq(s, &cached)));
    }

    #[tokio::test]
    async fn test_expire_idle() {
        let connector = Arc::new(CountingConnector::default());
        let cache = ConnectionCache::new(connector, 8);
        cache.name("a").await.unwrap();
        assert_eq!(cache.expire_idle(Duration::from_secs(60)), 0);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(cache.expire_idle(Duration::from_millis(5)), 1);
        assert!(cache.is_empty());
    }
}
