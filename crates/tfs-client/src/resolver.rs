//! Metadata resolver
//!
//! Turns a user-supplied file name into the block location that holds it.
//! Lookups go to the cluster's name server and are cached by
//! `(filename, suffix, cluster)`. Concurrent lookups of the same missing key
//! share one name-server round trip.
//!
//! Creation never touches the cache: every `create` asks the name server for
//! a fresh block/file id and a write lease.

use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::OnceCell;
use tracing::{debug, info};

use tfs_common::{BlockId, Error, FileId, FsName, NameKind, Result, suffix_hash};
use tfs_proto::{ApplyLeaseRequest, ClusterInfo, CreateFileRequest, Lease, NameService};

use crate::pool::ConnectionCache;
use crate::retry::{RetryPolicy, with_retry};
use crate::stats::ClientStats;
use crate::tunables::Tunables;

/// Cache key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResolveKey {
    /// Canonical 18-character name
    pub filename: String,
    /// Effective suffix
    pub suffix: String,
    /// Name server address
    pub cluster: String,
}

/// Where a file lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    pub cluster: String,
    pub name: FsName,
    /// Data server addresses, primary first
    pub servers: Vec<String>,
    pub version: u32,
    pub suffix: String,
}

impl Location {
    #[must_use]
    pub const fn block_id(&self) -> BlockId {
        self.name.block_id
    }

    #[must_use]
    pub const fn file_id(&self) -> FileId {
        self.name.file_id()
    }

    /// Replica to use for the given attempt
    #[must_use]
    pub fn server(&self, attempt: u32) -> &str {
        if self.servers.is_empty() {
            return "";
        }
        &self.servers[attempt as usize % self.servers.len()]
    }
}

/// A newly allocated file and the lease to write it under
#[derive(Debug, Clone)]
pub struct Created {
    pub location: Location,
    pub lease_id: u64,
}

struct CacheEntry {
    location: Location,
    inserted: Instant,
    generation: u64,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<ResolveKey, CacheEntry>,
    /// Insertion order; entries replaced since are skipped by generation
    order: VecDeque<(ResolveKey, u64)>,
    next_generation: u64,
}

impl CacheState {
    fn is_current(&self, key: &ResolveKey, generation: u64) -> bool {
        self.entries
            .get(key)
            .is_some_and(|e| e.generation == generation)
    }

    fn compact(&mut self) {
        if self.order.len() > self.entries.len() * 2 + 16 {
            let entries = &self.entries;
            self.order
                .retain(|(k, g)| entries.get(k).is_some_and(|e| e.generation == *g));
        }
    }
}

/// Location cache bounded by age and count, evicting oldest first
#[derive(Default)]
pub struct ResolverCache {
    state: RwLock<CacheState>,
}

impl ResolverCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached location younger than `ttl`. A `None` ttl disables the cache.
    pub fn get(&self, key: &ResolveKey, ttl: Option<Duration>) -> Option<Location> {
        let ttl = ttl?;
        let state = self.state.read();
        state
            .entries
            .get(key)
            .filter(|e| e.inserted.elapsed() <= ttl)
            .map(|e| e.location.clone())
    }

    pub fn insert(&self, key: ResolveKey, location: Location, capacity: usize) {
        if capacity == 0 {
            return;
        }
        let mut guard = self.state.write();
        let state = &mut *guard;

        let generation = state.next_generation;
        state.next_generation += 1;
        state.entries.insert(
            key.clone(),
            CacheEntry {
                location,
                inserted: Instant::now(),
                generation,
            },
        );
        state.order.push_back((key, generation));

        while state.entries.len() > capacity {
            let Some((oldest, g)) = state.order.pop_front() else {
                break;
            };
            if state.is_current(&oldest, g) {
                state.entries.remove(&oldest);
            }
        }
        state.compact();
    }

    /// Drop entries older than `ttl`; everything goes when `ttl` is `None`.
    /// Returns how many entries were removed.
    pub fn expire(&self, ttl: Option<Duration>) -> usize {
        let mut guard = self.state.write();
        let state = &mut *guard;
        let Some(ttl) = ttl else {
            let n = state.entries.len();
            state.entries.clear();
            state.order.clear();
            return n;
        };

        let mut removed = 0;
        while let Some((key, g)) = state.order.front().cloned() {
            match state.entries.get(&key) {
                Some(e) if e.generation == g && e.inserted.elapsed() <= ttl => break,
                Some(e) if e.generation == g => {
                    state.entries.remove(&key);
                    removed += 1;
                }
                // Superseded or invalidated
                _ => {}
            }
            state.order.pop_front();
        }
        removed
    }

    pub fn invalidate(&self, key: &ResolveKey) -> bool {
        self.state.write().entries.remove(key).is_some()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.state.read().entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut state = self.state.write();
        state.entries.clear();
        state.order.clear();
    }
}

type Flight = Arc<OnceCell<Result<Location>>>;

/// Name resolution and the other name-server requests a client makes
pub struct Resolver {
    pool: Arc<ConnectionCache>,
    tunables: Arc<Tunables>,
    stats: Arc<ClientStats>,
    client_id: String,
    cache: ResolverCache,
    inflight: DashMap<ResolveKey, Flight>,
    clusters: RwLock<HashMap<String, ClusterInfo>>,
}

impl Resolver {
    pub fn new(
        pool: Arc<ConnectionCache>,
        tunables: Arc<Tunables>,
        stats: Arc<ClientStats>,
        client_id: impl Into<String>,
    ) -> Self {
        Self {
            pool,
            tunables,
            stats,
            client_id: client_id.into(),
            cache: ResolverCache::new(),
            inflight: DashMap::new(),
            clusters: RwLock::new(HashMap::new()),
        }
    }

    #[must_use]
    pub const fn cache(&self) -> &ResolverCache {
        &self.cache
    }

    /// Run a name-server request against `cluster` under the retry policy.
    /// A connection that failed is dropped so the next attempt reconnects.
    async fn call<T, F, Fut>(
        &self,
        cluster: &str,
        op: &str,
        policy: RetryPolicy,
        f: F,
    ) -> Result<T>
    where
        F: Fn(Arc<dyn NameService>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let f = &f;
        let result = with_retry(&self.tunables, &self.stats, op, policy, move |_| async move {
            let ns = self.pool.name(cluster).await?;
            let result = f(ns).await;
            if let Err(e) = &result
                && e.is_connection_error()
            {
                self.pool.invalidate(cluster);
            }
            result
        })
        .await;

        result.map_err(|e| {
            if e.is_connection_error() {
                Error::ClusterUnreachable(format!("{cluster}: {e}"))
            } else {
                e
            }
        })
    }

    /// Identity of the cluster at `cluster`, fetched once per address
    pub async fn cluster_info(&self, cluster: &str) -> Result<ClusterInfo> {
        if let Some(info) = self.clusters.read().get(cluster) {
            return Ok(*info);
        }
        let info = self
            .call(cluster, "cluster_info", RetryPolicy::Retry, |ns| async move {
                ns.cluster_info().await
            })
            .await?;
        info!(
            cluster,
            cluster_id = info.cluster_id,
            server_id = info.server_id,
            "cluster identified"
        );
        self.clusters.write().insert(cluster.to_string(), info);
        Ok(info)
    }

    /// Resolve an existing file
    pub async fn resolve(&self, filename: &str, suffix: &str, cluster: &str) -> Result<Location> {
        let (name, suffix) = FsName::parse(filename, suffix)?;
        let info = self.cluster_info(cluster).await?;
        if name.cluster_id != info.cluster_id {
            return Err(Error::InvalidFileName(format!(
                "{filename} belongs to cluster {}, {cluster} is cluster {}",
                name.cluster_id, info.cluster_id
            )));
        }

        let key = ResolveKey {
            filename: name.encode(),
            suffix,
            cluster: cluster.to_string(),
        };
        if let Some(location) = self.cache.get(&key, self.tunables.cache_ttl()) {
            ClientStats::incr(&self.stats.cache_hits);
            return Ok(location);
        }

        let flight: Flight = Arc::clone(&self.inflight.entry(key.clone()).or_default());
        let result = flight
            .get_or_init(|| self.lookup(&key, name))
            .await
            .clone();
        self.inflight
            .remove_if(&key, |_, current| Arc::ptr_eq(current, &flight));
        result
    }

    async fn lookup(&self, key: &ResolveKey, name: FsName) -> Result<Location> {
        // A flight that just landed may have filled the cache
        if let Some(location) = self.cache.get(key, self.tunables.cache_ttl()) {
            ClientStats::incr(&self.stats.cache_hits);
            return Ok(location);
        }
        ClientStats::incr(&self.stats.cache_misses);

        let block_id = name.block_id;
        let block = self
            .call(&key.cluster, "get_block", RetryPolicy::Retry, |ns| async move {
                ns.get_block(block_id).await
            })
            .await?;
        if block.servers.is_empty() {
            return Err(Error::not_found(format!("block {block_id} has no data servers")));
        }

        let location = Location {
            cluster: key.cluster.clone(),
            name,
            servers: block.servers,
            version: block.version,
            suffix: key.suffix.clone(),
        };
        debug!(file = %key.filename, %block_id, servers = ?location.servers, "resolved");
        self.cache
            .insert(key.clone(), location.clone(), self.tunables.cache_capacity());
        Ok(location)
    }

    /// Allocate a new file on `cluster`.
    ///
    /// Not retried: a lost reply would leave an allocation we know nothing
    /// about, and a second request would make another.
    pub async fn create(
        &self,
        cluster: &str,
        suffix: &str,
        large: bool,
        new_block: bool,
    ) -> Result<Created> {
        let info = self.cluster_info(cluster).await?;
        let req = CreateFileRequest {
            large,
            new_block,
            suffix_hash: suffix_hash(suffix),
            client_id: self.client_id.clone(),
        };
        let req = &req;
        let created = self
            .call(cluster, "create_file", RetryPolicy::Once, |ns| async move {
                ns.create_file(req.clone()).await
            })
            .await?;

        let kind = if large { NameKind::Large } else { NameKind::Small };
        let name = FsName::new(kind, info.cluster_id, created.block_id, created.file_id);
        debug!(file = %name, lease_id = created.lease_id, "created");
        Ok(Created {
            location: Location {
                cluster: cluster.to_string(),
                name,
                servers: created.servers,
                version: created.version,
                suffix: suffix.to_string(),
            },
            lease_id: created.lease_id,
        })
    }

    /// Write lease on an existing file
    pub async fn apply_lease(&self, location: &Location) -> Result<Lease> {
        let req = ApplyLeaseRequest {
            block_id: location.block_id(),
            file_id: location.file_id(),
            client_id: self.client_id.clone(),
        };
        let req = &req;
        self.call(&location.cluster, "apply_lease", RetryPolicy::Retry, |ns| async move {
            ns.apply_lease(req.clone()).await
        })
        .await
    }

    pub async fn release_lease(&self, cluster: &str, lease_id: u64) -> Result<()> {
        self.call(cluster, "release_lease", RetryPolicy::Retry, |ns| async move {
            ns.release_lease(lease_id).await
        })
        .await
    }

    /// Forget a cached location, e.g. after its servers stopped answering
    pub fn invalidate(&self, location: &Location) {
        let key = ResolveKey {
            filename: location.name.encode(),
            suffix: location.suffix.clone(),
            cluster: location.cluster.clone(),
        };
        if self.cache.invalidate(&key) {
            debug!(file = %key.filename, "invalidated cached location");
        }
    }

    /// Drop expired cache entries. Returns how many went.
    pub fn expire(&self) -> usize {
        self.cache.expire(self.tunables.cache_ttl())
    }

    pub fn clear(&self) {
        self.cache.clear();
        self.clusters.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tfs_cluster::{MemoryCluster, MemoryNetwork};

    fn setup() -> (Arc<MemoryCluster>, Arc<Resolver>) {
        let net = MemoryNetwork::new();
        let cluster = net.add_cluster("ns:1", 1, 2);
        let pool = Arc::new(ConnectionCache::new(net, 16));
        let resolver = Resolver::new(
            pool,
            Arc::new(Tunables::default()),
            Arc::new(ClientStats::default()),
            "test-client",
        );
        (cluster, Arc::new(resolver))
    }

    async fn committed(cluster: &MemoryCluster, resolver: &Resolver) -> String {
        let created = resolver.create("ns:1", "", false, false).await.unwrap();
        let loc = &created.location;
        cluster
            .store
            .commit(&tfs_proto::CommitRequest {
                block_id: loc.block_id(),
                file_id: loc.file_id(),
                lease_id: Some(created.lease_id),
                seq: 1,
                size: 0,
                crc: None,
                sync_log: true,
            })
            .unwrap();
        loc.name.encode()
    }

    fn key(name: &str) -> ResolveKey {
        ResolveKey {
            filename: name.into(),
            suffix: String::new(),
            cluster: "ns:1".into(),
        }
    }

    fn location() -> Location {
        Location {
            cluster: "ns:1".into(),
            name: FsName::new(NameKind::Small, 1, BlockId(1), FileId(1)),
            servers: vec!["ds".into()],
            version: 1,
            suffix: String::new(),
        }
    }

    #[tokio::test]
    async fn test_second_resolve_hits_cache() {
        let (cluster, resolver) = setup();
        let name = committed(&cluster, &resolver).await;

        let first = resolver.resolve(&name, "", "ns:1").await.unwrap();
        let second = resolver.resolve(&name, "", "ns:1").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(cluster.name.get_block_calls(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_resolves_share_one_lookup() {
        let (cluster, resolver) = setup();
        let name = committed(&cluster, &resolver).await;
        cluster
            .name
            .faults()
            .set_delay(Duration::from_millis(30));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let resolver = Arc::clone(&resolver);
                let name = name.clone();
                tokio::spawn(async move { resolver.resolve(&name, "", "ns:1").await })
            })
            .collect();
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert_eq!(cluster.name.get_block_calls(), 1);
        assert!(resolver.inflight.is_empty());
    }

    #[tokio::test]
    async fn test_create_is_not_cached() {
        let (cluster, resolver) = setup();
        let a = resolver.create("ns:1", ".jpg", false, false).await.unwrap();
        let b = resolver.create("ns:1", ".jpg", false, false).await.unwrap();
        assert_ne!(a.location.name, b.location.name);
        assert_eq!(a.location.name.cluster_id, 1);
        assert_eq!(cluster.name.create_calls(), 2);
        assert!(resolver.cache().is_empty());
    }

    #[tokio::test]
    async fn test_disabled_cache_always_asks() {
        let (cluster, resolver) = setup();
        let name = committed(&cluster, &resolver).await;
        resolver.tunables.set_cache_time(0);

        resolver.resolve(&name, "", "ns:1").await.unwrap();
        resolver.resolve(&name, "", "ns:1").await.unwrap();
        assert_eq!(cluster.name.get_block_calls(), 2);
    }

    #[tokio::test]
    async fn test_wrong_cluster_digit() {
        let (_cluster, resolver) = setup();
        let foreign = FsName::new(NameKind::Small, 7, BlockId(1), FileId(1)).encode();
        let err = resolver.resolve(&foreign, "", "ns:1").await.unwrap_err();
        assert!(matches!(err, Error::InvalidFileName(_)));
    }

    #[tokio::test]
    async fn test_unreachable_cluster() {
        let (_cluster, resolver) = setup();
        resolver.tunables.set_client_retry_count(1);
        let err = resolver.cluster_info("nowhere:1").await.unwrap_err();
        assert!(matches!(err, Error::ClusterUnreachable(_)));
    }

    #[test]
    fn test_cache_capacity_evicts_oldest() {
        let cache = ResolverCache::new();
        cache.insert(key("a"), location(), 2);
        cache.insert(key("b"), location(), 2);
        // Refreshing "a" makes "b" the oldest
        cache.insert(key("a"), location(), 2);
        cache.insert(key("c"), location(), 2);

        let ttl = Some(Duration::from_secs(60));
        assert!(cache.get(&key("a"), ttl).is_some());
        assert!(cache.get(&key("b"), ttl).is_none());
        assert!(cache.get(&key("c"), ttl).is_some());
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_cache_expire() {
        let cache = ResolverCache::new();
        cache.insert(key("a"), location(), 8);
        std::thread::sleep(Duration::from_millis(20));
        cache.insert(key("b"), location(), 8);

        assert!(cache.get(&key("a"), Some(Duration::from_millis(10))).is_none());
        assert_eq!(cache.expire(Some(Duration::from_millis(10))), 1);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.expire(None), 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_cache_zero_capacity() {
        let cache = ResolverCache::new();
        cache.insert(key("a"), location(), 0);
        assert!(cache.is_empty());
    }
}
