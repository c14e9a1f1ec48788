//! Client handle
//!
//! [`TfsClient`] owns everything a process needs to talk to TFS clusters:
//! the connection cache, the metadata resolver, the descriptor table, the
//! orphan queue and the background maintenance task. Descriptor operations
//! live in `dispatch`; this module covers setup, teardown and the
//! process-wide knobs.

use parking_lot::{Mutex, RwLock};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{info, warn};

use tfs_common::{ClientConfig, Error, Result};
use tfs_proto::Connector;

use crate::fd_table::FdTable;
use crate::file::Descriptor;
use crate::gc::GcQueue;
use crate::io::DataPath;
use crate::logging;
use crate::maintenance::{self, MaintenanceHandle};
use crate::pool::ConnectionCache;
use crate::resolver::Resolver;
use crate::stats::ClientStats;
use crate::tunables::Tunables;

pub struct TfsClient {
    pub(crate) client_id: String,
    pub(crate) default_server: RwLock<String>,
    pub(crate) tunables: Arc<Tunables>,
    pub(crate) stats: Arc<ClientStats>,
    pub(crate) pool: Arc<ConnectionCache>,
    pub(crate) resolver: Resolver,
    pub(crate) data: DataPath,
    pub(crate) fds: FdTable<Descriptor>,
    pub(crate) gc: GcQueue,
    live: AtomicBool,
    pub(crate) maintenance: Mutex<Option<MaintenanceHandle>>,
}

impl TfsClient {
    /// Build a client and check that the default name server answers.
    ///
    /// Starts the maintenance task when `config.start_background` is set.
    pub async fn initialize(
        config: ClientConfig,
        connector: Arc<dyn Connector>,
    ) -> Result<Arc<Self>> {
        if config.ns_addr.is_empty() {
            return Err(Error::Configuration("name server address is empty".into()));
        }

        let tunables = Arc::new(Tunables::from_config(&config));
        let stats = Arc::new(ClientStats::default());
        let pool = Arc::new(ConnectionCache::new(connector, config.max_connections));
        let client_id = uuid::Uuid::new_v4().to_string();
        let resolver = Resolver::new(
            Arc::clone(&pool),
            Arc::clone(&tunables),
            Arc::clone(&stats),
            client_id.clone(),
        );
        let data = DataPath::new(Arc::clone(&pool), Arc::clone(&tunables), Arc::clone(&stats));

        let cluster = resolver.cluster_info(&config.ns_addr).await?;

        let client = Arc::new(Self {
            client_id,
            default_server: RwLock::new(config.ns_addr.clone()),
            tunables,
            stats,
            pool,
            resolver,
            data,
            fds: FdTable::new(config.max_open_files),
            gc: GcQueue::default(),
            live: AtomicBool::new(true),
            maintenance: Mutex::new(None),
        });

        if config.start_background {
            *client.maintenance.lock() = Some(maintenance::spawn(&client));
        }

        info!(
            ns_addr = %config.ns_addr,
            cluster_id = cluster.cluster_id,
            client_id = %client.client_id,
            background = config.start_background,
            "client initialized"
        );
        Ok(client)
    }

    /// Switch the default cluster and its cache settings.
    ///
    /// The new server must answer before the switch takes effect.
    pub async fn set_default_server(
        &self,
        ns_addr: &str,
        cache_time_secs: i64,
        cache_items: i64,
    ) -> Result<()> {
        self.ensure_live()?;
        if ns_addr.is_empty() {
            return Err(Error::invalid_argument("name server address is empty"));
        }
        self.resolver.cluster_info(ns_addr).await?;

        self.tunables.set_cache_time(cache_time_secs);
        self.tunables.set_cache_items(cache_items);
        *self.default_server.write() = ns_addr.to_string();
        info!(ns_addr, cache_time_secs, cache_items, "default server changed");
        Ok(())
    }

    /// Stop background work and close everything.
    ///
    /// Open descriptors are dropped without committing. Every later call
    /// fails with `NotInitialized`.
    pub async fn destroy(&self) -> Result<()> {
        if !self.live.swap(false, Ordering::AcqRel) {
            return Err(Error::NotInitialized);
        }

        let handle = self.maintenance.lock().take();
        if let Some(handle) = handle {
            handle.shutdown().await;
        }

        let open = self.fds.drain();
        if !open.is_empty() {
            warn!(count = open.len(), "dropping descriptors still open at destroy");
        }
        for desc in open {
            let mut file = desc.lock().await;
            self.abandon(&mut file).await;
        }

        self.pool.clear();
        self.resolver.clear();
        info!(stats = ?self.stats.snapshot(), "client destroyed");
        Ok(())
    }

    pub(crate) fn ensure_live(&self) -> Result<()> {
        if self.live.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(Error::NotInitialized)
        }
    }

    #[must_use]
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    /// Address of the default name server
    #[must_use]
    pub fn default_server(&self) -> String {
        self.default_server.read().clone()
    }

    /// Cluster id of the default cluster
    pub async fn cluster_id(&self) -> Result<u8> {
        self.ensure_live()?;
        let ns_addr = self.default_server();
        Ok(self.resolver.cluster_info(&ns_addr).await?.cluster_id)
    }

    /// Server id of the default cluster's name server
    pub async fn server_id(&self) -> Result<u64> {
        self.ensure_live()?;
        let ns_addr = self.default_server();
        Ok(self.resolver.cluster_info(&ns_addr).await?.server_id)
    }

    #[must_use]
    pub fn tunables(&self) -> &Tunables {
        &self.tunables
    }

    #[must_use]
    pub fn stats(&self) -> &ClientStats {
        &self.stats
    }

    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Number of open descriptors
    #[must_use]
    pub fn open_files(&self) -> usize {
        self.fds.len()
    }

    /// Orphan segments waiting for collection
    #[must_use]
    pub fn pending_orphans(&self) -> usize {
        self.gc.len()
    }

    /// Change the log filter. An empty level is ignored.
    pub fn set_log_level(&self, level: &str) -> Result<()> {
        logging::set_level(level)
    }

    /// Send logs to `path`. An empty path is ignored.
    pub fn set_log_file(&self, path: &Path) -> Result<()> {
        logging::set_file(path)
    }
}

impl Drop for TfsClient {
    fn drop(&mut self) {
        if let Some(handle) = self.maintenance.get_mut().take() {
            handle.abort();
        }
    }
}
