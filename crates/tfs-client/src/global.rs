//! Process-wide client
//!
//! Most programs want exactly one client. These functions keep it in a
//! global slot so callers can reach it without threading an `Arc` around.
//! A destroyed client may be replaced by a fresh `initialize`.

use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use tfs_common::{ClientConfig, Error, Result};
use tfs_proto::Connector;

use crate::client::TfsClient;
use crate::logging;
use crate::remote::TcpConnector;

static SLOT: RwLock<Option<Arc<TfsClient>>> = parking_lot::const_rwlock(None);
/// Serializes initialize and destroy
static LIFECYCLE: Mutex<()> = Mutex::const_new(());

/// Initialize the global client over TCP
pub async fn initialize(config: ClientConfig) -> Result<Arc<TfsClient>> {
    initialize_with(config, Arc::new(TcpConnector)).await
}

/// Initialize the global client with a custom transport
pub async fn initialize_with(
    config: ClientConfig,
    connector: Arc<dyn Connector>,
) -> Result<Arc<TfsClient>> {
    let _lifecycle = LIFECYCLE.lock().await;
    if SLOT.read().as_ref().is_some_and(|c| c.is_live()) {
        return Err(Error::AlreadyInitialized);
    }

    if let Err(e) = logging::init(&config.log) {
        // Someone else owns the subscriber; keep theirs
        debug!(error = %e, "client logging not installed");
    }

    let client = TfsClient::initialize(config, connector).await?;
    *SLOT.write() = Some(Arc::clone(&client));
    Ok(client)
}

/// The global client
pub fn client() -> Result<Arc<TfsClient>> {
    SLOT.read()
        .as_ref()
        .filter(|c| c.is_live())
        .cloned()
        .ok_or(Error::NotInitialized)
}

/// Destroy the global client and empty the slot
pub async fn destroy() -> Result<()> {
    let _lifecycle = LIFECYCLE.lock().await;
    let client = SLOT.write().take().ok_or(Error::NotInitialized)?;
    client.destroy().await
}
