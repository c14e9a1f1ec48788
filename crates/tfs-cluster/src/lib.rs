//! TFS Cluster - in-memory reference name server and data servers
//!
//! A complete but volatile cluster: block allocation, leases with request
//! replay protection, file state transitions and CRC checks. Used by the
//! client's tests in-process and served over TCP by `tfs-devcluster`.
//! Nothing is persisted or replicated.

pub mod data_server;
pub mod faults;
pub mod name_server;
pub mod network;
pub mod server;
pub mod store;

pub use data_server::{DataCounters, MemoryDataServer};
pub use faults::Faults;
pub use name_server::{MemoryNameServer, NameCounters};
pub use network::{MemoryCluster, MemoryNetwork};
pub use server::{Endpoint, serve};
pub use store::{ClusterStore, FILE_HEADER_SIZE, StoreConfig};
