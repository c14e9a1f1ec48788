#![allow(dead_code)]

use std::sync::Arc;

use tfs_client::{Fd, TfsClient};
use tfs_cluster::{MemoryCluster, MemoryNetwork};
use tfs_common::{ClientConfig, OpenFlags};

pub const NS: &str = "ns-a:8108";

pub struct Harness {
    pub network: Arc<MemoryNetwork>,
    pub cluster: Arc<MemoryCluster>,
    pub client: Arc<TfsClient>,
}

/// Test config: no background task, short timeouts
pub fn config(ns_addr: &str) -> ClientConfig {
    let mut config = ClientConfig::with_server(ns_addr, 60, 1_000);
    config.start_background = false;
    config.wait_timeout_ms = 500;
    config.segment_size = 8 * 1024;
    config.batch_count = 2;
    config
}

/// One cluster with `data_servers` data servers and a client on it
pub async fn harness(data_servers: usize) -> Harness {
    harness_with(data_servers, config(NS)).await
}

pub async fn harness_with(data_servers: usize, config: ClientConfig) -> Harness {
    let network = MemoryNetwork::new();
    let cluster = network.add_cluster(NS, 1, data_servers);
    let client = TfsClient::initialize(config, network.clone())
        .await
        .unwrap();
    Harness {
        network,
        cluster,
        client,
    }
}

/// Store `data` as a new small file and return its name
pub async fn put(client: &TfsClient, data: &[u8], suffix: &str) -> String {
    let fd = client
        .open("", suffix, OpenFlags::CREATE | OpenFlags::WRITE, None)
        .await
        .unwrap();
    assert_eq!(client.write(fd, data).await.unwrap(), data.len());
    client.close(fd).await.unwrap()
}

/// Read a whole file through a fresh descriptor
pub async fn get(client: &TfsClient, name: &str, suffix: &str) -> Vec<u8> {
    let fd = client
        .open(name, suffix, OpenFlags::READ, None)
        .await
        .unwrap();
    let out = read_all(client, fd).await;
    client.close(fd).await.unwrap();
    out
}

pub async fn read_all(client: &TfsClient, fd: Fd) -> Vec<u8> {
    let mut out = Vec::new();
    let mut buf = vec![0u8; 4096];
    loop {
        let n = client.read(fd, &mut buf).await.unwrap();
        if n == 0 {
            return out;
        }
        out.extend_from_slice(&buf[..n]);
    }
}

pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|_| rand::random::<u8>()).collect()
}
