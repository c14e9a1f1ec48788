//! The client over real sockets against the in-memory cluster

mod common;

use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;

use common::{config, get, payload, put};
use tfs_client::{TcpConnector, TfsClient};
use tfs_cluster::{Endpoint, MemoryCluster, StoreConfig, serve};
use tfs_common::{OpenFlags, StatMode, UnlinkAction};

struct TcpCluster {
    ns_addr: String,
    cluster: Arc<MemoryCluster>,
    shutdown: watch::Sender<bool>,
}

async fn listen() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    (listener, addr)
}

async fn start(data_servers: usize) -> TcpCluster {
    let (ns_listener, ns_addr) = listen().await;
    let mut data_listeners = Vec::new();
    for _ in 0..data_servers {
        data_listeners.push(listen().await);
    }
    let data_addrs = data_listeners.iter().map(|(_, a)| a.clone()).collect();
    let cluster = Arc::new(MemoryCluster::new(
        &ns_addr,
        data_addrs,
        StoreConfig::default(),
    ));

    let (shutdown, rx) = watch::channel(false);
    let name = Endpoint {
        name: Some(cluster.name.clone()),
        data: None,
    };
    tokio::spawn(serve(ns_listener, name, rx.clone()));
    for ((listener, _), ds) in data_listeners.into_iter().zip(&cluster.data) {
        let endpoint = Endpoint {
            name: None,
            data: Some(ds.clone()),
        };
        tokio::spawn(serve(listener, endpoint, rx.clone()));
    }

    TcpCluster {
        ns_addr,
        cluster,
        shutdown,
    }
}

#[tokio::test]
async fn test_round_trip_over_tcp() {
    let tcp = start(2).await;
    let client = TfsClient::initialize(config(&tcp.ns_addr), Arc::new(TcpConnector))
        .await
        .unwrap();

    let data = payload(50_000);
    let name = put(&client, &data, ".dat").await;
    assert_eq!(get(&client, &name, ".dat").await, data);

    let fd = client
        .open(&name, ".dat", OpenFlags::STAT, None)
        .await
        .unwrap();
    let stat = client.fstat(fd, StatMode::Force).await.unwrap();
    assert_eq!(stat.size, data.len() as i64);
    client.close(fd).await.unwrap();

    client
        .unlink(&name, ".dat", UnlinkAction::Conceal.into())
        .await
        .unwrap();
    let err = client
        .open(&name, ".dat", OpenFlags::READ, None)
        .await
        .unwrap_err();
    assert!(err.is_not_found(), "{err:?}");

    assert_eq!(tcp.cluster.name.create_calls(), 1);
    client.destroy().await.unwrap();
    let _ = tcp.shutdown.send(true);
}

#[tokio::test]
async fn test_reconnects_after_server_error() {
    let tcp = start(1).await;
    let client = TfsClient::initialize(config(&tcp.ns_addr), Arc::new(TcpConnector))
        .await
        .unwrap();
    let name = put(&client, b"sturdy", "").await;

    // The server reports a reset; the client drops that connection and retries
    tcp.cluster.data[0].faults().fail_next(1);
    assert_eq!(get(&client, &name, "").await, b"sturdy");

    client.destroy().await.unwrap();
    let _ = tcp.shutdown.send(true);
}
