//! Retries, lost replies, unreachable servers and lifecycle errors

mod common;

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use common::{NS, config, get, harness, put};
use tfs_client::TfsClient;
use tfs_common::{Error, OpenFlags, OptionFlag, SeekWhence, StatMode, UnlinkAction};

#[tokio::test]
async fn test_lost_write_reply_is_applied_once() {
    let h = harness(1).await;
    let ds = &h.cluster.data[0];
    let fd = h
        .client
        .open("", "", OpenFlags::CREATE | OpenFlags::WRITE, None)
        .await
        .unwrap();
    h.client.write(fd, b"exactly once").await.unwrap();

    ds.faults().drop_replies(1);
    let name = h.client.close(fd).await.unwrap();

    let counters = ds.counters();
    assert_eq!(counters.writes.load(Ordering::SeqCst), 2, "write was resent");
    assert_eq!(counters.applied_writes.load(Ordering::SeqCst), 1);
    assert!(h.client.stats().snapshot().retries >= 1);
    assert_eq!(get(&h.client, &name, "").await, b"exactly once");
}

#[tokio::test]
async fn test_lost_commit_reply_is_applied_once() {
    let h = harness(1).await;
    let ds = &h.cluster.data[0];
    let fd = h
        .client
        .open("", "", OpenFlags::CREATE | OpenFlags::WRITE, None)
        .await
        .unwrap();
    h.client.write(fd, b"commit me").await.unwrap();
    // A leased stat sends the buffered write first
    h.client.fstat(fd, StatMode::Force).await.unwrap();

    ds.faults().drop_replies(1);
    let name = h.client.close(fd).await.unwrap();
    let counters = ds.counters();
    assert_eq!(counters.commits.load(Ordering::SeqCst), 2, "commit was resent");
    assert_eq!(counters.applied_commits.load(Ordering::SeqCst), 1);
    assert_eq!(get(&h.client, &name, "").await, b"commit me");
}

#[tokio::test]
async fn test_unleased_write_is_not_retried() {
    let h = harness(1).await;
    let ds = &h.cluster.data[0];
    let name = put(&h.client, b"original", "").await;

    let fd = h
        .client
        .open(&name, "", OpenFlags::WRITE | OpenFlags::NOLEASE, None)
        .await
        .unwrap();
    h.client.write(fd, b"ORIG").await.unwrap();

    let writes = ds.counters().writes.load(Ordering::SeqCst);
    ds.faults().drop_replies(1);
    let err = h.client.close(fd).await.unwrap_err();
    assert!(matches!(err, Error::FlushFailed(_)), "{err:?}");
    assert_eq!(
        ds.counters().writes.load(Ordering::SeqCst),
        writes + 1,
        "sent exactly once"
    );
}

#[tokio::test]
async fn test_update_in_place_under_lease() {
    let h = harness(2).await;
    let name = put(&h.client, b"hello world", "").await;

    let fd = h.client.open(&name, "", OpenFlags::WRITE, None).await.unwrap();
    h.client.write(fd, b"HELLO world").await.unwrap();
    assert_eq!(h.client.close(fd).await.unwrap(), name);
    assert_eq!(get(&h.client, &name, "").await, b"HELLO world");

    // Opened for writing, nothing written: the file stays as it is
    let fd = h.client.open(&name, "", OpenFlags::WRITE, None).await.unwrap();
    h.client.close(fd).await.unwrap();
    assert_eq!(get(&h.client, &name, "").await, b"HELLO world");
}

#[tokio::test]
async fn test_read_write_descriptor_sees_existing_size() {
    let h = harness(1).await;
    let name = put(&h.client, b"hello world", "").await;

    let fd = h
        .client
        .open(&name, "", OpenFlags::WRITE | OpenFlags::READ, None)
        .await
        .unwrap();
    assert_eq!(h.client.get_file_length(fd).await.unwrap(), 11);
    assert_eq!(h.client.seek(fd, 0, SeekWhence::End).await.unwrap(), 11);

    h.client.seek(fd, 0, SeekWhence::Set).await.unwrap();
    assert_eq!(common::read_all(&h.client, fd).await, b"hello world");

    h.client.seek(fd, 0, SeekWhence::Set).await.unwrap();
    h.client.write(fd, b"HI").await.unwrap();
    assert_eq!(h.client.get_file_length(fd).await.unwrap(), 11);
    assert_eq!(
        h.client.fstat(fd, StatMode::Force).await.unwrap().size,
        11
    );

    // Writing past the end grows the file
    h.client.pwrite(fd, b"!", 11).await.unwrap();
    assert_eq!(h.client.get_file_length(fd).await.unwrap(), 12);

    assert_eq!(h.client.close(fd).await.unwrap(), name);
    assert_eq!(get(&h.client, &name, "").await, b"HIllo world!");
}

#[tokio::test]
async fn test_read_fails_over_to_replica() {
    let h = harness(2).await;
    let name = put(&h.client, b"replicated", "").await;

    // Every server refuses once; the third attempt gets through
    for ds in &h.cluster.data {
        ds.faults().fail_next(1);
    }
    assert_eq!(get(&h.client, &name, "").await, b"replicated");
}

#[tokio::test]
async fn test_aborted_small_write_discards_data() {
    let h = harness(1).await;
    let fd = h
        .client
        .open("", "", OpenFlags::CREATE | OpenFlags::WRITE, None)
        .await
        .unwrap();
    h.client.write(fd, b"never stored").await.unwrap();
    h.client
        .set_option_flag(fd, OptionFlag::CloseFlagWriteDataFailed)
        .await
        .unwrap();
    let err = h.client.close(fd).await.unwrap_err();
    assert!(matches!(err, Error::WriteAborted));
    assert_eq!(h.cluster.total(|ds| &ds.counters().applied_commits), 0);
}

#[tokio::test]
async fn test_unreachable_cluster() {
    let network = tfs_cluster::MemoryNetwork::new();
    let err = TfsClient::initialize(config("nowhere:1"), network)
        .await
        .err()
        .unwrap();
    assert!(matches!(err, Error::ClusterUnreachable(_)), "{err:?}");
}

#[tokio::test]
async fn test_slow_server_times_out() {
    let mut cfg = config(NS);
    cfg.wait_timeout_ms = 50;
    cfg.client_retry_count = 2;
    let h = common::harness_with(1, cfg).await;
    let name = put(&h.client, b"slow", "").await;

    h.cluster.data[0]
        .faults()
        .set_delay(Duration::from_millis(200));
    let err = h
        .client
        .open(&name, "", OpenFlags::READ, None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Timeout(_)), "{err:?}");
    assert_eq!(h.client.open_files(), 0, "failed open frees its slot");
}

#[tokio::test]
async fn test_two_clusters() {
    let network = tfs_cluster::MemoryNetwork::new();
    let _a = network.add_cluster(NS, 1, 1);
    let b = network.add_cluster("ns-b:8108", 2, 1);
    let client = TfsClient::initialize(config(NS), network.clone())
        .await
        .unwrap();

    let fd = client
        .open_with_cluster(
            "",
            "",
            OpenFlags::CREATE | OpenFlags::WRITE,
            None,
            "ns-b:8108",
        )
        .await
        .unwrap();
    client.write(fd, b"on b").await.unwrap();
    let name = client.close(fd).await.unwrap();
    assert!(name.starts_with("T2"), "{name}");
    assert_eq!(b.name.create_calls(), 1);

    // Cluster a does not own the name
    let err = client.open(&name, "", OpenFlags::READ, None).await.unwrap_err();
    assert!(matches!(err, Error::InvalidFileName(_)), "{err:?}");

    let fd = client
        .open_with_cluster(&name, "", OpenFlags::STAT, None, "ns-b:8108")
        .await
        .unwrap();
    assert_eq!(client.fstat(fd, StatMode::Force).await.unwrap().size, 4);
    client.close(fd).await.unwrap();

    client.set_default_server("ns-b:8108", 60, 100).await.unwrap();
    assert_eq!(client.cluster_id().await.unwrap(), 2);
    assert_eq!(get(&client, &name, "").await, b"on b");
}

#[tokio::test]
async fn test_destroy_invalidates_everything() {
    let h = harness(1).await;
    let name = put(&h.client, b"bye", "").await;
    let fd = h.client.open(&name, "", OpenFlags::READ, None).await.unwrap();
    let writer = h
        .client
        .open("", "", OpenFlags::CREATE | OpenFlags::WRITE, None)
        .await
        .unwrap();
    h.client.write(writer, b"unsaved").await.unwrap();

    h.client.destroy().await.unwrap();
    assert!(matches!(
        h.client.close(fd).await.unwrap_err(),
        Error::NotInitialized
    ));
    assert!(matches!(
        h.client.open(&name, "", OpenFlags::READ, None).await.unwrap_err(),
        Error::NotInitialized
    ));
    assert!(matches!(
        h.client.unlink(&name, "", UnlinkAction::Delete.into()).await.unwrap_err(),
        Error::NotInitialized
    ));
    assert!(matches!(h.client.destroy().await, Err(Error::NotInitialized)));
    assert_eq!(h.client.open_files(), 0);
    assert_eq!(h.cluster.total(|ds| &ds.counters().applied_commits), 1);
}

#[tokio::test]
async fn test_stale_descriptor_does_not_reach_new_file() {
    let h = harness(1).await;
    let a = put(&h.client, b"first", "").await;
    let b = put(&h.client, b"second", "").await;

    let old = h.client.open(&a, "", OpenFlags::READ, None).await.unwrap();
    h.client.close(old).await.unwrap();
    let new = h.client.open(&b, "", OpenFlags::READ, None).await.unwrap();
    assert_ne!(old, new);

    let mut buf = [0u8; 16];
    assert!(matches!(
        h.client.read(old, &mut buf).await.unwrap_err(),
        Error::InvalidFd(_)
    ));
    assert_eq!(h.client.read(new, &mut buf).await.unwrap(), 6);
    h.client.close(new).await.unwrap();
}

#[tokio::test]
async fn test_read_only_descriptor_rejects_write() {
    let h = harness(1).await;
    let name = put(&h.client, b"ro", "").await;
    let fd = h.client.open(&name, "", OpenFlags::READ, None).await.unwrap();
    assert!(matches!(
        h.client.write(fd, b"x").await.unwrap_err(),
        Error::NotPermitted(_)
    ));
    h.client.close(fd).await.unwrap();

    let err = h
        .client
        .open(&name, "", OpenFlags::READ | OpenFlags::STAT, None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidFlags(_)));
    assert_eq!(h.client.open_files(), 0);
}

#[tokio::test]
async fn test_global_client_lifecycle() {
    let network = tfs_cluster::MemoryNetwork::new();
    network.add_cluster(NS, 1, 1);
    let connector: Arc<dyn tfs_proto::Connector> = network;

    assert!(matches!(
        tfs_client::global::client(),
        Err(Error::NotInitialized)
    ));
    tfs_client::global::initialize_with(config(NS), Arc::clone(&connector))
        .await
        .unwrap();
    assert!(matches!(
        tfs_client::global::initialize_with(config(NS), Arc::clone(&connector)).await,
        Err(Error::AlreadyInitialized)
    ));

    let client = tfs_client::global::client().unwrap();
    let name = put(&client, b"global", "").await;
    tfs_client::global::destroy().await.unwrap();
    assert!(matches!(
        tfs_client::global::client(),
        Err(Error::NotInitialized)
    ));

    // A destroyed client can be replaced
    let client = tfs_client::global::initialize_with(config(NS), connector)
        .await
        .unwrap();
    assert_eq!(get(&client, &name, "").await, b"global");
    tfs_client::global::destroy().await.unwrap();
}
