//! Behavior every client must show against a healthy cluster

mod common;

use std::sync::Arc;

use common::{NS, get, harness, put};
use tfs_common::{
    Error, FsName, OpenFlags, SeekWhence, StatMode, UnlinkAction, UnlinkType,
};

#[tokio::test]
async fn test_created_name_reopens_same_block() {
    let h = harness(2).await;
    let fd = h
        .client
        .open("", ".jpg", OpenFlags::CREATE | OpenFlags::WRITE, None)
        .await
        .unwrap();
    let name = h.client.close(fd).await.unwrap();

    let (created, suffix) = FsName::parse(&name, ".jpg").unwrap();
    assert_eq!(suffix, ".jpg");

    let fd = h.client.open(&name, ".jpg", OpenFlags::READ, None).await.unwrap();
    let stat = h.client.fstat(fd, StatMode::Normal).await.unwrap();
    assert_eq!(stat.size, 0);
    let reopened = h.client.close(fd).await.unwrap();

    let (again, _) = FsName::parse(&reopened, ".jpg").unwrap();
    assert_eq!(again.block_id, created.block_id);
    assert_eq!(again.seq_id, created.seq_id);
}

#[tokio::test]
async fn test_second_open_uses_cached_location() {
    let h = harness(2).await;
    let name = put(&h.client, b"cached", "").await;

    assert_eq!(get(&h.client, &name, "").await, b"cached");
    let lookups = h.cluster.name.get_block_calls();
    assert_eq!(get(&h.client, &name, "").await, b"cached");
    assert_eq!(h.cluster.name.get_block_calls(), lookups);
}

#[tokio::test]
async fn test_concurrent_opens_share_one_lookup() {
    let h = harness(2).await;
    let name = put(&h.client, b"shared", "").await;
    let before = h.cluster.name.get_block_calls();
    h.cluster
        .name
        .faults()
        .set_delay(std::time::Duration::from_millis(30));

    let tasks: Vec<_> = (0..16)
        .map(|_| {
            let client = Arc::clone(&h.client);
            let name = name.clone();
            tokio::spawn(async move {
                let fd = client.open(&name, "", OpenFlags::READ, None).await.unwrap();
                client.close(fd).await.unwrap();
            })
        })
        .collect();
    for task in tasks {
        task.await.unwrap();
    }
    assert_eq!(h.cluster.name.get_block_calls(), before + 1);
}

#[tokio::test]
async fn test_close_twice_fails() {
    let h = harness(1).await;
    let name = put(&h.client, b"x", "").await;
    let fd = h.client.open(&name, "", OpenFlags::READ, None).await.unwrap();
    h.client.close(fd).await.unwrap();

    let err = h.client.close(fd).await.unwrap_err();
    assert!(matches!(err, Error::InvalidFd(_)), "{err:?}");

    let never = tfs_client::Fd::from_raw(12345);
    assert!(matches!(
        h.client.close(never).await.unwrap_err(),
        Error::InvalidFd(_)
    ));
}

#[tokio::test]
async fn test_write_seek_read_round_trip() {
    let h = harness(2).await;
    let data = common::payload(20_000);
    let fd = h
        .client
        .open(
            "",
            "",
            OpenFlags::CREATE | OpenFlags::WRITE | OpenFlags::READ,
            None,
        )
        .await
        .unwrap();

    assert_eq!(h.client.write(fd, &data).await.unwrap(), data.len());
    assert_eq!(h.client.seek(fd, 0, SeekWhence::Set).await.unwrap(), 0);

    let mut buf = vec![0u8; data.len()];
    assert_eq!(h.client.read(fd, &mut buf).await.unwrap(), data.len());
    assert_eq!(buf, data);

    let name = h.client.close(fd).await.unwrap();
    assert_eq!(get(&h.client, &name, "").await, data);
}

#[tokio::test]
async fn test_positional_io_keeps_offset() {
    let h = harness(1).await;
    let fd = h
        .client
        .open("", "", OpenFlags::CREATE | OpenFlags::WRITE, None)
        .await
        .unwrap();

    h.client.write(fd, b"head").await.unwrap();
    h.client.pwrite(fd, b"tail", 100).await.unwrap();
    h.client.write(fd, b"more").await.unwrap();
    let name = h.client.close(fd).await.unwrap();

    let content = get(&h.client, &name, "").await;
    assert_eq!(content.len(), 104);
    assert_eq!(&content[..8], b"headmore");
    assert!(content[8..100].iter().all(|&b| b == 0));
    assert_eq!(&content[100..], b"tail");

    let fd = h.client.open(&name, "", OpenFlags::READ, None).await.unwrap();
    let mut buf = [0u8; 4];
    assert_eq!(h.client.pread(fd, &mut buf, 100).await.unwrap(), 4);
    assert_eq!(&buf, b"tail");
    assert_eq!(h.client.read(fd, &mut buf).await.unwrap(), 4);
    assert_eq!(&buf, b"head");
    h.client.close(fd).await.unwrap();
}

#[tokio::test]
async fn test_delete_then_undelete() {
    let h = harness(2).await;
    let name = put(&h.client, b"doomed", ".txt").await;

    let size = h
        .client
        .unlink(&name, ".txt", UnlinkAction::Delete.into())
        .await
        .unwrap();
    assert_eq!(size, 6);

    let err = h
        .client
        .open(&name, ".txt", OpenFlags::READ, None)
        .await
        .unwrap_err();
    assert!(err.is_not_found(), "{err:?}");

    // FORCE still sees the deleted file
    let fd = h
        .client
        .open(&name, ".txt", OpenFlags::READ | OpenFlags::FORCE, None)
        .await
        .unwrap();
    h.client.close(fd).await.unwrap();

    h.client
        .unlink(&name, ".txt", UnlinkType::new(UnlinkAction::Undelete))
        .await
        .unwrap();
    assert_eq!(get(&h.client, &name, ".txt").await, b"doomed");
}

#[tokio::test]
async fn test_tunable_setters_are_visible() {
    let h = harness(1).await;
    let tunables = h.client.tunables();

    tunables.set_cache_items(5000);
    assert_eq!(tunables.cache_items(), 5000);
    tunables.set_cache_items(5000);
    assert_eq!(tunables.cache_items(), 5000);

    tunables.set_client_retry_count(7);
    assert_eq!(tunables.client_retry_count(), 7);
    tunables.set_batch_timeout(-1);
    assert_eq!(tunables.batch_timeout(), -1);

    h.client.set_default_server(NS, 30, 42).await.unwrap();
    assert_eq!(tunables.cache_time(), 30);
    assert_eq!(tunables.cache_items(), 42);
}
