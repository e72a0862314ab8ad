#![allow(clippy::unwrap_used, missing_docs)]
//! Item tree operations: resolution, create/delete/rename/move, sync.

mod common;

use common::Fixture;
use std::sync::Arc;
use std::time::Duration;

use nimbus_fs::config::{CacheOptions, ConfigOptions};
use nimbus_fs::error::FsError;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn resolves_through_the_super_root() {
    let fx = Fixture::new();
    fx.api.seed_file("root", "hello.txt", b"hi");

    let file = fx
        .root
        .resolve_file("filesystems/main/hello.txt")
        .await
        .unwrap();
    assert_eq!(file.file_size().unwrap(), 2);

    // Leading slashes are tolerated; folders reject file expectations.
    assert!(fx.root.resolve("/filesystems/main").await.is_ok());
    assert!(matches!(
        fx.root.resolve_file("filesystems/main").await.unwrap_err(),
        FsError::NotFile
    ));
    assert!(matches!(
        fx.root.resolve("filesystems/nope").await.unwrap_err(),
        FsError::NotFound
    ));
    assert!(matches!(
        fx.root
            .resolve("filesystems/main/hello.txt/deeper")
            .await
            .unwrap_err(),
        FsError::NotFolder
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cross_folder_move_preserves_identity_and_bytes() {
    let fx = Fixture::new();
    let fs_root = fx.fs_root().await;

    let a = fs_root.create_folder("a").await.unwrap();
    let b = fs_root.create_folder("b").await.unwrap();

    let x = a.create_file("x").await.unwrap();
    x.write_bytes(0, b"contents of x").await.unwrap();
    x.flush_file(false).await.unwrap();

    a.move_item("x", &b, false).await.unwrap();

    assert!(matches!(
        fx.root.resolve("filesystems/main/a/x").await.unwrap_err(),
        FsError::NotFound
    ));
    let moved = fx
        .root
        .resolve_file("filesystems/main/b/x")
        .await
        .unwrap();

    assert!(Arc::ptr_eq(&moved, &x), "the moved file keeps its identity");
    assert_eq!(moved.read_bytes(0, 64).await.unwrap(), b"contents of x");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rename_preserves_contents() {
    let fx = Fixture::new();
    let fs_root = fx.fs_root().await;

    let file = fs_root.create_file("old-name").await.unwrap();
    file.write_bytes(0, b"payload").await.unwrap();
    file.flush_file(false).await.unwrap();

    fs_root.rename_item("old-name", "new-name", false).await.unwrap();

    assert!(fx.api.find("root", "old-name").is_none());
    assert!(fx.api.find("root", "new-name").is_some());

    let renamed = fx
        .root
        .resolve_file("filesystems/main/new-name")
        .await
        .unwrap();
    assert_eq!(renamed.read_bytes(0, 64).await.unwrap(), b"payload");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn delete_of_remotely_missing_item_succeeds() {
    let fx = Fixture::new();
    let fs_root = fx.fs_root().await;

    let file = fs_root.create_file("gone.txt").await.unwrap();
    file.flush_file(false).await.unwrap();

    // The server already lost it; deletion is idempotent.
    let id = fx.api.find("root", "gone.txt").unwrap();
    fx.api.remove_object(&id);

    fs_root.delete_item("gone.txt").await.unwrap();
    assert!(matches!(
        fx.root
            .resolve("filesystems/main/gone.txt")
            .await
            .unwrap_err(),
        FsError::NotFound
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn recreate_after_delete_sees_only_the_new_file() {
    let fx = Fixture::new();
    let fs_root = fx.fs_root().await;

    let first = fs_root.create_file("twice.txt").await.unwrap();
    first.write_bytes(0, b"first").await.unwrap();
    first.flush_file(false).await.unwrap();

    fs_root.delete_item("twice.txt").await.unwrap();

    let second = fs_root.create_file("twice.txt").await.unwrap();
    second.write_bytes(0, b"second").await.unwrap();
    second.flush_file(false).await.unwrap();

    let resolved = fx
        .root
        .resolve_file("filesystems/main/twice.txt")
        .await
        .unwrap();
    assert_eq!(resolved.read_bytes(0, 64).await.unwrap(), b"second");

    let id = fx.api.find("root", "twice.txt").unwrap();
    assert_eq!(fx.api.stored_data(&id).unwrap(), b"second");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn duplicate_creates_are_rejected() {
    let fx = Fixture::new();
    let fs_root = fx.fs_root().await;

    fs_root.create_file("dup").await.unwrap();
    assert!(matches!(
        fs_root.create_file("dup").await.unwrap_err(),
        FsError::Duplicate
    ));
    assert!(matches!(
        fs_root.create_folder("dup").await.unwrap_err(),
        FsError::Duplicate
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn refresh_keeps_never_uploaded_local_files()
{
    // Zero refresh interval: every resolution re-lists the folder.
    let fx = Fixture::with(
        "local",
        ConfigOptions {
            page_size: 4096,
            refresh_interval: Duration::from_secs(0),
            ..ConfigOptions::default()
        },
        CacheOptions::default(),
    );
    let fs_root = fx.fs_root().await;

    let pending = fs_root.create_file("pending.txt").await.unwrap();
    pending.write_bytes(0, b"not yet uploaded").await.unwrap();

    // A refresh happens here; the server does not list the file, but a
    // dirty local create must survive.
    let again = fx
        .root
        .resolve_file("filesystems/main/pending.txt")
        .await
        .unwrap();
    assert!(Arc::ptr_eq(&again, &pending));

    // Once flushed, a remote deletion is honored on the next refresh.
    pending.flush_file(false).await.unwrap();
    let id = fx.api.find("root", "pending.txt").unwrap();
    fx.api.remove_object(&id);

    assert!(matches!(
        fx.root
            .resolve("filesystems/main/pending.txt")
            .await
            .unwrap_err(),
        FsError::NotFound
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn synthetic_folders_reject_mutation() {
    let fx = Fixture::new();

    let filesystems = fx.root.resolve_folder("filesystems").await.unwrap();
    assert!(matches!(
        filesystems.create_file("nope").await.unwrap_err(),
        FsError::Modify
    ));
    assert!(matches!(
        fx.root.create_folder("nope").await.unwrap_err(),
        FsError::Modify
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn remote_size_change_invalidates_tail_pages() {
    let fx = Fixture::with(
        "local",
        ConfigOptions {
            page_size: 4096,
            refresh_interval: Duration::from_secs(0),
            ..ConfigOptions::default()
        },
        CacheOptions::default(),
    );
    let payload = vec![1u8; 3 * 4096];
    let id = fx.api.seed_file("root", "shrink.bin", &payload);

    let file = fx
        .root
        .resolve_file("filesystems/main/shrink.bin")
        .await
        .unwrap();
    assert_eq!(file.read_bytes(0, payload.len()).await.unwrap(), payload);

    // The server-side copy shrinks; the next listing refresh drops the
    // cached tail.
    fx.api.seed_with_id(&id, "root", "shrink.bin", &vec![1u8; 4096]);
    let refreshed = fx
        .root
        .resolve_file("filesystems/main/shrink.bin")
        .await
        .unwrap();

    assert_eq!(refreshed.file_size().unwrap(), 4096);
    assert_eq!(refreshed.read_bytes(0, payload.len()).await.unwrap().len(), 4096);
}
