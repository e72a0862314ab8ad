#![allow(clippy::unwrap_used, missing_docs)]
//! Write-mode enforcement: append-only and whole-file storages,
//! read-only mounts, and memory cache mode.

mod common;

use common::Fixture;

use nimbus_fs::config::{CacheMode, CacheOptions, ConfigOptions};
use nimbus_fs::error::FsError;

const PAGE: u64 = 4096;

fn options() -> ConfigOptions {
    ConfigOptions {
        page_size: PAGE as usize,
        ..ConfigOptions::default()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn append_storage_rejects_interior_writes() {
    let fx = Fixture::with("FTP", options(), CacheOptions::default());
    fx.api.seed_file("root", "log.txt", b"0123456789");

    let file = fx
        .root
        .resolve_file("filesystems/main/log.txt")
        .await
        .unwrap();

    assert!(matches!(
        file.write_bytes(0, b"X").await.unwrap_err(),
        FsError::WriteType
    ));

    // Appending at the end is the one allowed write.
    file.write_bytes(10, b"abc").await.unwrap();
    assert_eq!(file.file_size().unwrap(), 13);
    assert_eq!(file.read_bytes(0, 13).await.unwrap(), b"0123456789abc");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn append_storage_writes_unaligned_tail_through() {
    let fx = Fixture::with("FTP", options(), CacheOptions::default());
    let id = fx.api.seed_file("root", "tail.txt", b"0123456789");

    let file = fx
        .root
        .resolve_file("filesystems/main/tail.txt")
        .await
        .unwrap();

    // The backend tail is mid-page, so the append goes straight to the
    // server rather than into a page that could never be re-flushed.
    file.write_bytes(10, b"abc").await.unwrap();
    assert_eq!(fx.api.stored_data(&id).unwrap(), b"0123456789abc");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn append_storage_truncates_only_to_zero() {
    let fx = Fixture::with("FTP", options(), CacheOptions::default());
    fx.api.seed_file("root", "log.txt", b"0123456789");

    let file = fx
        .root
        .resolve_file("filesystems/main/log.txt")
        .await
        .unwrap();

    assert!(matches!(
        file.truncate_file(5).await.unwrap_err(),
        FsError::WriteType
    ));
    file.truncate_file(0).await.unwrap();
    assert_eq!(file.file_size().unwrap(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn upload_storage_is_write_once() {
    let fx = Fixture::with("S3", options(), CacheOptions::default());
    let fs_root = fx.fs_root().await;

    let file = fs_root.create_file("object.bin").await.unwrap();
    file.write_bytes(0, b"whole object body").await.unwrap();
    file.flush_file(false).await.unwrap();

    let id = fx.api.find("root", "object.bin").unwrap();
    assert_eq!(fx.api.stored_data(&id).unwrap(), b"whole object body");

    // Once the object exists it can be neither modified nor resized.
    assert!(matches!(
        file.write_bytes(0, b"patch").await.unwrap_err(),
        FsError::WriteType
    ));
    assert!(matches!(
        file.truncate_file(4).await.unwrap_err(),
        FsError::WriteType
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn read_only_mount_rejects_all_mutation() {
    let fx = Fixture::with(
        "local",
        ConfigOptions {
            read_only: true,
            ..options()
        },
        CacheOptions::default(),
    );
    fx.api.seed_file("root", "ro.txt", b"data");
    let fs_root = fx.fs_root().await;

    let file = fx
        .root
        .resolve_file("filesystems/main/ro.txt")
        .await
        .unwrap();

    assert!(matches!(
        file.write_bytes(0, b"X").await.unwrap_err(),
        FsError::ReadOnly
    ));
    assert!(matches!(
        file.truncate_file(0).await.unwrap_err(),
        FsError::ReadOnly
    ));
    assert!(matches!(
        fs_root.create_file("new").await.unwrap_err(),
        FsError::ReadOnly
    ));
    assert!(matches!(
        fs_root.delete_item("ro.txt").await.unwrap_err(),
        FsError::ReadOnly
    ));

    // Reading still works.
    assert_eq!(file.read_bytes(0, 4).await.unwrap(), b"data");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn memory_mode_never_talks_to_the_server() {
    let fx = Fixture::with(
        "local",
        ConfigOptions {
            cache_mode: CacheMode::Memory,
            ..options()
        },
        CacheOptions::default(),
    );
    let fs_root = fx.fs_root().await;

    let file = fs_root.create_file("local.bin").await.unwrap();
    file.write_bytes(0, b"memory only").await.unwrap();
    file.flush_file(false).await.unwrap();

    // Flush is a no-op: nothing was created server-side.
    assert!(fx.api.find("root", "local.bin").is_none());
    assert_eq!(file.read_bytes(0, 64).await.unwrap(), b"memory only");

    let folder = fs_root.create_folder("dir").await.unwrap();
    let nested = folder.create_file("nested").await.unwrap();
    nested.write_bytes(0, b"deep").await.unwrap();
    assert_eq!(
        fx.root
            .resolve_file("filesystems/main/dir/nested")
            .await
            .unwrap()
            .read_bytes(0, 4)
            .await
            .unwrap(),
        b"deep"
    );
}
