#![allow(clippy::unwrap_used, missing_docs)]
//! Flush behavior: dirty-run coalescing, deferred create, chunk downshift.

mod common;

use common::Fixture;
use std::sync::atomic::Ordering;

const PAGE: u64 = 4096;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn consecutive_dirty_pages_flush_in_one_call() {
    let fx = Fixture::new();
    let folder = fx.fs_root().await;
    let file = folder.create_file("coalesce.bin").await.unwrap();

    // Four consecutive dirty pages, no intervening flush.
    let payload: Vec<u8> = (0..4 * PAGE).map(|i| (i % 199) as u8).collect();
    file.write_bytes(0, &payload).await.unwrap();
    file.flush_file(false).await.unwrap();

    // One upload covering all four pages; no per-page writes.
    assert_eq!(fx.api.uploads.load(Ordering::Relaxed), 1);
    assert_eq!(fx.api.write_calls.load(Ordering::Relaxed), 0);

    let id = fx.api.find("root", "coalesce.bin").unwrap();
    assert_eq!(fx.api.stored_data(&id).unwrap(), payload);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn disjoint_dirty_runs_flush_separately() {
    let fx = Fixture::new();
    fx.api
        .seed_file("root", "sparse.bin", &vec![0u8; 6 * PAGE as usize]);

    let folder = fx.fs_root().await;
    let file = folder.resolve_file("sparse.bin").await.unwrap();

    // Dirty pages 0 and 3: two runs.
    file.write_bytes(0, &vec![1u8; PAGE as usize]).await.unwrap();
    file.write_bytes(3 * PAGE, &vec![2u8; PAGE as usize])
        .await
        .unwrap();
    file.flush_file(false).await.unwrap();

    let log = fx.api.write_log.lock().unwrap().clone();
    assert_eq!(
        log,
        vec![(0, PAGE as usize), (3 * PAGE, PAGE as usize)],
        "two runs, one write each"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn empty_create_is_deferred_to_flush() {
    let fx = Fixture::new();
    let folder = fx.fs_root().await;
    let file = folder.create_file("empty.txt").await.unwrap();

    // Nothing on the server until the flush.
    assert!(fx.api.find("root", "empty.txt").is_none());

    file.flush_file(false).await.unwrap();
    let id = fx.api.find("root", "empty.txt").expect("created at flush");
    assert_eq!(fx.api.stored_data(&id).unwrap(), Vec::<u8>::new());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn truncate_before_create_is_asserted_at_flush() {
    let fx = Fixture::new();
    let folder = fx.fs_root().await;
    let file = folder.create_file("sized.bin").await.unwrap();

    // Truncate larger while the file only exists in memory.
    file.truncate_file(3 * PAGE).await.unwrap();
    file.flush_file(false).await.unwrap();

    let id = fx.api.find("root", "sized.bin").unwrap();
    assert_eq!(fx.api.stored_data(&id).unwrap().len(), 3 * PAGE as usize);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn oversized_upload_halves_chunk_and_retries() {
    let fx = Fixture::new();
    *fx.api.body_limit.lock().unwrap() = Some(6000);

    let folder = fx.fs_root().await;
    let file = folder.create_file("big.bin").await.unwrap();

    let payload: Vec<u8> = (0..4 * PAGE).map(|i| (i % 131) as u8).collect();
    file.write_bytes(0, &payload).await.unwrap();
    file.flush_file(false).await.unwrap();

    // 16384 fails, 8192 fails, 4096 succeeds; the rest follows in
    // 4096-byte chunks.
    assert_eq!(fx.mount.chunker.current(), 4096);
    let log = fx.api.write_log.lock().unwrap().clone();
    assert!(
        log.iter().all(|&(_, len)| len <= 4096),
        "no accepted write may exceed the learned chunk size: {log:?}"
    );

    let id = fx.api.find("root", "big.bin").unwrap();
    assert_eq!(fx.api.stored_data(&id).unwrap(), payload);

    // Read back through the backend for good measure.
    let pages = &file.as_file().unwrap().pages;
    for index in 0..4 {
        pages.evict_page(index).await.unwrap();
    }
    assert_eq!(file.read_bytes(0, payload.len()).await.unwrap(), payload);
}
