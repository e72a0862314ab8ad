#![allow(clippy::unwrap_used, missing_docs)]
//! Cache manager budgets: LRU eviction order and counter invariants.

mod common;

use common::{settle, Fixture};

use nimbus_fs::config::{CacheOptions, ConfigOptions};

const PAGE: u64 = 4096;

fn tight_fixture() -> Fixture {
    Fixture::with(
        "local",
        ConfigOptions {
            page_size: PAGE as usize,
            // Keep the read-ahead budget below one page so the window
            // stays at a single page and reads are deterministic.
            read_max_cache_frac: 16,
            ..ConfigOptions::default()
        },
        CacheOptions {
            memory_limit: 3 * PAGE,
            ..CacheOptions::default()
        },
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sequential_read_evicts_oldest_pages() {
    let fx = tight_fixture();
    let payload: Vec<u8> = (0..5 * PAGE).map(|i| (i % 127) as u8).collect();
    fx.api.seed_file("root", "five.bin", &payload);

    let folder = fx.fs_root().await;
    let file = folder.resolve_file("five.bin").await.unwrap();
    let mgr_id = file.as_file().unwrap().pages.id();

    for index in 0..5u64 {
        let chunk = file.read_bytes(index * PAGE, PAGE as usize).await.unwrap();
        assert_eq!(chunk.len(), PAGE as usize);
        settle().await; // let the eviction worker catch up per page
    }

    let cached: Vec<u64> = fx
        .cache
        .lru_snapshot()
        .into_iter()
        .filter(|&(mgr, _)| mgr == mgr_id)
        .map(|(_, index)| index)
        .collect();

    // Pages 0 and 1 were the least recently used and clean, so they
    // went first; the tail of the file stays resident.
    assert_eq!(cached, vec![2, 3, 4]);
    assert_eq!(fx.cache.memory_usage(), 3 * PAGE);
    assert_eq!(fx.cache.dirty_usage(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn write_over_budget_keeps_the_dirty_page() {
    let fx = tight_fixture();
    let payload: Vec<u8> = (0..5 * PAGE).map(|i| (i % 127) as u8).collect();
    fx.api.seed_file("root", "five.bin", &payload);

    let folder = fx.fs_root().await;
    let file = folder.resolve_file("five.bin").await.unwrap();
    let mgr_id = file.as_file().unwrap().pages.id();

    for index in 0..5u64 {
        file.read_bytes(index * PAGE, PAGE as usize).await.unwrap();
        settle().await;
    }

    file.write_bytes(0, &vec![1u8; PAGE as usize]).await.unwrap();
    settle().await;

    let cached: Vec<u64> = fx
        .cache
        .lru_snapshot()
        .into_iter()
        .filter(|&(mgr, _)| mgr == mgr_id)
        .map(|(_, index)| index)
        .collect();

    assert!(cached.contains(&0), "the fresh dirty page must survive");
    assert!(
        cached.iter().all(|i| [0u64, 2, 3, 4].contains(i)),
        "only previously cached pages and the new write may remain: {cached:?}"
    );
    assert!(fx.cache.memory_usage() <= 3 * PAGE);

    let dirty: Vec<(u64, u64)> = fx.cache.dirty_snapshot();
    assert_eq!(dirty, vec![(mgr_id, 0)], "page 0 is the only dirty page");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn eviction_of_dirty_page_flushes_first() {
    let fx = Fixture::new();
    let folder = fx.fs_root().await;
    let file = folder.create_file("dirty.bin").await.unwrap();

    file.write_bytes(0, b"precious").await.unwrap();
    let pages = &file.as_file().unwrap().pages;
    pages.evict_page(0).await.unwrap();

    // The eviction wrote the data out before dropping the page.
    let id = fx.api.find("root", "dirty.bin").expect("created on evict");
    assert_eq!(fx.api.stored_data(&id).unwrap(), b"precious");
    assert_eq!(fx.cache.dirty_usage(), 0);

    // And the data reads back identically through a fresh fetch.
    assert_eq!(file.read_bytes(0, 8).await.unwrap(), b"precious");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn counters_track_page_truncation() {
    let fx = Fixture::new();
    let folder = fx.fs_root().await;
    let file = folder.create_file("count.bin").await.unwrap();

    file.write_bytes(0, &vec![5u8; 3 * PAGE as usize]).await.unwrap();
    assert_eq!(fx.cache.memory_usage(), 3 * PAGE);
    assert_eq!(fx.cache.dirty_usage(), 3 * PAGE);

    file.truncate_file(PAGE + 10).await.unwrap();
    assert_eq!(fx.cache.memory_usage(), PAGE + 10);
    assert_eq!(fx.cache.dirty_usage(), PAGE + 10);

    file.truncate_file(0).await.unwrap();
    assert_eq!(fx.cache.memory_usage(), 0);
    assert_eq!(fx.cache.dirty_usage(), 0);
}
