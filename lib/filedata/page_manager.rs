//! Per-file page data manager.
//!
//! Splits the file into fixed-size pages and implements thread-safe
//! read, write, truncate, evict and flush on top of the page backend:
//!
//! - pages read from the backend are cached (see `evict_page`)
//! - cache misses fetch a consecutive range sized by measured bandwidth,
//!   on a background task, so sequential reads rarely wait
//! - writes are buffered until flushed (write-back, see `flush_page`)
//! - flushes write back consecutive dirty runs in one call
//! - file creation is deferred so create-then-write becomes one upload
//!
//! Lock layout: `order` is the data lock — shared for reads and flushes,
//! exclusive for writes, truncates and evictions. `flush_lock` keeps two
//! flushes from overlapping. `state` is a short-hold mutex over the page
//! table, the pending-fetch list and the failure map; background
//! fetchers synchronize with readers through it and `notify` alone, so a
//! fetch never needs the data lock and cannot deadlock against a queued
//! writer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::{Mutex as AsyncMutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::error::FsError;
use crate::filedata::alloc::PagePool;
use crate::filedata::bandwidth::BandwidthMeasure;
use crate::filedata::cache_manager::CacheManager;
use crate::filedata::page::{min64, Page, PageMap};
use crate::filedata::page_backend::PageBackend;

struct PageState {
    pages: PageMap,
    /// Current file size including dirty extending writes.
    file_size: u64,
    /// Ranges being fetched by background tasks: `(start, count)`.
    pending: Vec<(u64, usize)>,
    /// Failures captured by fetchers, surfaced to the next reader.
    failed: HashMap<u64, FsError>,
    /// Read-ahead window in pages, never zero.
    fetch_window: usize,
    bandwidth: BandwidthMeasure,
}

impl PageState {
    fn pending_covers(&self, index: u64) -> bool {
        self.pending
            .iter()
            .any(|&(start, count)| index >= start && index < start + count as u64)
    }
}

/// Per-file page table, dirty tracking and read-ahead.
pub struct PageManager {
    id: u64,
    page_size: usize,
    cache: Arc<CacheManager>,
    pool: Arc<PagePool>,
    backend: PageBackend,
    /// The data lock: shared for reads/flushes, exclusive for writes,
    /// truncates and evictions.
    order: RwLock<()>,
    /// Overlapping flushes could duplicate writes.
    flush_lock: AsyncMutex<()>,
    state: Mutex<PageState>,
    /// Wakes readers waiting on a pending fetch.
    notify: Notify,
    /// Upper bound on one read-ahead, in bytes.
    max_fetch_bytes: usize,
    /// Memory cache mode: keep everything local, never talk to the backend.
    local_only: bool,
    stopping: AtomicBool,
    fetchers: Mutex<Vec<JoinHandle<()>>>,
}

impl PageManager {
    /// Construct a manager for one file.
    #[must_use]
    pub fn new(
        cache: Arc<CacheManager>,
        backend: PageBackend,
        file_size: u64,
        page_size: usize,
        read_ahead_time: Duration,
        max_fetch_bytes: usize,
        local_only: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: cache.next_manager_id(),
            page_size,
            pool: cache.pool(),
            cache,
            backend,
            order: RwLock::new(()),
            flush_lock: AsyncMutex::new(()),
            state: Mutex::new(PageState {
                pages: PageMap::new(),
                file_size,
                pending: Vec::new(),
                failed: HashMap::new(),
                fetch_window: 1,
                bandwidth: BandwidthMeasure::new(read_ahead_time),
            }),
            notify: Notify::new(),
            max_fetch_bytes: max_fetch_bytes.max(page_size),
            local_only,
            stopping: AtomicBool::new(false),
            fetchers: Mutex::new(Vec::new()),
        })
    }

    /// The cache-manager identity of this manager.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The fixed page size.
    #[must_use]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Current file size including dirty extending writes.
    #[must_use]
    pub fn file_size(&self) -> u64 {
        self.state.lock().expect("page state").file_size
    }

    /// The page backend (for identity updates on rename/move).
    #[must_use]
    pub fn backend(&self) -> &PageBackend {
        &self.backend
    }

    /// True if any page holds unflushed writes.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.state
            .lock()
            .expect("page state")
            .pages
            .values()
            .any(|p| p.dirty)
    }

    // ---- read path ----

    /// Read up to `len` bytes at `offset`; short only at end of file.
    pub async fn read_bytes(self: &Arc<Self>, offset: u64, len: usize) -> Result<Vec<u8>, FsError> {
        let _read = self.order.read().await;

        let file_size = self.file_size();
        if offset >= file_size {
            return Ok(Vec::new());
        }
        let len = min64(file_size - offset, len);

        let mut out = Vec::with_capacity(len);
        let mut pos = offset;
        let end = offset + len as u64;
        while pos < end {
            let index = pos / self.page_size as u64;
            let page_off = (pos % self.page_size as u64) as usize;
            let take = min64(end - pos, self.page_size - page_off);
            self.read_page_into(index, page_off, take, &mut out).await?;
            pos += take as u64;
        }
        Ok(out)
    }

    /// Copy `len` bytes at `page_off` of the given page into `out`,
    /// fetching or synthesizing the page as needed. Requires the shared
    /// data lock.
    async fn read_page_into(
        self: &Arc<Self>,
        index: u64,
        page_off: usize,
        len: usize,
        out: &mut Vec<u8>,
    ) -> Result<(), FsError> {
        enum Step {
            Done,
            Wait,
            Spawn { start: u64, count: usize },
            Zero { size: usize },
        }

        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let step = {
                let mut guard = self.state.lock().expect("page state");
                let state = &mut *guard;

                if let Some(page) = state.pages.get(&index) {
                    // The page may be shorter than the read when dirty
                    // writes extended the file past the backend copy;
                    // the hole reads as zeros.
                    let avail = page.size().saturating_sub(page_off);
                    let take = avail.min(len);
                    out.extend_from_slice(&page.data()[page_off..page_off + take]);
                    out.resize(out.len() + (len - take), 0);
                    Step::Done
                } else if let Some(err) = state.failed.remove(&index) {
                    return Err(err);
                } else if state.pending_covers(index) {
                    Step::Wait
                } else {
                    let backend_pages = self.backend_page_count();
                    if index >= backend_pages {
                        // Beyond the server-known size: a hole or a dirty
                        // extension. Synthesized without I/O.
                        let page_start = index * self.page_size as u64;
                        let size = min64(state.file_size - page_start, self.page_size);
                        Step::Zero { size }
                    } else {
                        let count = self.fetch_count(state, index, backend_pages);
                        state.pending.push((index, count));
                        Step::Spawn {
                            start: index,
                            count,
                        }
                    }
                }
            };

            match step {
                Step::Done => {
                    self.cache
                        .inform_page(self, index, self.page_size_of(index), false, true, false)
                        .await?;
                    return Ok(());
                }
                Step::Zero { size } => {
                    let page = Page::new(self.pool.alloc(size));
                    {
                        let mut state = self.state.lock().expect("page state");
                        state.pages.entry(index).or_insert(page);
                    }
                    // Loop back around to the hit path, which informs.
                }
                Step::Spawn { start, count } => {
                    if self.stopping.load(Ordering::SeqCst) {
                        let mut state = self.state.lock().expect("page state");
                        state.pending.retain(|&(s, _)| s != start);
                        return Err(FsError::NotFound);
                    }
                    trace!(start, count, "spawning fetch");
                    self.spawn_fetch(start, count);
                    // Loop; the next pass waits on the pending entry.
                }
                Step::Wait => {
                    notified.await;
                }
            }
        }
    }

    fn backend_page_count(&self) -> u64 {
        let size = self.backend.backend_size();
        size.div_ceil(self.page_size as u64)
    }

    /// Read-ahead length for a cache miss at `index`: the bandwidth
    /// window, capped by the per-fetch byte budget and by the end of the
    /// backend copy.
    fn fetch_count(&self, state: &PageState, index: u64, backend_pages: u64) -> usize {
        let until_eof = usize::try_from(backend_pages - index).unwrap_or(usize::MAX);
        let budget = (self.max_fetch_bytes / self.page_size).max(1);
        state.fetch_window.min(budget).min(until_eof).max(1)
    }

    fn spawn_fetch(self: &Arc<Self>, start: u64, count: usize) {
        let manager = Arc::clone(self);
        let handle = tokio::spawn(async move { manager.fetch_pages(start, count).await });

        let mut fetchers = self.fetchers.lock().expect("fetchers lock");
        fetchers.retain(|h| !h.is_finished());
        fetchers.push(handle);
    }

    /// Background fetch of `count` pages starting at `start`.
    ///
    /// Runs without the data lock; coordination with readers, writers
    /// and truncates happens entirely through the pending list. A page
    /// that appeared in the map while we were downloading (a write beat
    /// us) is never overwritten, and a pending entry removed by truncate
    /// cancels the insertion.
    async fn fetch_pages(self: Arc<Self>, start: u64, count: usize) {
        let started = Instant::now();

        match self.backend.read_pages(start, count).await {
            Ok(chunks) => {
                let total: usize = chunks.iter().map(|(_, b)| b.len()).sum();

                for (index, bytes) in chunks {
                    let inform = {
                        let mut guard = self.state.lock().expect("page state");
                        let state = &mut *guard;

                        if !state.pending_covers(index) {
                            false // cancelled underneath us
                        } else if state.pages.contains_key(&index) {
                            false // a write got here first; never clobber it
                        } else {
                            let mut buf = self.pool.alloc(bytes.len());
                            buf.as_mut_slice().copy_from_slice(&bytes);
                            state.pages.insert(index, Page::new(buf));
                            true
                        }
                    };

                    if inform {
                        // Fetchers never wait on capacity; a reader
                        // blocked on this page may hold the shared lock
                        // an evicting worker wants.
                        if let Err(e) = self
                            .cache
                            .inform_page(&self, index, bytes.len() as u64, false, false, false)
                            .await
                        {
                            warn!(error = %e, index, "cache inform failed during fetch");
                        }
                    }
                    self.notify.notify_waiters();
                }

                {
                    let mut guard = self.state.lock().expect("page state");
                    let state = &mut *guard;
                    state.pending.retain(|&(s, _)| s != start);

                    if total > 0 {
                        let target = state.bandwidth.update(total as u64, started.elapsed());
                        let budget = (self.max_fetch_bytes / self.page_size).max(1);
                        state.fetch_window =
                            usize::try_from(target / self.page_size as u64)
                                .unwrap_or(budget)
                                .clamp(1, budget);
                        trace!(window = state.fetch_window, "read-ahead window updated");
                    }
                }
                self.notify.notify_waiters();
            }
            Err(e) => {
                warn!(error = %e, start, count, "page fetch failed");
                let mut guard = self.state.lock().expect("page state");
                let state = &mut *guard;

                if let Some(&(s, c)) = state.pending.iter().find(|&&(s, _)| s == start) {
                    // Surface the failure to every reader of the range.
                    for index in s..s + c as u64 {
                        state.failed.insert(index, e.clone());
                    }
                    state.pending.retain(|&(s2, _)| s2 != start);
                }
                drop(guard);
                self.notify.notify_waiters();
            }
        }
    }

    // ---- write path ----

    /// Write `data` at `offset`, growing the file and zero-filling any
    /// hole between the old end and the write start.
    pub async fn write_bytes(self: &Arc<Self>, offset: u64, data: &[u8]) -> Result<(), FsError> {
        let _write = self.order.write().await;

        let file_size = self.file_size();
        if offset > file_size {
            self.fill_hole(file_size, offset).await?;
        }
        self.write_locked(offset, data).await
    }

    /// Zero-write the byte range `[from, to)`. Requires the exclusive
    /// data lock.
    async fn fill_hole(self: &Arc<Self>, from: u64, to: u64) -> Result<(), FsError> {
        debug!(from, to, "filling write hole");
        let zeros = vec![0u8; self.page_size];
        let mut pos = from;
        while pos < to {
            let take = min64(to - pos, self.page_size - (pos % self.page_size as u64) as usize);
            self.write_locked(pos, &zeros[..take]).await?;
            pos += take as u64;
        }
        Ok(())
    }

    async fn write_locked(self: &Arc<Self>, offset: u64, data: &[u8]) -> Result<(), FsError> {
        let mut pos = 0usize;
        while pos < data.len() {
            let at = offset + pos as u64;
            let index = at / self.page_size as u64;
            let page_off = (at % self.page_size as u64) as usize;
            let take = (data.len() - pos).min(self.page_size - page_off);
            self.write_page_locked(index, page_off, &data[pos..pos + take])
                .await?;
            pos += take;
        }
        Ok(())
    }

    /// Write one chunk within one page. Requires the exclusive data lock.
    async fn write_page_locked(
        self: &Arc<Self>,
        index: u64,
        page_off: usize,
        chunk: &[u8],
    ) -> Result<(), FsError> {
        enum Prep {
            Ready,
            Wait,
            Alloc,
            Fetch,
        }

        // Make the page resident. A partial write to a page the backend
        // holds must pre-populate it so the untouched bytes survive;
        // pages strictly past end-of-file just zero-fill their prefix.
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let prep = {
                let state = self.state.lock().expect("page state");
                if state.pages.contains_key(&index) {
                    Prep::Ready
                } else if state.pending_covers(index) {
                    Prep::Wait
                } else {
                    let page_start = index * self.page_size as u64;
                    let past_eof = page_start >= state.file_size;
                    let partial = page_off != 0 || chunk.len() != self.page_size;
                    if partial && !past_eof && index < self.backend_page_count() {
                        Prep::Fetch
                    } else {
                        Prep::Alloc
                    }
                }
            };

            match prep {
                Prep::Ready => break,
                Prep::Wait => {
                    notified.await;
                }
                Prep::Fetch => {
                    // Inline single-page fetch: we hold the write lock,
                    // so nothing else can populate this page for us.
                    let chunks = self.backend.read_pages(index, 1).await?;
                    let mut state = self.state.lock().expect("page state");
                    match chunks.into_iter().next() {
                        Some((_, bytes)) => {
                            let mut buf = self.pool.alloc(bytes.len());
                            buf.as_mut_slice().copy_from_slice(&bytes);
                            state.pages.entry(index).or_insert_with(|| Page::new(buf));
                        }
                        None => {
                            // Raced a remote truncate; treat as past-EOF.
                            let size = page_off + chunk.len();
                            state
                                .pages
                                .entry(index)
                                .or_insert_with(|| Page::new(self.pool.alloc(size)));
                        }
                    }
                }
                Prep::Alloc => {
                    let mut state = self.state.lock().expect("page state");
                    let page_start = index * self.page_size as u64;
                    // Cover the existing file extent within this page and
                    // the write itself; the gap in between reads as zero.
                    let covered = state.file_size.saturating_sub(page_start);
                    let size = min64(covered, self.page_size).max(page_off + chunk.len());
                    let size = size.min(self.page_size);
                    let page = Page::new(self.pool.alloc(size));
                    state.pages.entry(index).or_insert(page);
                }
            }
        }

        let new_size = {
            let mut guard = self.state.lock().expect("page state");
            let state = &mut *guard;
            let page = state.pages.get_mut(&index).expect("page resident");

            let need = page_off + chunk.len();
            if need > page.size() {
                page.resize(need);
            }
            page.data_mut()[page_off..page_off + chunk.len()].copy_from_slice(chunk);
            page.dirty = true;

            let page_start = index * self.page_size as u64;
            state.file_size = state.file_size.max(page_start + need as u64);
            page.size() as u64
        };

        self.cache
            .inform_page(self, index, new_size, !self.local_only, true, true)
            .await
    }

    /// Write bytes straight through to the backend at `offset`, patching
    /// any cached page. Append-mode storages cannot rewrite a flushed
    /// partial page, so the tail of the file is written unbuffered until
    /// it aligns with a page boundary.
    ///
    /// Returns the number of bytes consumed from `data`.
    pub async fn write_through_tail(
        self: &Arc<Self>,
        offset: u64,
        data: &[u8],
    ) -> Result<usize, FsError> {
        let _write = self.order.write().await;

        let misalign = (offset % self.page_size as u64) as usize;
        if misalign == 0 {
            return Ok(0);
        }
        let take = data.len().min(self.page_size - misalign);

        self.backend
            .write_raw(offset, Bytes::copy_from_slice(&data[..take]))
            .await?;

        let index = offset / self.page_size as u64;
        let resized = {
            let mut guard = self.state.lock().expect("page state");
            let state = &mut *guard;
            state.file_size = state.file_size.max(offset + take as u64);
            match state.pages.get_mut(&index) {
                Some(page) => {
                    let need = misalign + take;
                    if need > page.size() {
                        page.resize(need);
                    }
                    page.data_mut()[misalign..misalign + take].copy_from_slice(&data[..take]);
                    Some(page.size() as u64)
                }
                None => None,
            }
        };

        if let Some(size) = resized {
            self.cache.resize_page(self, index, size, true).await?;
        }
        Ok(take)
    }

    // ---- truncate / refresh ----

    /// Set the file size, dropping pages past the new end, resizing the
    /// now-last page and truncating on the backend when the file exists
    /// there (otherwise the next flush creates it at the right size).
    pub async fn truncate(self: &Arc<Self>, new_size: u64) -> Result<(), FsError> {
        let _write = self.order.write().await;
        debug!(new_size, "truncate");

        let (dropped, resized) = {
            let mut guard = self.state.lock().expect("page state");
            let state = &mut *guard;

            state.file_size = new_size;

            let first_dead = new_size.div_ceil(self.page_size as u64);
            let dropped: Vec<u64> = state.pages.range(first_dead..).map(|(i, _)| *i).collect();
            for index in &dropped {
                state.pages.remove(index);
            }

            let mut resized = None;
            if new_size > 0 {
                let last = (new_size - 1) / self.page_size as u64;
                if let Some(page) = state.pages.get_mut(&last) {
                    let want = min64(new_size - last * self.page_size as u64, self.page_size);
                    if want != page.size() {
                        page.resize(want);
                        resized = Some((last, want as u64));
                    }
                }
            }

            // Cancel in-flight fetches past the new end; clamp ranges
            // that straddle it so completed pages beyond it never land.
            state.pending.retain_mut(|entry| {
                if entry.0 >= first_dead {
                    return false;
                }
                entry.1 = entry.1.min(usize::try_from(first_dead - entry.0).unwrap_or(entry.1));
                true
            });
            state.failed.retain(|&index, _| index < first_dead);

            (dropped, resized)
        };

        for index in dropped {
            self.cache.remove_page(self.id, index);
        }
        if let Some((index, size)) = resized {
            self.cache.resize_page(self, index, size, true).await?;
        }

        if !self.local_only && self.backend.exists_on_backend() {
            self.backend.truncate(new_size).await?;
        }

        self.notify.notify_waiters();
        Ok(())
    }

    /// The backend reported a different size (a polled listing changed):
    /// drop cached pages past the new end. Dirty local writes win the
    /// size argument.
    pub async fn remote_changed(self: &Arc<Self>, backend_size: u64) {
        let _write = self.order.write().await;

        if self.backend.backend_size() == backend_size {
            return;
        }
        debug!(backend_size, "remote size changed");
        self.backend.set_backend_size(backend_size);

        let dropped = {
            let mut guard = self.state.lock().expect("page state");
            let state = &mut *guard;

            let first_dead = backend_size.div_ceil(self.page_size as u64);
            let dropped: Vec<u64> = state
                .pages
                .range(first_dead..)
                .filter(|(_, p)| !p.dirty)
                .map(|(i, _)| *i)
                .collect();
            for index in &dropped {
                state.pages.remove(index);
            }

            let dirty_extent = state
                .pages
                .iter()
                .rev()
                .find(|(_, p)| p.dirty)
                .map_or(0, |(i, p)| i * self.page_size as u64 + p.size() as u64);
            state.file_size = backend_size.max(dirty_extent);

            dropped
        };

        for index in dropped {
            self.cache.remove_page(self.id, index);
        }
        self.notify.notify_waiters();
    }

    // ---- flush / evict ----

    /// Flush the dirty run starting at `index`; the cache flush worker's
    /// entry point. Takes the shared data lock so reads proceed while
    /// the run uploads.
    pub async fn flush_page(self: &Arc<Self>, index: u64) -> Result<u64, FsError> {
        let _read = self.order.read().await;
        let _flush = self.flush_lock.lock().await;
        self.flush_run(index).await
    }

    /// Flush variant for callers already holding the exclusive data lock
    /// (synchronous back-pressure, eviction of a dirty page).
    pub async fn flush_page_locked(self: &Arc<Self>, index: u64) -> Result<u64, FsError> {
        let _flush = self.flush_lock.lock().await;
        self.flush_run(index).await
    }

    /// Write back every dirty page and perform any deferred create or
    /// truncate, leaving the file clean on the backend.
    pub async fn flush(self: &Arc<Self>) -> Result<(), FsError> {
        if self.local_only {
            return Ok(());
        }
        let _read = self.order.read().await;
        let _flush = self.flush_lock.lock().await;

        loop {
            let next = {
                let state = self.state.lock().expect("page state");
                state
                    .pages
                    .iter()
                    .find(|(_, p)| p.dirty)
                    .map(|(i, _)| *i)
            };
            match next {
                Some(index) => {
                    self.flush_run(index).await?;
                }
                None => break,
            }
        }

        // A freshly created, never-written file still needs its deferred
        // create; a file truncated larger before creation needs its size
        // asserted.
        if !self.backend.exists_on_backend() {
            self.backend.write_pages(0, Bytes::new()).await?;
        }
        let file_size = self.file_size();
        if self.backend.backend_size() < file_size {
            self.backend.truncate(file_size).await?;
        }
        Ok(())
    }

    /// Collect the consecutive dirty run starting at `index`, upload it
    /// in one call, then clear the dirty bits — all of them or none.
    async fn flush_run(self: &Arc<Self>, index: u64) -> Result<u64, FsError> {
        let (data, run) = {
            let state = self.state.lock().expect("page state");
            let mut run = Vec::new();
            let mut buf = Vec::new();
            let mut i = index;
            while let Some(page) = state.pages.get(&i) {
                if !page.dirty {
                    break;
                }
                buf.extend_from_slice(page.data());
                run.push(i);
                i += 1;
            }
            (buf, run)
        };

        if run.is_empty() {
            return Ok(0);
        }
        let written = data.len() as u64;
        debug!(start = run[0], pages = run.len(), bytes = written, "flushing dirty run");

        if !self.local_only {
            self.backend.write_pages(run[0], Bytes::from(data)).await?;
        }

        {
            let mut state = self.state.lock().expect("page state");
            for i in &run {
                if let Some(page) = state.pages.get_mut(i) {
                    page.dirty = false;
                }
            }
        }
        for i in run {
            self.cache.remove_dirty(self.id, i);
        }
        Ok(written)
    }

    /// Remove the page at `index`, flushing it first if dirty; the cache
    /// eviction worker's entry point.
    pub async fn evict_page(self: &Arc<Self>, index: u64) -> Result<(), FsError> {
        let _write = self.order.write().await;
        self.evict_page_locked(index).await
    }

    /// Eviction for callers already holding the exclusive data lock.
    pub async fn evict_page_locked(self: &Arc<Self>, index: u64) -> Result<(), FsError> {
        let dirty = {
            let state = self.state.lock().expect("page state");
            state.pages.get(&index).map(|p| p.dirty)
        };

        match dirty {
            None => {
                // Already gone; clear any stale queue entry.
                self.cache.remove_page(self.id, index);
                return Ok(());
            }
            Some(true) if self.local_only => {
                // Memory-mode data has nowhere to go; dropping it would
                // lose the only copy. Untrack it instead.
                self.cache.remove_page(self.id, index);
                return Ok(());
            }
            Some(true) => {
                self.flush_page_locked(index).await?;
            }
            Some(false) => {}
        }

        {
            let mut state = self.state.lock().expect("page state");
            state.pages.remove(&index);
        }
        self.cache.remove_page(self.id, index);
        Ok(())
    }

    // ---- teardown ----

    /// Stop background fetches and untrack every page. Readers racing
    /// teardown observe an empty manager rather than a dangling one.
    pub async fn shutdown(self: &Arc<Self>) {
        self.stopping.store(true, Ordering::SeqCst);

        let fetchers = std::mem::take(&mut *self.fetchers.lock().expect("fetchers lock"));
        for handle in &fetchers {
            handle.abort();
        }
        for handle in fetchers {
            let _ = handle.await;
        }

        let indexes: Vec<u64> = {
            let mut guard = self.state.lock().expect("page state");
            let state = &mut *guard;
            state.pending.clear();
            state.failed.clear();
            let indexes = state.pages.keys().copied().collect();
            state.pages.clear();
            indexes
        };
        for index in indexes {
            self.cache.remove_page(self.id, index);
        }
        self.notify.notify_waiters();
    }

    fn page_size_of(&self, index: u64) -> u64 {
        let state = self.state.lock().expect("page state");
        state.pages.get(&index).map_or(0, |p| p.size() as u64)
    }
}
