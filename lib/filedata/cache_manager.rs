//! Process-wide page cache budgets.
//!
//! Every cached page is tracked in an LRU queue and every dirty page in
//! a FIFO. Two long-lived workers evict and flush from the queue fronts
//! whenever the memory or dirty budget is exceeded; callers that push
//! the cache over budget wait until the workers (or a synchronous evict
//! on their own file) bring it back under.
//!
//! Deadlock discipline: queue mutations never happen under a
//! page-manager lock, and a worker that needs a page-manager lock first
//! publishes that manager in a skip-wait hint so callers holding the
//! lock are exempted from capacity waiting.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use hashlink::LinkedHashMap;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::config::CacheOptions;
use crate::error::FsError;
use crate::filedata::alloc::PagePool;
use crate::filedata::bandwidth::BandwidthMeasure;
use crate::filedata::page_manager::PageManager;

/// Identity of one tracked page: owning manager id plus page index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageKey {
    /// The owning page manager's id.
    pub mgr: u64,
    /// The page index within that file.
    pub index: u64,
}

struct PageInfo {
    mgr: Weak<PageManager>,
    size: u64,
}

struct CacheState {
    /// All tracked pages, least recently used at the front.
    page_queue: LinkedHashMap<PageKey, PageInfo>,
    /// Dirty pages, oldest write at the front.
    dirty_queue: LinkedHashMap<PageKey, PageInfo>,
    /// Sum of sizes in `page_queue`.
    current_memory: u64,
    /// Sum of sizes in `dirty_queue`.
    current_dirty: u64,
    /// Dirty budget in bytes, retargeted after every flush.
    dirty_limit: u64,
    bandwidth: BandwidthMeasure,
    /// Manager the evict worker is about to lock; its callers skip
    /// capacity waits so the worker can acquire the lock they hold.
    skip_evict: Option<u64>,
    /// Same, for the flush worker.
    skip_flush: Option<u64>,
    evict_failure: Option<FsError>,
    flush_failure: Option<FsError>,
    /// Callers currently blocked on memory capacity; the worker also
    /// runs for them when the cache is over the plain limit but under
    /// the wake margin. The dirty path needs no counterpart: its waiters
    /// and its worker share one threshold.
    evict_waiters: u32,
}

impl CacheState {
    #[cfg(debug_assertions)]
    fn validate(&self) {
        let memory: u64 = self.page_queue.values().map(|i| i.size).sum();
        let dirty: u64 = self.dirty_queue.values().map(|i| i.size).sum();
        assert_eq!(memory, self.current_memory, "memory counter out of sync");
        assert_eq!(dirty, self.current_dirty, "dirty counter out of sync");
    }

    #[cfg(not(debug_assertions))]
    fn validate(&self) {}

    /// Remove a page from both queues, returning its tracked size.
    fn remove(&mut self, key: PageKey) -> u64 {
        let mut old_size = 0;
        if let Some(info) = self.page_queue.remove(&key) {
            self.current_memory -= info.size;
            old_size = info.size;
        }
        if let Some(info) = self.dirty_queue.remove(&key) {
            self.current_dirty -= info.size;
        }
        old_size
    }

    /// Append a page to the back of both queues as appropriate.
    fn enqueue(&mut self, key: PageKey, mgr: &Arc<PageManager>, size: u64, dirty: bool) -> u64 {
        let old_size = self.remove(key);

        self.page_queue.insert(
            key,
            PageInfo {
                mgr: Arc::downgrade(mgr),
                size,
            },
        );
        self.current_memory += size;

        if dirty {
            self.dirty_queue.insert(
                key,
                PageInfo {
                    mgr: Arc::downgrade(mgr),
                    size,
                },
            );
            self.current_dirty += size;
        }

        self.validate();
        old_size
    }
}

/// The process-wide cache manager.
///
/// Not a global: one instance is created at mount time and passed by
/// reference into every page manager.
pub struct CacheManager {
    opts: CacheOptions,
    pool: Arc<PagePool>,
    state: Mutex<CacheState>,
    /// Wakes the eviction worker.
    evict_notify: Notify,
    /// Wakes the flush worker.
    flush_notify: Notify,
    /// Wakes callers awaiting memory capacity.
    evict_wait: Notify,
    /// Wakes callers awaiting dirty capacity.
    flush_wait: Notify,
    running: AtomicBool,
    next_id: AtomicU64,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl CacheManager {
    /// Create the cache manager and start its eviction and flush workers.
    #[must_use]
    pub fn spawn(opts: CacheOptions) -> Arc<Self> {
        let pool_bound = usize::try_from(opts.memory_limit).unwrap_or(usize::MAX);
        let manager = Arc::new(Self {
            pool: PagePool::new(pool_bound),
            state: Mutex::new(CacheState {
                page_queue: LinkedHashMap::new(),
                dirty_queue: LinkedHashMap::new(),
                current_memory: 0,
                current_dirty: 0,
                dirty_limit: opts.initial_dirty_limit,
                bandwidth: BandwidthMeasure::new(opts.max_dirty_time),
                skip_evict: None,
                skip_flush: None,
                evict_failure: None,
                flush_failure: None,
                evict_waiters: 0,
            }),
            evict_notify: Notify::new(),
            flush_notify: Notify::new(),
            evict_wait: Notify::new(),
            flush_wait: Notify::new(),
            running: AtomicBool::new(true),
            next_id: AtomicU64::new(1),
            workers: Mutex::new(Vec::new()),
            opts,
        });

        let evict = {
            let mgr = Arc::clone(&manager);
            tokio::spawn(async move { mgr.evict_worker().await })
        };
        let flush = {
            let mgr = Arc::clone(&manager);
            tokio::spawn(async move { mgr.flush_worker().await })
        };
        manager.workers.lock().expect("workers lock").extend([evict, flush]);

        info!(memory_limit = manager.opts.memory_limit, "cache manager started");
        manager
    }

    /// Stop both workers and wait for them to exit.
    pub async fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.evict_notify.notify_waiters();
        self.flush_notify.notify_waiters();

        let workers = std::mem::take(&mut *self.workers.lock().expect("workers lock"));
        for handle in workers {
            let _ = handle.await;
        }
    }

    /// Allocate an identity for a new page manager.
    #[must_use]
    pub fn next_manager_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// The shared page buffer pool.
    #[must_use]
    pub fn pool(&self) -> Arc<PagePool> {
        Arc::clone(&self.pool)
    }

    /// The configured memory budget.
    #[must_use]
    pub fn memory_limit(&self) -> u64 {
        self.opts.memory_limit
    }

    /// Record a page as (re)cached, touching its LRU position and dirty
    /// membership, then apply back-pressure if the cache grew over
    /// budget.
    ///
    /// `holds_write` must be true iff the caller holds `mgr`'s exclusive
    /// data lock; it enables synchronous front-of-queue eviction on that
    /// manager, which the worker could never do while the caller holds
    /// the lock.
    pub async fn inform_page(
        &self,
        mgr: &Arc<PageManager>,
        index: u64,
        size: u64,
        dirty: bool,
        can_wait: bool,
        holds_write: bool,
    ) -> Result<(), FsError> {
        let key = PageKey { mgr: mgr.id(), index };

        let old_size = {
            let mut state = self.state.lock().expect("cache state");
            state.enqueue(key, mgr, size, dirty)
        };

        if size > old_size {
            self.handle_memory(mgr, can_wait, holds_write).await?;
            if dirty {
                self.handle_dirty(mgr, can_wait, holds_write).await?;
            }
        }
        Ok(())
    }

    /// Adjust a tracked page's size (last-page growth or shrink). On a
    /// capacity failure while growing, the recorded size is rolled back
    /// and the error returned so the caller can undo the resize.
    pub async fn resize_page(
        &self,
        mgr: &Arc<PageManager>,
        index: u64,
        new_size: u64,
        holds_write: bool,
    ) -> Result<(), FsError> {
        let key = PageKey { mgr: mgr.id(), index };

        fn apply(state: &mut CacheState, key: PageKey, size: u64) -> Option<u64> {
            let old = match state.page_queue.get_mut(&key) {
                Some(info) => {
                    let old = info.size;
                    info.size = size;
                    old
                }
                None => return None,
            };
            state.current_memory = state.current_memory + size - old;
            if let Some(info) = state.dirty_queue.get_mut(&key) {
                let prior = info.size;
                info.size = size;
                state.current_dirty = state.current_dirty + size - prior;
            }
            state.validate();
            Some(old)
        }

        let old_size = {
            let mut state = self.state.lock().expect("cache state");
            match apply(&mut state, key, new_size) {
                Some(old) => old,
                None => return Ok(()), // not tracked
            }
        };

        if new_size > old_size {
            if let Err(e) = self.handle_memory(mgr, true, holds_write).await {
                let mut state = self.state.lock().expect("cache state");
                apply(&mut state, key, old_size);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Forget a page entirely (evicted or truncated away).
    pub fn remove_page(&self, mgr_id: u64, index: u64) {
        let key = PageKey { mgr: mgr_id, index };
        {
            let mut state = self.state.lock().expect("cache state");
            state.remove(key);
            state.validate();
        }
        self.evict_wait.notify_waiters();
        self.flush_wait.notify_waiters();
    }

    /// Drop a page from the dirty queue only (flushed clean; it stays in
    /// the LRU queue).
    pub fn remove_dirty(&self, mgr_id: u64, index: u64) {
        let key = PageKey { mgr: mgr_id, index };
        {
            let mut state = self.state.lock().expect("cache state");
            if let Some(info) = state.dirty_queue.remove(&key) {
                state.current_dirty -= info.size;
            }
            state.validate();
        }
        self.flush_wait.notify_waiters();
    }

    /// Current tracked memory. Test hook.
    #[must_use]
    pub fn memory_usage(&self) -> u64 {
        self.state.lock().expect("cache state").current_memory
    }

    /// Current tracked dirty bytes. Test hook.
    #[must_use]
    pub fn dirty_usage(&self) -> u64 {
        self.state.lock().expect("cache state").current_dirty
    }

    /// LRU-ordered `(manager id, page index)` pairs. Test hook.
    #[doc(hidden)]
    #[must_use]
    pub fn lru_snapshot(&self) -> Vec<(u64, u64)> {
        let state = self.state.lock().expect("cache state");
        state
            .page_queue
            .iter()
            .map(|(k, _)| (k.mgr, k.index))
            .collect()
    }

    /// FIFO-ordered dirty `(manager id, page index)` pairs. Test hook.
    #[doc(hidden)]
    #[must_use]
    pub fn dirty_snapshot(&self) -> Vec<(u64, u64)> {
        let state = self.state.lock().expect("cache state");
        state
            .dirty_queue
            .iter()
            .map(|(k, _)| (k.mgr, k.index))
            .collect()
    }

    fn margin(&self) -> u64 {
        self.opts.memory_limit / u64::from(self.opts.margin_frac)
    }

    /// The eviction worker starts once memory passes `limit + margin`,
    /// or as soon as a caller is blocked over the plain limit.
    fn evict_should_run(&self, state: &CacheState) -> bool {
        state.current_memory > self.opts.memory_limit + self.margin()
            || (state.evict_waiters > 0 && state.current_memory > self.opts.memory_limit)
    }

    /// Once started, eviction aims below `limit - margin`.
    fn evict_target_pending(&self, state: &CacheState) -> bool {
        state.current_memory > self.opts.memory_limit.saturating_sub(self.margin())
    }

    async fn handle_memory(
        &self,
        mgr: &Arc<PageManager>,
        can_wait: bool,
        holds_write: bool,
    ) -> Result<(), FsError> {
        if holds_write {
            // The worker cannot evict from this manager while the caller
            // holds its write lock, so evict synchronously as long as
            // this manager owns the front of the LRU. This also picks up
            // errors directly instead of through the failure slot.
            loop {
                let front = {
                    let state = self.state.lock().expect("cache state");
                    if !(can_wait && state.current_memory > self.opts.memory_limit) {
                        None
                    } else {
                        state
                            .page_queue
                            .front()
                            .filter(|(key, _)| key.mgr == mgr.id())
                            .map(|(key, _)| key.index)
                    }
                };
                match front {
                    Some(index) => {
                        debug!(index, "synchronous evict");
                        mgr.evict_page_locked(index).await?;
                    }
                    None => break,
                }
            }
        }

        {
            let state = self.state.lock().expect("cache state");
            if state.current_memory > self.opts.memory_limit {
                self.evict_notify.notify_one();
            }
        }

        if can_wait {
            {
                let mut state = self.state.lock().expect("cache state");
                state.evict_failure = None;
                state.evict_waiters += 1;
            }
            let result = loop {
                let notified = self.evict_wait.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                {
                    let state = self.state.lock().expect("cache state");
                    if state.current_memory <= self.opts.memory_limit {
                        break Ok(());
                    }
                    if state.evict_failure.is_some() {
                        break Err(FsError::Memory("evict"));
                    }
                    if state.skip_evict == Some(mgr.id()) || state.skip_flush == Some(mgr.id()) {
                        // A worker is waiting on this manager's lock.
                        break Ok(());
                    }
                }
                self.evict_notify.notify_one();
                notified.await;
            };
            self.state.lock().expect("cache state").evict_waiters -= 1;
            return result;
        }
        Ok(())
    }

    async fn handle_dirty(
        &self,
        mgr: &Arc<PageManager>,
        can_wait: bool,
        holds_write: bool,
    ) -> Result<(), FsError> {
        if holds_write {
            loop {
                let front = {
                    let state = self.state.lock().expect("cache state");
                    if !(can_wait && state.current_dirty > state.dirty_limit) {
                        None
                    } else {
                        state
                            .dirty_queue
                            .front()
                            .filter(|(key, _)| key.mgr == mgr.id())
                            .map(|(key, _)| key.index)
                    }
                };
                match front {
                    Some(index) => {
                        debug!(index, "synchronous flush");
                        self.flush_and_measure(mgr, index, true).await?;
                    }
                    None => break,
                }
            }
        }

        {
            let state = self.state.lock().expect("cache state");
            if state.current_dirty > state.dirty_limit {
                self.flush_notify.notify_one();
            }
        }

        if can_wait {
            self.state.lock().expect("cache state").flush_failure = None;
            let result = loop {
                let notified = self.flush_wait.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                {
                    let state = self.state.lock().expect("cache state");
                    if state.current_dirty <= state.dirty_limit {
                        break Ok(());
                    }
                    if state.flush_failure.is_some() {
                        break Err(FsError::Memory("flush"));
                    }
                    if state.skip_evict == Some(mgr.id()) || state.skip_flush == Some(mgr.id()) {
                        break Ok(());
                    }
                }
                self.flush_notify.notify_one();
                notified.await;
            };
            return result;
        }
        Ok(())
    }

    /// Flush starting at `index` and feed the measurement into the dirty
    /// budget. `locked` means the caller already holds the manager's
    /// exclusive data lock.
    async fn flush_and_measure(
        &self,
        mgr: &Arc<PageManager>,
        index: u64,
        locked: bool,
    ) -> Result<(), FsError> {
        let started = Instant::now();
        let written = if locked {
            mgr.flush_page_locked(index).await?
        } else {
            mgr.flush_page(index).await?
        };

        if written > 0 {
            let mut state = self.state.lock().expect("cache state");
            state.dirty_limit = state.bandwidth.update(written, started.elapsed()).max(1);
            debug!(dirty_limit = state.dirty_limit, "dirty budget retargeted");
        }
        Ok(())
    }

    async fn evict_worker(self: Arc<Self>) {
        debug!("eviction worker started");
        loop {
            loop {
                let notified = self.evict_notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                if !self.running.load(Ordering::SeqCst) {
                    debug!("eviction worker exiting");
                    return;
                }
                {
                    let state = self.state.lock().expect("cache state");
                    if self.evict_should_run(&state) && state.evict_failure.is_none() {
                        break;
                    }
                }
                notified.await;
            }

            // Once started, keep going until the target is reached (or
            // nothing evictable remains, or a failure is captured).
            loop {
                {
                    let state = self.state.lock().expect("cache state");
                    if !self.evict_target_pending(&state) || state.evict_failure.is_some() {
                        break;
                    }
                }
                if !self.do_evictions().await {
                    break;
                }
            }
        }
    }

    /// Evict one page from the LRU front. Returns false when there was
    /// nothing to do.
    async fn do_evictions(&self) -> bool {
        // Pick the LRU front whose manager is still alive; dead managers
        // are being torn down and their entries are dropped here.
        let target = {
            let mut state = self.state.lock().expect("cache state");
            let mut found = None;
            while found.is_none() && self.evict_target_pending(&state) {
                let (key, info) = match state.page_queue.front() {
                    Some((key, info)) => (*key, info.mgr.clone()),
                    None => break,
                };
                match info.upgrade() {
                    Some(mgr) => {
                        // Callers on this file may hold the lock we need;
                        // let them continue past their capacity waits.
                        state.skip_evict = Some(key.mgr);
                        found = Some((mgr, key.index));
                    }
                    None => {
                        state.remove(key);
                    }
                }
            }
            found
        };

        let Some((mgr, index)) = target else {
            return false;
        };

        self.evict_wait.notify_waiters();
        self.flush_wait.notify_waiters();

        let result = mgr.evict_page(index).await;

        {
            let mut state = self.state.lock().expect("cache state");
            state.skip_evict = None;
            if let Err(e) = result {
                error!(error = %e, index, "page eviction failed");
                // Send the failed page to the back so a different
                // (possibly clean) page is tried next.
                if let Some(info) = state.page_queue.remove(&PageKey { mgr: mgr.id(), index }) {
                    state.page_queue.insert(PageKey { mgr: mgr.id(), index }, info);
                }
                state.evict_failure = Some(e);
            }
        }

        self.evict_wait.notify_waiters();
        true
    }

    async fn flush_worker(self: Arc<Self>) {
        debug!("flush worker started");
        loop {
            loop {
                let notified = self.flush_notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                if !self.running.load(Ordering::SeqCst) {
                    debug!("flush worker exiting");
                    return;
                }
                {
                    let state = self.state.lock().expect("cache state");
                    if state.current_dirty > state.dirty_limit && state.flush_failure.is_none() {
                        break;
                    }
                }
                notified.await;
            }

            self.do_flushes().await;
        }
    }

    async fn do_flushes(&self) {
        let target = {
            let mut state = self.state.lock().expect("cache state");
            let mut found = None;
            while found.is_none() && state.current_dirty > state.dirty_limit {
                let (key, info) = match state.dirty_queue.front() {
                    Some((key, info)) => (*key, info.mgr.clone()),
                    None => break,
                };
                match info.upgrade() {
                    Some(mgr) => {
                        state.skip_flush = Some(key.mgr);
                        found = Some((mgr, key.index));
                    }
                    None => {
                        state.remove(key);
                    }
                }
            }
            found
        };

        let Some((mgr, index)) = target else {
            return;
        };

        self.evict_wait.notify_waiters();
        self.flush_wait.notify_waiters();

        let result = self.flush_and_measure(&mgr, index, false).await;

        {
            let mut state = self.state.lock().expect("cache state");
            state.skip_flush = None;
            if let Err(e) = result {
                error!(error = %e, index, "page flush failed");
                state.flush_failure = Some(e);
            }
        }

        self.flush_wait.notify_waiters();
    }
}
