//! Paged Buffer Pool for Socket I/O
//!
//! This module supplies every receive and send with a transfer buffer drawn
//! from a set of pre-allocated pages, so steady-state traffic never touches
//! the allocator and no two in-flight operations share memory.
//!
//! # Performance-First Design:
//! - Each page is one contiguous allocation split into fixed-size slots
//! - Renting pops a lock-free free list; the page list is only read-locked
//! - The pool grows by one page when every slot is leased, it never waits
//! - An idle sweep drops unleased pages after a load spike subsides
//!
//! # Usage
//! ```rust,no_run
//! use tidal_core::{BufferPool, PoolConfig};
//!
//! let pool = BufferPool::new(PoolConfig::default())?;
//! let mut lease = pool.rent();
//! lease.as_mut_slice()[..5].copy_from_slice(b"hello");
//! lease.narrow(5);
//! drop(lease); // slot goes back with its full window
//! # Ok::<(), tidal_core::TransportError>(())
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, OnceLock, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::config::PoolConfig;
use crate::engine::lease::Lease;
use crate::engine::page::{BufferPage, SlotWindow};
use crate::error::TransportError;

/// Runtime statistics for a [`BufferPool`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStats {
    /// Pages currently held by the pool.
    pub pages: usize,
    /// Slots across all pages.
    pub total_slots: usize,
    /// Slots currently checked out.
    pub leased: usize,
    /// Cumulative number of successful rents.
    pub rents: u64,
    pub pages_created: u64,
    pub pages_evicted: u64,
}

/// State shared by pool handles and outstanding leases.
pub(crate) struct PoolShared {
    config: PoolConfig,
    pages: RwLock<Vec<Arc<BufferPage>>>,
    epoch: Instant,
    next_page_id: AtomicU64,
    rents: AtomicU64,
    pages_created: AtomicU64,
    pages_evicted: AtomicU64,
}

impl PoolShared {
    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// Push a slot back onto the page that owns it.
    pub(crate) fn give_back(&self, page: &Arc<BufferPage>, slot: SlotWindow) {
        let now = self.now_ms();
        let pages = self.pages.read();
        match pages.iter().find(|p| Arc::ptr_eq(p, page)) {
            Some(owner) => owner.give_back(slot, now),
            None => warn!(page = page.id(), "Returned slot belongs to no live page"),
        }
    }

    fn rent(self: &Arc<Self>) -> Lease {
        loop {
            let now = self.now_ms();
            {
                let pages = self.pages.read();
                for page in pages.iter() {
                    if let Some(slot) = page.try_rent(now) {
                        return self.lease(page, slot);
                    }
                }
            }

            let mut pages = self.pages.write();
            // Another renter may have grown the pool, or a slot came back,
            // while we waited for the write lock.
            for page in pages.iter() {
                if let Some(slot) = page.try_rent(now) {
                    return self.lease(page, slot);
                }
            }

            let id = self.next_page_id.fetch_add(1, Ordering::Relaxed);
            let page = Arc::new(BufferPage::create(
                id,
                self.config.items_per_page,
                self.config.buffer_size,
                now,
            ));
            pages.push(page.clone());
            self.pages_created.fetch_add(1, Ordering::Relaxed);
            info!(page = id, pages = pages.len(), "Buffer pool exhausted, added page");

            if let Some(slot) = page.try_rent(now) {
                return self.lease(&page, slot);
            }
        }
    }

    fn lease(self: &Arc<Self>, page: &Arc<BufferPage>, slot: SlotWindow) -> Lease {
        self.rents.fetch_add(1, Ordering::Relaxed);
        Lease::new(self.clone(), page.clone(), slot)
    }

    fn sweep_idle(&self) -> usize {
        let now = self.now_ms();
        let timeout = self.config.idle_timeout.as_millis() as u64;

        if !self
            .pages
            .read()
            .iter()
            .any(|p| p.is_evictable(now, timeout))
        {
            return 0;
        }

        let mut pages = self.pages.write();
        let before = pages.len();
        // Rents and returns hold the read lock, so the leased counts are
        // stable while we hold the write lock.
        pages.retain(|p| !p.is_evictable(now, timeout));
        let removed = before - pages.len();
        if removed > 0 {
            self.pages_evicted
                .fetch_add(removed as u64, Ordering::Relaxed);
            info!(removed, remaining = pages.len(), "Evicted idle buffer pages");
        }
        removed
    }

    fn stats(&self) -> PoolStats {
        let pages = self.pages.read();
        PoolStats {
            pages: pages.len(),
            total_slots: pages.iter().map(|p| p.item_count()).sum(),
            leased: pages.iter().map(|p| p.leased()).sum(),
            rents: self.rents.load(Ordering::Relaxed),
            pages_created: self.pages_created.load(Ordering::Relaxed),
            pages_evicted: self.pages_evicted.load(Ordering::Relaxed),
        }
    }
}

/// Owns the background sweep thread; dropping it stops and joins the thread.
struct Sweeper {
    stop: Option<mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl Sweeper {
    fn spawn(shared: Weak<PoolShared>, interval: Duration) -> Option<Self> {
        let (tx, rx) = mpsc::channel::<()>();
        let spawned = std::thread::Builder::new()
            .name("tidal-pool-sweep".into())
            .spawn(move || loop {
                match rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => match shared.upgrade() {
                        Some(shared) => {
                            shared.sweep_idle();
                        }
                        None => break,
                    },
                    _ => break,
                }
            });

        match spawned {
            Ok(thread) => {
                debug!(?interval, "Started buffer pool sweeper");
                Some(Self {
                    stop: Some(tx),
                    thread: Some(thread),
                })
            }
            Err(err) => {
                warn!(%err, "Could not start buffer pool sweeper; idle pages stay resident");
                None
            }
        }
    }
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        // Disconnecting the channel wakes the thread.
        drop(self.stop.take());
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("Buffer pool sweeper panicked");
            }
        }
    }
}

/// A pool of fixed-size transfer buffers organised in pages.
///
/// Handles are cheap to clone and share one set of pages. Leases keep the
/// pages they borrow from alive even if every handle is dropped.
#[derive(Clone)]
pub struct BufferPool {
    shared: Arc<PoolShared>,
    _sweeper: Option<Arc<Sweeper>>,
}

impl BufferPool {
    /// Create a pool, validating `config` first.
    pub fn new(config: PoolConfig) -> Result<Self, TransportError> {
        config.validate()?;
        Ok(Self::build(config))
    }

    fn build(config: PoolConfig) -> Self {
        info!(
            items_per_page = config.items_per_page,
            buffer_size = config.buffer_size,
            idle_timeout = ?config.idle_timeout,
            "Creating BufferPool"
        );
        let sweep_interval = config.sweep_interval;
        let shared = Arc::new(PoolShared {
            config,
            pages: RwLock::new(Vec::new()),
            epoch: Instant::now(),
            next_page_id: AtomicU64::new(1),
            rents: AtomicU64::new(0),
            pages_created: AtomicU64::new(0),
            pages_evicted: AtomicU64::new(0),
        });
        let sweeper = sweep_interval
            .and_then(|interval| Sweeper::spawn(Arc::downgrade(&shared), interval))
            .map(Arc::new);
        Self {
            shared,
            _sweeper: sweeper,
        }
    }

    /// Lease a free slot, adding a page if every slot is taken.
    pub fn rent(&self) -> Lease {
        self.shared.rent()
    }

    /// Release `lease` back to the pool. Same as dropping it.
    pub fn give_back(&self, mut lease: Lease) {
        lease.release();
    }

    /// Remove unleased pages idle for longer than the configured timeout.
    /// Returns how many pages were removed.
    pub fn sweep_idle(&self) -> usize {
        self.shared.sweep_idle()
    }

    /// Returns the configuration the pool was built with.
    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// Snapshot the pool's runtime statistics.
    pub fn stats(&self) -> PoolStats {
        self.shared.stats()
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::build(PoolConfig::default())
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("config", &self.shared.config)
            .field("stats", &self.stats())
            .finish()
    }
}

/// Process-wide pool with default sizing, created on first use.
pub fn shared_pool() -> &'static BufferPool {
    static SHARED: OnceLock<BufferPool> = OnceLock::new();
    SHARED.get_or_init(BufferPool::default)
}
