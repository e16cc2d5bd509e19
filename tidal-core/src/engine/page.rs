//! Buffer pages: one contiguous allocation carved into fixed-size slots.
//!
//! A page is created with `item_count` slots of `buffer_size` bytes each and
//! never grows. Free slots live on a lock-free [`ArrayQueue`]; popping a slot
//! is what grants a renter exclusive access to its bytes.

use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_queue::ArrayQueue;
use tracing::{debug, warn};

/// Window of a page's arena that one slot currently exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotWindow {
    pub(crate) index: usize,
    pub offset: usize,
    pub len: usize,
}

impl SlotWindow {
    /// Returns the slot's position within its page.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Returns the offset one past the window's last byte.
    pub fn end(&self) -> usize {
        self.offset + self.len
    }
}

/// Heap block backing a page.
struct Arena {
    ptr: NonNull<[u8]>,
}

impl Arena {
    fn zeroed(len: usize) -> Self {
        let boxed: Box<[u8]> = vec![0u8; len].into_boxed_slice();
        // SAFETY: Box::into_raw never returns null.
        let ptr = unsafe { NonNull::new_unchecked(Box::into_raw(boxed)) };
        Self { ptr }
    }

    fn base(&self) -> *mut u8 {
        self.ptr.as_ptr() as *mut u8
    }

    fn len(&self) -> usize {
        self.ptr.len()
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        // SAFETY: ptr came from Box::into_raw in `zeroed` and is dropped once.
        drop(unsafe { Box::from_raw(self.ptr.as_ptr()) });
    }
}

// SAFETY: the arena is plain bytes. Concurrent access is confined to disjoint
// slot windows, each owned by at most one lease (see BufferPage::try_rent).
unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

/// A batch-allocated group of slots sharing one arena.
pub struct BufferPage {
    id: u64,
    arena: Arena,
    item_count: usize,
    buffer_size: usize,
    free: ArrayQueue<SlotWindow>,
    last_access_ms: AtomicU64,
}

impl BufferPage {
    /// Allocate `item_count * buffer_size` bytes and partition them into slots.
    pub(crate) fn create(id: u64, item_count: usize, buffer_size: usize, now_ms: u64) -> Self {
        let arena = Arena::zeroed(item_count * buffer_size);
        let free = ArrayQueue::new(item_count);
        for index in 0..item_count {
            let slot = SlotWindow {
                index,
                offset: index * buffer_size,
                len: buffer_size,
            };
            // Capacity is exactly item_count, so this cannot fail.
            let _ = free.push(slot);
        }
        debug!(page = id, item_count, buffer_size, "Created buffer page");
        Self {
            id,
            arena,
            item_count,
            buffer_size,
            free,
            last_access_ms: AtomicU64::new(now_ms),
        }
    }

    /// Identity of the page's arena.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Returns the number of slots the page was carved into.
    pub fn item_count(&self) -> usize {
        self.item_count
    }

    /// Returns the size of each slot in bytes.
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Slots currently leased out.
    pub fn leased(&self) -> usize {
        self.item_count - self.free.len()
    }

    /// Returns `true` while any slot is leased out.
    pub fn is_leasing(&self) -> bool {
        self.leased() > 0
    }

    /// Returns when a slot was last rented or returned, in milliseconds
    /// since the pool was created.
    pub fn last_access_ms(&self) -> u64 {
        self.last_access_ms.load(Ordering::Relaxed)
    }

    /// Whether the sweep may drop this page.
    pub(crate) fn is_evictable(&self, now_ms: u64, idle_timeout_ms: u64) -> bool {
        !self.is_leasing() && now_ms.saturating_sub(self.last_access_ms()) > idle_timeout_ms
    }

    /// The full-size window slot `index` was created with.
    pub(crate) fn original_window(&self, index: usize) -> SlotWindow {
        SlotWindow {
            index,
            offset: index * self.buffer_size,
            len: self.buffer_size,
        }
    }

    /// Pop a free slot. The caller owns the slot's bytes until it is given back.
    pub(crate) fn try_rent(&self, now_ms: u64) -> Option<SlotWindow> {
        let slot = self.free.pop()?;
        self.last_access_ms.store(now_ms, Ordering::Relaxed);
        Some(slot)
    }

    pub(crate) fn give_back(&self, slot: SlotWindow, now_ms: u64) {
        debug_assert_eq!(slot, self.original_window(slot.index), "slot window not restored");
        self.last_access_ms.store(now_ms, Ordering::Relaxed);
        if self.free.push(slot).is_err() {
            warn!(page = self.id, index = slot.index, "Slot returned twice, ignoring");
        }
    }

    /// Bytes of `window`.
    ///
    /// # Safety
    /// The caller must own `window`'s slot (popped via `try_rent` and not yet
    /// given back) and `window` must lie inside that slot.
    pub(crate) unsafe fn bytes(&self, window: SlotWindow) -> &[u8] {
        debug_assert!(window.end() <= self.arena.len());
        std::slice::from_raw_parts(self.arena.base().add(window.offset), window.len)
    }

    /// Mutable bytes of `window`.
    ///
    /// # Safety
    /// Same as [`bytes`](Self::bytes); additionally no other reference into
    /// the slot may be alive.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn bytes_mut(&self, window: SlotWindow) -> &mut [u8] {
        debug_assert!(window.end() <= self.arena.len());
        std::slice::from_raw_parts_mut(self.arena.base().add(window.offset), window.len)
    }
}

impl fmt::Debug for BufferPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPage")
            .field("id", &self.id)
            .field("item_count", &self.item_count)
            .field("buffer_size", &self.buffer_size)
            .field("leased", &self.leased())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_partitions_slots() {
        let page = BufferPage::create(1, 4, 16, 0);
        assert_eq!(page.item_count(), 4);
        assert_eq!(page.leased(), 0);

        let mut offsets: Vec<usize> = (0..4).map(|_| page.try_rent(1).unwrap().offset).collect();
        offsets.sort_unstable();
        assert_eq!(offsets, vec![0, 16, 32, 48]);
        assert!(page.try_rent(1).is_none());
        assert_eq!(page.leased(), 4);
    }

    #[test]
    fn test_give_back_updates_last_access() {
        let page = BufferPage::create(1, 2, 8, 10);
        let slot = page.try_rent(20).unwrap();
        assert_eq!(page.last_access_ms(), 20);
        assert!(page.is_leasing());

        page.give_back(slot, 35);
        assert_eq!(page.last_access_ms(), 35);
        assert!(!page.is_leasing());
    }

    #[test]
    fn test_eviction_requires_idle_and_unleased() {
        let page = BufferPage::create(1, 1, 8, 0);
        assert!(!page.is_evictable(100, 100));
        assert!(page.is_evictable(101, 100));

        let slot = page.try_rent(0).unwrap();
        assert!(!page.is_evictable(10_000, 100));
        page.give_back(slot, 0);
        assert!(page.is_evictable(10_000, 100));
    }

    #[test]
    fn test_slot_bytes_are_disjoint() {
        let page = BufferPage::create(1, 2, 4, 0);
        let a = page.try_rent(0).unwrap();
        let b = page.try_rent(0).unwrap();
        unsafe {
            page.bytes_mut(a).fill(0xAA);
            page.bytes_mut(b).fill(0xBB);
            assert!(page.bytes(a).iter().all(|&x| x == 0xAA));
            assert!(page.bytes(b).iter().all(|&x| x == 0xBB));
        }
        page.give_back(a, 0);
        page.give_back(b, 0);
    }
}
