//! Scoped ownership of one pooled slot.
//!
//! A [`Lease`] is the only way to touch a slot's bytes. It remembers the
//! window the slot was issued with; whatever the holder does to the window
//! (narrowing it to a short send, advancing past a partial write), releasing
//! the lease puts the original window back before the slot returns to its
//! page. Release happens exactly once, either explicitly or on drop.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::engine::buffer::PoolShared;
use crate::engine::page::{BufferPage, SlotWindow};

/// An exclusive claim on one buffer slot.
pub struct Lease {
    pool: Arc<PoolShared>,
    page: Arc<BufferPage>,
    window: SlotWindow,
    original: SlotWindow,
    released: bool,
    metadata: Option<Box<dyn Any + Send + Sync>>,
}

impl Lease {
    pub(crate) fn new(pool: Arc<PoolShared>, page: Arc<BufferPage>, slot: SlotWindow) -> Self {
        Self {
            pool,
            page,
            window: slot,
            original: slot,
            released: false,
            metadata: None,
        }
    }

    /// Identity of the page buffer backing this lease.
    pub fn buffer_id(&self) -> u64 {
        self.page.id()
    }

    /// Offset of the current window inside the page buffer.
    pub fn offset(&self) -> usize {
        self.window.offset
    }

    /// Length of the current window.
    pub fn len(&self) -> usize {
        if self.released {
            0
        } else {
            self.window.len
        }
    }

    /// Returns `true` when the window has no bytes left.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Full size of the slot.
    pub fn capacity(&self) -> usize {
        self.original.len
    }

    /// The window this lease was issued with.
    pub fn original_window(&self) -> SlotWindow {
        self.original
    }

    /// Returns the current window, after any `narrow` or `advance`.
    pub fn window(&self) -> SlotWindow {
        self.window
    }

    /// Returns `true` once the slot has gone back to the pool.
    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Returns the bytes inside the current window. Empty once released.
    pub fn as_slice(&self) -> &[u8] {
        if self.released {
            return &[];
        }
        // SAFETY: the slot was popped from the page's free list for this
        // lease and has not been given back; the window stays inside it.
        unsafe { self.page.bytes(self.window) }
    }

    /// Returns the current window for writing. Empty once released.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        if self.released {
            return &mut [];
        }
        // SAFETY: as above, and `&mut self` rules out any other borrow.
        unsafe { self.page.bytes_mut(self.window) }
    }

    /// Shrink the window to its first `len` bytes.
    pub fn narrow(&mut self, len: usize) {
        self.window.len = len.min(self.window.len);
    }

    /// Drop the first `n` bytes from the window.
    pub fn advance(&mut self, n: usize) {
        let n = n.min(self.window.len);
        self.window.offset += n;
        self.window.len -= n;
    }

    /// Put the original full-size window back.
    pub fn restore_window(&mut self) {
        self.window = self.original;
    }

    /// Attach holder-defined metadata, replacing any previous value.
    pub fn set_metadata<T: Any + Send + Sync>(&mut self, value: T) {
        self.metadata = Some(Box::new(value));
    }

    /// Returns the attached metadata if it is a `T`.
    pub fn metadata<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.metadata.as_ref().and_then(|m| m.downcast_ref::<T>())
    }

    /// Detaches and returns the metadata, whatever its type.
    pub fn take_metadata(&mut self) -> Option<Box<dyn Any + Send + Sync>> {
        self.metadata.take()
    }

    /// Return the slot to its pool. Later calls do nothing.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.metadata = None;
        if self.window != self.original {
            self.window = self.original;
        }
        self.pool.give_back(&self.page, self.original);
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("buffer_id", &self.buffer_id())
            .field("window", &self.window)
            .field("original", &self.original)
            .field("released", &self.released)
            .finish()
    }
}
