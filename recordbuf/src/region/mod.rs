//! Word-addressed atomic views over a fixed-capacity memory region.
//!
//! A region is addressed by byte offset, but every access is a 32-bit word
//! access, so offsets handed to [`AtomicRegion`] must be 4-byte aligned. Two
//! backings are provided:
//!
//! - [`HeapRegion`]: owns its words. Used in-process, in tests and under loom.
//! - [`RawRegion`]: borrows a raw pointer whose lifetime the caller manages
//!   (an mmap'd segment, a JNI direct buffer).
//!
//! # Memory ordering
//!
//! Orderings are fixed per primitive rather than per call site:
//!
//! - `load_acquire` pairs with the read-modify-write operations that publish
//!   status transitions and Position Field advances.
//! - `load_plain` / `store_plain` are `Relaxed`. They carry keys and payload
//!   bytes, which are published by a later status transition.
//! - `compare_and_swap` / `fetch_add` are `SeqCst` full barriers.

use crate::sync::{AtomicU32, Ordering};

/// Size in bytes of every word the region hands out.
pub const WORD_SIZE: usize = 4;

pub trait AtomicRegion {
    /// Total addressable bytes.
    fn capacity(&self) -> usize;

    /// The word starting at byte `offset`.
    ///
    /// Panics if `offset` is not word aligned or the word ends past
    /// [`capacity`](AtomicRegion::capacity).
    fn word(&self, offset: usize) -> &AtomicU32;

    #[inline]
    fn load_acquire(&self, offset: usize) -> u32 {
        self.word(offset).load(Ordering::Acquire)
    }

    #[inline]
    fn load_plain(&self, offset: usize) -> u32 {
        self.word(offset).load(Ordering::Relaxed)
    }

    #[inline]
    fn store_plain(&self, offset: usize, value: u32) {
        self.word(offset).store(value, Ordering::Relaxed)
    }

    /// Returns `true` if the word held `expected` and now holds `new`.
    #[inline]
    fn compare_and_swap(&self, offset: usize, expected: u32, new: u32) -> bool {
        self.word(offset)
            .compare_exchange(expected, new, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Adds `delta` and returns the previous value.
    #[inline]
    fn fetch_add(&self, offset: usize, delta: u32) -> u32 {
        self.word(offset).fetch_add(delta, Ordering::SeqCst)
    }

    /// Copy `dst.len()` bytes starting at `offset` out of the region.
    fn read_bytes(&self, offset: usize, dst: &mut [u8]) {
        for (i, chunk) in dst.chunks_mut(WORD_SIZE).enumerate() {
            let word = self.load_plain(offset + i * WORD_SIZE).to_ne_bytes();
            chunk.copy_from_slice(&word[..chunk.len()]);
        }
    }

    /// Copy `src` into the region starting at `offset`.
    ///
    /// A trailing partial word keeps the bytes of the region that `src` does
    /// not cover.
    fn write_bytes(&self, offset: usize, src: &[u8]) {
        for (i, chunk) in src.chunks(WORD_SIZE).enumerate() {
            let at = offset + i * WORD_SIZE;
            let mut word = if chunk.len() == WORD_SIZE {
                [0u8; WORD_SIZE]
            } else {
                self.load_plain(at).to_ne_bytes()
            };
            word[..chunk.len()].copy_from_slice(chunk);
            self.store_plain(at, u32::from_ne_bytes(word));
        }
    }
}

impl<R: AtomicRegion + ?Sized> AtomicRegion for &R {
    #[inline]
    fn capacity(&self) -> usize {
        (**self).capacity()
    }

    #[inline]
    fn word(&self, offset: usize) -> &AtomicU32 {
        (**self).word(offset)
    }
}

#[inline]
fn check_word(offset: usize, capacity: usize) {
    assert!(
        offset % WORD_SIZE == 0,
        "offset {} is not {}-byte aligned",
        offset,
        WORD_SIZE
    );
    assert!(
        offset + WORD_SIZE <= capacity,
        "word at offset {} ends past region capacity {}",
        offset,
        capacity
    );
}

/// A zero-initialised region that owns its memory.
pub struct HeapRegion {
    words: Box<[AtomicU32]>,
}

impl HeapRegion {
    /// Allocate `capacity` zeroed bytes, rounded down to whole words.
    pub fn new_zeroed(capacity: usize) -> HeapRegion {
        let words = (0..capacity / WORD_SIZE)
            .map(|_| AtomicU32::new(0))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        HeapRegion { words }
    }
}

impl AtomicRegion for HeapRegion {
    #[inline]
    fn capacity(&self) -> usize {
        self.words.len() * WORD_SIZE
    }

    #[inline]
    fn word(&self, offset: usize) -> &AtomicU32 {
        check_word(offset, self.capacity());
        &self.words[offset / WORD_SIZE]
    }
}

/// A region over memory owned by someone else.
#[cfg(not(feature = "loom"))]
#[derive(Clone, Copy)]
pub struct RawRegion {
    ptr: *mut u8,
    len: usize,
}

// SAFETY: every access goes through an atomic word, and the creator of the
// region guarantees the memory outlives every use of it.
#[cfg(not(feature = "loom"))]
unsafe impl Send for RawRegion {}
#[cfg(not(feature = "loom"))]
unsafe impl Sync for RawRegion {}

#[cfg(not(feature = "loom"))]
impl RawRegion {
    /// # Safety
    ///
    /// `ptr` must be valid for reads and writes of `len` bytes for as long as
    /// the returned region (or any copy of it) is used, and must only be
    /// accessed through atomic operations while shared.
    pub unsafe fn from_raw(ptr: *mut u8, len: usize) -> RawRegion {
        assert!(!ptr.is_null(), "region pointer is null");
        assert!(
            ptr as usize % std::mem::align_of::<AtomicU32>() == 0,
            "region pointer is not 4-byte aligned"
        );
        RawRegion { ptr, len }
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }
}

#[cfg(not(feature = "loom"))]
impl AtomicRegion for RawRegion {
    #[inline]
    fn capacity(&self) -> usize {
        self.len
    }

    #[inline]
    fn word(&self, offset: usize) -> &AtomicU32 {
        check_word(offset, self.len);
        // SAFETY: bounds and alignment are checked above, validity is
        // guaranteed by the contract of `from_raw`.
        unsafe { &*(self.ptr.add(offset) as *const AtomicU32) }
    }
}
