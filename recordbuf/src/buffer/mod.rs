//! The record buffer: keyed, fixed-size records in a shared region.
//!
//! ```text
//!  +----------------------------+
//!  |           Header           |
//!  |             ....           |
//!  +----------------------------+
//!  |        Position Field      |  <- header_size - 4
//!  +----------------------------+
//!  |        Status Field 0      |  <- header_size
//!  +----------------------------+
//!  |         Key Field 0        |
//!  +----------------------------+
//!  |          Payload 0         |
//!  |             ....           |
//!  +----------------------------+
//!  |        Status Field 1      |
//!  +----------------------------+
//!  |             ....           |
//! ```
//!
//! Every slot moves through `UNUSED -> PENDING` once, when it is allocated,
//! and then `COMMITTED -> PENDING -> COMMITTED` for every update. A `PENDING`
//! status means exactly one writer owns the slot.
//!
//! Readers get no snapshot isolation: a payload can be overwritten while a
//! reader is copying it out.

mod retry;

use std::mem;

use tracing::{debug, error, trace};

use crate::errors::{NoSlotClaimed, RecordBufError};
use crate::region::{AtomicRegion, WORD_SIZE};

pub use retry::{RetryConfig, RetryPolicy, DEFAULT_PAUSE};

pub const UNUSED: u32 = 0;
pub const PENDING: u32 = 1;
pub const COMMITTED: u32 = 2;

pub const SIZE_OF_POSITION_FIELD: usize = 4;
pub const SIZE_OF_STATUS_FIELD: usize = 4;
pub const SIZE_OF_KEY_FIELD: usize = 4;
pub const SIZE_OF_RECORD_FRAME: usize = SIZE_OF_STATUS_FIELD + SIZE_OF_KEY_FIELD;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotStatus {
    Unused,
    Pending,
    Committed,
}

impl SlotStatus {
    pub fn from_raw(raw: u32) -> Option<SlotStatus> {
        match raw {
            UNUSED => Some(SlotStatus::Unused),
            PENDING => Some(SlotStatus::Pending),
            COMMITTED => Some(SlotStatus::Committed),
            _ => None,
        }
    }
}

/// Offsets derived from the header and record sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    pub position_field_offset: usize,
    pub first_slot_offset: usize,
    pub slot_size: usize,
    pub record_size: usize,
    /// End of the last whole slot that fits in the region.
    pub slots_end: usize,
}

impl Layout {
    pub fn new(capacity: usize, header_size: usize, record_size: usize) -> Result<Layout, RecordBufError> {
        if header_size < SIZE_OF_POSITION_FIELD {
            return Err(RecordBufError::Layout(format!(
                "header_size {} has no room for the position field",
                header_size
            )));
        }
        if header_size % WORD_SIZE != 0 || record_size % WORD_SIZE != 0 {
            return Err(RecordBufError::Layout(format!(
                "header_size {} and record_size {} must be multiples of {}",
                header_size, record_size, WORD_SIZE
            )));
        }
        if capacity < header_size {
            return Err(RecordBufError::Layout(format!(
                "region of {} bytes is smaller than the {} byte header",
                capacity, header_size
            )));
        }
        // Claimers losing the capacity race push the position past the last
        // slot, so leave the upper half of the field free for that overshoot.
        if capacity > i32::MAX as usize {
            return Err(RecordBufError::Layout(format!(
                "region of {} bytes cannot be addressed by the position field",
                capacity
            )));
        }

        let slot_size = record_size + SIZE_OF_RECORD_FRAME;
        let slot_count = (capacity - header_size) / slot_size;
        Ok(Layout {
            position_field_offset: header_size - SIZE_OF_POSITION_FIELD,
            first_slot_offset: header_size,
            slot_size,
            record_size,
            slots_end: header_size + slot_count * slot_size,
        })
    }

    /// Bytes a region needs to hold `slots` records.
    pub fn required_capacity(header_size: usize, record_size: usize, slots: usize) -> usize {
        header_size + slots * (record_size + SIZE_OF_RECORD_FRAME)
    }

    #[inline]
    pub fn slot_count(&self) -> usize {
        (self.slots_end - self.first_slot_offset) / self.slot_size
    }

    /// Whether `offset` is the payload offset of some slot in the region.
    pub fn is_payload_offset(&self, offset: usize) -> bool {
        offset >= self.first_slot_offset + SIZE_OF_RECORD_FRAME
            && (offset - SIZE_OF_RECORD_FRAME - self.first_slot_offset) % self.slot_size == 0
            && offset - SIZE_OF_RECORD_FRAME + self.slot_size <= self.slots_end
    }
}

pub struct RecordBuffer<R> {
    region: R,
    layout: Layout,
    retry: RetryPolicy,
}

impl<R: AtomicRegion> RecordBuffer<R> {
    /// `header_size` includes the position field at its tail.
    pub fn new(region: R, header_size: usize, record_size: usize) -> Result<Self, RecordBufError> {
        let layout = Layout::new(region.capacity(), header_size, record_size)?;
        Ok(RecordBuffer {
            region,
            layout,
            retry: RetryPolicy::default(),
        })
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    #[inline]
    pub fn region(&self) -> &R {
        &self.region
    }

    #[inline]
    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    #[inline]
    pub fn record_size(&self) -> usize {
        self.layout.record_size
    }

    pub fn into_region(self) -> R {
        self.region
    }

    /// Point the position field at the first slot.
    ///
    /// Must run on one thread before anything else touches the buffer.
    /// Returns `false` if the buffer was already initialised.
    pub fn initialise(&self) -> bool {
        let initialised = self.region.compare_and_swap(
            self.layout.position_field_offset,
            0,
            self.layout.first_slot_offset as u32,
        );
        if initialised {
            debug!(
                first_slot = self.layout.first_slot_offset,
                slot_size = self.layout.slot_size,
                slots = self.layout.slot_count(),
                "initialised record buffer"
            );
        } else {
            debug!(position = self.position(), "record buffer already initialised");
        }
        initialised
    }

    #[inline]
    pub fn is_initialised(&self) -> bool {
        self.position() >= self.layout.first_slot_offset
    }

    /// Offset of the first unallocated byte.
    #[inline]
    pub fn position(&self) -> usize {
        self.region.load_acquire(self.layout.position_field_offset) as usize
    }

    // Claimers that lose the capacity race push the position past the last
    // whole slot, so every scan stops at whichever comes first.
    #[inline]
    fn scan_limit(&self) -> usize {
        self.position().min(self.layout.slots_end)
    }

    /// Number of slots allocated so far.
    pub fn len(&self) -> usize {
        self.scan_limit().saturating_sub(self.layout.first_slot_offset) / self.layout.slot_size
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    fn key_at(&self, slot_offset: usize) -> i32 {
        self.region.load_plain(slot_offset + SIZE_OF_STATUS_FIELD) as i32
    }

    /// Status of the slot owning `payload_offset`.
    ///
    /// `None` for an offset that is not a payload offset, or a corrupt status.
    pub fn status(&self, payload_offset: usize) -> Option<SlotStatus> {
        if !self.layout.is_payload_offset(payload_offset) {
            return None;
        }
        SlotStatus::from_raw(self.region.load_acquire(payload_offset - SIZE_OF_RECORD_FRAME))
    }

    /// Claim the record for `key`, returning its payload offset.
    ///
    /// An existing record is reused in place. Otherwise a fresh slot is
    /// appended. The claim is exclusive until [`commit`](Self::commit).
    ///
    /// Two threads creating the same new key at the same time each get their
    /// own slot; serialize first use of a key if that matters.
    pub fn claim(&self, key: i32) -> Result<usize, NoSlotClaimed> {
        let layout = &self.layout;
        let mut offset = layout.first_slot_offset;

        loop {
            let position = self.position();
            if position < layout.first_slot_offset {
                return Err(NoSlotClaimed::Uninitialised);
            }
            if offset >= position.min(layout.slots_end) {
                break;
            }

            if self.key_at(offset) == key {
                match self.region.load_acquire(offset) {
                    // Allocated by another writer that has not stored its key.
                    UNUSED => {}
                    PENDING => return Err(NoSlotClaimed::KeyPending),
                    // The key was still zero on the first look.
                    _ if self.key_at(offset) != key => {}
                    _ => {
                        if !self.transition(offset, COMMITTED, PENDING) {
                            return Err(NoSlotClaimed::Stalled);
                        }
                        return Ok(offset + SIZE_OF_RECORD_FRAME);
                    }
                }
            }

            offset += layout.slot_size;
        }

        if offset + layout.slot_size > layout.slots_end {
            return Err(NoSlotClaimed::BufferFull);
        }

        let claimed = self
            .region
            .fetch_add(layout.position_field_offset, layout.slot_size as u32) as usize;
        if claimed + layout.slot_size > layout.slots_end {
            trace!(key, claimed, "lost the race for the last slot");
            return Err(NoSlotClaimed::BufferFull);
        }

        if !self.transition(claimed, UNUSED, PENDING) {
            return Err(NoSlotClaimed::Stalled);
        }
        self.region
            .store_plain(claimed + SIZE_OF_STATUS_FIELD, key as u32);
        trace!(key, offset = claimed, "allocated slot");
        Ok(claimed + SIZE_OF_RECORD_FRAME)
    }

    /// Publish a claimed record.
    ///
    /// `payload_offset` must come from [`claim`](Self::claim). Committing
    /// anything else waits until the retry policy gives up, which by default
    /// is never.
    pub fn commit(&self, payload_offset: usize) -> Result<(), RecordBufError> {
        debug_assert!(
            self.layout.is_payload_offset(payload_offset),
            "{} is not a payload offset",
            payload_offset
        );
        if self.transition(payload_offset - SIZE_OF_RECORD_FRAME, PENDING, COMMITTED) {
            Ok(())
        } else {
            Err(RecordBufError::Stalled {
                offset: payload_offset,
            })
        }
    }

    /// Claim `key` and hand back a guard that commits when dropped.
    pub fn scoped(&self, key: i32) -> Result<RecordGuard<'_, R>, NoSlotClaimed> {
        let offset = self.claim(key)?;
        Ok(RecordGuard {
            buffer: self,
            offset,
        })
    }

    /// Claim `key`, let `write` fill the payload, then commit.
    ///
    /// Returns `false` without calling `write` if the claim fails. The commit
    /// happens even if `write` panics, so a half-written payload can become
    /// visible to readers.
    pub fn with_record<F>(&self, key: i32, write: F) -> bool
    where
        F: FnOnce(usize),
    {
        let guard = match self.scoped(key) {
            Ok(guard) => guard,
            Err(_) => return false,
        };
        write(guard.offset);
        drop(guard);
        true
    }

    /// Like [`with_record`](Self::with_record) for writers that can fail.
    ///
    /// The record is committed before the error is returned.
    pub fn try_with_record<F, E>(&self, key: i32, write: F) -> Result<bool, E>
    where
        F: FnOnce(usize) -> Result<(), E>,
    {
        let guard = match self.scoped(key) {
            Ok(guard) => guard,
            Err(_) => return Ok(false),
        };
        write(guard.offset)?;
        drop(guard);
        Ok(true)
    }

    /// Committed records up to the current position.
    pub fn records(&self) -> Records<'_, R> {
        Records {
            buffer: self,
            offset: self.layout.first_slot_offset,
            limit: self.scan_limit(),
        }
    }

    /// Call `handler(key, payload_offset)` for every committed record.
    pub fn for_each<F>(&self, mut handler: F)
    where
        F: FnMut(i32, usize),
    {
        for (key, offset) in self.records() {
            handler(key, offset);
        }
    }

    pub fn write_payload(&self, payload_offset: usize, src: &[u8]) -> Result<(), RecordBufError> {
        if src.len() > self.layout.record_size {
            return Err(RecordBufError::PayloadTooLarge {
                len: src.len(),
                record_size: self.layout.record_size,
            });
        }
        self.region.write_bytes(payload_offset, src);
        Ok(())
    }

    /// Copy up to `record_size` bytes of payload into `dst`.
    pub fn read_payload(&self, payload_offset: usize, dst: &mut [u8]) {
        let len = dst.len().min(self.layout.record_size);
        self.region.read_bytes(payload_offset, &mut dst[..len]);
    }

    fn transition(&self, status_offset: usize, from: u32, to: u32) -> bool {
        let mut backoff = self.retry.backoff();
        while !self.region.compare_and_swap(status_offset, from, to) {
            if !backoff.snooze(status_offset) {
                return false;
            }
        }
        true
    }
}

/// Snapshot-bounded walk over committed records, yielding `(key, payload_offset)`.
pub struct Records<'a, R> {
    buffer: &'a RecordBuffer<R>,
    offset: usize,
    limit: usize,
}

impl<'a, R: AtomicRegion> Iterator for Records<'a, R> {
    type Item = (i32, usize);

    fn next(&mut self) -> Option<Self::Item> {
        let buffer = self.buffer;
        while self.offset < self.limit {
            let slot = self.offset;
            self.offset += buffer.layout.slot_size;
            if buffer.region.load_acquire(slot) == COMMITTED {
                return Some((buffer.key_at(slot), slot + SIZE_OF_RECORD_FRAME));
            }
        }
        None
    }
}

/// An exclusive claim on one record. Commits on drop.
pub struct RecordGuard<'a, R: AtomicRegion> {
    buffer: &'a RecordBuffer<R>,
    offset: usize,
}

impl<'a, R: AtomicRegion> RecordGuard<'a, R> {
    #[inline]
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn write(&self, src: &[u8]) -> Result<(), RecordBufError> {
        self.buffer.write_payload(self.offset, src)
    }

    pub fn read(&self, dst: &mut [u8]) {
        self.buffer.read_payload(self.offset, dst)
    }

    /// Commit now and report a stalled transition instead of logging it.
    pub fn commit(self) -> Result<(), RecordBufError> {
        let result = self.buffer.commit(self.offset);
        mem::forget(self);
        result
    }
}

impl<'a, R: AtomicRegion> Drop for RecordGuard<'a, R> {
    fn drop(&mut self) {
        if let Err(e) = self.buffer.commit(self.offset) {
            error!(offset = self.offset, "failed to release claimed record: {}", e);
        }
    }
}
