//! The shared region one farm exposes to its refs.
//!
//! Everything a Park and its Refs share lives here and nowhere else: one slot
//! per potential descriptor, the base channel slot, the payload arena, the
//! close-notification channel and the ref-id counter. The region is sized
//! once from [`FarmConfig`] and never resized.

use std::sync::atomic::{AtomicU32, Ordering};

use farm_abi::layout::{
    CALL_IDLE, CALL_PENDING, ERRNO_UNSET, ERRNO_WORD, LOCK_FREE, RECORD_WORDS, REPLY_KIND_WORD,
    SLOT_UNUSED,
};
use farm_abi::{layout_fingerprint, LayoutHash};

use crate::allocator::Allocator;
use crate::close_channel::CloseChannel;
use crate::config::FarmConfig;
use crate::error::FarmError;
use crate::sync::Futex;

const NOT_ABANDONED: u32 = 0;
const ABANDONED_ALONE: u32 = 1;
/// Marks above this name the second slot held with this one, offset by it.
const ABANDONED_PAIR_BASE: u32 = 2;

/// Call channel for one descriptor.
pub struct Slot {
    pub(crate) lock: Futex,
    pub(crate) call: Futex,
    pub(crate) state: AtomicU32,
    /// Set by a caller that gave up waiting on a pending call.
    abandoned: AtomicU32,
    record: [AtomicU32; RECORD_WORDS],
}

impl Slot {
    fn new() -> Self {
        Self {
            lock: Futex::new(LOCK_FREE),
            call: Futex::new(CALL_IDLE),
            state: AtomicU32::new(SLOT_UNUSED),
            abandoned: AtomicU32::new(NOT_ABANDONED),
            record: std::array::from_fn(|_| AtomicU32::new(0)),
        }
    }

    pub fn record(&self) -> Record<'_> {
        Record {
            words: &self.record,
        }
    }

    pub fn state(&self) -> u32 {
        self.state.load(Ordering::SeqCst)
    }

    pub(crate) fn set_state(&self, state: u32) {
        self.state.store(state, Ordering::SeqCst)
    }

    /// Leave the pending call, its reply and the held lock (plus the lock of
    /// `partner`, for two-descriptor calls) to the listener.
    ///
    /// Returns `false` if the reply landed first and nobody took the mark;
    /// the caller then still owns the locks and collects the reply itself.
    pub(crate) fn abandon(&self, partner: Option<u32>) -> bool {
        let mark = partner.map_or(ABANDONED_ALONE, |fd| fd + ABANDONED_PAIR_BASE);
        self.abandoned.store(mark, Ordering::SeqCst);
        if self.call.load() == CALL_PENDING {
            return true;
        }
        self.abandoned.swap(NOT_ABANDONED, Ordering::SeqCst) == NOT_ABANDONED
    }

    /// Claim an abandonment mark. `Some(partner)` means the caller is gone
    /// and the claimant must free the reply and release the locks.
    pub(crate) fn take_abandoned(&self) -> Option<Option<u32>> {
        match self.abandoned.swap(NOT_ABANDONED, Ordering::SeqCst) {
            NOT_ABANDONED => None,
            ABANDONED_ALONE => Some(None),
            mark => Some(Some(mark - ABANDONED_PAIR_BASE)),
        }
    }
}

/// Typed view over a slot's call record.
///
/// 64-bit values occupy two consecutive words, low word first, starting at
/// an even index.
#[derive(Clone, Copy)]
pub struct Record<'a> {
    words: &'a [AtomicU32; RECORD_WORDS],
}

impl Record<'_> {
    pub fn u32(&self, index: usize) -> u32 {
        self.words[index].load(Ordering::Acquire)
    }

    pub fn set_u32(&self, index: usize, value: u32) {
        self.words[index].store(value, Ordering::Release)
    }

    pub fn u64(&self, index: usize) -> u64 {
        debug_assert!(index % 2 == 0, "u64 fields start on even words");
        u64::from(self.u32(index)) | (u64::from(self.u32(index + 1)) << 32)
    }

    pub fn set_u64(&self, index: usize, value: u64) {
        debug_assert!(index % 2 == 0, "u64 fields start on even words");
        self.set_u32(index, value as u32);
        self.set_u32(index + 1, (value >> 32) as u32);
    }

    pub fn errno_raw(&self) -> i32 {
        self.u32(ERRNO_WORD) as i32
    }

    pub fn set_errno_raw(&self, raw: i32) {
        self.set_u32(ERRNO_WORD, raw as u32)
    }

    /// Zero every word and mark the errno unset.
    pub fn clear(&self) {
        for word in self.words.iter() {
            word.store(0, Ordering::Release);
        }
        self.set_errno_raw(ERRNO_UNSET);
        self.set_u32(REPLY_KIND_WORD, 0);
    }
}

/// The fixed shared region of one farm.
pub struct SharedRegion {
    slots: Box<[Slot]>,
    base: Slot,
    arena: Allocator,
    close: CloseChannel,
    next_ref_id: AtomicU32,
    fingerprint: LayoutHash,
    config: FarmConfig,
}

impl SharedRegion {
    pub fn new(config: FarmConfig) -> Result<Self, FarmError> {
        config.validate()?;
        Ok(Self {
            slots: (0..config.max_slots).map(|_| Slot::new()).collect(),
            base: Slot::new(),
            arena: Allocator::new(config.arena_size)?,
            close: CloseChannel::new(config.close_channel_words),
            next_ref_id: AtomicU32::new(0),
            fingerprint: layout_fingerprint(),
            config,
        })
    }

    /// Slot for real descriptor `fd`, if the table is that large.
    pub fn slot(&self, fd: u32) -> Option<&Slot> {
        self.slots.get(fd as usize)
    }

    pub fn max_slots(&self) -> usize {
        self.slots.len()
    }

    pub fn base(&self) -> &Slot {
        &self.base
    }

    pub fn arena(&self) -> &Allocator {
        &self.arena
    }

    pub fn close_channel(&self) -> &CloseChannel {
        &self.close
    }

    pub fn config(&self) -> &FarmConfig {
        &self.config
    }

    pub fn fingerprint(&self) -> LayoutHash {
        self.fingerprint
    }

    pub(crate) fn issue_ref_id(&self) -> u32 {
        self.next_ref_id.fetch_add(1, Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn u64_fields_span_two_words() {
        let slot = Slot::new();
        let record = slot.record();
        record.set_u64(4, 0x1122_3344_5566_7788);
        assert_eq!(record.u32(4), 0x5566_7788);
        assert_eq!(record.u32(5), 0x1122_3344);
        assert_eq!(record.u64(4), 0x1122_3344_5566_7788);
    }

    #[test]
    fn clear_marks_errno_unset() {
        let slot = Slot::new();
        let record = slot.record();
        record.set_u32(3, 9);
        record.clear();
        assert_eq!(record.u32(3), 0);
        assert_eq!(record.errno_raw(), ERRNO_UNSET);
    }

    #[test]
    fn abandoned_pending_call_is_left_for_the_listener() {
        let slot = Slot::new();
        slot.call.store(CALL_PENDING);
        assert!(slot.abandon(Some(7)));
        slot.call.store(CALL_IDLE);
        assert_eq!(slot.take_abandoned(), Some(Some(7)));
        assert_eq!(slot.take_abandoned(), None);
    }

    #[test]
    fn abandon_after_the_reply_keeps_the_call() {
        let slot = Slot::new();
        slot.call.store(CALL_IDLE);
        assert!(!slot.abandon(None));
        assert_eq!(slot.take_abandoned(), None);
    }

    #[test]
    fn region_has_one_slot_per_descriptor() {
        let region = SharedRegion::new(FarmConfig::new(1024, 8)).expect("region");
        assert_eq!(region.max_slots(), 8);
        assert!(region.slot(7).is_some());
        assert!(region.slot(8).is_none());
        assert_eq!(region.issue_ref_id(), 0);
        assert_eq!(region.issue_ref_id(), 1);
    }
}
