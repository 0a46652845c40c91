//! Bump allocator over a fixed shared arena.
//!
//! ```text
//! [lock | refcount | used_len | payload bytes ...........]
//!  0      4          8          ARENA_HEADER_LEN
//! ```
//!
//! `write` appends under the arena lock and bumps the reference count.
//! `free` only decrements the count; no single range is ever reclaimed. When
//! the count reaches zero `used_len` falls back to the header size, and a
//! writer that finds the count at zero resets it again before appending.
//! Ranges therefore stay valid until their own `free`, and an arena with any
//! outstanding reference only grows.

use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};

use farm_abi::layout::ARENA_HEADER_LEN;
use tracing::{error, trace};

use crate::error::FarmError;
use crate::sync::{lock, Futex};

/// A byte range handed out by [`Allocator::write`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaRange {
    pub ptr: u32,
    pub len: u32,
}

/// The shared payload arena.
pub struct Allocator {
    lock: Futex,
    refcount: AtomicU32,
    used_len: AtomicU32,
    bytes: Box<[AtomicU8]>,
}

impl Allocator {
    /// Create an arena of `size` bytes, header included.
    pub fn new(size: usize) -> Result<Self, FarmError> {
        if size <= ARENA_HEADER_LEN as usize || size > u32::MAX as usize {
            return Err(FarmError::InvalidConfig(format!("arena size {size}")));
        }
        Ok(Self {
            lock: Futex::new(0),
            refcount: AtomicU32::new(0),
            used_len: AtomicU32::new(ARENA_HEADER_LEN),
            bytes: (0..size).map(|_| AtomicU8::new(0)).collect(),
        })
    }

    pub fn capacity(&self) -> usize {
        self.bytes.len()
    }

    pub fn used_len(&self) -> u32 {
        self.used_len.load(Ordering::SeqCst)
    }

    /// Outstanding writes not yet freed.
    pub fn refcount(&self) -> u32 {
        self.refcount.load(Ordering::SeqCst)
    }

    /// Copy `data` into the arena, blocking on the arena lock.
    pub fn write(&self, data: &[u8]) -> Result<ArenaRange, FarmError> {
        lock::acquire(&self.lock);
        let result = self.write_locked(data);
        lock::release(&self.lock, "arena");
        result
    }

    /// Copy `data` into the arena, suspending on the arena lock.
    pub async fn write_async(&self, data: &[u8]) -> Result<ArenaRange, FarmError> {
        lock::acquire_async(&self.lock).await;
        let result = self.write_locked(data);
        lock::release(&self.lock, "arena");
        result
    }

    fn write_locked(&self, data: &[u8]) -> Result<ArenaRange, FarmError> {
        if self.refcount.load(Ordering::SeqCst) == 0 {
            self.used_len.store(ARENA_HEADER_LEN, Ordering::SeqCst);
        }
        let ptr = self.used_len.load(Ordering::SeqCst) as usize;
        let end = ptr
            .checked_add(data.len())
            .filter(|end| *end <= self.bytes.len())
            .ok_or(FarmError::AllocatorExhausted {
                requested: data.len(),
                capacity: self.bytes.len(),
            })?;
        for (cell, byte) in self.bytes[ptr..end].iter().zip(data) {
            cell.store(*byte, Ordering::Relaxed);
        }
        self.used_len.store(end as u32, Ordering::SeqCst);
        self.refcount.fetch_add(1, Ordering::SeqCst);
        trace!(ptr, len = data.len(), "arena write");
        Ok(ArenaRange {
            ptr: ptr as u32,
            len: data.len() as u32,
        })
    }

    /// Copy a range out without freeing it.
    pub fn read(&self, range: ArenaRange) -> Result<Vec<u8>, FarmError> {
        let start = range.ptr as usize;
        let end = start + range.len as usize;
        if range.ptr < ARENA_HEADER_LEN && range.len > 0 || end > self.bytes.len() {
            return Err(FarmError::OutOfBounds {
                ptr: range.ptr,
                len: range.len,
            });
        }
        Ok(self.bytes[start..end]
            .iter()
            .map(|cell| cell.load(Ordering::Relaxed))
            .collect())
    }

    /// Drop one reference. The bytes are reclaimed once every range is freed.
    pub fn free(&self, range: ArenaRange) {
        lock::acquire(&self.lock);
        match self
            .refcount
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        {
            Ok(1) => self.used_len.store(ARENA_HEADER_LEN, Ordering::SeqCst),
            Ok(_) => {}
            Err(_) => error!(
                ptr = range.ptr,
                len = range.len,
                "protocol violation: arena free without a matching write"
            ),
        }
        lock::release(&self.lock, "arena");
    }

    /// Read a range and free it.
    pub fn take(&self, range: ArenaRange) -> Result<Vec<u8>, FarmError> {
        let data = self.read(range);
        self.free(range);
        data
    }
}

impl std::fmt::Debug for Allocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Allocator")
            .field("capacity", &self.capacity())
            .field("refcount", &self.refcount())
            .field("used_len", &self.used_len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn write_then_read() {
        let arena = Allocator::new(64).expect("arena");
        let range = arena.write(b"hello").expect("write");
        assert_eq!(range.ptr, ARENA_HEADER_LEN);
        assert_eq!(arena.read(range).expect("read"), b"hello");
        assert_eq!(arena.refcount(), 1);
    }

    #[test]
    fn arena_resets_only_when_every_range_is_freed() {
        let arena = Allocator::new(64).expect("arena");
        let a = arena.write(b"aaaa").expect("write");
        let b = arena.write(b"bbbb").expect("write");
        assert_eq!(b.ptr, a.ptr + 4);
        arena.free(a);
        let c = arena.write(b"cc").expect("write");
        assert_eq!(c.ptr, b.ptr + 4, "still one reference outstanding");
        arena.free(b);
        arena.free(c);
        let d = arena.write(b"d").expect("write");
        assert_eq!(d.ptr, ARENA_HEADER_LEN);
    }

    #[test]
    fn oversize_write_is_exhaustion_and_keeps_refcount() {
        let arena = Allocator::new(32).expect("arena");
        let err = arena.write(&[0u8; 40]).unwrap_err();
        assert!(matches!(
            err,
            FarmError::AllocatorExhausted {
                requested: 40,
                capacity: 32
            }
        ));
        assert_eq!(arena.refcount(), 0);
    }

    #[test]
    fn read_out_of_bounds() {
        let arena = Allocator::new(32).expect("arena");
        let err = arena.read(ArenaRange { ptr: 30, len: 4 }).unwrap_err();
        assert!(matches!(err, FarmError::OutOfBounds { .. }));
    }

    #[test]
    fn extra_free_does_not_underflow() {
        let arena = Allocator::new(32).expect("arena");
        arena.free(ArenaRange { ptr: 12, len: 0 });
        assert_eq!(arena.refcount(), 0);
    }

    #[tokio::test]
    async fn async_write_shares_the_arena() {
        let arena = Allocator::new(64).expect("arena");
        let a = arena.write_async(b"xy").await.expect("write");
        let b = arena.write(b"z").expect("write");
        assert_eq!(arena.take(a).expect("take"), b"xy");
        assert_eq!(arena.take(b).expect("take"), b"z");
        assert_eq!(arena.refcount(), 0);
    }

    proptest! {
        #[test]
        fn round_trip_restores_used_len(payloads in proptest::collection::vec(
            proptest::collection::vec(any::<u8>(), 0..64), 1..16)
        ) {
            let arena = Allocator::new(4096).expect("arena");
            let start = arena.used_len();
            let ranges: Vec<_> = payloads
                .iter()
                .map(|p| arena.write(p).expect("write"))
                .collect();
            for (range, payload) in ranges.iter().zip(&payloads) {
                prop_assert_eq!(&arena.read(*range).expect("read"), payload);
            }
            for range in ranges {
                arena.free(range);
            }
            prop_assert_eq!(arena.refcount(), 0);
            prop_assert_eq!(arena.used_len(), start);
        }
    }
}
