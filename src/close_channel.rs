//! Close-notification channel.
//!
//! An append-only list of records in a fixed word buffer:
//!
//! ```text
//! [remaining | target_count | target ids ... | fd]
//! ```
//!
//! `send` appends a record addressed to a set of ref ids. `get(id)` collects
//! every descriptor addressed to `id`, marks that target consumed and
//! decrements `remaining`; a record whose last target consumed it is
//! compacted out of the buffer. All mutation happens under the channel's own
//! lock word, the same lock pattern the arena uses.

use std::sync::atomic::{AtomicU32, Ordering};

use farm_abi::layout::CONSUMED_TARGET;
use tracing::{debug, trace};

use crate::error::FarmError;
use crate::sync::{lock, Futex};

const RECORD_OVERHEAD: usize = 3;

pub struct CloseChannel {
    lock: Futex,
    /// Records not yet consumed by every target.
    count: AtomicU32,
    /// Words in use.
    used: AtomicU32,
    words: Box<[AtomicU32]>,
}

impl CloseChannel {
    pub fn new(capacity_words: usize) -> Self {
        Self {
            lock: Futex::new(0),
            count: AtomicU32::new(0),
            used: AtomicU32::new(0),
            words: (0..capacity_words).map(|_| AtomicU32::new(0)).collect(),
        }
    }

    pub fn pending(&self) -> u32 {
        self.count.load(Ordering::SeqCst)
    }

    pub fn used_words(&self) -> usize {
        self.used.load(Ordering::SeqCst) as usize
    }

    /// Broadcast "descriptor `fd` was closed" to `targets`.
    pub fn send(&self, targets: &[u32], fd: u32) -> Result<(), FarmError> {
        if targets.is_empty() {
            return Err(FarmError::Protocol(format!(
                "close notification for fd {fd} has no targets"
            )));
        }
        let needed = RECORD_OVERHEAD + targets.len();
        lock::acquire(&self.lock);
        let used = self.used.load(Ordering::SeqCst) as usize;
        let available = self.words.len() - used;
        if needed > available {
            lock::release(&self.lock, "close-channel");
            return Err(FarmError::CloseChannelFull { needed, available });
        }
        let record = std::iter::once(targets.len() as u32)
            .chain(std::iter::once(targets.len() as u32))
            .chain(targets.iter().copied())
            .chain(std::iter::once(fd));
        for (cell, word) in self.words[used..used + needed].iter().zip(record) {
            cell.store(word, Ordering::Relaxed);
        }
        self.used.store((used + needed) as u32, Ordering::SeqCst);
        self.count.fetch_add(1, Ordering::SeqCst);
        lock::release(&self.lock, "close-channel");
        debug!(fd, ?targets, "close notification sent");
        Ok(())
    }

    /// Descriptors closed since `id` last asked, oldest first.
    pub fn get(&self, id: u32) -> Option<Vec<u32>> {
        if self.count.load(Ordering::SeqCst) == 0 {
            return None;
        }
        lock::acquire(&self.lock);
        let used = self.used.load(Ordering::SeqCst) as usize;
        let mut fds = Vec::new();
        let mut drained = false;
        let mut at = 0;
        while at < used {
            let remaining = self.words[at].load(Ordering::Relaxed);
            let target_count = self.words[at + 1].load(Ordering::Relaxed) as usize;
            let targets = &self.words[at + 2..at + 2 + target_count];
            let fd = self.words[at + 2 + target_count].load(Ordering::Relaxed);
            for target in targets {
                if target.load(Ordering::Relaxed) == id {
                    target.store(CONSUMED_TARGET, Ordering::Relaxed);
                    self.words[at].store(remaining - 1, Ordering::Relaxed);
                    drained |= remaining == 1;
                    fds.push(fd);
                    break;
                }
            }
            at += RECORD_OVERHEAD + target_count;
        }
        if drained {
            self.compact(used);
        }
        lock::release(&self.lock, "close-channel");
        if fds.is_empty() {
            None
        } else {
            trace!(id, ?fds, "close notifications consumed");
            Some(fds)
        }
    }

    /// Drop fully consumed records. Caller holds the lock.
    fn compact(&self, used: usize) {
        let mut kept = Vec::with_capacity(used);
        let mut records = 0;
        let mut at = 0;
        while at < used {
            let target_count = self.words[at + 1].load(Ordering::Relaxed) as usize;
            let len = RECORD_OVERHEAD + target_count;
            if self.words[at].load(Ordering::Relaxed) > 0 {
                kept.extend(self.words[at..at + len].iter().map(|w| w.load(Ordering::Relaxed)));
                records += 1;
            }
            at += len;
        }
        for (cell, word) in self.words.iter().zip(&kept) {
            cell.store(*word, Ordering::Relaxed);
        }
        self.used.store(kept.len() as u32, Ordering::SeqCst);
        self.count.store(records, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for CloseChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloseChannel")
            .field("pending", &self.pending())
            .field("used_words", &self.used_words())
            .finish()
    }
}
