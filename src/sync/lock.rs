//! Slot locks built on [`Futex`] words.
//!
//! A lock word is `LOCK_FREE`, `LOCK_HELD` (single-descriptor caller) or
//! `LOCK_HELD_DOUBLE` (a caller holding two slot locks at once).
//!
//! Two-descriptor callers take the lower-indexed lock first. If the higher
//! lock is held by another two-descriptor caller, the lower one is released
//! and the whole acquisition starts over, so no cycle of waiters can form.

use std::time::{Duration, Instant};

use farm_abi::layout::{LOCK_FREE, LOCK_HELD, LOCK_HELD_DOUBLE};
use tracing::error;

use super::futex::{Futex, WaitResult};

/// The deadline elapsed while waiting for a lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockTimedOut;

/// Optional point in time after which waits give up.
#[derive(Debug, Clone, Copy)]
pub struct Deadline(Option<Instant>);

impl Deadline {
    pub fn never() -> Self {
        Deadline(None)
    }

    pub fn after(timeout: Option<Duration>) -> Self {
        Deadline(timeout.map(|t| Instant::now() + t))
    }

    /// Time left, or `None` for no deadline. Zero once passed.
    pub fn remaining(&self) -> Option<Duration> {
        self.0
            .map(|at| at.saturating_duration_since(Instant::now()))
    }

    fn wait(&self, word: &Futex, expected: u32) -> Result<(), LockTimedOut> {
        match word.wait(expected, self.remaining()) {
            WaitResult::TimedOut => Err(LockTimedOut),
            WaitResult::Ok | WaitResult::NotEqual => Ok(()),
        }
    }
}

/// Acquire a single lock, blocking without limit.
pub fn acquire(word: &Futex) {
    // A deadline of `never` cannot time out.
    let _ = acquire_within(word, Deadline::never());
}

/// Acquire a single lock before `deadline`.
pub fn acquire_within(word: &Futex, deadline: Deadline) -> Result<(), LockTimedOut> {
    loop {
        match word.compare_exchange(LOCK_FREE, LOCK_HELD) {
            Ok(_) => return Ok(()),
            Err(current) => deadline.wait(word, current)?,
        }
    }
}

/// Acquire a single lock by suspending the current task.
pub async fn acquire_async(word: &Futex) {
    loop {
        match word.compare_exchange(LOCK_FREE, LOCK_HELD) {
            Ok(_) => return,
            Err(current) => {
                word.wait_async(current).await;
            }
        }
    }
}

/// Release a lock and wake one waiter.
///
/// Releasing a free lock is a protocol violation; it is logged and the word
/// is left free.
pub fn release(word: &Futex, what: &str) {
    let old = word.swap(LOCK_FREE);
    if old == LOCK_FREE {
        error!(lock = what, "protocol violation: released a lock that was not held");
    }
    word.wake(1);
}

/// Acquire two locks, `lower` first. Both must be distinct words.
pub fn acquire_pair(lower: &Futex, higher: &Futex, deadline: Deadline) -> Result<(), LockTimedOut> {
    'retry: loop {
        loop {
            match lower.compare_exchange(LOCK_FREE, LOCK_HELD_DOUBLE) {
                Ok(_) => break,
                Err(current) => deadline.wait(lower, current)?,
            }
        }
        loop {
            match higher.compare_exchange(LOCK_FREE, LOCK_HELD_DOUBLE) {
                Ok(_) => return Ok(()),
                Err(LOCK_HELD_DOUBLE) => {
                    // Another pair holder: back off completely and start over.
                    release(lower, "pair-lower");
                    deadline.wait(higher, LOCK_HELD_DOUBLE)?;
                    continue 'retry;
                }
                Err(current) => {
                    // A single holder never waits on another slot, so waiting here is safe.
                    if let Err(timeout) = deadline.wait(higher, current) {
                        release(lower, "pair-lower");
                        return Err(timeout);
                    }
                }
            }
        }
    }
}

/// Suspending counterpart of [`acquire_pair`], without a deadline.
pub async fn acquire_pair_async(lower: &Futex, higher: &Futex) {
    'retry: loop {
        loop {
            match lower.compare_exchange(LOCK_FREE, LOCK_HELD_DOUBLE) {
                Ok(_) => break,
                Err(current) => {
                    lower.wait_async(current).await;
                }
            }
        }
        loop {
            match higher.compare_exchange(LOCK_FREE, LOCK_HELD_DOUBLE) {
                Ok(_) => return,
                Err(LOCK_HELD_DOUBLE) => {
                    release(lower, "pair-lower");
                    higher.wait_async(LOCK_HELD_DOUBLE).await;
                    continue 'retry;
                }
                Err(current) => {
                    higher.wait_async(current).await;
                }
            }
        }
    }
}

/// Release a pair taken with [`acquire_pair`].
pub fn release_pair(lower: &Futex, higher: &Futex) {
    release(lower, "pair-lower");
    release(higher, "pair-higher");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn acquire_and_release() {
        let word = Futex::new(LOCK_FREE);
        acquire(&word);
        assert_eq!(word.load(), LOCK_HELD);
        release(&word, "test");
        assert_eq!(word.load(), LOCK_FREE);
    }

    #[test]
    fn acquire_within_times_out_on_a_held_lock() {
        let word = Futex::new(LOCK_HELD);
        let deadline = Deadline::after(Some(Duration::from_millis(10)));
        assert_eq!(acquire_within(&word, deadline), Err(LockTimedOut));
    }

    #[test]
    fn double_release_leaves_lock_free() {
        let word = Futex::new(LOCK_FREE);
        release(&word, "test");
        assert_eq!(word.load(), LOCK_FREE);
    }

    #[test]
    fn pair_marks_both_words() {
        let a = Futex::new(LOCK_FREE);
        let b = Futex::new(LOCK_FREE);
        acquire_pair(&a, &b, Deadline::never()).expect("pair");
        assert_eq!(a.load(), LOCK_HELD_DOUBLE);
        assert_eq!(b.load(), LOCK_HELD_DOUBLE);
        release_pair(&a, &b);
        assert_eq!((a.load(), b.load()), (LOCK_FREE, LOCK_FREE));
    }

    #[test]
    fn pair_timeout_releases_the_lower_lock() {
        let a = Futex::new(LOCK_FREE);
        let b = Futex::new(LOCK_HELD);
        let deadline = Deadline::after(Some(Duration::from_millis(10)));
        assert_eq!(acquire_pair(&a, &b, deadline), Err(LockTimedOut));
        assert_eq!(a.load(), LOCK_FREE);
    }

    #[test]
    fn pairs_and_singles_serialize() {
        let locks = Arc::new([Futex::new(LOCK_FREE), Futex::new(LOCK_FREE)]);
        let inside = Arc::new(AtomicU32::new(0));
        let workers: Vec<_> = (0..4)
            .map(|i| {
                let locks = Arc::clone(&locks);
                let inside = Arc::clone(&inside);
                thread::spawn(move || {
                    for _ in 0..200 {
                        if i % 2 == 0 {
                            acquire_pair(&locks[0], &locks[1], Deadline::never()).expect("pair");
                            assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                            inside.fetch_sub(1, Ordering::SeqCst);
                            release_pair(&locks[0], &locks[1]);
                        } else {
                            acquire(&locks[1]);
                            assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                            inside.fetch_sub(1, Ordering::SeqCst);
                            release(&locks[1], "single");
                        }
                    }
                })
            })
            .collect();
        for w in workers {
            w.join().expect("join");
        }
    }

    #[tokio::test]
    async fn async_acquire_waits_for_release() {
        let word = Arc::new(Futex::new(LOCK_HELD));
        let releaser = {
            let word = Arc::clone(&word);
            thread::spawn(move || {
                while word.waiters() == 0 {
                    thread::yield_now();
                }
                release(&word, "test");
            })
        };
        acquire_async(&word).await;
        assert_eq!(word.load(), LOCK_HELD);
        releaser.join().expect("join");
    }
}
