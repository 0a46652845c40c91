//! A futex-like 32-bit word.
//!
//! `wait(expected)` parks while the word equals `expected`; `wake(n)` wakes up
//! to `n` parked waiters in arrival order. Thread waiters and task waiters
//! share one queue, so a wake reaches whichever kind arrived first and the
//! blocking and suspending variants stay linearizable with each other.
//!
//! The word itself is an ordinary atomic and can be read or swapped without
//! touching the queue. Writers must change the word *before* calling `wake`;
//! a waiter compares the word under the queue lock, so a change published
//! before the wake is never missed.

use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Outcome of a wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitResult {
    /// Woken by `wake`.
    Ok,
    /// The word did not hold the expected value; nothing was parked.
    NotEqual,
    /// The timeout elapsed before a wake arrived.
    TimedOut,
}

struct Waiter {
    id: u64,
    /// `None` for a parked thread.
    waker: Option<Waker>,
}

#[derive(Default)]
struct WaitQueue {
    next_id: u64,
    parked: VecDeque<Waiter>,
    woken: HashSet<u64>,
}

impl WaitQueue {
    fn register(&mut self, waker: Option<Waker>) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.parked.push_back(Waiter { id, waker });
        id
    }

    fn unregister(&mut self, id: u64) {
        self.parked.retain(|w| w.id != id);
    }
}

/// A 32-bit word supporting wait-while-equal and wake-N.
pub struct Futex {
    word: AtomicU32,
    queue: Mutex<WaitQueue>,
    cond: Condvar,
}

impl Futex {
    pub fn new(value: u32) -> Self {
        Self {
            word: AtomicU32::new(value),
            queue: Mutex::new(WaitQueue::default()),
            cond: Condvar::new(),
        }
    }

    pub fn load(&self) -> u32 {
        self.word.load(Ordering::SeqCst)
    }

    pub fn store(&self, value: u32) {
        self.word.store(value, Ordering::SeqCst)
    }

    pub fn swap(&self, value: u32) -> u32 {
        self.word.swap(value, Ordering::SeqCst)
    }

    pub fn compare_exchange(&self, current: u32, new: u32) -> Result<u32, u32> {
        self.word
            .compare_exchange(current, new, Ordering::SeqCst, Ordering::SeqCst)
    }

    pub fn fetch_add(&self, value: u32) -> u32 {
        self.word.fetch_add(value, Ordering::SeqCst)
    }

    /// Block the current thread while the word equals `expected`.
    pub fn wait(&self, expected: u32, timeout: Option<Duration>) -> WaitResult {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut queue = self.queue.lock();
        if self.load() != expected {
            return WaitResult::NotEqual;
        }
        let id = queue.register(None);
        loop {
            if queue.woken.remove(&id) {
                return WaitResult::Ok;
            }
            match deadline {
                None => self.cond.wait(&mut queue),
                Some(deadline) => {
                    if self.cond.wait_until(&mut queue, deadline).timed_out() {
                        if queue.woken.remove(&id) {
                            return WaitResult::Ok;
                        }
                        queue.unregister(id);
                        return WaitResult::TimedOut;
                    }
                }
            }
        }
    }

    /// Suspend the current task while the word equals `expected`.
    pub fn wait_async(&self, expected: u32) -> WaitFuture<'_> {
        WaitFuture {
            futex: self,
            expected,
            id: None,
        }
    }

    /// Wake up to `count` waiters. Returns how many were woken.
    pub fn wake(&self, count: u32) -> u32 {
        let mut queue = self.queue.lock();
        let mut woken = 0;
        let mut threads = false;
        let mut tasks = Vec::new();
        while woken < count {
            let Some(waiter) = queue.parked.pop_front() else {
                break;
            };
            queue.woken.insert(waiter.id);
            match waiter.waker {
                Some(waker) => tasks.push(waker),
                None => threads = true,
            }
            woken += 1;
        }
        drop(queue);
        if threads {
            self.cond.notify_all();
        }
        for waker in tasks {
            waker.wake();
        }
        woken
    }

    /// Number of parked waiters.
    pub fn waiters(&self) -> usize {
        self.queue.lock().parked.len()
    }
}

impl std::fmt::Debug for Futex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Futex").field("word", &self.load()).finish()
    }
}

/// Future returned by [`Futex::wait_async`].
pub struct WaitFuture<'a> {
    futex: &'a Futex,
    expected: u32,
    id: Option<u64>,
}

impl Future for WaitFuture<'_> {
    type Output = WaitResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<WaitResult> {
        let this = &mut *self;
        let mut queue = this.futex.queue.lock();
        match this.id {
            None => {
                if this.futex.load() != this.expected {
                    return Poll::Ready(WaitResult::NotEqual);
                }
                this.id = Some(queue.register(Some(cx.waker().clone())));
                Poll::Pending
            }
            Some(id) => {
                if queue.woken.remove(&id) {
                    this.id = None;
                    return Poll::Ready(WaitResult::Ok);
                }
                if let Some(waiter) = queue.parked.iter_mut().find(|w| w.id == id) {
                    let stale = waiter
                        .waker
                        .as_ref()
                        .map_or(true, |w| !w.will_wake(cx.waker()));
                    if stale {
                        waiter.waker = Some(cx.waker().clone());
                    }
                }
                Poll::Pending
            }
        }
    }
}

impl Drop for WaitFuture<'_> {
    fn drop(&mut self) {
        let Some(id) = self.id.take() else {
            return;
        };
        let mut queue = self.futex.queue.lock();
        queue.unregister(id);
        let consumed = queue.woken.remove(&id);
        drop(queue);
        // A wake delivered to a dropped future is handed to the next waiter.
        if consumed {
            self.futex.wake(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn wait_returns_not_equal_without_parking() {
        let futex = Futex::new(5);
        assert_eq!(futex.wait(4, None), WaitResult::NotEqual);
        assert_eq!(futex.waiters(), 0);
    }

    #[test]
    fn wait_times_out() {
        let futex = Futex::new(0);
        let start = Instant::now();
        assert_eq!(
            futex.wait(0, Some(Duration::from_millis(20))),
            WaitResult::TimedOut
        );
        assert!(start.elapsed() >= Duration::from_millis(20));
        assert_eq!(futex.waiters(), 0);
    }

    #[test]
    fn wake_without_waiters_wakes_nobody() {
        let futex = Futex::new(0);
        assert_eq!(futex.wake(3), 0);
    }

    #[test]
    fn wake_releases_a_parked_thread() {
        let futex = Arc::new(Futex::new(0));
        let waiter = {
            let futex = Arc::clone(&futex);
            thread::spawn(move || futex.wait(0, Some(Duration::from_secs(5))))
        };
        while futex.waiters() == 0 {
            thread::yield_now();
        }
        futex.store(1);
        assert_eq!(futex.wake(1), 1);
        assert_eq!(waiter.join().expect("join"), WaitResult::Ok);
    }

    #[test]
    fn wake_counts_at_most_n() {
        let futex = Arc::new(Futex::new(0));
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let futex = Arc::clone(&futex);
                thread::spawn(move || futex.wait(0, Some(Duration::from_secs(5))))
            })
            .collect();
        while futex.waiters() < 3 {
            thread::yield_now();
        }
        assert_eq!(futex.wake(2), 2);
        assert_eq!(futex.waiters(), 1);
        assert_eq!(futex.wake(u32::MAX), 1);
        for w in waiters {
            assert_eq!(w.join().expect("join"), WaitResult::Ok);
        }
    }

    #[tokio::test]
    async fn async_wait_is_woken_by_a_thread() {
        let futex = Arc::new(Futex::new(7));
        let waker = {
            let futex = Arc::clone(&futex);
            thread::spawn(move || {
                while futex.waiters() == 0 {
                    thread::yield_now();
                }
                futex.store(8);
                futex.wake(1)
            })
        };
        assert_eq!(futex.wait_async(7).await, WaitResult::Ok);
        assert_eq!(waker.join().expect("join"), 1);
    }

    #[tokio::test]
    async fn async_wait_sees_changed_word() {
        let futex = Futex::new(1);
        assert_eq!(futex.wait_async(0).await, WaitResult::NotEqual);
    }
}
