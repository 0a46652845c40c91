//! Blocking and suspending primitives over shared 32-bit words.

pub mod futex;
pub mod lock;

pub use futex::{Futex, WaitFuture, WaitResult};
pub use lock::{Deadline, LockTimedOut};
