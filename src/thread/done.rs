//! The done/error slot a spawned thread reports through.
//!
//! Three words: a state word the waiter parks on, then either the exit code
//! or the arena pointer and length of a JSON-encoded [`SerializedError`].

use std::sync::atomic::{AtomicU32, Ordering};

use tracing::{error, warn};

use super::error::SerializedError;
use crate::allocator::{Allocator, ArenaRange};
use crate::error::FarmError;
use crate::sync::Futex;

const STATE_RUNNING: u32 = 0;
const STATE_ERROR: u32 = 1;
const STATE_DONE: u32 = 2;
/// The error payload was collected, or the waiter went away.
const STATE_RELEASED: u32 = 3;

pub struct DoneSlot {
    state: Futex,
    value: AtomicU32,
    len: AtomicU32,
}

impl Default for DoneSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl DoneSlot {
    pub fn new() -> Self {
        Self {
            state: Futex::new(STATE_RUNNING),
            value: AtomicU32::new(0),
            len: AtomicU32::new(0),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.state.load() != STATE_RUNNING
    }

    /// Report a normal exit.
    pub fn notify_done(&self, code: u32) {
        self.value.store(code, Ordering::Release);
        self.publish(STATE_DONE);
    }

    /// Report a failure. An error that does not fit in the arena is
    /// replaced by the unclonable placeholder; if even that does not fit,
    /// a null pointer stands for it.
    pub fn notify_error(&self, arena: &Allocator, err: &SerializedError) {
        let range = serde_json::to_vec(err)
            .map_err(|e| e.to_string())
            .and_then(|json| arena.write(&json).map_err(|e| e.to_string()))
            .or_else(|reason| {
                warn!(%reason, "error payload not transferable; sending placeholder");
                serde_json::to_vec(&SerializedError::unclonable())
                    .map_err(|e| e.to_string())
                    .and_then(|json| arena.write(&json).map_err(|e| e.to_string()))
            })
            .unwrap_or(ArenaRange { ptr: 0, len: 0 });
        self.value.store(range.ptr, Ordering::Release);
        self.len.store(range.len, Ordering::Release);
        if !self.publish(STATE_ERROR) && range.ptr != 0 {
            arena.free(range);
        }
    }

    /// Move out of the running state. `false` if nobody will read the report.
    fn publish(&self, state: u32) -> bool {
        match self.state.compare_exchange(STATE_RUNNING, state) {
            Ok(_) => {
                self.state.wake(u32::MAX);
                true
            }
            Err(STATE_RELEASED) => false,
            Err(old) => {
                error!(old, new = state, "protocol violation: done slot reported twice");
                false
            }
        }
    }

    /// Stop waiting for the report. An error payload already written is
    /// freed now; one written later is freed by the reporting thread.
    pub fn discard(&self, arena: &Allocator) {
        match self.state.compare_exchange(STATE_RUNNING, STATE_RELEASED) {
            Ok(_) => {}
            Err(STATE_ERROR) => {
                if self.state.compare_exchange(STATE_ERROR, STATE_RELEASED).is_ok() {
                    let range = self.error_range();
                    if range.ptr != 0 {
                        arena.free(range);
                    }
                }
            }
            Err(_) => {}
        }
    }

    fn error_range(&self) -> ArenaRange {
        ArenaRange {
            ptr: self.value.load(Ordering::Acquire),
            len: self.len.load(Ordering::Acquire),
        }
    }

    /// Block until the thread reports.
    pub fn wait(&self, arena: &Allocator) -> Result<u32, FarmError> {
        while self.state.load() == STATE_RUNNING {
            self.state.wait(STATE_RUNNING, None);
        }
        self.collect(arena)
    }

    /// Suspend until the thread reports.
    pub async fn wait_async(&self, arena: &Allocator) -> Result<u32, FarmError> {
        while self.state.load() == STATE_RUNNING {
            self.state.wait_async(STATE_RUNNING).await;
        }
        self.collect(arena)
    }

    fn collect(&self, arena: &Allocator) -> Result<u32, FarmError> {
        match self.state.load() {
            STATE_DONE => Ok(self.value.load(Ordering::Acquire)),
            STATE_ERROR => {
                if let Err(other) = self.state.compare_exchange(STATE_ERROR, STATE_RELEASED) {
                    return Err(FarmError::Protocol(format!("done slot in state {other}")));
                }
                let range = self.error_range();
                let err = if range.ptr == 0 {
                    SerializedError::unclonable()
                } else {
                    arena
                        .take(range)
                        .ok()
                        .and_then(|json| serde_json::from_slice(&json).ok())
                        .unwrap_or_else(SerializedError::unclonable)
                };
                Err(FarmError::SpawnedUnit(err))
            }
            other => Err(FarmError::Protocol(format!("done slot in state {other}"))),
        }
    }
}
