//! Error types for the farm protocol.
//!
//! Descriptor-level failures (bad descriptor, no such file, ...) are never
//! `FarmError`s; they travel as [`Errno`](farm_abi::Errno) inside an
//! [`FdResult`](farm_abi::FdResult). `FarmError` covers everything that
//! breaks the protocol itself.

use thiserror::Error;

use crate::thread::SerializedError;

/// Errors raised by the allocator, the call channel, or the coordinator.
#[derive(Debug, Error)]
pub enum FarmError {
    /// A payload does not fit in the arena. Configuration-level, not retried.
    #[error("allocator exhausted: requested {requested} bytes, arena holds {capacity}")]
    AllocatorExhausted { requested: usize, capacity: usize },

    /// An arena range points outside the arena.
    #[error("arena range {ptr}+{len} is out of bounds")]
    OutOfBounds { ptr: u32, len: u32 },

    /// A close notification does not fit in the channel.
    #[error("close channel full: record needs {needed} words, {available} free")]
    CloseChannelFull { needed: usize, available: usize },

    /// More initial descriptors than slots.
    #[error("{count} descriptors exceed the slot table of {max}")]
    TooManyDescriptors { count: usize, max: usize },

    /// Rejected configuration value.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// No ref supplied one of the standard streams.
    #[error("{0} is not found")]
    MissingStdio(&'static str),

    /// The park did not answer in time. The slot is abandoned.
    #[error("call on descriptor {fd} timed out; channel is broken")]
    CallTimedOut { fd: u32 },

    /// A previous call timed out and the channel was abandoned.
    #[error("channel was abandoned after a timeout")]
    ChannelBroken,

    /// The park's dispatch panicked or failed while serving a call.
    #[error("park faulted while serving descriptor {fd}")]
    ParkFault { fd: u32 },

    /// A control word or record held a value no participant should write.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The park and this ref were built against different record layouts.
    #[error("layout mismatch: park {park}, ref {local}")]
    LayoutMismatch { park: String, local: String },

    /// A spawned unit failed; carries its serialized error.
    #[error("spawned unit failed: {0}")]
    SpawnedUnit(SerializedError),

    /// Creating an OS thread or completing the handshake failed.
    #[error("spawn failed: {0}")]
    Spawn(String),
}

/// The message carried by a panic payload, if it is a string.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> Option<String> {
    payload
        .downcast_ref::<&'static str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
}
