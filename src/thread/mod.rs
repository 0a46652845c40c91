//! Spawning Animals onto new threads.
//!
//! A spawn is a one-time handshake over a channel: the new thread receives
//! its id, a snapshot of the spawning Animal and the entry point, rebuilds
//! its own Animal and acknowledges. From then on it talks to the farms only
//! through their shared regions, and reports its outcome through a 3-word
//! [`DoneSlot`].

mod done;
mod error;
mod spawner;

pub use done::DoneSlot;
pub use error::{SerializedError, UNCLONABLE_ERROR};
pub use spawner::{ThreadContext, ThreadHandle, ThreadSpawner};
