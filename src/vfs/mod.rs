//! In-memory descriptor objects: console streams and a small tree of
//! files and directories.

mod console;
mod mem;

pub use console::{ConsoleIn, ConsoleOut};
pub use mem::{MemDir, MemFile, Node, OpenDirectory, OpenFile};
