//! Running a `wasi_snapshot_preview1` module against an [`Animal`].
//!
//! The linker routes every descriptor call through the module's Animal, so
//! the guest sees exactly the descriptor table the Animal maps.
//!
//! [`Animal`]: crate::animal::Animal

mod imports;
mod linker;
mod memory;
mod runner;

use thiserror::Error;

pub use imports::{check_imports, is_supported, WASI_MODULE};
pub use linker::{add_to_linker, GuestState, ProcExit};
pub use memory::{Ctx, MemoryError};
pub use runner::run_module;

/// Rejections that happen before a module is instantiated.
#[derive(Debug, Error)]
pub enum GuestError {
    #[error("failed to parse module: {0}")]
    Parse(#[from] wasmparser::BinaryReaderError),

    #[error("unsupported imports: {}", .0.join(", "))]
    UnsupportedImports(Vec<String>),
}
