//! farm-abi: the vocabulary shared by every participant of a descriptor farm.
//!
//! A Park (server) and a Ref (client proxy) talk through fixed-width call
//! records. Both sides must agree on the numbers used here bit for bit:
//! errno codes, function ids, the WASI plain-data structs they marshal, and
//! the word offsets inside a call record.
//!
//! ## Contents
//!
//! ```text
//! errno   - WASI result codes (`Errno`, `FdResult`)
//! types   - Filetype, Whence, flags, Fdstat, Filestat, Prestat, Dirent
//! layout  - call-record geometry, lock/call/slot word values, FuncId
//! hash    - SHA-256 fingerprint of the layout
//! ```

#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

pub mod errno;
pub mod hash;
pub mod layout;
pub mod types;

pub use errno::{Errno, FdResult};
pub use hash::{layout_fingerprint, LayoutHash};
pub use layout::FuncId;
pub use types::{Dirent, Fdstat, Filestat, Filetype, Prestat, Whence};
