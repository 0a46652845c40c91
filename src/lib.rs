//! wasi-farm: several WASI workers sharing one descriptor table.
//!
//! A *farm* owns real descriptors and serves them over a fixed shared
//! region. Workers reach it through *Refs*, and each worker sees a single
//! guest descriptor table through an *Animal* that multiplexes one or more
//! farms.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────┐   ┌───────────────┐
//! │ Animal (A)    │   │ Animal (B)    │   guest fd -> (farm, real fd)
//! │  FarmRef ...  │   │  FarmRef ...  │
//! └──────┬────────┘   └──────┬────────┘
//!        │  slot lock, call record, futex wake
//! ┌──────┴───────────────────┴────────┐
//! │ SharedRegion                      │
//! │  slots[0..max]  base slot         │
//! │  arena (payloads)  close channel  │
//! └──────┬────────────────────────────┘
//!        │  one listener thread per live slot
//! ┌──────┴────────────────────────────┐
//! │ Park: FdTable of Box<dyn Fd>      │
//! └───────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use wasi_farm::vfs::{ConsoleIn, ConsoleOut, MemDir, OpenDirectory};
//! use wasi_farm::{Animal, Farm, FarmConfig};
//!
//! # fn main() -> Result<(), wasi_farm::FarmError> {
//! let farm = Farm::builder(FarmConfig::new(1 << 20, 64))
//!     .stdin(ConsoleIn::empty())
//!     .stdout(ConsoleOut::stdout())
//!     .stderr(ConsoleOut::stderr())
//!     .fd(OpenDirectory::preopen("/", MemDir::new()))
//!     .build()?;
//! let mut animal = Animal::builder().farm(farm.get_ref()).build()?;
//! let _written = animal.fd_write(1, b"hello\n")?;
//! # Ok(())
//! # }
//! ```

pub mod allocator;
pub mod animal;
pub mod close_channel;
pub mod config;
pub mod error;
pub mod farm;
pub mod farm_ref;
pub mod fd;
pub mod guest;
pub mod park;
pub mod region;
pub mod sync;
pub mod thread;
pub mod vfs;
pub mod wire;

pub use allocator::{Allocator, ArenaRange};
pub use animal::{Animal, AnimalBuilder, AnimalSnapshot, MappedFd};
pub use close_channel::CloseChannel;
pub use config::FarmConfig;
pub use error::FarmError;
pub use farm::{Farm, FarmBuilder, FarmRefHandle};
pub use farm_ref::FarmRef;
pub use fd::{Fd, Inode};
pub use park::Park;
pub use region::SharedRegion;
pub use thread::{SerializedError, ThreadContext, ThreadHandle, ThreadSpawner};

pub use farm_abi::{Errno, FdResult};
