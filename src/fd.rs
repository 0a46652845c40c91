//! The capability interface a Park dispatches against.
//!
//! A descriptor object accepts a fixed set of named calls and answers with
//! an [`FdResult`]. Every method has a default so an implementation only
//! overrides what it supports; the defaults mirror what an unsupported call
//! means for WASI (`NOTSUP`, or success for `fd_close`/`fd_sync`).

use std::any::Any;
use std::sync::Arc;

use farm_abi::{Dirent, Errno, FdResult, Fdstat, Filestat, Prestat, Whence};

/// An opaque filesystem node moved between descriptors by link and rename.
///
/// Only the implementation that produced it knows its concrete type.
pub type Inode = Arc<dyn Any + Send + Sync>;

/// A real descriptor owned by a Park.
#[allow(unused_variables)]
pub trait Fd: Send {
    fn fd_allocate(&mut self, offset: u64, len: u64) -> FdResult<()> {
        Err(Errno::NOTSUP)
    }

    fn fd_close(&mut self) -> FdResult<()> {
        Ok(())
    }

    fn fd_fdstat_get(&self) -> FdResult<Fdstat> {
        Err(Errno::NOTSUP)
    }

    fn fd_fdstat_set_flags(&mut self, flags: u16) -> FdResult<()> {
        Err(Errno::NOTSUP)
    }

    fn fd_fdstat_set_rights(&mut self, rights_base: u64, rights_inheriting: u64) -> FdResult<()> {
        Err(Errno::NOTSUP)
    }

    fn fd_filestat_get(&self) -> FdResult<Filestat> {
        Err(Errno::NOTSUP)
    }

    fn fd_filestat_set_size(&mut self, size: u64) -> FdResult<()> {
        Err(Errno::NOTSUP)
    }

    fn fd_filestat_set_times(&mut self, atim: u64, mtim: u64, fst_flags: u16) -> FdResult<()> {
        Err(Errno::NOTSUP)
    }

    /// Read up to `len` bytes at `offset` without moving the position.
    fn fd_pread(&mut self, len: usize, offset: u64) -> FdResult<Vec<u8>> {
        Err(Errno::NOTSUP)
    }

    fn fd_prestat_get(&self) -> FdResult<Prestat> {
        Err(Errno::NOTSUP)
    }

    fn fd_pwrite(&mut self, data: &[u8], offset: u64) -> FdResult<u32> {
        Err(Errno::NOTSUP)
    }

    /// Read up to `len` bytes at the current position.
    fn fd_read(&mut self, len: usize) -> FdResult<Vec<u8>> {
        Err(Errno::NOTSUP)
    }

    /// The entry at `cookie`, or `None` past the end.
    fn fd_readdir_single(&self, cookie: u64) -> FdResult<Option<Dirent>> {
        Err(Errno::NOTSUP)
    }

    fn fd_seek(&mut self, offset: i64, whence: Whence) -> FdResult<u64> {
        Err(Errno::NOTSUP)
    }

    fn fd_sync(&mut self) -> FdResult<()> {
        Ok(())
    }

    fn fd_tell(&self) -> FdResult<u64> {
        Err(Errno::NOTSUP)
    }

    fn fd_write(&mut self, data: &[u8]) -> FdResult<u32> {
        Err(Errno::NOTSUP)
    }

    fn path_create_directory(&mut self, path: &str) -> FdResult<()> {
        Err(Errno::NOTSUP)
    }

    fn path_filestat_get(&self, flags: u32, path: &str) -> FdResult<Filestat> {
        Err(Errno::NOTSUP)
    }

    fn path_filestat_set_times(
        &mut self,
        flags: u32,
        path: &str,
        atim: u64,
        mtim: u64,
        fst_flags: u16,
    ) -> FdResult<()> {
        Err(Errno::NOTSUP)
    }

    /// Attach `inode` under `path`. `allow_dir` permits directories (rename).
    fn path_link(&mut self, path: &str, inode: Inode, allow_dir: bool) -> FdResult<()> {
        Err(Errno::NOTSUP)
    }

    fn path_lookup(&self, path: &str, dirflags: u32) -> FdResult<Inode> {
        Err(Errno::NOTSUP)
    }

    fn path_open(
        &mut self,
        dirflags: u32,
        path: &str,
        oflags: u16,
        rights_base: u64,
        rights_inheriting: u64,
        fdflags: u16,
    ) -> FdResult<Box<dyn Fd>> {
        Err(Errno::NOTDIR)
    }

    fn path_readlink(&self, path: &str) -> FdResult<String> {
        Err(Errno::NOTSUP)
    }

    fn path_remove_directory(&mut self, path: &str) -> FdResult<()> {
        Err(Errno::NOTSUP)
    }

    /// Detach and return the node at `path`, whatever its kind.
    fn path_unlink(&mut self, path: &str) -> FdResult<Inode> {
        Err(Errno::NOTSUP)
    }

    fn path_unlink_file(&mut self, path: &str) -> FdResult<()> {
        Err(Errno::NOTSUP)
    }
}
