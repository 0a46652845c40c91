//! Geometry of the shared call channel.
//!
//! Each descriptor slot carries three control words and one call record:
//!
//! ```text
//! lock   0 free | 1 held | 2 held by a two-descriptor caller
//! call   0 idle | 1 pending | 3 shutdown
//! state  0 unused | 1 listening | 2 retired
//! record [u32; RECORD_WORDS]
//!        w0  function id       (request)
//!        w1  descriptor        (request)
//!        w2..w15 arguments / reply fields, u64 values on even word pairs
//!        w16 reply kind        (reply)
//!        w17 errno as i32      (reply; -1 unset, -2 park fault)
//! ```

/// Words in one call record.
pub const RECORD_WORDS: usize = 18;
pub const FUNC_WORD: usize = 0;
pub const FD_WORD: usize = 1;
pub const REPLY_KIND_WORD: usize = 16;
pub const ERRNO_WORD: usize = 17;

pub const ERRNO_UNSET: i32 = -1;
pub const ERRNO_PARK_FAULT: i32 = -2;

pub const LOCK_FREE: u32 = 0;
pub const LOCK_HELD: u32 = 1;
pub const LOCK_HELD_DOUBLE: u32 = 2;

pub const CALL_IDLE: u32 = 0;
pub const CALL_PENDING: u32 = 1;
pub const CALL_SHUTDOWN: u32 = 3;

pub const SLOT_UNUSED: u32 = 0;
pub const SLOT_LISTENING: u32 = 1;
pub const SLOT_RETIRED: u32 = 2;

/// Bytes at the front of an allocator arena holding `{lock, refcount, used_len}`.
/// Payload offsets start after it, so offset 0 never names a payload.
pub const ARENA_HEADER_LEN: u32 = 12;

/// A close-notification target that has already consumed its record.
pub const CONSUMED_TARGET: u32 = u32::MAX;

/// Function selector stored in word 0 of a call record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum FuncId {
    /// Base channel: register a Ref's interest in a set of descriptors.
    SetFdsMap = 0,
    FdAdvise = 7,
    FdAllocate = 8,
    FdClose = 9,
    FdDatasync = 10,
    FdFdstatGet = 11,
    FdFdstatSetFlags = 12,
    FdFdstatSetRights = 13,
    FdFilestatGet = 14,
    FdFilestatSetSize = 15,
    FdFilestatSetTimes = 16,
    FdPread = 17,
    FdPrestatGet = 18,
    FdPrestatDirName = 19,
    FdPwrite = 20,
    FdRead = 21,
    FdReaddir = 22,
    FdSeek = 24,
    FdSync = 25,
    FdTell = 26,
    FdWrite = 27,
    PathCreateDirectory = 28,
    PathFilestatGet = 29,
    PathFilestatSetTimes = 30,
    PathLink = 31,
    PathOpen = 32,
    PathReadlink = 33,
    PathRemoveDirectory = 34,
    PathRename = 35,
    PathSymlink = 36,
    PathUnlinkFile = 37,
}

impl FuncId {
    pub const ALL: [FuncId; 31] = [
        FuncId::SetFdsMap,
        FuncId::FdAdvise,
        FuncId::FdAllocate,
        FuncId::FdClose,
        FuncId::FdDatasync,
        FuncId::FdFdstatGet,
        FuncId::FdFdstatSetFlags,
        FuncId::FdFdstatSetRights,
        FuncId::FdFilestatGet,
        FuncId::FdFilestatSetSize,
        FuncId::FdFilestatSetTimes,
        FuncId::FdPread,
        FuncId::FdPrestatGet,
        FuncId::FdPrestatDirName,
        FuncId::FdPwrite,
        FuncId::FdRead,
        FuncId::FdReaddir,
        FuncId::FdSeek,
        FuncId::FdSync,
        FuncId::FdTell,
        FuncId::FdWrite,
        FuncId::PathCreateDirectory,
        FuncId::PathFilestatGet,
        FuncId::PathFilestatSetTimes,
        FuncId::PathLink,
        FuncId::PathOpen,
        FuncId::PathReadlink,
        FuncId::PathRemoveDirectory,
        FuncId::PathRename,
        FuncId::PathSymlink,
        FuncId::PathUnlinkFile,
    ];

    pub fn from_raw(raw: u32) -> Option<Self> {
        Self::ALL.iter().copied().find(|f| *f as u32 == raw)
    }

    /// The `wasi_snapshot_preview1` import name (or the base-channel name).
    pub fn name(self) -> &'static str {
        match self {
            FuncId::SetFdsMap => "set_fds_map",
            FuncId::FdAdvise => "fd_advise",
            FuncId::FdAllocate => "fd_allocate",
            FuncId::FdClose => "fd_close",
            FuncId::FdDatasync => "fd_datasync",
            FuncId::FdFdstatGet => "fd_fdstat_get",
            FuncId::FdFdstatSetFlags => "fd_fdstat_set_flags",
            FuncId::FdFdstatSetRights => "fd_fdstat_set_rights",
            FuncId::FdFilestatGet => "fd_filestat_get",
            FuncId::FdFilestatSetSize => "fd_filestat_set_size",
            FuncId::FdFilestatSetTimes => "fd_filestat_set_times",
            FuncId::FdPread => "fd_pread",
            FuncId::FdPrestatGet => "fd_prestat_get",
            FuncId::FdPrestatDirName => "fd_prestat_dir_name",
            FuncId::FdPwrite => "fd_pwrite",
            FuncId::FdRead => "fd_read",
            FuncId::FdReaddir => "fd_readdir",
            FuncId::FdSeek => "fd_seek",
            FuncId::FdSync => "fd_sync",
            FuncId::FdTell => "fd_tell",
            FuncId::FdWrite => "fd_write",
            FuncId::PathCreateDirectory => "path_create_directory",
            FuncId::PathFilestatGet => "path_filestat_get",
            FuncId::PathFilestatSetTimes => "path_filestat_set_times",
            FuncId::PathLink => "path_link",
            FuncId::PathOpen => "path_open",
            FuncId::PathReadlink => "path_readlink",
            FuncId::PathRemoveDirectory => "path_remove_directory",
            FuncId::PathRename => "path_rename",
            FuncId::PathSymlink => "path_symlink",
            FuncId::PathUnlinkFile => "path_unlink_file",
        }
    }

    /// Calls that touch two descriptors and take both slot locks.
    pub fn is_two_descriptor(self) -> bool {
        matches!(self, FuncId::PathLink | FuncId::PathRename)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_ids_round_trip() {
        for f in FuncId::ALL {
            assert_eq!(FuncId::from_raw(f as u32), Some(f));
        }
        assert_eq!(FuncId::from_raw(23), None);
    }

    #[test]
    fn errno_is_the_last_word() {
        assert_eq!(ERRNO_WORD, RECORD_WORDS - 1);
        assert!(REPLY_KIND_WORD < ERRNO_WORD);
    }
}
