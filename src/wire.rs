//! Call-record encoding shared by Park and Ref.
//!
//! Every operation is one [`Request`] variant with its typed arguments and
//! maps to fixed word offsets in a [`Record`]. Variable-length payloads
//! (paths, write buffers, buffer-length lists) go through the arena and are
//! referenced by a `(ptr, len)` word pair. Whoever writes a payload hands
//! ownership to the other side: the Park frees request payloads while
//! decoding, the Ref frees reply payloads while decoding.

use farm_abi::layout::{FuncId, FD_WORD, FUNC_WORD, REPLY_KIND_WORD};
use farm_abi::{Fdstat, Filestat, Filetype, Prestat};

use crate::allocator::{Allocator, ArenaRange};
use crate::error::FarmError;
use crate::region::Record;

/// One call against a Park, as seen on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    SetFdsMap { ref_id: u32, fds: Vec<u32> },
    FdAdvise { fd: u32 },
    FdAllocate { fd: u32, offset: u64, len: u64 },
    FdClose { fd: u32 },
    FdDatasync { fd: u32 },
    FdFdstatGet { fd: u32 },
    FdFdstatSetFlags { fd: u32, flags: u16 },
    FdFdstatSetRights { fd: u32, rights_base: u64, rights_inheriting: u64 },
    FdFilestatGet { fd: u32 },
    FdFilestatSetSize { fd: u32, size: u64 },
    FdFilestatSetTimes { fd: u32, atim: u64, mtim: u64, fst_flags: u16 },
    FdPread { fd: u32, iovec_lens: Vec<u32>, offset: u64 },
    FdPrestatGet { fd: u32 },
    FdPrestatDirName { fd: u32, path_len: u32 },
    FdPwrite { fd: u32, data: Vec<u8>, offset: u64 },
    FdRead { fd: u32, iovec_lens: Vec<u32> },
    FdReaddir { fd: u32, buf_len: u32, cookie: u64 },
    FdSeek { fd: u32, offset: i64, whence: u32 },
    FdSync { fd: u32 },
    FdTell { fd: u32 },
    FdWrite { fd: u32, data: Vec<u8> },
    PathCreateDirectory { fd: u32, path: Vec<u8> },
    PathFilestatGet { fd: u32, flags: u32, path: Vec<u8> },
    PathFilestatSetTimes {
        fd: u32,
        flags: u32,
        path: Vec<u8>,
        atim: u64,
        mtim: u64,
        fst_flags: u16,
    },
    PathLink {
        old_fd: u32,
        old_flags: u32,
        old_path: Vec<u8>,
        new_fd: u32,
        new_path: Vec<u8>,
    },
    PathOpen {
        fd: u32,
        dirflags: u32,
        path: Vec<u8>,
        oflags: u16,
        rights_base: u64,
        rights_inheriting: u64,
        fdflags: u16,
    },
    PathReadlink { fd: u32, path: Vec<u8>, buf_len: u32 },
    PathRemoveDirectory { fd: u32, path: Vec<u8> },
    PathRename {
        old_fd: u32,
        old_path: Vec<u8>,
        new_fd: u32,
        new_path: Vec<u8>,
    },
    PathSymlink { old_path: Vec<u8>, fd: u32, new_path: Vec<u8> },
    PathUnlinkFile { fd: u32, path: Vec<u8> },
}

/// Result payload written back by the Park.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    None,
    Fdstat(Fdstat),
    Filestat(Filestat),
    Prestat(Prestat),
    Read { nread: u32, data: Vec<u8> },
    Written(u32),
    Readdir { buf: Vec<u8>, buf_used: u32 },
    Offset(u64),
    Opened(u32),
    Bytes(Vec<u8>),
}

impl Request {
    pub fn func(&self) -> FuncId {
        match self {
            Request::SetFdsMap { .. } => FuncId::SetFdsMap,
            Request::FdAdvise { .. } => FuncId::FdAdvise,
            Request::FdAllocate { .. } => FuncId::FdAllocate,
            Request::FdClose { .. } => FuncId::FdClose,
            Request::FdDatasync { .. } => FuncId::FdDatasync,
            Request::FdFdstatGet { .. } => FuncId::FdFdstatGet,
            Request::FdFdstatSetFlags { .. } => FuncId::FdFdstatSetFlags,
            Request::FdFdstatSetRights { .. } => FuncId::FdFdstatSetRights,
            Request::FdFilestatGet { .. } => FuncId::FdFilestatGet,
            Request::FdFilestatSetSize { .. } => FuncId::FdFilestatSetSize,
            Request::FdFilestatSetTimes { .. } => FuncId::FdFilestatSetTimes,
            Request::FdPread { .. } => FuncId::FdPread,
            Request::FdPrestatGet { .. } => FuncId::FdPrestatGet,
            Request::FdPrestatDirName { .. } => FuncId::FdPrestatDirName,
            Request::FdPwrite { .. } => FuncId::FdPwrite,
            Request::FdRead { .. } => FuncId::FdRead,
            Request::FdReaddir { .. } => FuncId::FdReaddir,
            Request::FdSeek { .. } => FuncId::FdSeek,
            Request::FdSync { .. } => FuncId::FdSync,
            Request::FdTell { .. } => FuncId::FdTell,
            Request::FdWrite { .. } => FuncId::FdWrite,
            Request::PathCreateDirectory { .. } => FuncId::PathCreateDirectory,
            Request::PathFilestatGet { .. } => FuncId::PathFilestatGet,
            Request::PathFilestatSetTimes { .. } => FuncId::PathFilestatSetTimes,
            Request::PathLink { .. } => FuncId::PathLink,
            Request::PathOpen { .. } => FuncId::PathOpen,
            Request::PathReadlink { .. } => FuncId::PathReadlink,
            Request::PathRemoveDirectory { .. } => FuncId::PathRemoveDirectory,
            Request::PathRename { .. } => FuncId::PathRename,
            Request::PathSymlink { .. } => FuncId::PathSymlink,
            Request::PathUnlinkFile { .. } => FuncId::PathUnlinkFile,
        }
    }

    /// The descriptor whose slot carries this call (word 1).
    ///
    /// For `SetFdsMap` this is the registering ref id.
    pub fn fd(&self) -> u32 {
        match self {
            Request::SetFdsMap { ref_id, .. } => *ref_id,
            Request::PathLink { old_fd, .. } | Request::PathRename { old_fd, .. } => *old_fd,
            Request::FdAdvise { fd }
            | Request::FdAllocate { fd, .. }
            | Request::FdClose { fd }
            | Request::FdDatasync { fd }
            | Request::FdFdstatGet { fd }
            | Request::FdFdstatSetFlags { fd, .. }
            | Request::FdFdstatSetRights { fd, .. }
            | Request::FdFilestatGet { fd }
            | Request::FdFilestatSetSize { fd, .. }
            | Request::FdFilestatSetTimes { fd, .. }
            | Request::FdPread { fd, .. }
            | Request::FdPrestatGet { fd }
            | Request::FdPrestatDirName { fd, .. }
            | Request::FdPwrite { fd, .. }
            | Request::FdRead { fd, .. }
            | Request::FdReaddir { fd, .. }
            | Request::FdSeek { fd, .. }
            | Request::FdSync { fd }
            | Request::FdTell { fd }
            | Request::FdWrite { fd, .. }
            | Request::PathCreateDirectory { fd, .. }
            | Request::PathFilestatGet { fd, .. }
            | Request::PathFilestatSetTimes { fd, .. }
            | Request::PathOpen { fd, .. }
            | Request::PathReadlink { fd, .. }
            | Request::PathRemoveDirectory { fd, .. }
            | Request::PathSymlink { fd, .. }
            | Request::PathUnlinkFile { fd, .. } => *fd,
        }
    }

    /// The second descriptor of a two-descriptor call.
    pub fn second_fd(&self) -> Option<u32> {
        match self {
            Request::PathLink { new_fd, .. } | Request::PathRename { new_fd, .. } => Some(*new_fd),
            _ => None,
        }
    }

    /// Write this request into `record`, placing payloads in `arena`.
    ///
    /// On failure every payload already written is freed again.
    pub fn encode(&self, record: &Record<'_>, arena: &Allocator) -> Result<(), FarmError> {
        record.clear();
        let mut payloads = Payloads::new(arena);
        let result = self.encode_fields(record, &mut payloads);
        if result.is_err() {
            payloads.abandon();
        }
        result
    }

    fn encode_fields(&self, r: &Record<'_>, p: &mut Payloads<'_>) -> Result<(), FarmError> {
        r.set_u32(FUNC_WORD, self.func() as u32);
        r.set_u32(FD_WORD, self.fd());
        match self {
            Request::SetFdsMap { fds, .. } => p.put(r, 2, &u32s_to_bytes(fds))?,
            Request::FdAdvise { .. }
            | Request::FdClose { .. }
            | Request::FdDatasync { .. }
            | Request::FdFdstatGet { .. }
            | Request::FdFilestatGet { .. }
            | Request::FdPrestatGet { .. }
            | Request::FdSync { .. }
            | Request::FdTell { .. } => {}
            Request::FdAllocate { offset, len, .. } => {
                r.set_u64(2, *offset);
                r.set_u64(4, *len);
            }
            Request::FdFdstatSetFlags { flags, .. } => r.set_u32(2, u32::from(*flags)),
            Request::FdFdstatSetRights {
                rights_base,
                rights_inheriting,
                ..
            } => {
                r.set_u64(2, *rights_base);
                r.set_u64(4, *rights_inheriting);
            }
            Request::FdFilestatSetSize { size, .. } => r.set_u64(2, *size),
            Request::FdFilestatSetTimes {
                atim,
                mtim,
                fst_flags,
                ..
            } => {
                r.set_u64(2, *atim);
                r.set_u64(4, *mtim);
                r.set_u32(6, u32::from(*fst_flags));
            }
            Request::FdPread {
                iovec_lens, offset, ..
            } => {
                p.put(r, 2, &u32s_to_bytes(iovec_lens))?;
                r.set_u64(4, *offset);
            }
            Request::FdPrestatDirName { path_len, .. } => r.set_u32(2, *path_len),
            Request::FdPwrite { data, offset, .. } => {
                p.put(r, 2, data)?;
                r.set_u64(4, *offset);
            }
            Request::FdRead { iovec_lens, .. } => p.put(r, 2, &u32s_to_bytes(iovec_lens))?,
            Request::FdReaddir { buf_len, cookie, .. } => {
                r.set_u32(2, *buf_len);
                r.set_u64(4, *cookie);
            }
            Request::FdSeek { offset, whence, .. } => {
                r.set_u64(2, *offset as u64);
                r.set_u32(4, *whence);
            }
            Request::FdWrite { data, .. } => p.put(r, 2, data)?,
            Request::PathCreateDirectory { path, .. }
            | Request::PathRemoveDirectory { path, .. }
            | Request::PathUnlinkFile { path, .. } => p.put(r, 2, path)?,
            Request::PathFilestatGet { flags, path, .. } => {
                r.set_u32(2, *flags);
                p.put(r, 3, path)?;
            }
            Request::PathFilestatSetTimes {
                flags,
                path,
                atim,
                mtim,
                fst_flags,
                ..
            } => {
                r.set_u32(2, *flags);
                p.put(r, 3, path)?;
                r.set_u64(6, *atim);
                r.set_u64(8, *mtim);
                r.set_u32(10, u32::from(*fst_flags));
            }
            Request::PathLink {
                old_flags,
                old_path,
                new_fd,
                new_path,
                ..
            } => {
                r.set_u32(2, *old_flags);
                p.put(r, 3, old_path)?;
                r.set_u32(5, *new_fd);
                p.put(r, 6, new_path)?;
            }
            Request::PathOpen {
                dirflags,
                path,
                oflags,
                rights_base,
                rights_inheriting,
                fdflags,
                ..
            } => {
                r.set_u32(2, *dirflags);
                p.put(r, 3, path)?;
                r.set_u32(5, u32::from(*oflags));
                r.set_u64(6, *rights_base);
                r.set_u64(8, *rights_inheriting);
                r.set_u32(10, u32::from(*fdflags));
            }
            Request::PathReadlink { path, buf_len, .. } => {
                p.put(r, 2, path)?;
                r.set_u32(4, *buf_len);
            }
            Request::PathRename {
                old_path,
                new_fd,
                new_path,
                ..
            } => {
                p.put(r, 2, old_path)?;
                r.set_u32(4, *new_fd);
                p.put(r, 5, new_path)?;
            }
            Request::PathSymlink {
                old_path, new_path, ..
            } => {
                p.put(r, 2, old_path)?;
                p.put(r, 4, new_path)?;
            }
        }
        Ok(())
    }

    /// Read a request out of `record`, taking ownership of its payloads.
    pub fn decode(r: &Record<'_>, arena: &Allocator) -> Result<Request, FarmError> {
        let raw = r.u32(FUNC_WORD);
        let func = FuncId::from_raw(raw)
            .ok_or_else(|| FarmError::Protocol(format!("unknown function id {raw}")))?;
        let fd = r.u32(FD_WORD);
        let take = |word: usize| take_pair(r, arena, word);
        Ok(match func {
            FuncId::SetFdsMap => Request::SetFdsMap {
                ref_id: fd,
                fds: bytes_to_u32s(&take(2)?),
            },
            FuncId::FdAdvise => Request::FdAdvise { fd },
            FuncId::FdAllocate => Request::FdAllocate {
                fd,
                offset: r.u64(2),
                len: r.u64(4),
            },
            FuncId::FdClose => Request::FdClose { fd },
            FuncId::FdDatasync => Request::FdDatasync { fd },
            FuncId::FdFdstatGet => Request::FdFdstatGet { fd },
            FuncId::FdFdstatSetFlags => Request::FdFdstatSetFlags {
                fd,
                flags: r.u32(2) as u16,
            },
            FuncId::FdFdstatSetRights => Request::FdFdstatSetRights {
                fd,
                rights_base: r.u64(2),
                rights_inheriting: r.u64(4),
            },
            FuncId::FdFilestatGet => Request::FdFilestatGet { fd },
            FuncId::FdFilestatSetSize => Request::FdFilestatSetSize { fd, size: r.u64(2) },
            FuncId::FdFilestatSetTimes => Request::FdFilestatSetTimes {
                fd,
                atim: r.u64(2),
                mtim: r.u64(4),
                fst_flags: r.u32(6) as u16,
            },
            FuncId::FdPread => Request::FdPread {
                fd,
                iovec_lens: bytes_to_u32s(&take(2)?),
                offset: r.u64(4),
            },
            FuncId::FdPrestatGet => Request::FdPrestatGet { fd },
            FuncId::FdPrestatDirName => Request::FdPrestatDirName {
                fd,
                path_len: r.u32(2),
            },
            FuncId::FdPwrite => Request::FdPwrite {
                fd,
                data: take(2)?,
                offset: r.u64(4),
            },
            FuncId::FdRead => Request::FdRead {
                fd,
                iovec_lens: bytes_to_u32s(&take(2)?),
            },
            FuncId::FdReaddir => Request::FdReaddir {
                fd,
                buf_len: r.u32(2),
                cookie: r.u64(4),
            },
            FuncId::FdSeek => Request::FdSeek {
                fd,
                offset: r.u64(2) as i64,
                whence: r.u32(4),
            },
            FuncId::FdSync => Request::FdSync { fd },
            FuncId::FdTell => Request::FdTell { fd },
            FuncId::FdWrite => Request::FdWrite { fd, data: take(2)? },
            FuncId::PathCreateDirectory => Request::PathCreateDirectory { fd, path: take(2)? },
            FuncId::PathFilestatGet => Request::PathFilestatGet {
                fd,
                flags: r.u32(2),
                path: take(3)?,
            },
            FuncId::PathFilestatSetTimes => Request::PathFilestatSetTimes {
                fd,
                flags: r.u32(2),
                path: take(3)?,
                atim: r.u64(6),
                mtim: r.u64(8),
                fst_flags: r.u32(10) as u16,
            },
            FuncId::PathLink => {
                let (old_path, new_path) = take_both(r, arena, 3, 6)?;
                Request::PathLink {
                    old_fd: fd,
                    old_flags: r.u32(2),
                    old_path,
                    new_fd: r.u32(5),
                    new_path,
                }
            }
            FuncId::PathOpen => Request::PathOpen {
                fd,
                dirflags: r.u32(2),
                path: take(3)?,
                oflags: r.u32(5) as u16,
                rights_base: r.u64(6),
                rights_inheriting: r.u64(8),
                fdflags: r.u32(10) as u16,
            },
            FuncId::PathReadlink => Request::PathReadlink {
                fd,
                path: take(2)?,
                buf_len: r.u32(4),
            },
            FuncId::PathRemoveDirectory => Request::PathRemoveDirectory { fd, path: take(2)? },
            FuncId::PathRename => {
                let (old_path, new_path) = take_both(r, arena, 2, 5)?;
                Request::PathRename {
                    old_fd: fd,
                    old_path,
                    new_fd: r.u32(4),
                    new_path,
                }
            }
            FuncId::PathSymlink => {
                let (old_path, new_path) = take_both(r, arena, 2, 4)?;
                Request::PathSymlink { old_path, fd, new_path }
            }
            FuncId::PathUnlinkFile => Request::PathUnlinkFile { fd, path: take(2)? },
        })
    }
}

const KIND_NONE: u32 = 0;
const KIND_FDSTAT: u32 = 1;
const KIND_FILESTAT: u32 = 2;
const KIND_PRESTAT: u32 = 3;
const KIND_READ: u32 = 4;
const KIND_WRITTEN: u32 = 5;
const KIND_READDIR: u32 = 6;
const KIND_OFFSET: u32 = 7;
const KIND_OPENED: u32 = 8;
const KIND_BYTES: u32 = 9;

impl Reply {
    fn kind(&self) -> u32 {
        match self {
            Reply::None => KIND_NONE,
            Reply::Fdstat(_) => KIND_FDSTAT,
            Reply::Filestat(_) => KIND_FILESTAT,
            Reply::Prestat(_) => KIND_PRESTAT,
            Reply::Read { .. } => KIND_READ,
            Reply::Written(_) => KIND_WRITTEN,
            Reply::Readdir { .. } => KIND_READDIR,
            Reply::Offset(_) => KIND_OFFSET,
            Reply::Opened(_) => KIND_OPENED,
            Reply::Bytes(_) => KIND_BYTES,
        }
    }

    /// Write the reply fields (not the errno) into `record`.
    pub fn encode(&self, r: &Record<'_>, arena: &Allocator) -> Result<(), FarmError> {
        let mut p = Payloads::new(arena);
        match self {
            Reply::None => {}
            Reply::Fdstat(stat) => {
                r.set_u32(0, stat.filetype as u32);
                r.set_u32(1, u32::from(stat.flags));
                r.set_u64(2, stat.rights_base);
                r.set_u64(4, stat.rights_inheriting);
            }
            Reply::Filestat(stat) => {
                r.set_u64(0, stat.dev);
                r.set_u64(2, stat.ino);
                r.set_u32(4, stat.filetype as u32);
                r.set_u64(6, stat.nlink);
                r.set_u64(8, stat.size);
                r.set_u64(10, stat.atim);
                r.set_u64(12, stat.mtim);
                r.set_u64(14, stat.ctim);
            }
            Reply::Prestat(prestat) => {
                r.set_u32(0, u32::from(prestat.tag));
                p.put(r, 1, &prestat.pr_name)?;
            }
            Reply::Read { nread, data } => {
                r.set_u32(0, *nread);
                p.put(r, 1, data)?;
            }
            Reply::Written(n) | Reply::Opened(n) => r.set_u32(0, *n),
            Reply::Readdir { buf, buf_used } => {
                p.put(r, 0, buf)?;
                r.set_u32(2, *buf_used);
            }
            Reply::Offset(offset) => r.set_u64(0, *offset),
            Reply::Bytes(bytes) => p.put(r, 0, bytes)?,
        }
        r.set_u32(REPLY_KIND_WORD, self.kind());
        Ok(())
    }

    /// Read the reply out of `record`, taking ownership of its payload.
    pub fn decode(r: &Record<'_>, arena: &Allocator) -> Result<Reply, FarmError> {
        let take = |word: usize| take_pair(r, arena, word);
        Ok(match r.u32(REPLY_KIND_WORD) {
            KIND_NONE => Reply::None,
            KIND_FDSTAT => Reply::Fdstat(Fdstat {
                filetype: Filetype::from_raw(r.u32(0)),
                flags: r.u32(1) as u16,
                rights_base: r.u64(2),
                rights_inheriting: r.u64(4),
            }),
            KIND_FILESTAT => Reply::Filestat(Filestat {
                dev: r.u64(0),
                ino: r.u64(2),
                filetype: Filetype::from_raw(r.u32(4)),
                nlink: r.u64(6),
                size: r.u64(8),
                atim: r.u64(10),
                mtim: r.u64(12),
                ctim: r.u64(14),
            }),
            KIND_PRESTAT => Reply::Prestat(Prestat {
                tag: r.u32(0) as u8,
                pr_name: take(1)?,
            }),
            KIND_READ => Reply::Read {
                nread: r.u32(0),
                data: take(1)?,
            },
            KIND_WRITTEN => Reply::Written(r.u32(0)),
            KIND_READDIR => Reply::Readdir {
                buf: take(0)?,
                buf_used: r.u32(2),
            },
            KIND_OFFSET => Reply::Offset(r.u64(0)),
            KIND_OPENED => Reply::Opened(r.u32(0)),
            KIND_BYTES => Reply::Bytes(take(0)?),
            other => return Err(FarmError::Protocol(format!("unknown reply kind {other}"))),
        })
    }
}

/// Tracks payloads written during one encode so a failure can free them.
struct Payloads<'a> {
    arena: &'a Allocator,
    written: Vec<ArenaRange>,
}

impl<'a> Payloads<'a> {
    fn new(arena: &'a Allocator) -> Self {
        Self {
            arena,
            written: Vec::new(),
        }
    }

    fn put(&mut self, r: &Record<'_>, word: usize, bytes: &[u8]) -> Result<(), FarmError> {
        let range = self.arena.write(bytes)?;
        self.written.push(range);
        r.set_u32(word, range.ptr);
        r.set_u32(word + 1, range.len);
        Ok(())
    }

    fn abandon(self) {
        for range in self.written {
            self.arena.free(range);
        }
    }
}

fn take_pair(r: &Record<'_>, arena: &Allocator, word: usize) -> Result<Vec<u8>, FarmError> {
    arena.take(ArenaRange {
        ptr: r.u32(word),
        len: r.u32(word + 1),
    })
}

/// Take two payloads. Both ranges are freed even if the first is bad.
fn take_both(
    r: &Record<'_>,
    arena: &Allocator,
    first: usize,
    second: usize,
) -> Result<(Vec<u8>, Vec<u8>), FarmError> {
    let first = take_pair(r, arena, first);
    let second = take_pair(r, arena, second);
    Ok((first?, second?))
}

fn u32s_to_bytes(values: &[u32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn bytes_to_u32s(bytes: &[u8]) -> Vec<u32> {
    bytes
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FarmConfig;
    use crate::region::SharedRegion;

    fn region(arena_size: usize) -> SharedRegion {
        SharedRegion::new(FarmConfig::new(arena_size, 4)).expect("region")
    }

    #[test]
    fn bad_first_path_still_frees_the_second() {
        let region = region(256);
        let slot = region.slot(3).expect("slot");
        let request = Request::PathRename {
            old_fd: 3,
            old_path: b"from".to_vec(),
            new_fd: 2,
            new_path: b"to".to_vec(),
        };
        request.encode(&slot.record(), region.arena()).expect("encode");
        assert_eq!(region.arena().refcount(), 2);
        slot.record().set_u32(3, 10_000);

        let err = Request::decode(&slot.record(), region.arena()).expect_err("first range is out of bounds");
        assert!(matches!(err, FarmError::OutOfBounds { .. }));
        assert_eq!(region.arena().refcount(), 0);
    }

    #[test]
    fn path_open_travels_through_the_record() {
        let region = region(256);
        let slot = region.slot(3).expect("slot");
        let request = Request::PathOpen {
            fd: 3,
            dirflags: 1,
            path: b"dir/file.txt".to_vec(),
            oflags: 9,
            rights_base: u64::MAX - 1,
            rights_inheriting: 7,
            fdflags: 1,
        };
        request.encode(&slot.record(), region.arena()).expect("encode");
        assert_eq!(slot.record().u32(FUNC_WORD), FuncId::PathOpen as u32);
        assert_eq!(region.arena().refcount(), 1);
        let decoded = Request::decode(&slot.record(), region.arena()).expect("decode");
        assert_eq!(decoded, request);
        assert_eq!(region.arena().refcount(), 0);
    }

    #[test]
    fn rename_carries_both_descriptors() {
        let region = region(256);
        let slot = region.slot(1).expect("slot");
        let request = Request::PathRename {
            old_fd: 1,
            old_path: b"a".to_vec(),
            new_fd: 2,
            new_path: b"b".to_vec(),
        };
        assert_eq!(request.second_fd(), Some(2));
        request.encode(&slot.record(), region.arena()).expect("encode");
        let decoded = Request::decode(&slot.record(), region.arena()).expect("decode");
        assert_eq!(decoded, request);
    }

    #[test]
    fn failed_encode_frees_earlier_payloads() {
        let region = region(32);
        let slot = region.slot(0).expect("slot");
        let request = Request::PathLink {
            old_fd: 0,
            old_flags: 0,
            old_path: vec![b'x'; 10],
            new_fd: 1,
            new_path: vec![b'y'; 20],
        };
        let err = request.encode(&slot.record(), region.arena()).unwrap_err();
        assert!(matches!(err, FarmError::AllocatorExhausted { .. }));
        assert_eq!(region.arena().refcount(), 0);
    }

    #[test]
    fn negative_seek_offsets_survive() {
        let region = region(64);
        let slot = region.slot(2).expect("slot");
        let request = Request::FdSeek {
            fd: 2,
            offset: -5,
            whence: 1,
        };
        request.encode(&slot.record(), region.arena()).expect("encode");
        assert_eq!(Request::decode(&slot.record(), region.arena()).expect("decode"), request);
    }

    #[test]
    fn filestat_reply_fills_sixteen_words() {
        let region = region(64);
        let record = region.slot(0).expect("slot").record();
        record.clear();
        let stat = Filestat {
            dev: 1,
            ino: 2,
            filetype: Filetype::RegularFile,
            nlink: 3,
            size: 4,
            atim: 5,
            mtim: 6,
            ctim: u64::MAX,
        };
        Reply::Filestat(stat).encode(&record, region.arena()).expect("encode");
        assert_eq!(record.u32(15), u32::MAX);
        assert_eq!(
            Reply::decode(&record, region.arena()).expect("decode"),
            Reply::Filestat(stat)
        );
    }

    #[test]
    fn unknown_function_is_a_protocol_error() {
        let region = region(64);
        let record = region.slot(0).expect("slot").record();
        record.clear();
        record.set_u32(FUNC_WORD, 23);
        assert!(matches!(
            Request::decode(&record, region.arena()),
            Err(FarmError::Protocol(_))
        ));
    }
}
