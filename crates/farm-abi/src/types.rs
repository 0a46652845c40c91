//! WASI plain-data types and their guest-memory encodings.
//!
//! All guest encodings are little-endian and follow the `wasi_snapshot_preview1`
//! struct layouts.

use alloc::vec::Vec;

/// Kind of object a descriptor or directory entry refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum Filetype {
    Unknown = 0,
    BlockDevice = 1,
    CharacterDevice = 2,
    Directory = 3,
    RegularFile = 4,
    SocketDgram = 5,
    SocketStream = 6,
    SymbolicLink = 7,
}

impl Filetype {
    /// Lossy decode: anything out of range is `Unknown`.
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            1 => Filetype::BlockDevice,
            2 => Filetype::CharacterDevice,
            3 => Filetype::Directory,
            4 => Filetype::RegularFile,
            5 => Filetype::SocketDgram,
            6 => Filetype::SocketStream,
            7 => Filetype::SymbolicLink,
            _ => Filetype::Unknown,
        }
    }
}

/// Reference point for `fd_seek`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum Whence {
    Set = 0,
    Cur = 1,
    End = 2,
}

impl Whence {
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Whence::Set),
            1 => Some(Whence::Cur),
            2 => Some(Whence::End),
            _ => None,
        }
    }
}

pub const OFLAGS_CREAT: u16 = 1 << 0;
pub const OFLAGS_DIRECTORY: u16 = 1 << 1;
pub const OFLAGS_EXCL: u16 = 1 << 2;
pub const OFLAGS_TRUNC: u16 = 1 << 3;

pub const FDFLAGS_APPEND: u16 = 1 << 0;
pub const FDFLAGS_DSYNC: u16 = 1 << 1;
pub const FDFLAGS_NONBLOCK: u16 = 1 << 2;
pub const FDFLAGS_RSYNC: u16 = 1 << 3;
pub const FDFLAGS_SYNC: u16 = 1 << 4;

pub const FSTFLAGS_ATIM: u16 = 1 << 0;
pub const FSTFLAGS_ATIM_NOW: u16 = 1 << 1;
pub const FSTFLAGS_MTIM: u16 = 1 << 2;
pub const FSTFLAGS_MTIM_NOW: u16 = 1 << 3;

pub const LOOKUPFLAGS_SYMLINK_FOLLOW: u32 = 1 << 0;

pub const PREOPENTYPE_DIR: u8 = 0;

pub const CLOCKID_REALTIME: u32 = 0;
pub const CLOCKID_MONOTONIC: u32 = 1;

/// Every right bit defined by preview1.
pub const RIGHTS_ALL: u64 = (1 << 30) - 1;

/// Result of `fd_fdstat_get`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Fdstat {
    pub filetype: Filetype,
    pub flags: u16,
    pub rights_base: u64,
    pub rights_inheriting: u64,
}

impl Fdstat {
    pub const SIZE: usize = 24;

    pub fn new(filetype: Filetype, flags: u16) -> Self {
        Self {
            filetype,
            flags,
            rights_base: RIGHTS_ALL,
            rights_inheriting: RIGHTS_ALL,
        }
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0] = self.filetype as u8;
        out[2..4].copy_from_slice(&self.flags.to_le_bytes());
        out[8..16].copy_from_slice(&self.rights_base.to_le_bytes());
        out[16..24].copy_from_slice(&self.rights_inheriting.to_le_bytes());
        out
    }
}

/// Result of `fd_filestat_get` / `path_filestat_get`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Filestat {
    pub dev: u64,
    pub ino: u64,
    pub filetype: Filetype,
    pub nlink: u64,
    pub size: u64,
    pub atim: u64,
    pub mtim: u64,
    pub ctim: u64,
}

impl Filestat {
    pub const SIZE: usize = 64;

    pub fn new(ino: u64, filetype: Filetype, size: u64) -> Self {
        Self {
            dev: 0,
            ino,
            filetype,
            nlink: 1,
            size,
            atim: 0,
            mtim: 0,
            ctim: 0,
        }
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0..8].copy_from_slice(&self.dev.to_le_bytes());
        out[8..16].copy_from_slice(&self.ino.to_le_bytes());
        out[16] = self.filetype as u8;
        out[24..32].copy_from_slice(&self.nlink.to_le_bytes());
        out[32..40].copy_from_slice(&self.size.to_le_bytes());
        out[40..48].copy_from_slice(&self.atim.to_le_bytes());
        out[48..56].copy_from_slice(&self.mtim.to_le_bytes());
        out[56..64].copy_from_slice(&self.ctim.to_le_bytes());
        out
    }
}

/// A preopened directory: its tag and the name the guest should see.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Prestat {
    pub tag: u8,
    pub pr_name: Vec<u8>,
}

impl Prestat {
    pub const SIZE: usize = 8;

    pub fn dir(name: impl Into<Vec<u8>>) -> Self {
        Self {
            tag: PREOPENTYPE_DIR,
            pr_name: name.into(),
        }
    }

    /// Guest encoding: `{ tag: u8, pr_name_len: u32 }`.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0] = self.tag;
        out[4..8].copy_from_slice(&(self.pr_name.len() as u32).to_le_bytes());
        out
    }
}

/// One directory entry as produced by `fd_readdir`.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Dirent {
    /// Cookie of the entry that follows this one.
    pub d_next: u64,
    pub d_ino: u64,
    pub d_type: Filetype,
    pub name: Vec<u8>,
}

impl Dirent {
    pub const HEAD_SIZE: usize = 24;

    pub fn head_length(&self) -> usize {
        Self::HEAD_SIZE
    }

    pub fn name_length(&self) -> usize {
        self.name.len()
    }

    pub fn head_bytes(&self) -> [u8; Self::HEAD_SIZE] {
        let mut out = [0u8; Self::HEAD_SIZE];
        out[0..8].copy_from_slice(&self.d_next.to_le_bytes());
        out[8..16].copy_from_slice(&self.d_ino.to_le_bytes());
        out[16..20].copy_from_slice(&(self.name.len() as u32).to_le_bytes());
        out[20] = self.d_type as u8;
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fdstat_layout() {
        let stat = Fdstat {
            filetype: Filetype::RegularFile,
            flags: FDFLAGS_APPEND,
            rights_base: 0x0102,
            rights_inheriting: 0,
        };
        let bytes = stat.to_bytes();
        assert_eq!(bytes[0], 4);
        assert_eq!(&bytes[2..4], &[1, 0]);
        assert_eq!(&bytes[8..10], &[0x02, 0x01]);
    }

    #[test]
    fn dirent_head_carries_name_len_and_type() {
        let dirent = Dirent {
            d_next: 2,
            d_ino: 9,
            d_type: Filetype::Directory,
            name: b"sub".to_vec(),
        };
        let head = dirent.head_bytes();
        assert_eq!(head[0], 2);
        assert_eq!(head[8], 9);
        assert_eq!(head[16], 3);
        assert_eq!(head[20], Filetype::Directory as u8);
    }

    #[test]
    fn prestat_encodes_name_length() {
        let bytes = Prestat::dir("/tmp").to_bytes();
        assert_eq!(bytes[0], PREOPENTYPE_DIR);
        assert_eq!(u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]), 4);
    }

    #[test]
    fn unknown_filetype_and_whence() {
        assert_eq!(Filetype::from_raw(42), Filetype::Unknown);
        assert_eq!(Whence::from_raw(3), None);
        assert_eq!(Whence::from_raw(2), Some(Whence::End));
    }
}
