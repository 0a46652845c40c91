//! An in-memory directory tree.
//!
//! Paths are resolved relative to the directory a descriptor names. A
//! leading `/` is ignored, `.` is skipped and `..` steps back toward that
//! directory but never above it.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use farm_abi::types::{
    FSTFLAGS_ATIM, FSTFLAGS_ATIM_NOW, FSTFLAGS_MTIM, FSTFLAGS_MTIM_NOW, OFLAGS_CREAT,
    OFLAGS_DIRECTORY, OFLAGS_EXCL, OFLAGS_TRUNC,
};
use farm_abi::{Dirent, Errno, FdResult, Fdstat, Filestat, Filetype, Prestat, Whence};
use parking_lot::RwLock;

use crate::fd::{Fd, Inode};

static NEXT_INO: AtomicU64 = AtomicU64::new(1);

struct Meta {
    ino: u64,
    atim: AtomicU64,
    mtim: AtomicU64,
}

impl Meta {
    fn new() -> Self {
        Self {
            ino: NEXT_INO.fetch_add(1, Ordering::Relaxed),
            atim: AtomicU64::new(0),
            mtim: AtomicU64::new(0),
        }
    }

    fn set_times(&self, atim: u64, mtim: u64, fst_flags: u16) -> FdResult<()> {
        if (fst_flags & FSTFLAGS_ATIM != 0 && fst_flags & FSTFLAGS_ATIM_NOW != 0)
            || (fst_flags & FSTFLAGS_MTIM != 0 && fst_flags & FSTFLAGS_MTIM_NOW != 0)
        {
            return Err(Errno::INVAL);
        }
        let now = || {
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_nanos() as u64)
                .unwrap_or(0)
        };
        if fst_flags & FSTFLAGS_ATIM != 0 {
            self.atim.store(atim, Ordering::Relaxed);
        } else if fst_flags & FSTFLAGS_ATIM_NOW != 0 {
            self.atim.store(now(), Ordering::Relaxed);
        }
        if fst_flags & FSTFLAGS_MTIM != 0 {
            self.mtim.store(mtim, Ordering::Relaxed);
        } else if fst_flags & FSTFLAGS_MTIM_NOW != 0 {
            self.mtim.store(now(), Ordering::Relaxed);
        }
        Ok(())
    }

    fn filestat(&self, filetype: Filetype, size: u64) -> Filestat {
        let mut stat = Filestat::new(self.ino, filetype, size);
        stat.atim = self.atim.load(Ordering::Relaxed);
        stat.mtim = self.mtim.load(Ordering::Relaxed);
        stat
    }
}

/// A regular file's contents.
pub struct MemFile {
    meta: Meta,
    data: RwLock<Vec<u8>>,
}

impl MemFile {
    pub fn new(data: impl Into<Vec<u8>>) -> Arc<Self> {
        Arc::new(Self {
            meta: Meta::new(),
            data: RwLock::new(data.into()),
        })
    }

    pub fn contents(&self) -> Vec<u8> {
        self.data.read().clone()
    }

    pub fn len(&self) -> u64 {
        self.data.read().len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }
}

/// A directory: named children, listed in name order.
pub struct MemDir {
    meta: Meta,
    entries: RwLock<BTreeMap<String, Node>>,
}

impl MemDir {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            meta: Meta::new(),
            entries: RwLock::new(BTreeMap::new()),
        })
    }

    /// Add `node` under `name`, replacing any previous entry.
    pub fn insert(&self, name: impl Into<String>, node: Node) {
        self.entries.write().insert(name.into(), node);
    }

    pub fn get(&self, name: &str) -> Option<Node> {
        self.entries.read().get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }
}

#[derive(Clone)]
pub enum Node {
    File(Arc<MemFile>),
    Dir(Arc<MemDir>),
}

impl Node {
    fn meta(&self) -> &Meta {
        match self {
            Node::File(file) => &file.meta,
            Node::Dir(dir) => &dir.meta,
        }
    }

    pub fn ino(&self) -> u64 {
        self.meta().ino
    }

    pub fn filetype(&self) -> Filetype {
        match self {
            Node::File(_) => Filetype::RegularFile,
            Node::Dir(_) => Filetype::Directory,
        }
    }

    pub fn filestat(&self) -> Filestat {
        let size = match self {
            Node::File(file) => file.len(),
            Node::Dir(dir) => dir.entries.read().len() as u64,
        };
        self.meta().filestat(self.filetype(), size)
    }
}

/// Walk `path` from `root`, returning the final node.
fn resolve(root: &Arc<MemDir>, path: &str) -> FdResult<Node> {
    let mut stack = vec![Arc::clone(root)];
    let parts: Vec<&str> = path.split('/').filter(|p| !p.is_empty() && *p != ".").collect();
    for (i, part) in parts.iter().enumerate() {
        if *part == ".." {
            if stack.len() > 1 {
                stack.pop();
            }
            continue;
        }
        let current = stack.last().ok_or(Errno::NOENT)?;
        match current.get(part).ok_or(Errno::NOENT)? {
            Node::Dir(dir) => stack.push(dir),
            file @ Node::File(_) if i + 1 == parts.len() => return Ok(file),
            Node::File(_) => return Err(Errno::NOTDIR),
        }
    }
    stack.pop().map(Node::Dir).ok_or(Errno::NOENT)
}

/// Resolve the directory holding the last component of `path`.
fn resolve_parent(root: &Arc<MemDir>, path: &str) -> FdResult<(Arc<MemDir>, String)> {
    let trimmed = path.trim_end_matches('/');
    let (dir_path, name) = match trimmed.rfind('/') {
        Some(at) => (&trimmed[..at], &trimmed[at + 1..]),
        None => ("", trimmed),
    };
    if name.is_empty() || name == "." || name == ".." {
        return Err(Errno::INVAL);
    }
    match resolve(root, dir_path)? {
        Node::Dir(dir) => Ok((dir, name.to_string())),
        Node::File(_) => Err(Errno::NOTDIR),
    }
}

/// An open regular file with its own position.
pub struct OpenFile {
    file: Arc<MemFile>,
    pos: u64,
    flags: u16,
}

impl OpenFile {
    pub fn new(file: Arc<MemFile>) -> Self {
        Self { file, pos: 0, flags: 0 }
    }

    fn write_at(&self, data: &[u8], offset: u64) -> u32 {
        let mut contents = self.file.data.write();
        let start = offset as usize;
        let end = start + data.len();
        if contents.len() < end {
            contents.resize(end, 0);
        }
        contents[start..end].copy_from_slice(data);
        data.len() as u32
    }

    fn read_at(&self, len: usize, offset: u64) -> Vec<u8> {
        let contents = self.file.data.read();
        let start = (offset as usize).min(contents.len());
        let end = start.saturating_add(len).min(contents.len());
        contents[start..end].to_vec()
    }
}

impl Fd for OpenFile {
    fn fd_allocate(&mut self, offset: u64, len: u64) -> FdResult<()> {
        let want = offset.checked_add(len).ok_or(Errno::INVAL)? as usize;
        let mut contents = self.file.data.write();
        if contents.len() < want {
            contents.resize(want, 0);
        }
        Ok(())
    }

    fn fd_fdstat_get(&self) -> FdResult<Fdstat> {
        Ok(Fdstat::new(Filetype::RegularFile, self.flags))
    }

    fn fd_fdstat_set_flags(&mut self, flags: u16) -> FdResult<()> {
        self.flags = flags;
        Ok(())
    }

    fn fd_filestat_get(&self) -> FdResult<Filestat> {
        Ok(Node::File(Arc::clone(&self.file)).filestat())
    }

    fn fd_filestat_set_size(&mut self, size: u64) -> FdResult<()> {
        self.file.data.write().resize(size as usize, 0);
        Ok(())
    }

    fn fd_filestat_set_times(&mut self, atim: u64, mtim: u64, fst_flags: u16) -> FdResult<()> {
        self.file.meta.set_times(atim, mtim, fst_flags)
    }

    fn fd_pread(&mut self, len: usize, offset: u64) -> FdResult<Vec<u8>> {
        Ok(self.read_at(len, offset))
    }

    fn fd_pwrite(&mut self, data: &[u8], offset: u64) -> FdResult<u32> {
        Ok(self.write_at(data, offset))
    }

    fn fd_read(&mut self, len: usize) -> FdResult<Vec<u8>> {
        let chunk = self.read_at(len, self.pos);
        self.pos += chunk.len() as u64;
        Ok(chunk)
    }

    fn fd_seek(&mut self, offset: i64, whence: Whence) -> FdResult<u64> {
        let base = match whence {
            Whence::Set => 0,
            Whence::Cur => self.pos as i64,
            Whence::End => self.file.len() as i64,
        };
        let pos = base.checked_add(offset).filter(|p| *p >= 0).ok_or(Errno::INVAL)?;
        self.pos = pos as u64;
        Ok(self.pos)
    }

    fn fd_tell(&self) -> FdResult<u64> {
        Ok(self.pos)
    }

    fn fd_write(&mut self, data: &[u8]) -> FdResult<u32> {
        if self.flags & farm_abi::types::FDFLAGS_APPEND != 0 {
            self.pos = self.file.len();
        }
        let n = self.write_at(data, self.pos);
        self.pos += u64::from(n);
        Ok(n)
    }
}

/// An open directory, optionally preopened under a guest-visible name.
pub struct OpenDirectory {
    dir: Arc<MemDir>,
    preopen: Option<String>,
}

impl OpenDirectory {
    pub fn new(dir: Arc<MemDir>) -> Self {
        Self { dir, preopen: None }
    }

    /// A directory the guest finds through `fd_prestat_get` as `name`.
    pub fn preopen(name: impl Into<String>, dir: Arc<MemDir>) -> Self {
        Self {
            dir,
            preopen: Some(name.into()),
        }
    }
}

impl Fd for OpenDirectory {
    fn fd_fdstat_get(&self) -> FdResult<Fdstat> {
        Ok(Fdstat::new(Filetype::Directory, 0))
    }

    fn fd_filestat_get(&self) -> FdResult<Filestat> {
        Ok(Node::Dir(Arc::clone(&self.dir)).filestat())
    }

    fn fd_filestat_set_times(&mut self, atim: u64, mtim: u64, fst_flags: u16) -> FdResult<()> {
        self.dir.meta.set_times(atim, mtim, fst_flags)
    }

    fn fd_prestat_get(&self) -> FdResult<Prestat> {
        match &self.preopen {
            Some(name) => Ok(Prestat::dir(name.as_bytes())),
            None => Err(Errno::BADF),
        }
    }

    fn fd_readdir_single(&self, cookie: u64) -> FdResult<Option<Dirent>> {
        let entries = self.dir.entries.read();
        Ok(entries.iter().nth(cookie as usize).map(|(name, node)| Dirent {
            d_next: cookie + 1,
            d_ino: node.ino(),
            d_type: node.filetype(),
            name: name.as_bytes().to_vec(),
        }))
    }

    fn path_create_directory(&mut self, path: &str) -> FdResult<()> {
        let (parent, name) = resolve_parent(&self.dir, path)?;
        let mut entries = parent.entries.write();
        if entries.contains_key(&name) {
            return Err(Errno::EXIST);
        }
        entries.insert(name, Node::Dir(MemDir::new()));
        Ok(())
    }

    fn path_filestat_get(&self, _flags: u32, path: &str) -> FdResult<Filestat> {
        Ok(resolve(&self.dir, path)?.filestat())
    }

    fn path_filestat_set_times(
        &mut self,
        _flags: u32,
        path: &str,
        atim: u64,
        mtim: u64,
        fst_flags: u16,
    ) -> FdResult<()> {
        resolve(&self.dir, path)?.meta().set_times(atim, mtim, fst_flags)
    }

    fn path_link(&mut self, path: &str, inode: Inode, allow_dir: bool) -> FdResult<()> {
        let node = inode.downcast::<Node>().map_err(|_| Errno::XDEV)?;
        if matches!(*node, Node::Dir(_)) && !allow_dir {
            return Err(Errno::PERM);
        }
        let (parent, name) = resolve_parent(&self.dir, path)?;
        let mut entries = parent.entries.write();
        if entries.contains_key(&name) {
            return Err(Errno::EXIST);
        }
        entries.insert(name, (*node).clone());
        Ok(())
    }

    fn path_lookup(&self, path: &str, _dirflags: u32) -> FdResult<Inode> {
        Ok(Arc::new(resolve(&self.dir, path)?))
    }

    fn path_open(
        &mut self,
        _dirflags: u32,
        path: &str,
        oflags: u16,
        _rights_base: u64,
        _rights_inheriting: u64,
        fdflags: u16,
    ) -> FdResult<Box<dyn Fd>> {
        let node = match resolve(&self.dir, path) {
            Ok(_) if oflags & OFLAGS_CREAT != 0 && oflags & OFLAGS_EXCL != 0 => return Err(Errno::EXIST),
            Ok(node) => node,
            Err(Errno::NOENT) if oflags & OFLAGS_CREAT != 0 => {
                if oflags & OFLAGS_DIRECTORY != 0 {
                    return Err(Errno::INVAL);
                }
                let (parent, name) = resolve_parent(&self.dir, path)?;
                let file = MemFile::new(Vec::new());
                parent.insert(name, Node::File(Arc::clone(&file)));
                Node::File(file)
            }
            Err(errno) => return Err(errno),
        };
        match node {
            Node::Dir(_) if oflags & OFLAGS_TRUNC != 0 => Err(Errno::ISDIR),
            Node::Dir(dir) => Ok(Box::new(OpenDirectory::new(dir))),
            Node::File(_) if oflags & OFLAGS_DIRECTORY != 0 => Err(Errno::NOTDIR),
            Node::File(file) => {
                if oflags & OFLAGS_TRUNC != 0 {
                    file.data.write().clear();
                }
                let mut open = OpenFile::new(file);
                open.flags = fdflags;
                Ok(Box::new(open))
            }
        }
    }

    fn path_readlink(&self, path: &str) -> FdResult<String> {
        resolve(&self.dir, path)?;
        Err(Errno::INVAL)
    }

    fn path_remove_directory(&mut self, path: &str) -> FdResult<()> {
        let (parent, name) = resolve_parent(&self.dir, path)?;
        let mut entries = parent.entries.write();
        match entries.get(&name) {
            None => Err(Errno::NOENT),
            Some(Node::File(_)) => Err(Errno::NOTDIR),
            Some(Node::Dir(dir)) if !dir.entries.read().is_empty() => Err(Errno::NOTEMPTY),
            Some(Node::Dir(_)) => {
                entries.remove(&name);
                Ok(())
            }
        }
    }

    fn path_unlink(&mut self, path: &str) -> FdResult<Inode> {
        let (parent, name) = resolve_parent(&self.dir, path)?;
        let node = parent.entries.write().remove(&name).ok_or(Errno::NOENT)?;
        Ok(Arc::new(node))
    }

    fn path_unlink_file(&mut self, path: &str) -> FdResult<()> {
        let (parent, name) = resolve_parent(&self.dir, path)?;
        let mut entries = parent.entries.write();
        match entries.get(&name) {
            None => Err(Errno::NOENT),
            Some(Node::Dir(_)) => Err(Errno::ISDIR),
            Some(Node::File(_)) => {
                entries.remove(&name);
                Ok(())
            }
        }
    }
}
