//! Per-operation semantics on the Park side of a call channel.

use std::sync::Arc;

use farm_abi::{Errno, FdResult, Whence};
use tracing::{debug, warn};

use super::ParkInner;
use crate::error::FarmError;
use crate::fd::Fd;
use crate::wire::{Reply, Request};

fn path_str(path: &[u8]) -> FdResult<&str> {
    std::str::from_utf8(path).map_err(|_| Errno::INVAL)
}

fn done(result: FdResult<Reply>) -> (Errno, Reply, bool) {
    match result {
        Ok(reply) => (Errno::SUCCESS, reply, false),
        Err(errno) => (errno, Reply::None, false),
    }
}

/// Read into consecutive buffers of `lens`, stopping at the first short read.
fn gather(lens: &[u32], mut read: impl FnMut(usize) -> FdResult<Vec<u8>>) -> FdResult<Reply> {
    let mut data = Vec::new();
    for &len in lens {
        let chunk = read(len as usize)?;
        let short = chunk.len() < len as usize;
        data.extend_from_slice(&chunk);
        if short {
            break;
        }
    }
    Ok(Reply::Read {
        nread: data.len() as u32,
        data,
    })
}

impl ParkInner {
    fn with_fd<T>(&self, fd: u32, f: impl FnOnce(&mut Box<dyn Fd>) -> FdResult<T>) -> FdResult<T> {
        let cell = self.table.get(fd).ok_or(Errno::BADF)?;
        let mut guard = cell.lock();
        f(&mut guard)
    }

    /// Register `ref_id` for close notifications on `fds`.
    pub(crate) fn set_fds_map(&self, ref_id: u32, fds: &[u32]) -> Errno {
        let rejected = self.table.subscribe(ref_id, fds);
        if rejected.is_empty() {
            debug!(ref_id, ?fds, "ref subscribed");
            Errno::SUCCESS
        } else {
            warn!(ref_id, ?rejected, "subscription outside the slot table");
            Errno::BADF
        }
    }

    /// Run one request against the table. The flag reports that the
    /// descriptor was closed and its listener should retire.
    pub(crate) fn dispatch(self: &Arc<Self>, request: Request) -> Result<(Errno, Reply, bool), FarmError> {
        Ok(match request {
            Request::SetFdsMap { .. } => (Errno::INVAL, Reply::None, false),
            Request::FdAdvise { fd } => done(self.with_fd(fd, |_| Ok(Reply::None))),
            Request::FdAllocate { fd, offset, len } => {
                done(self.with_fd(fd, |f| f.fd_allocate(offset, len).map(|()| Reply::None)))
            }
            Request::FdClose { fd } => return self.close(fd),
            Request::FdDatasync { fd } | Request::FdSync { fd } => {
                done(self.with_fd(fd, |f| f.fd_sync().map(|()| Reply::None)))
            }
            Request::FdFdstatGet { fd } => done(self.with_fd(fd, |f| f.fd_fdstat_get().map(Reply::Fdstat))),
            Request::FdFdstatSetFlags { fd, flags } => {
                done(self.with_fd(fd, |f| f.fd_fdstat_set_flags(flags).map(|()| Reply::None)))
            }
            Request::FdFdstatSetRights {
                fd,
                rights_base,
                rights_inheriting,
            } => done(self.with_fd(fd, |f| {
                f.fd_fdstat_set_rights(rights_base, rights_inheriting)
                    .map(|()| Reply::None)
            })),
            Request::FdFilestatGet { fd } => {
                done(self.with_fd(fd, |f| f.fd_filestat_get().map(Reply::Filestat)))
            }
            Request::FdFilestatSetSize { fd, size } => {
                done(self.with_fd(fd, |f| f.fd_filestat_set_size(size).map(|()| Reply::None)))
            }
            Request::FdFilestatSetTimes {
                fd,
                atim,
                mtim,
                fst_flags,
            } => done(self.with_fd(fd, |f| {
                f.fd_filestat_set_times(atim, mtim, fst_flags).map(|()| Reply::None)
            })),
            Request::FdPread {
                fd,
                iovec_lens,
                offset,
            } => done(self.with_fd(fd, |f| {
                let mut at = offset;
                gather(&iovec_lens, |len| {
                    let chunk = f.fd_pread(len, at)?;
                    at += chunk.len() as u64;
                    Ok(chunk)
                })
            })),
            Request::FdPrestatGet { fd } => done(self.with_fd(fd, |f| f.fd_prestat_get().map(Reply::Prestat))),
            Request::FdPrestatDirName { fd, path_len } => match self.with_fd(fd, |f| f.fd_prestat_get()) {
                Ok(prestat) => {
                    let mut name = prestat.pr_name;
                    if name.len() > path_len as usize {
                        name.truncate(path_len as usize);
                        (Errno::NAMETOOLONG, Reply::Bytes(name), false)
                    } else {
                        (Errno::SUCCESS, Reply::Bytes(name), false)
                    }
                }
                Err(errno) => (errno, Reply::None, false),
            },
            Request::FdPwrite { fd, data, offset } => {
                done(self.with_fd(fd, |f| f.fd_pwrite(&data, offset).map(Reply::Written)))
            }
            Request::FdRead { fd, iovec_lens } => {
                done(self.with_fd(fd, |f| gather(&iovec_lens, |len| f.fd_read(len))))
            }
            Request::FdReaddir { fd, buf_len, cookie } => done(self.with_fd(fd, |f| {
                let limit = buf_len as usize;
                let mut buf = Vec::new();
                let mut cookie = cookie;
                while buf.len() < limit {
                    let Some(dirent) = f.fd_readdir_single(cookie)? else {
                        break;
                    };
                    buf.extend_from_slice(&dirent.head_bytes());
                    buf.extend_from_slice(&dirent.name);
                    cookie = dirent.d_next;
                }
                buf.truncate(limit);
                Ok(Reply::Readdir {
                    buf_used: buf.len() as u32,
                    buf,
                })
            })),
            Request::FdSeek { fd, offset, whence } => done(self.with_fd(fd, |f| {
                let whence = Whence::from_raw(whence).ok_or(Errno::INVAL)?;
                f.fd_seek(offset, whence).map(Reply::Offset)
            })),
            Request::FdTell { fd } => done(self.with_fd(fd, |f| f.fd_tell().map(Reply::Offset))),
            Request::FdWrite { fd, data } => done(self.with_fd(fd, |f| f.fd_write(&data).map(Reply::Written))),
            Request::PathCreateDirectory { fd, path } => done(self.with_fd(fd, |f| {
                f.path_create_directory(path_str(&path)?).map(|()| Reply::None)
            })),
            Request::PathFilestatGet { fd, flags, path } => done(self.with_fd(fd, |f| {
                f.path_filestat_get(flags, path_str(&path)?).map(Reply::Filestat)
            })),
            Request::PathFilestatSetTimes {
                fd,
                flags,
                path,
                atim,
                mtim,
                fst_flags,
            } => done(self.with_fd(fd, |f| {
                f.path_filestat_set_times(flags, path_str(&path)?, atim, mtim, fst_flags)
                    .map(|()| Reply::None)
            })),
            Request::PathLink {
                old_fd,
                old_flags,
                old_path,
                new_fd,
                new_path,
            } => done(self.link(old_fd, old_flags, &old_path, new_fd, &new_path)),
            Request::PathOpen {
                fd,
                dirflags,
                path,
                oflags,
                rights_base,
                rights_inheriting,
                fdflags,
            } => {
                let opened = self.with_fd(fd, |f| {
                    f.path_open(
                        dirflags,
                        path_str(&path)?,
                        oflags,
                        rights_base,
                        rights_inheriting,
                        fdflags,
                    )
                });
                match opened.and_then(|new_fd| self.install(new_fd)) {
                    Ok(index) => (Errno::SUCCESS, Reply::Opened(index), false),
                    Err(errno) => (errno, Reply::None, false),
                }
            }
            Request::PathReadlink { fd, path, buf_len } => {
                let target = self.with_fd(fd, |f| f.path_readlink(path_str(&path)?));
                match target {
                    Ok(target) => {
                        let mut target = target.into_bytes();
                        if target.len() > buf_len as usize {
                            target.truncate(buf_len as usize);
                            (Errno::OVERFLOW, Reply::Bytes(target), false)
                        } else {
                            (Errno::SUCCESS, Reply::Bytes(target), false)
                        }
                    }
                    Err(errno) => (errno, Reply::None, false),
                }
            }
            Request::PathRemoveDirectory { fd, path } => done(self.with_fd(fd, |f| {
                f.path_remove_directory(path_str(&path)?).map(|()| Reply::None)
            })),
            Request::PathRename {
                old_fd,
                old_path,
                new_fd,
                new_path,
            } => done(self.rename(old_fd, &old_path, new_fd, &new_path)),
            Request::PathSymlink { fd, .. } => {
                let errno = if self.table.get(fd).is_some() {
                    Errno::NOTSUP
                } else {
                    Errno::BADF
                };
                (errno, Reply::None, false)
            }
            Request::PathUnlinkFile { fd, path } => done(self.with_fd(fd, |f| {
                f.path_unlink_file(path_str(&path)?).map(|()| Reply::None)
            })),
        })
    }

    /// Close `fd` after queueing its close notification. When the channel
    /// has no room the descriptor stays open and the call faults.
    fn close(&self, fd: u32) -> Result<(Errno, Reply, bool), FarmError> {
        if self.table.get(fd).is_none() {
            return Ok((Errno::BADF, Reply::None, false));
        }
        let targets = self.table.take_subscribers(fd);
        if !targets.is_empty() {
            if let Err(e) = self.region.close_channel().send(&targets, fd) {
                for &id in &targets {
                    self.table.subscribe(id, &[fd]);
                }
                warn!(fd, ?targets, error = %e, "close refused; subscribers cannot be notified");
                return Err(e);
            }
        }
        let Some(cell) = self.table.take(fd) else {
            return Ok((Errno::BADF, Reply::None, false));
        };
        let errno = Errno::of(&cell.lock().fd_close());
        debug!(fd, %errno, "descriptor closed");
        Ok((errno, Reply::None, true))
    }

    fn link(&self, old_fd: u32, old_flags: u32, old_path: &[u8], new_fd: u32, new_path: &[u8]) -> FdResult<Reply> {
        let old_path = path_str(old_path)?;
        let new_path = path_str(new_path)?;
        let inode = self.with_fd(old_fd, |f| f.path_lookup(old_path, old_flags))?;
        self.with_fd(new_fd, |f| f.path_link(new_path, inode, false))?;
        Ok(Reply::None)
    }

    fn rename(&self, old_fd: u32, old_path: &[u8], new_fd: u32, new_path: &[u8]) -> FdResult<Reply> {
        let old_path = path_str(old_path)?;
        let new_path = path_str(new_path)?;
        if self.table.get(new_fd).is_none() {
            return Err(Errno::BADF);
        }
        let inode = self.with_fd(old_fd, |f| f.path_unlink(old_path))?;
        let linked = self.with_fd(new_fd, |f| f.path_link(new_path, inode.clone(), true));
        if let Err(errno) = linked {
            if let Err(relink) = self.with_fd(old_fd, |f| f.path_link(old_path, inode, true)) {
                warn!(old_fd, old_path, %relink, "rename failed and the source could not be restored");
            }
            return Err(errno);
        }
        Ok(Reply::None)
    }
}
