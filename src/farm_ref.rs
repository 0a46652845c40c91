//! The Ref: client side of a farm's call channels.
//!
//! Every method takes the slot lock of its descriptor (both locks, lower
//! index first, for link and rename), encodes the request into the slot's
//! record, flips the call word to pending and waits for the Park to flip it
//! back. The outer `Result` is the protocol outcome; the inner
//! [`FdResult`] is what the Park's descriptor returned.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use farm_abi::layout::{
    CALL_IDLE, CALL_PENDING, CALL_SHUTDOWN, ERRNO_PARK_FAULT, ERRNO_UNSET, SLOT_LISTENING,
};
use farm_abi::{layout_fingerprint, Errno, FdResult, Fdstat, Filestat, Prestat};
use tracing::{trace, warn};

use crate::error::FarmError;
use crate::farm::FarmRefHandle;
use crate::region::Slot;
use crate::sync::lock::{self, Deadline};
use crate::sync::WaitResult;
use crate::wire::{Reply, Request};

/// A connection to one farm, identified by a ref id for close notifications.
pub struct FarmRef {
    handle: FarmRefHandle,
    id: u32,
    timeout: Option<Duration>,
    broken: AtomicBool,
}

type Answer = (Errno, Reply);

impl FarmRef {
    /// Connect to the farm behind `handle`, taking a fresh ref id.
    pub fn connect(handle: &FarmRefHandle) -> Result<Self, FarmError> {
        let local = layout_fingerprint();
        if handle.fingerprint != local {
            return Err(FarmError::LayoutMismatch {
                park: handle.fingerprint.to_hex(),
                local: local.to_hex(),
            });
        }
        let id = handle.region.issue_ref_id();
        trace!(ref_id = id, "ref connected");
        Ok(Self {
            timeout: handle.region.config().call_timeout(),
            handle: handle.clone(),
            id,
            broken: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn handle(&self) -> &FarmRefHandle {
        &self.handle
    }

    /// Whether a timed-out call has abandoned this ref.
    pub fn is_broken(&self) -> bool {
        self.broken.load(Ordering::Acquire)
    }

    /// Send one request and wait for the Park's answer.
    pub fn call(&self, request: &Request) -> Result<Answer, FarmError> {
        if self.is_broken() {
            return Err(FarmError::ChannelBroken);
        }
        let fd = request.fd();
        let region = &self.handle.region;
        let Some(slot) = region.slot(fd) else {
            return Ok((Errno::BADF, Reply::None));
        };
        let deadline = Deadline::after(self.timeout);
        match request.second_fd().filter(|&other| other != fd) {
            None => {
                lock::acquire_within(&slot.lock, deadline).map_err(|_| FarmError::CallTimedOut { fd })?;
                let result = self.exchange(slot, request, None, deadline);
                if !matches!(result, Err(FarmError::CallTimedOut { .. })) {
                    lock::release(&slot.lock, "slot");
                }
                result
            }
            Some(other) => {
                let Some(other_slot) = region.slot(other) else {
                    return Ok((Errno::BADF, Reply::None));
                };
                let (lower, higher) = if fd < other { (slot, other_slot) } else { (other_slot, slot) };
                lock::acquire_pair(&lower.lock, &higher.lock, deadline)
                    .map_err(|_| FarmError::CallTimedOut { fd })?;
                let result = self.exchange(slot, request, Some(other), deadline);
                if !matches!(result, Err(FarmError::CallTimedOut { .. })) {
                    lock::release_pair(&lower.lock, &higher.lock);
                }
                result
            }
        }
    }

    /// Suspending variant of [`call`](Self::call). Waits without a deadline.
    pub async fn call_async(&self, request: &Request) -> Result<Answer, FarmError> {
        if self.is_broken() {
            return Err(FarmError::ChannelBroken);
        }
        let fd = request.fd();
        let region = &self.handle.region;
        let Some(slot) = region.slot(fd) else {
            return Ok((Errno::BADF, Reply::None));
        };
        let pair = match request.second_fd().filter(|&other| other != fd) {
            None => None,
            Some(other) => match region.slot(other) {
                Some(other_slot) if fd < other => Some((slot, other_slot)),
                Some(other_slot) => Some((other_slot, slot)),
                None => return Ok((Errno::BADF, Reply::None)),
            },
        };
        match pair {
            None => lock::acquire_async(&slot.lock).await,
            Some((lower, higher)) => lock::acquire_pair_async(&lower.lock, &higher.lock).await,
        }
        let result = match self.submit(slot, request) {
            Ok(true) => {
                while slot.call.load() == CALL_PENDING {
                    slot.call.wait_async(CALL_PENDING).await;
                }
                self.collect(slot, fd)
            }
            Ok(false) => Ok((Errno::BADF, Reply::None)),
            Err(e) => Err(e),
        };
        match pair {
            None => lock::release(&slot.lock, "slot"),
            Some((lower, higher)) => lock::release_pair(&lower.lock, &higher.lock),
        }
        result
    }

    /// One request/reply round trip on a slot whose lock is held, together
    /// with the lock of `partner` for two-descriptor calls.
    ///
    /// On timeout the call and the held locks are handed to the listener,
    /// which frees the reply and releases them once the Park answers.
    fn exchange(
        &self,
        slot: &Slot,
        request: &Request,
        partner: Option<u32>,
        deadline: Deadline,
    ) -> Result<Answer, FarmError> {
        let fd = request.fd();
        if !self.submit(slot, request)? {
            return Ok((Errno::BADF, Reply::None));
        }
        while slot.call.load() == CALL_PENDING {
            if slot.call.wait(CALL_PENDING, deadline.remaining()) == WaitResult::TimedOut
                && slot.abandon(partner)
            {
                self.broken.store(true, Ordering::Release);
                warn!(ref_id = self.id, fd, func = request.func().name(), "call timed out; abandoning ref");
                return Err(FarmError::CallTimedOut { fd });
            }
        }
        self.collect(slot, fd)
    }

    /// Encode `request` and hand it to the listener. `false` means the slot
    /// is not being served.
    fn submit(&self, slot: &Slot, request: &Request) -> Result<bool, FarmError> {
        if slot.state() != SLOT_LISTENING {
            return Ok(false);
        }
        let arena = self.handle.region.arena();
        let record = slot.record();
        record.clear();
        request.encode(&record, arena)?;
        match slot.call.compare_exchange(CALL_IDLE, CALL_PENDING) {
            Ok(_) => {
                trace!(ref_id = self.id, fd = request.fd(), func = request.func().name(), "call");
                slot.call.wake(u32::MAX);
                Ok(true)
            }
            Err(word) => {
                // Nobody will decode the request; drop its payloads.
                let _ = Request::decode(&record, arena);
                if word == CALL_SHUTDOWN {
                    Ok(false)
                } else {
                    Err(FarmError::Protocol(format!(
                        "call word {word} on descriptor {} while holding its lock",
                        request.fd()
                    )))
                }
            }
        }
    }

    fn collect(&self, slot: &Slot, fd: u32) -> Result<Answer, FarmError> {
        let record = slot.record();
        let errno = record.errno_raw();
        let reply = Reply::decode(&record, self.handle.region.arena())?;
        match errno {
            ERRNO_PARK_FAULT => Err(FarmError::ParkFault { fd }),
            ERRNO_UNSET => Err(FarmError::Protocol(format!("descriptor {fd} answered without an errno"))),
            raw => u16::try_from(raw)
                .map(|raw| (Errno::from_raw(raw), reply))
                .map_err(|_| FarmError::Protocol(format!("errno {raw} out of range"))),
        }
    }

    /// Register for close notifications on `fds`.
    pub fn set_park_fds_map(&self, fds: &[u32]) -> Result<FdResult<()>, FarmError> {
        if self.is_broken() {
            return Err(FarmError::ChannelBroken);
        }
        let base = self.handle.region.base();
        let deadline = Deadline::after(self.timeout);
        lock::acquire_within(&base.lock, deadline).map_err(|_| FarmError::CallTimedOut { fd: u32::MAX })?;
        let request = Request::SetFdsMap {
            ref_id: self.id,
            fds: fds.to_vec(),
        };
        let result = self.exchange(base, &request, None, deadline);
        if !matches!(result, Err(FarmError::CallTimedOut { .. })) {
            lock::release(&base.lock, "base");
        }
        let (errno, _) = result?;
        Ok(errno.into_result())
    }

    /// Descriptors closed since the last call, if any notification is queued.
    pub fn closed_fds(&self) -> Option<Vec<u32>> {
        self.handle.region.close_channel().get(self.id)
    }

    /// Queue a close notification for `fd` to the given ref ids.
    pub fn send_close(&self, targets: &[u32], fd: u32) -> Result<(), FarmError> {
        self.handle.region.close_channel().send(targets, fd)
    }

    fn answer<T>(&self, request: Request, pick: impl FnOnce(Reply) -> Option<T>) -> Result<FdResult<T>, FarmError> {
        let func = request.func();
        let (errno, reply) = self.call(&request)?;
        if !errno.is_success() {
            return Ok(Err(errno));
        }
        pick(reply)
            .map(Ok)
            .ok_or_else(|| FarmError::Protocol(format!("unexpected reply shape for {}", func.name())))
    }

    fn unit(&self, request: Request) -> Result<FdResult<()>, FarmError> {
        self.answer(request, |_| Some(()))
    }

    /// Byte replies that carry a truncated value alongside the errno.
    fn bytes_with_errno(&self, request: Request) -> Result<(Vec<u8>, Errno), FarmError> {
        let (errno, reply) = self.call(&request)?;
        match reply {
            Reply::Bytes(bytes) => Ok((bytes, errno)),
            _ => Ok((Vec::new(), errno)),
        }
    }

    pub fn fd_advise(&self, fd: u32) -> Result<FdResult<()>, FarmError> {
        self.unit(Request::FdAdvise { fd })
    }

    pub fn fd_allocate(&self, fd: u32, offset: u64, len: u64) -> Result<FdResult<()>, FarmError> {
        self.unit(Request::FdAllocate { fd, offset, len })
    }

    pub fn fd_close(&self, fd: u32) -> Result<FdResult<()>, FarmError> {
        self.unit(Request::FdClose { fd })
    }

    pub fn fd_datasync(&self, fd: u32) -> Result<FdResult<()>, FarmError> {
        self.unit(Request::FdDatasync { fd })
    }

    pub fn fd_fdstat_get(&self, fd: u32) -> Result<FdResult<Fdstat>, FarmError> {
        self.answer(Request::FdFdstatGet { fd }, |r| match r {
            Reply::Fdstat(stat) => Some(stat),
            _ => None,
        })
    }

    pub fn fd_fdstat_set_flags(&self, fd: u32, flags: u16) -> Result<FdResult<()>, FarmError> {
        self.unit(Request::FdFdstatSetFlags { fd, flags })
    }

    pub fn fd_fdstat_set_rights(
        &self,
        fd: u32,
        rights_base: u64,
        rights_inheriting: u64,
    ) -> Result<FdResult<()>, FarmError> {
        self.unit(Request::FdFdstatSetRights {
            fd,
            rights_base,
            rights_inheriting,
        })
    }

    pub fn fd_filestat_get(&self, fd: u32) -> Result<FdResult<Filestat>, FarmError> {
        self.answer(Request::FdFilestatGet { fd }, |r| match r {
            Reply::Filestat(stat) => Some(stat),
            _ => None,
        })
    }

    pub fn fd_filestat_set_size(&self, fd: u32, size: u64) -> Result<FdResult<()>, FarmError> {
        self.unit(Request::FdFilestatSetSize { fd, size })
    }

    pub fn fd_filestat_set_times(
        &self,
        fd: u32,
        atim: u64,
        mtim: u64,
        fst_flags: u16,
    ) -> Result<FdResult<()>, FarmError> {
        self.unit(Request::FdFilestatSetTimes {
            fd,
            atim,
            mtim,
            fst_flags,
        })
    }

    /// Read into buffers of `iovec_lens` at `offset`. Returns the bytes read.
    pub fn fd_pread(&self, fd: u32, iovec_lens: &[u32], offset: u64) -> Result<FdResult<Vec<u8>>, FarmError> {
        self.answer(
            Request::FdPread {
                fd,
                iovec_lens: iovec_lens.to_vec(),
                offset,
            },
            read_data,
        )
    }

    pub fn fd_prestat_get(&self, fd: u32) -> Result<FdResult<Prestat>, FarmError> {
        self.answer(Request::FdPrestatGet { fd }, |r| match r {
            Reply::Prestat(prestat) => Some(prestat),
            _ => None,
        })
    }

    /// The preopen name, truncated to `path_len` with NAMETOOLONG.
    pub fn fd_prestat_dir_name(&self, fd: u32, path_len: u32) -> Result<(Vec<u8>, Errno), FarmError> {
        self.bytes_with_errno(Request::FdPrestatDirName { fd, path_len })
    }

    pub fn fd_pwrite(&self, fd: u32, data: &[u8], offset: u64) -> Result<FdResult<u32>, FarmError> {
        self.answer(
            Request::FdPwrite {
                fd,
                data: data.to_vec(),
                offset,
            },
            written,
        )
    }

    pub fn fd_read(&self, fd: u32, iovec_lens: &[u32]) -> Result<FdResult<Vec<u8>>, FarmError> {
        self.answer(
            Request::FdRead {
                fd,
                iovec_lens: iovec_lens.to_vec(),
            },
            read_data,
        )
    }

    /// Packed dirents starting at `cookie`, at most `buf_len` bytes.
    pub fn fd_readdir(&self, fd: u32, buf_len: u32, cookie: u64) -> Result<FdResult<(Vec<u8>, u32)>, FarmError> {
        self.answer(Request::FdReaddir { fd, buf_len, cookie }, |r| match r {
            Reply::Readdir { buf, buf_used } => Some((buf, buf_used)),
            _ => None,
        })
    }

    pub fn fd_seek(&self, fd: u32, offset: i64, whence: u32) -> Result<FdResult<u64>, FarmError> {
        self.answer(Request::FdSeek { fd, offset, whence }, offset_of)
    }

    pub fn fd_sync(&self, fd: u32) -> Result<FdResult<()>, FarmError> {
        self.unit(Request::FdSync { fd })
    }

    pub fn fd_tell(&self, fd: u32) -> Result<FdResult<u64>, FarmError> {
        self.answer(Request::FdTell { fd }, offset_of)
    }

    pub fn fd_write(&self, fd: u32, data: &[u8]) -> Result<FdResult<u32>, FarmError> {
        self.answer(
            Request::FdWrite {
                fd,
                data: data.to_vec(),
            },
            written,
        )
    }

    pub fn path_create_directory(&self, fd: u32, path: &[u8]) -> Result<FdResult<()>, FarmError> {
        self.unit(Request::PathCreateDirectory {
            fd,
            path: path.to_vec(),
        })
    }

    pub fn path_filestat_get(&self, fd: u32, flags: u32, path: &[u8]) -> Result<FdResult<Filestat>, FarmError> {
        self.answer(
            Request::PathFilestatGet {
                fd,
                flags,
                path: path.to_vec(),
            },
            |r| match r {
                Reply::Filestat(stat) => Some(stat),
                _ => None,
            },
        )
    }

    pub fn path_filestat_set_times(
        &self,
        fd: u32,
        flags: u32,
        path: &[u8],
        atim: u64,
        mtim: u64,
        fst_flags: u16,
    ) -> Result<FdResult<()>, FarmError> {
        self.unit(Request::PathFilestatSetTimes {
            fd,
            flags,
            path: path.to_vec(),
            atim,
            mtim,
            fst_flags,
        })
    }

    pub fn path_link(
        &self,
        old_fd: u32,
        old_flags: u32,
        old_path: &[u8],
        new_fd: u32,
        new_path: &[u8],
    ) -> Result<FdResult<()>, FarmError> {
        self.unit(Request::PathLink {
            old_fd,
            old_flags,
            old_path: old_path.to_vec(),
            new_fd,
            new_path: new_path.to_vec(),
        })
    }

    /// Open `path` relative to `fd`. Returns the Park's new descriptor.
    #[allow(clippy::too_many_arguments)]
    pub fn path_open(
        &self,
        fd: u32,
        dirflags: u32,
        path: &[u8],
        oflags: u16,
        rights_base: u64,
        rights_inheriting: u64,
        fdflags: u16,
    ) -> Result<FdResult<u32>, FarmError> {
        self.answer(
            Request::PathOpen {
                fd,
                dirflags,
                path: path.to_vec(),
                oflags,
                rights_base,
                rights_inheriting,
                fdflags,
            },
            |r| match r {
                Reply::Opened(fd) => Some(fd),
                _ => None,
            },
        )
    }

    /// The link target, truncated to `buf_len` with OVERFLOW.
    pub fn path_readlink(&self, fd: u32, path: &[u8], buf_len: u32) -> Result<(Vec<u8>, Errno), FarmError> {
        self.bytes_with_errno(Request::PathReadlink {
            fd,
            path: path.to_vec(),
            buf_len,
        })
    }

    pub fn path_remove_directory(&self, fd: u32, path: &[u8]) -> Result<FdResult<()>, FarmError> {
        self.unit(Request::PathRemoveDirectory {
            fd,
            path: path.to_vec(),
        })
    }

    pub fn path_rename(
        &self,
        old_fd: u32,
        old_path: &[u8],
        new_fd: u32,
        new_path: &[u8],
    ) -> Result<FdResult<()>, FarmError> {
        self.unit(Request::PathRename {
            old_fd,
            old_path: old_path.to_vec(),
            new_fd,
            new_path: new_path.to_vec(),
        })
    }

    pub fn path_symlink(&self, old_path: &[u8], fd: u32, new_path: &[u8]) -> Result<FdResult<()>, FarmError> {
        self.unit(Request::PathSymlink {
            old_path: old_path.to_vec(),
            fd,
            new_path: new_path.to_vec(),
        })
    }

    pub fn path_unlink_file(&self, fd: u32, path: &[u8]) -> Result<FdResult<()>, FarmError> {
        self.unit(Request::PathUnlinkFile {
            fd,
            path: path.to_vec(),
        })
    }
}

fn read_data(reply: Reply) -> Option<Vec<u8>> {
    match reply {
        Reply::Read { data, .. } => Some(data),
        _ => None,
    }
}

fn written(reply: Reply) -> Option<u32> {
    match reply {
        Reply::Written(n) => Some(n),
        _ => None,
    }
}

fn offset_of(reply: Reply) -> Option<u64> {
    match reply {
        Reply::Offset(offset) => Some(offset),
        _ => None,
    }
}

impl std::fmt::Debug for FarmRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FarmRef")
            .field("id", &self.id)
            .field("broken", &self.is_broken())
            .finish()
    }
}
