//! `wasi_snapshot_preview1` host functions.
//!
//! Descriptor-level failures come back to the guest as errno values. A
//! guest pointer that falls outside its memory is `FAULT`. Protocol
//! failures from the farm trap the guest.

use std::time::{Instant, SystemTime, UNIX_EPOCH};

use farm_abi::types::{CLOCKID_MONOTONIC, CLOCKID_REALTIME};
use farm_abi::Errno;
use thiserror::Error;
use tracing::{debug, trace};
use wasmtime::{Caller, Linker};

use super::imports::WASI_MODULE;
use super::memory::{Ctx, MemoryError};
use crate::animal::Animal;
use crate::error::FarmError;

/// Clock resolution reported to the guest, in nanoseconds.
const CLOCK_RESOLUTION_NS: u64 = 1_000;

/// Store data for a guest instance.
pub struct GuestState {
    pub animal: Animal,
    started: Instant,
}

impl GuestState {
    pub fn new(animal: Animal) -> Self {
        Self {
            animal,
            started: Instant::now(),
        }
    }
}

/// Raised by `proc_exit` to unwind out of the guest.
#[derive(Debug, Error)]
#[error("guest exited with code {0}")]
pub struct ProcExit(pub i32);

enum CallError {
    Memory(MemoryError),
    Farm(FarmError),
}

impl From<MemoryError> for CallError {
    fn from(e: MemoryError) -> Self {
        CallError::Memory(e)
    }
}

impl From<FarmError> for CallError {
    fn from(e: FarmError) -> Self {
        CallError::Farm(e)
    }
}

type Call = Result<Errno, CallError>;
type G<'a> = Ctx<'a, GuestState>;

fn finish(name: &str, result: Call) -> anyhow::Result<i32> {
    match result {
        Ok(errno) => {
            trace!(call = name, %errno, "wasi");
            Ok(i32::from(errno.raw()))
        }
        Err(CallError::Memory(e)) => {
            debug!(call = name, error = %e, "guest memory fault");
            Ok(i32::from(Errno::FAULT.raw()))
        }
        Err(CallError::Farm(e)) => Err(anyhow::Error::new(e).context(format!("wasi call {name}"))),
    }
}

/// Unwrap a descriptor result, returning its errno to the guest on failure.
macro_rules! fd_try {
    ($e:expr) => {
        match $e? {
            Ok(value) => value,
            Err(errno) => return Ok(errno),
        }
    };
}

/// Register one host function returning an errno.
macro_rules! wasi {
    ($linker:ident, $name:literal, |$ctx:ident $(, $arg:ident : $ty:ty)*| $body:expr) => {
        $linker.func_wrap(
            WASI_MODULE,
            $name,
            |caller: Caller<'_, GuestState>, $($arg: $ty),*| -> anyhow::Result<i32> {
                let mut $ctx = Ctx::new(caller);
                let result = (|| -> Call { $body })();
                finish($name, result)
            },
        )?;
    };
}

/// Add every supported `wasi_snapshot_preview1` function to `linker`.
pub fn add_to_linker(linker: &mut Linker<GuestState>) -> anyhow::Result<()> {
    wasi!(linker, "args_get", |ctx, argv: i32, argv_buf: i32| {
        let args = ctx.data().animal.args().to_vec();
        write_strings(&mut ctx, &args, argv as u32, argv_buf as u32)
    });
    wasi!(linker, "args_sizes_get", |ctx, argc: i32, argv_buf_size: i32| {
        let args = ctx.data().animal.args().to_vec();
        write_sizes(&mut ctx, &args, argc as u32, argv_buf_size as u32)
    });
    wasi!(linker, "environ_get", |ctx, environ: i32, environ_buf: i32| {
        let env = ctx.data().animal.env().to_vec();
        write_strings(&mut ctx, &env, environ as u32, environ_buf as u32)
    });
    wasi!(linker, "environ_sizes_get", |ctx, count: i32, buf_size: i32| {
        let env = ctx.data().animal.env().to_vec();
        write_sizes(&mut ctx, &env, count as u32, buf_size as u32)
    });
    wasi!(linker, "clock_res_get", |ctx, id: i32, res_ptr: i32| {
        match id as u32 {
            CLOCKID_REALTIME | CLOCKID_MONOTONIC => {
                ctx.write_u64(res_ptr as u32, CLOCK_RESOLUTION_NS)?;
                Ok(Errno::SUCCESS)
            }
            _ => Ok(Errno::INVAL),
        }
    });
    wasi!(linker, "clock_time_get", |ctx, id: i32, _precision: i64, time_ptr: i32| {
        let now = match id as u32 {
            CLOCKID_REALTIME => SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_nanos() as u64)
                .unwrap_or(0),
            CLOCKID_MONOTONIC => ctx.data().started.elapsed().as_nanos() as u64,
            _ => return Ok(Errno::INVAL),
        };
        ctx.write_u64(time_ptr as u32, now)?;
        Ok(Errno::SUCCESS)
    });

    wasi!(linker, "fd_advise", |ctx, fd: i32, _offset: i64, _len: i64, _advice: i32| {
        fd_try!(ctx.data_mut().animal.fd_advise(fd as u32));
        Ok(Errno::SUCCESS)
    });
    wasi!(linker, "fd_allocate", |ctx, fd: i32, offset: i64, len: i64| {
        fd_try!(ctx.data_mut().animal.fd_allocate(fd as u32, offset as u64, len as u64));
        Ok(Errno::SUCCESS)
    });
    wasi!(linker, "fd_close", |ctx, fd: i32| {
        fd_try!(ctx.data_mut().animal.fd_close(fd as u32));
        Ok(Errno::SUCCESS)
    });
    wasi!(linker, "fd_datasync", |ctx, fd: i32| {
        fd_try!(ctx.data_mut().animal.fd_datasync(fd as u32));
        Ok(Errno::SUCCESS)
    });
    wasi!(linker, "fd_fdstat_get", |ctx, fd: i32, buf: i32| {
        let stat = fd_try!(ctx.data_mut().animal.fd_fdstat_get(fd as u32));
        ctx.write_bytes(buf as u32, &stat.to_bytes())?;
        Ok(Errno::SUCCESS)
    });
    wasi!(linker, "fd_fdstat_set_flags", |ctx, fd: i32, flags: i32| {
        fd_try!(ctx.data_mut().animal.fd_fdstat_set_flags(fd as u32, flags as u16));
        Ok(Errno::SUCCESS)
    });
    wasi!(linker, "fd_fdstat_set_rights", |ctx, fd: i32, base: i64, inheriting: i64| {
        fd_try!(ctx
            .data_mut()
            .animal
            .fd_fdstat_set_rights(fd as u32, base as u64, inheriting as u64));
        Ok(Errno::SUCCESS)
    });
    wasi!(linker, "fd_filestat_get", |ctx, fd: i32, buf: i32| {
        let stat = fd_try!(ctx.data_mut().animal.fd_filestat_get(fd as u32));
        ctx.write_bytes(buf as u32, &stat.to_bytes())?;
        Ok(Errno::SUCCESS)
    });
    wasi!(linker, "fd_filestat_set_size", |ctx, fd: i32, size: i64| {
        fd_try!(ctx.data_mut().animal.fd_filestat_set_size(fd as u32, size as u64));
        Ok(Errno::SUCCESS)
    });
    wasi!(linker, "fd_filestat_set_times", |ctx, fd: i32, atim: i64, mtim: i64, fst_flags: i32| {
        fd_try!(ctx
            .data_mut()
            .animal
            .fd_filestat_set_times(fd as u32, atim as u64, mtim as u64, fst_flags as u16));
        Ok(Errno::SUCCESS)
    });
    wasi!(linker, "fd_pread", |ctx, fd: i32, iovs: i32, iovs_len: i32, offset: i64, nread: i32| {
        let iovecs = ctx.read_iovecs(iovs as u32, iovs_len as u32)?;
        let lens: Vec<u32> = iovecs.iter().map(|(_, len)| *len).collect();
        let data = fd_try!(ctx.data_mut().animal.fd_pread(fd as u32, &lens, offset as u64));
        ctx.scatter(&iovecs, &data)?;
        ctx.write_u32(nread as u32, data.len() as u32)?;
        Ok(Errno::SUCCESS)
    });
    wasi!(linker, "fd_prestat_get", |ctx, fd: i32, buf: i32| {
        let prestat = fd_try!(ctx.data_mut().animal.fd_prestat_get(fd as u32));
        ctx.write_bytes(buf as u32, &prestat.to_bytes())?;
        Ok(Errno::SUCCESS)
    });
    wasi!(linker, "fd_prestat_dir_name", |ctx, fd: i32, path: i32, path_len: i32| {
        let (name, errno) = ctx
            .data_mut()
            .animal
            .fd_prestat_dir_name(fd as u32, path_len as u32)?;
        ctx.write_bytes(path as u32, &name)?;
        Ok(errno)
    });
    wasi!(linker, "fd_pwrite", |ctx, fd: i32, iovs: i32, iovs_len: i32, offset: i64, nwritten: i32| {
        let data = ctx.gather(iovs as u32, iovs_len as u32)?;
        let n = fd_try!(ctx.data_mut().animal.fd_pwrite(fd as u32, &data, offset as u64));
        ctx.write_u32(nwritten as u32, n)?;
        Ok(Errno::SUCCESS)
    });
    wasi!(linker, "fd_read", |ctx, fd: i32, iovs: i32, iovs_len: i32, nread: i32| {
        let iovecs = ctx.read_iovecs(iovs as u32, iovs_len as u32)?;
        let lens: Vec<u32> = iovecs.iter().map(|(_, len)| *len).collect();
        let data = fd_try!(ctx.data_mut().animal.fd_read(fd as u32, &lens));
        ctx.scatter(&iovecs, &data)?;
        ctx.write_u32(nread as u32, data.len() as u32)?;
        Ok(Errno::SUCCESS)
    });
    wasi!(linker, "fd_readdir", |ctx, fd: i32, buf: i32, buf_len: i32, cookie: i64, bufused: i32| {
        let (bytes, used) = fd_try!(ctx
            .data_mut()
            .animal
            .fd_readdir(fd as u32, buf_len as u32, cookie as u64));
        ctx.write_bytes(buf as u32, &bytes)?;
        ctx.write_u32(bufused as u32, used)?;
        Ok(Errno::SUCCESS)
    });
    wasi!(linker, "fd_renumber", |ctx, fd: i32, to: i32| {
        fd_try!(ctx.data_mut().animal.fd_renumber(fd as u32, to as u32));
        Ok(Errno::SUCCESS)
    });
    wasi!(linker, "fd_seek", |ctx, fd: i32, offset: i64, whence: i32, newoffset: i32| {
        let pos = fd_try!(ctx.data_mut().animal.fd_seek(fd as u32, offset, whence as u32));
        ctx.write_u64(newoffset as u32, pos)?;
        Ok(Errno::SUCCESS)
    });
    wasi!(linker, "fd_sync", |ctx, fd: i32| {
        fd_try!(ctx.data_mut().animal.fd_sync(fd as u32));
        Ok(Errno::SUCCESS)
    });
    wasi!(linker, "fd_tell", |ctx, fd: i32, offset: i32| {
        let pos = fd_try!(ctx.data_mut().animal.fd_tell(fd as u32));
        ctx.write_u64(offset as u32, pos)?;
        Ok(Errno::SUCCESS)
    });
    wasi!(linker, "fd_write", |ctx, fd: i32, iovs: i32, iovs_len: i32, nwritten: i32| {
        let data = ctx.gather(iovs as u32, iovs_len as u32)?;
        let n = fd_try!(ctx.data_mut().animal.fd_write(fd as u32, &data));
        ctx.write_u32(nwritten as u32, n)?;
        Ok(Errno::SUCCESS)
    });

    wasi!(linker, "path_create_directory", |ctx, fd: i32, path: i32, path_len: i32| {
        let path = ctx.read_bytes(path as u32, path_len as u32)?;
        fd_try!(ctx.data_mut().animal.path_create_directory(fd as u32, &path));
        Ok(Errno::SUCCESS)
    });
    wasi!(linker, "path_filestat_get", |ctx, fd: i32, flags: i32, path: i32, path_len: i32, buf: i32| {
        let path = ctx.read_bytes(path as u32, path_len as u32)?;
        let stat = fd_try!(ctx.data_mut().animal.path_filestat_get(fd as u32, flags as u32, &path));
        ctx.write_bytes(buf as u32, &stat.to_bytes())?;
        Ok(Errno::SUCCESS)
    });
    wasi!(linker, "path_filestat_set_times", |ctx, fd: i32, flags: i32, path: i32, path_len: i32, atim: i64, mtim: i64, fst_flags: i32| {
        let path = ctx.read_bytes(path as u32, path_len as u32)?;
        fd_try!(ctx.data_mut().animal.path_filestat_set_times(
            fd as u32,
            flags as u32,
            &path,
            atim as u64,
            mtim as u64,
            fst_flags as u16,
        ));
        Ok(Errno::SUCCESS)
    });
    wasi!(linker, "path_link", |ctx, old_fd: i32, old_flags: i32, old_path: i32, old_path_len: i32, new_fd: i32, new_path: i32, new_path_len: i32| {
        let old_path = ctx.read_bytes(old_path as u32, old_path_len as u32)?;
        let new_path = ctx.read_bytes(new_path as u32, new_path_len as u32)?;
        fd_try!(ctx.data_mut().animal.path_link(
            old_fd as u32,
            old_flags as u32,
            &old_path,
            new_fd as u32,
            &new_path,
        ));
        Ok(Errno::SUCCESS)
    });
    wasi!(linker, "path_open", |ctx, fd: i32, dirflags: i32, path: i32, path_len: i32, oflags: i32, base: i64, inheriting: i64, fdflags: i32, opened: i32| {
        let path = ctx.read_bytes(path as u32, path_len as u32)?;
        let new_fd = fd_try!(ctx.data_mut().animal.path_open(
            fd as u32,
            dirflags as u32,
            &path,
            oflags as u16,
            base as u64,
            inheriting as u64,
            fdflags as u16,
        ));
        ctx.write_u32(opened as u32, new_fd)?;
        Ok(Errno::SUCCESS)
    });
    wasi!(linker, "path_readlink", |ctx, fd: i32, path: i32, path_len: i32, buf: i32, buf_len: i32, bufused: i32| {
        let path = ctx.read_bytes(path as u32, path_len as u32)?;
        let (target, errno) = ctx
            .data_mut()
            .animal
            .path_readlink(fd as u32, &path, buf_len as u32)?;
        ctx.write_bytes(buf as u32, &target)?;
        ctx.write_u32(bufused as u32, target.len() as u32)?;
        Ok(errno)
    });
    wasi!(linker, "path_remove_directory", |ctx, fd: i32, path: i32, path_len: i32| {
        let path = ctx.read_bytes(path as u32, path_len as u32)?;
        fd_try!(ctx.data_mut().animal.path_remove_directory(fd as u32, &path));
        Ok(Errno::SUCCESS)
    });
    wasi!(linker, "path_rename", |ctx, fd: i32, old_path: i32, old_path_len: i32, new_fd: i32, new_path: i32, new_path_len: i32| {
        let old_path = ctx.read_bytes(old_path as u32, old_path_len as u32)?;
        let new_path = ctx.read_bytes(new_path as u32, new_path_len as u32)?;
        fd_try!(ctx
            .data_mut()
            .animal
            .path_rename(fd as u32, &old_path, new_fd as u32, &new_path));
        Ok(Errno::SUCCESS)
    });
    wasi!(linker, "path_symlink", |ctx, old_path: i32, old_path_len: i32, fd: i32, new_path: i32, new_path_len: i32| {
        let old_path = ctx.read_bytes(old_path as u32, old_path_len as u32)?;
        let new_path = ctx.read_bytes(new_path as u32, new_path_len as u32)?;
        fd_try!(ctx.data_mut().animal.path_symlink(&old_path, fd as u32, &new_path));
        Ok(Errno::SUCCESS)
    });
    wasi!(linker, "path_unlink_file", |ctx, fd: i32, path: i32, path_len: i32| {
        let path = ctx.read_bytes(path as u32, path_len as u32)?;
        fd_try!(ctx.data_mut().animal.path_unlink_file(fd as u32, &path));
        Ok(Errno::SUCCESS)
    });

    wasi!(linker, "poll_oneoff", |ctx, _in: i32, _out: i32, _nsubscriptions: i32, _nevents: i32| {
        ctx.data_mut().animal.check_fds();
        Ok(Errno::NOTSUP)
    });
    wasi!(linker, "proc_raise", |ctx, _signal: i32| {
        ctx.data_mut().animal.check_fds();
        Ok(Errno::NOSYS)
    });
    wasi!(linker, "random_get", |ctx, _buf: i32, _buf_len: i32| {
        ctx.data_mut().animal.check_fds();
        Ok(Errno::NOSYS)
    });
    wasi!(linker, "sched_yield", |ctx| {
        ctx.data_mut().animal.check_fds();
        std::thread::yield_now();
        Ok(Errno::SUCCESS)
    });
    linker.func_wrap(
        WASI_MODULE,
        "proc_exit",
        |mut caller: Caller<'_, GuestState>, code: i32| -> anyhow::Result<()> {
            caller.data_mut().animal.check_fds();
            debug!(code, "proc_exit");
            Err(ProcExit(code).into())
        },
    )?;
    Ok(())
}

/// Write NUL-terminated `strings` to `buf` and their pointers to `ptrs`.
fn write_strings(ctx: &mut G<'_>, strings: &[String], ptrs: u32, buf: u32) -> Call {
    ctx.data_mut().animal.check_fds();
    let mut at = buf;
    for (i, s) in strings.iter().enumerate() {
        ctx.write_u32(ptrs + 4 * i as u32, at)?;
        ctx.write_bytes(at, s.as_bytes())?;
        ctx.write_bytes(at + s.len() as u32, &[0])?;
        at += s.len() as u32 + 1;
    }
    Ok(Errno::SUCCESS)
}

fn write_sizes(ctx: &mut G<'_>, strings: &[String], count: u32, size: u32) -> Call {
    ctx.data_mut().animal.check_fds();
    let total: usize = strings.iter().map(|s| s.len() + 1).sum();
    ctx.write_u32(count, strings.len() as u32)?;
    ctx.write_u32(size, total as u32)?;
    Ok(Errno::SUCCESS)
}
