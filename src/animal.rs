//! The Animal: one guest-visible descriptor table over any number of farms.
//!
//! Guest descriptor numbers are translated to `(farm, real descriptor)`
//! pairs. Slots 0, 1 and 2 always name the standard streams; everything the
//! guest opens lands in the lowest free slot from 3 up. Before each call the
//! table is reconciled against the close notifications queued for this
//! Animal's refs, so a descriptor closed through another Animal stops
//! resolving here.

use farm_abi::{Errno, FdResult, Fdstat, Filestat, Prestat};
use tracing::{debug, warn};

use crate::error::FarmError;
use crate::farm::FarmRefHandle;
use crate::farm_ref::FarmRef;

/// Largest guest descriptor `fd_renumber` may target.
pub const MAX_GUEST_FDS: u32 = 1 << 16;

/// Where a guest descriptor points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappedFd {
    /// The descriptor number inside the farm's Park.
    pub fd: u32,
    /// Index of the farm in the Animal's ref list.
    pub farm: usize,
}

/// Everything needed to rebuild an Animal on another thread.
#[derive(Debug, Clone)]
pub struct AnimalSnapshot {
    pub handles: Vec<FarmRefHandle>,
    pub fd_map: Vec<Option<MappedFd>>,
    pub args: Vec<String>,
    pub env: Vec<String>,
}

#[derive(Default)]
pub struct AnimalBuilder {
    farms: Vec<(FarmRefHandle, Option<Vec<u32>>)>,
    args: Vec<String>,
    env: Vec<String>,
}

impl AnimalBuilder {
    /// Expose the farm's default descriptors.
    pub fn farm(mut self, handle: FarmRefHandle) -> Self {
        self.farms.push((handle, None));
        self
    }

    /// Expose only `fds` of the farm.
    pub fn farm_with(mut self, handle: FarmRefHandle, fds: Vec<u32>) -> Self {
        self.farms.push((handle, Some(fds)));
        self
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args(mut self, args: impl IntoIterator<Item = String>) -> Self {
        self.args.extend(args);
        self
    }

    /// Add one `KEY=VALUE` environment entry.
    pub fn env(mut self, entry: impl Into<String>) -> Self {
        self.env.push(entry.into());
        self
    }

    pub fn build(self) -> Result<Animal, FarmError> {
        let mut refs = Vec::with_capacity(self.farms.len());
        let mut visibility = Vec::with_capacity(self.farms.len());
        for (handle, fds) in self.farms {
            visibility.push(fds.unwrap_or_else(|| handle.default_fds.clone()));
            refs.push(FarmRef::connect(&handle)?);
        }
        let mut animal = Animal {
            refs,
            fd_map: vec![None, None, None],
            args: self.args,
            env: self.env,
        };
        animal.mapping_fds(&visibility)?;
        Ok(animal)
    }
}

#[derive(Debug)]
pub struct Animal {
    refs: Vec<FarmRef>,
    fd_map: Vec<Option<MappedFd>>,
    args: Vec<String>,
    env: Vec<String>,
}

impl Animal {
    pub fn builder() -> AnimalBuilder {
        AnimalBuilder::default()
    }

    fn mapping_fds(&mut self, visibility: &[Vec<u32>]) -> Result<(), FarmError> {
        for (farm, visible) in visibility.iter().enumerate() {
            let handle = self.refs[farm].handle().clone();
            let stdio = [handle.stdin, handle.stdout, handle.stderr];
            for (slot, fd) in stdio.into_iter().enumerate() {
                if let Some(fd) = fd.filter(|fd| visible.contains(fd)) {
                    self.fd_map[slot] = Some(MappedFd { fd, farm });
                }
            }
            for &fd in visible {
                if stdio.contains(&Some(fd)) {
                    continue;
                }
                self.map_new_fd(MappedFd { fd, farm });
            }
            self.subscribe(farm, visible)?;
        }
        for (slot, name) in ["stdin", "stdout", "stderr"].into_iter().enumerate() {
            if self.fd_map[slot].is_none() {
                return Err(FarmError::MissingStdio(name));
            }
        }
        debug!(fd_map = ?self.fd_map, "animal mapped");
        Ok(())
    }

    fn subscribe(&self, farm: usize, fds: &[u32]) -> Result<(), FarmError> {
        if let Err(errno) = self.refs[farm].set_park_fds_map(fds)? {
            warn!(farm, ?fds, %errno, "park refused the subscription");
        }
        Ok(())
    }

    fn map_new_fd(&mut self, mapped: MappedFd) -> u32 {
        match self.fd_map.iter().skip(3).position(Option::is_none) {
            Some(i) => {
                self.fd_map[i + 3] = Some(mapped);
                (i + 3) as u32
            }
            None => {
                self.fd_map.push(Some(mapped));
                (self.fd_map.len() - 1) as u32
            }
        }
    }

    /// Drop every entry pointing at `(farm, fd)`.
    fn forget(&mut self, farm: usize, fd: u32) {
        for entry in self.fd_map.iter_mut() {
            if *entry == Some(MappedFd { fd, farm }) {
                *entry = None;
            }
        }
    }

    /// Apply queued close notifications to the translation table.
    pub fn check_fds(&mut self) {
        let closed: Vec<(usize, Vec<u32>)> = self
            .refs
            .iter()
            .enumerate()
            .filter_map(|(farm, r)| r.closed_fds().map(|fds| (farm, fds)))
            .collect();
        for (farm, fds) in closed {
            for fd in fds {
                debug!(farm, fd, "descriptor closed remotely");
                self.forget(farm, fd);
            }
        }
    }

    pub fn mapped(&self, fd: u32) -> Option<MappedFd> {
        self.fd_map.get(fd as usize).copied().flatten()
    }

    pub fn fd_map(&self) -> &[Option<MappedFd>] {
        &self.fd_map
    }

    pub fn refs(&self) -> &[FarmRef] {
        &self.refs
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn env(&self) -> &[String] {
        &self.env
    }

    /// Capture the table so a spawned thread can rebuild this Animal.
    pub fn snapshot(&mut self) -> AnimalSnapshot {
        self.check_fds();
        AnimalSnapshot {
            handles: self.refs.iter().map(|r| r.handle().clone()).collect(),
            fd_map: self.fd_map.clone(),
            args: self.args.clone(),
            env: self.env.clone(),
        }
    }

    /// Rebuild from a snapshot with fresh refs subscribed to every
    /// descriptor the table holds.
    pub fn from_snapshot(snapshot: AnimalSnapshot) -> Result<Self, FarmError> {
        let refs = snapshot
            .handles
            .iter()
            .map(FarmRef::connect)
            .collect::<Result<Vec<_>, _>>()?;
        let animal = Animal {
            refs,
            fd_map: snapshot.fd_map,
            args: snapshot.args,
            env: snapshot.env,
        };
        for farm in 0..animal.refs.len() {
            let fds: Vec<u32> = animal
                .fd_map
                .iter()
                .flatten()
                .filter(|m| m.farm == farm)
                .map(|m| m.fd)
                .collect();
            animal.subscribe(farm, &fds)?;
        }
        Ok(animal)
    }

    fn forward<T>(
        &mut self,
        fd: u32,
        call: impl FnOnce(&FarmRef, u32) -> Result<FdResult<T>, FarmError>,
    ) -> Result<FdResult<T>, FarmError> {
        self.check_fds();
        match self.mapped(fd) {
            Some(m) => call(&self.refs[m.farm], m.fd),
            None => Ok(Err(Errno::BADF)),
        }
    }

    /// Resolve both descriptors of a link or rename to one farm.
    fn forward_pair(
        &mut self,
        old_fd: u32,
        new_fd: u32,
        call: impl FnOnce(&FarmRef, u32, u32) -> Result<FdResult<()>, FarmError>,
    ) -> Result<FdResult<()>, FarmError> {
        self.check_fds();
        match (self.mapped(old_fd), self.mapped(new_fd)) {
            (Some(old), Some(new)) if old.farm == new.farm => call(&self.refs[old.farm], old.fd, new.fd),
            _ => Ok(Err(Errno::BADF)),
        }
    }

    pub fn fd_advise(&mut self, fd: u32) -> Result<FdResult<()>, FarmError> {
        self.forward(fd, |r, fd| r.fd_advise(fd))
    }

    pub fn fd_allocate(&mut self, fd: u32, offset: u64, len: u64) -> Result<FdResult<()>, FarmError> {
        self.forward(fd, |r, fd| r.fd_allocate(fd, offset, len))
    }

    pub fn fd_close(&mut self, fd: u32) -> Result<FdResult<()>, FarmError> {
        self.check_fds();
        let Some(m) = self.mapped(fd) else {
            return Ok(Err(Errno::BADF));
        };
        let result = self.refs[m.farm].fd_close(m.fd)?;
        self.check_fds();
        if result.is_ok() {
            self.forget(m.farm, m.fd);
        }
        Ok(result)
    }

    pub fn fd_datasync(&mut self, fd: u32) -> Result<FdResult<()>, FarmError> {
        self.forward(fd, |r, fd| r.fd_datasync(fd))
    }

    pub fn fd_fdstat_get(&mut self, fd: u32) -> Result<FdResult<Fdstat>, FarmError> {
        self.forward(fd, |r, fd| r.fd_fdstat_get(fd))
    }

    pub fn fd_fdstat_set_flags(&mut self, fd: u32, flags: u16) -> Result<FdResult<()>, FarmError> {
        self.forward(fd, |r, fd| r.fd_fdstat_set_flags(fd, flags))
    }

    pub fn fd_fdstat_set_rights(
        &mut self,
        fd: u32,
        rights_base: u64,
        rights_inheriting: u64,
    ) -> Result<FdResult<()>, FarmError> {
        self.forward(fd, |r, fd| r.fd_fdstat_set_rights(fd, rights_base, rights_inheriting))
    }

    pub fn fd_filestat_get(&mut self, fd: u32) -> Result<FdResult<Filestat>, FarmError> {
        self.forward(fd, |r, fd| r.fd_filestat_get(fd))
    }

    pub fn fd_filestat_set_size(&mut self, fd: u32, size: u64) -> Result<FdResult<()>, FarmError> {
        self.forward(fd, |r, fd| r.fd_filestat_set_size(fd, size))
    }

    pub fn fd_filestat_set_times(
        &mut self,
        fd: u32,
        atim: u64,
        mtim: u64,
        fst_flags: u16,
    ) -> Result<FdResult<()>, FarmError> {
        self.forward(fd, |r, fd| r.fd_filestat_set_times(fd, atim, mtim, fst_flags))
    }

    pub fn fd_pread(&mut self, fd: u32, iovec_lens: &[u32], offset: u64) -> Result<FdResult<Vec<u8>>, FarmError> {
        self.forward(fd, |r, fd| r.fd_pread(fd, iovec_lens, offset))
    }

    pub fn fd_prestat_get(&mut self, fd: u32) -> Result<FdResult<Prestat>, FarmError> {
        self.forward(fd, |r, fd| r.fd_prestat_get(fd))
    }

    /// The preopen name, possibly truncated, and the errno to report.
    pub fn fd_prestat_dir_name(&mut self, fd: u32, path_len: u32) -> Result<(Vec<u8>, Errno), FarmError> {
        self.check_fds();
        match self.mapped(fd) {
            Some(m) => self.refs[m.farm].fd_prestat_dir_name(m.fd, path_len),
            None => Ok((Vec::new(), Errno::BADF)),
        }
    }

    pub fn fd_pwrite(&mut self, fd: u32, data: &[u8], offset: u64) -> Result<FdResult<u32>, FarmError> {
        self.forward(fd, |r, fd| r.fd_pwrite(fd, data, offset))
    }

    pub fn fd_read(&mut self, fd: u32, iovec_lens: &[u32]) -> Result<FdResult<Vec<u8>>, FarmError> {
        self.forward(fd, |r, fd| r.fd_read(fd, iovec_lens))
    }

    pub fn fd_readdir(&mut self, fd: u32, buf_len: u32, cookie: u64) -> Result<FdResult<(Vec<u8>, u32)>, FarmError> {
        self.forward(fd, |r, fd| r.fd_readdir(fd, buf_len, cookie))
    }

    /// Move `from` to `to`, closing whatever `to` pointed at.
    pub fn fd_renumber(&mut self, from: u32, to: u32) -> Result<FdResult<()>, FarmError> {
        self.check_fds();
        let Some(source) = self.mapped(from) else {
            return Ok(Err(Errno::BADF));
        };
        if from == to {
            return Ok(Ok(()));
        }
        if to >= MAX_GUEST_FDS {
            return Ok(Err(Errno::BADF));
        }
        if let Some(target) = self.mapped(to) {
            let closed = self.refs[target.farm].fd_close(target.fd)?;
            self.check_fds();
            if let Err(errno) = closed {
                return Ok(Err(errno));
            }
            self.forget(target.farm, target.fd);
        }
        let to = to as usize;
        if self.fd_map.len() <= to {
            self.fd_map.resize(to + 1, None);
        }
        self.fd_map[to] = Some(source);
        self.fd_map[from as usize] = None;
        Ok(Ok(()))
    }

    pub fn fd_seek(&mut self, fd: u32, offset: i64, whence: u32) -> Result<FdResult<u64>, FarmError> {
        self.forward(fd, |r, fd| r.fd_seek(fd, offset, whence))
    }

    pub fn fd_sync(&mut self, fd: u32) -> Result<FdResult<()>, FarmError> {
        self.forward(fd, |r, fd| r.fd_sync(fd))
    }

    pub fn fd_tell(&mut self, fd: u32) -> Result<FdResult<u64>, FarmError> {
        self.forward(fd, |r, fd| r.fd_tell(fd))
    }

    pub fn fd_write(&mut self, fd: u32, data: &[u8]) -> Result<FdResult<u32>, FarmError> {
        self.forward(fd, |r, fd| r.fd_write(fd, data))
    }

    pub fn path_create_directory(&mut self, fd: u32, path: &[u8]) -> Result<FdResult<()>, FarmError> {
        self.forward(fd, |r, fd| r.path_create_directory(fd, path))
    }

    pub fn path_filestat_get(&mut self, fd: u32, flags: u32, path: &[u8]) -> Result<FdResult<Filestat>, FarmError> {
        self.forward(fd, |r, fd| r.path_filestat_get(fd, flags, path))
    }

    pub fn path_filestat_set_times(
        &mut self,
        fd: u32,
        flags: u32,
        path: &[u8],
        atim: u64,
        mtim: u64,
        fst_flags: u16,
    ) -> Result<FdResult<()>, FarmError> {
        self.forward(fd, |r, fd| r.path_filestat_set_times(fd, flags, path, atim, mtim, fst_flags))
    }

    pub fn path_link(
        &mut self,
        old_fd: u32,
        old_flags: u32,
        old_path: &[u8],
        new_fd: u32,
        new_path: &[u8],
    ) -> Result<FdResult<()>, FarmError> {
        self.forward_pair(old_fd, new_fd, |r, old_fd, new_fd| {
            r.path_link(old_fd, old_flags, old_path, new_fd, new_path)
        })
    }

    /// Open `path` under `fd` and map the result to a new guest descriptor.
    #[allow(clippy::too_many_arguments)]
    pub fn path_open(
        &mut self,
        fd: u32,
        dirflags: u32,
        path: &[u8],
        oflags: u16,
        rights_base: u64,
        rights_inheriting: u64,
        fdflags: u16,
    ) -> Result<FdResult<u32>, FarmError> {
        self.check_fds();
        let Some(m) = self.mapped(fd) else {
            return Ok(Err(Errno::BADF));
        };
        let opened = self.refs[m.farm].path_open(
            m.fd,
            dirflags,
            path,
            oflags,
            rights_base,
            rights_inheriting,
            fdflags,
        )?;
        let real = match opened {
            Ok(real) => real,
            Err(errno) => return Ok(Err(errno)),
        };
        // A close that raced the open may name the number just handed out.
        self.check_fds();
        let guest = self.map_new_fd(MappedFd { fd: real, farm: m.farm });
        self.subscribe(m.farm, &[real])?;
        debug!(guest, real, farm = m.farm, "opened");
        Ok(Ok(guest))
    }

    /// The link target, possibly truncated, and the errno to report.
    pub fn path_readlink(&mut self, fd: u32, path: &[u8], buf_len: u32) -> Result<(Vec<u8>, Errno), FarmError> {
        self.check_fds();
        match self.mapped(fd) {
            Some(m) => self.refs[m.farm].path_readlink(m.fd, path, buf_len),
            None => Ok((Vec::new(), Errno::BADF)),
        }
    }

    pub fn path_remove_directory(&mut self, fd: u32, path: &[u8]) -> Result<FdResult<()>, FarmError> {
        self.forward(fd, |r, fd| r.path_remove_directory(fd, path))
    }

    pub fn path_rename(
        &mut self,
        old_fd: u32,
        old_path: &[u8],
        new_fd: u32,
        new_path: &[u8],
    ) -> Result<FdResult<()>, FarmError> {
        self.forward_pair(old_fd, new_fd, |r, old_fd, new_fd| {
            r.path_rename(old_fd, old_path, new_fd, new_path)
        })
    }

    pub fn path_symlink(&mut self, old_path: &[u8], fd: u32, new_path: &[u8]) -> Result<FdResult<()>, FarmError> {
        self.forward(fd, |r, fd| r.path_symlink(old_path, fd, new_path))
    }

    pub fn path_unlink_file(&mut self, fd: u32, path: &[u8]) -> Result<FdResult<()>, FarmError> {
        self.forward(fd, |r, fd| r.path_unlink_file(fd, path))
    }
}
