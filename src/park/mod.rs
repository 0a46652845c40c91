//! The Park: the server side of a farm.
//!
//! A Park owns the real descriptor table and one listener thread per live
//! descriptor slot, plus a listener on the base channel for subscription
//! requests. Listeners are started when a descriptor is installed (at
//! construction or by `path_open`) and retire when it is closed.

mod dispatch;
mod listener;
mod table;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use farm_abi::layout::{CALL_IDLE, CALL_PENDING, CALL_SHUTDOWN, SLOT_LISTENING, SLOT_RETIRED};
use farm_abi::{Errno, FdResult};
use parking_lot::Mutex;
use tracing::{debug, error, info};

use crate::error::FarmError;
use crate::fd::Fd;
use crate::region::{SharedRegion, Slot};
use listener::Channel;
use table::FdTable;

const SHUTDOWN_POLL: Duration = Duration::from_millis(10);

pub(crate) struct ParkInner {
    region: Arc<SharedRegion>,
    table: FdTable,
    listeners: Mutex<Vec<Option<JoinHandle<()>>>>,
    base_listener: Mutex<Option<JoinHandle<()>>>,
    /// Serializes slot allocation against shutdown.
    new_fd_lock: Mutex<()>,
    shutting_down: AtomicBool,
}

/// Serves the descriptors of one farm over a [`SharedRegion`].
pub struct Park {
    inner: Arc<ParkInner>,
}

impl Park {
    /// Take ownership of `fds` (index = descriptor number) and start a
    /// listener for every present entry.
    pub fn new(region: Arc<SharedRegion>, fds: Vec<Option<Box<dyn Fd>>>) -> Result<Self, FarmError> {
        let max = region.max_slots();
        if fds.len() > max {
            return Err(FarmError::TooManyDescriptors {
                count: fds.len(),
                max,
            });
        }
        let inner = Arc::new(ParkInner {
            table: FdTable::new(fds, max),
            listeners: Mutex::new((0..max).map(|_| None).collect()),
            base_listener: Mutex::new(None),
            new_fd_lock: Mutex::new(()),
            shutting_down: AtomicBool::new(false),
            region,
        });
        let park = Park { inner };
        park.listen()?;
        Ok(park)
    }

    fn listen(&self) -> Result<(), FarmError> {
        for fd in self.inner.table.live() {
            self.inner.start_listener(fd)?;
        }
        let inner = Arc::clone(&self.inner);
        let base = self.inner.region.base();
        base.call.store(CALL_IDLE);
        base.set_state(SLOT_LISTENING);
        let handle = std::thread::Builder::new()
            .name("park-base".into())
            .spawn(move || listener::run(&inner, Channel::Base))
            .map_err(|e| FarmError::Spawn(e.to_string()))?;
        *self.inner.base_listener.lock() = Some(handle);
        info!(fds = ?self.inner.table.live(), "park listening");
        Ok(())
    }

    pub fn region(&self) -> &Arc<SharedRegion> {
        &self.inner.region
    }

    /// Descriptor numbers currently open in the Park.
    pub fn live_fds(&self) -> Vec<u32> {
        self.inner.table.live()
    }

    /// Ref ids subscribed to close notifications for `fd`.
    pub fn subscribers(&self, fd: u32) -> Vec<u32> {
        self.inner.table.subscribers(fd)
    }

    /// Stop every listener and wait for them to exit. Calls already in
    /// flight complete first. Idempotent.
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }
}

impl Drop for Park {
    fn drop(&mut self) {
        self.inner.shutdown();
    }
}

impl ParkInner {
    fn start_listener(self: &Arc<Self>, fd: u32) -> Result<(), FarmError> {
        let slot = self
            .region
            .slot(fd)
            .ok_or(FarmError::TooManyDescriptors {
                count: fd as usize + 1,
                max: self.region.max_slots(),
            })?;
        let old = self.listeners.lock()[fd as usize].take();
        if let Some(old) = old {
            if old.join().is_err() {
                error!(fd, "previous listener panicked");
            }
        }
        slot.call.store(CALL_IDLE);
        slot.set_state(SLOT_LISTENING);
        let inner = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name(format!("park-fd-{fd}"))
            .spawn(move || listener::run(&inner, Channel::Fd(fd)))
            .map_err(|e| {
                slot.set_state(SLOT_RETIRED);
                FarmError::Spawn(e.to_string())
            })?;
        self.listeners.lock()[fd as usize] = Some(handle);
        Ok(())
    }

    /// Place a freshly opened descriptor in the lowest free slot.
    fn install(self: &Arc<Self>, mut fd: Box<dyn Fd>) -> FdResult<u32> {
        let _guard = self.new_fd_lock.lock();
        let index = self.table.lowest_free();
        if index >= self.region.max_slots() || self.shutting_down.load(Ordering::Acquire) {
            let _ = fd.fd_close();
            return Err(Errno::NFILE);
        }
        self.table.insert(index, fd);
        if let Err(e) = self.start_listener(index as u32) {
            error!(fd = index, error = %e, "listener could not be started");
            if let Some(cell) = self.table.take(index as u32) {
                let _ = cell.lock().fd_close();
            }
            return Err(Errno::NFILE);
        }
        debug!(fd = index, "descriptor installed");
        Ok(index as u32)
    }

    fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        drop(self.new_fd_lock.lock());
        for fd in 0..self.region.max_slots() as u32 {
            if let Some(slot) = self.region.slot(fd) {
                if slot.state() == SLOT_LISTENING {
                    stop(slot);
                }
            }
        }
        stop(self.region.base());
        let mut handles: Vec<_> = self.listeners.lock().iter_mut().filter_map(Option::take).collect();
        handles.extend(self.base_listener.lock().take());
        for handle in handles {
            if handle.join().is_err() {
                error!("listener panicked during shutdown");
            }
        }
        info!("park shut down");
    }
}

/// Move an idle slot to shutdown, letting an in-flight call finish first.
fn stop(slot: &Slot) {
    loop {
        match slot.call.compare_exchange(CALL_IDLE, CALL_SHUTDOWN) {
            Ok(_) | Err(CALL_SHUTDOWN) => break,
            Err(CALL_PENDING) => {
                slot.call.wait(CALL_PENDING, Some(SHUTDOWN_POLL));
            }
            Err(_) => std::thread::sleep(SHUTDOWN_POLL),
        }
    }
    slot.call.wake(u32::MAX);
}
