//! The Park's descriptor table and per-descriptor subscriber lists.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::fd::Fd;

pub(crate) type FdCell = Arc<Mutex<Box<dyn Fd>>>;

pub(crate) struct FdTable {
    fds: Mutex<Vec<Option<FdCell>>>,
    /// Ref ids to notify when a descriptor closes, indexed by descriptor.
    subscribers: Mutex<Vec<Vec<u32>>>,
}

impl FdTable {
    pub(crate) fn new(fds: Vec<Option<Box<dyn Fd>>>, max_slots: usize) -> Self {
        Self {
            fds: Mutex::new(
                fds.into_iter()
                    .map(|fd| fd.map(|fd| Arc::new(Mutex::new(fd))))
                    .collect(),
            ),
            subscribers: Mutex::new(vec![Vec::new(); max_slots]),
        }
    }

    pub(crate) fn get(&self, fd: u32) -> Option<FdCell> {
        self.fds.lock().get(fd as usize).cloned().flatten()
    }

    pub(crate) fn take(&self, fd: u32) -> Option<FdCell> {
        self.fds.lock().get_mut(fd as usize).and_then(Option::take)
    }

    pub(crate) fn lowest_free(&self) -> usize {
        let fds = self.fds.lock();
        fds.iter().position(Option::is_none).unwrap_or(fds.len())
    }

    pub(crate) fn insert(&self, index: usize, fd: Box<dyn Fd>) {
        let mut fds = self.fds.lock();
        if fds.len() <= index {
            fds.resize_with(index + 1, || None);
        }
        fds[index] = Some(Arc::new(Mutex::new(fd)));
    }

    pub(crate) fn live(&self) -> Vec<u32> {
        self.fds
            .lock()
            .iter()
            .enumerate()
            .filter(|(_, fd)| fd.is_some())
            .map(|(i, _)| i as u32)
            .collect()
    }

    /// Record `ref_id`'s interest in `fds`. Returns descriptors out of range.
    pub(crate) fn subscribe(&self, ref_id: u32, fds: &[u32]) -> Vec<u32> {
        let mut subscribers = self.subscribers.lock();
        let mut rejected = Vec::new();
        for &fd in fds {
            match subscribers.get_mut(fd as usize) {
                Some(ids) if !ids.contains(&ref_id) => ids.push(ref_id),
                Some(_) => {}
                None => rejected.push(fd),
            }
        }
        rejected
    }

    pub(crate) fn subscribers(&self, fd: u32) -> Vec<u32> {
        self.subscribers
            .lock()
            .get(fd as usize)
            .cloned()
            .unwrap_or_default()
    }

    pub(crate) fn take_subscribers(&self, fd: u32) -> Vec<u32> {
        self.subscribers
            .lock()
            .get_mut(fd as usize)
            .map(std::mem::take)
            .unwrap_or_default()
    }
}
