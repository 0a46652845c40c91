use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::JoinHandle;

use tracing::{debug, error, info_span};

use super::done::DoneSlot;
use super::error::SerializedError;
use crate::allocator::Allocator;
use crate::animal::{Animal, AnimalSnapshot};
use crate::error::FarmError;

type Entry = Box<dyn FnOnce(ThreadContext) -> anyhow::Result<u32> + Send>;

/// What a spawned thread starts with.
pub struct ThreadContext {
    pub id: u32,
    pub animal: Animal,
}

/// The one message sent to a new thread.
struct Handshake {
    id: u32,
    snapshot: AnimalSnapshot,
    entry: Entry,
    done: Arc<DoneSlot>,
    arena: Arc<Allocator>,
}

/// Starts threads that share the spawner's error arena.
pub struct ThreadSpawner {
    arena: Arc<Allocator>,
    next_id: AtomicU32,
}

impl ThreadSpawner {
    /// `arena_size` bounds the serialized errors in flight at once.
    pub fn new(arena_size: usize) -> Result<Self, FarmError> {
        Ok(Self {
            arena: Arc::new(Allocator::new(arena_size)?),
            next_id: AtomicU32::new(1),
        })
    }

    pub fn arena(&self) -> &Arc<Allocator> {
        &self.arena
    }

    /// Start `entry` on a new thread with an Animal rebuilt from
    /// `snapshot`. Returns once the thread has its Animal.
    pub fn spawn<F>(&self, snapshot: AnimalSnapshot, entry: F) -> Result<ThreadHandle, FarmError>
    where
        F: FnOnce(ThreadContext) -> anyhow::Result<u32> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let done = Arc::new(DoneSlot::new());
        let (to_thread, inbox) = mpsc::channel::<Handshake>();
        let (ack, ready) = mpsc::channel::<Result<(), String>>();
        let thread = std::thread::Builder::new()
            .name(format!("farm-thread-{id}"))
            .spawn(move || run(inbox, ack))
            .map_err(|e| FarmError::Spawn(e.to_string()))?;
        to_thread
            .send(Handshake {
                id,
                snapshot,
                entry: Box::new(entry),
                done: Arc::clone(&done),
                arena: Arc::clone(&self.arena),
            })
            .map_err(|_| FarmError::Spawn(format!("thread {id} exited before the handshake")))?;
        match ready.recv() {
            Ok(Ok(())) => {}
            Ok(Err(reason)) => return Err(FarmError::Spawn(reason)),
            Err(_) => return Err(FarmError::Spawn(format!("thread {id} dropped the handshake"))),
        }
        debug!(id, "thread spawned");
        Ok(ThreadHandle {
            id,
            done,
            arena: Arc::clone(&self.arena),
            thread: Some(thread),
        })
    }
}

fn run(inbox: mpsc::Receiver<Handshake>, ack: mpsc::Sender<Result<(), String>>) {
    let Ok(Handshake {
        id,
        snapshot,
        entry,
        done,
        arena,
    }) = inbox.recv()
    else {
        return;
    };
    let _span = info_span!("thread", id).entered();
    let animal = match Animal::from_snapshot(snapshot) {
        Ok(animal) => animal,
        Err(e) => {
            let err = SerializedError::new("SpawnError", e.to_string());
            done.notify_error(&arena, &err);
            let _ = ack.send(Err(e.to_string()));
            return;
        }
    };
    let _ = ack.send(Ok(()));
    match catch_unwind(AssertUnwindSafe(|| entry(ThreadContext { id, animal }))) {
        Ok(Ok(code)) => done.notify_done(code),
        Ok(Err(e)) => {
            error!(error = %e, "thread failed");
            done.notify_error(&arena, &SerializedError::from_anyhow(&e));
        }
        Err(payload) => {
            let err = SerializedError::from_panic(payload.as_ref());
            error!(error = %err, "thread panicked");
            done.notify_error(&arena, &err);
        }
    }
}

/// The spawning side's view of a thread.
pub struct ThreadHandle {
    id: u32,
    done: Arc<DoneSlot>,
    arena: Arc<Allocator>,
    thread: Option<JoinHandle<()>>,
}

impl ThreadHandle {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn is_finished(&self) -> bool {
        self.done.is_finished()
    }

    /// Block until the thread exits. Returns its exit code, or its error
    /// as [`FarmError::SpawnedUnit`].
    pub fn join(mut self) -> Result<u32, FarmError> {
        let result = self.done.wait(&self.arena);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!(id = self.id, "thread panicked after reporting");
            }
        }
        result
    }

    /// Suspend until the thread exits. The OS thread is detached.
    pub async fn wait_async(self) -> Result<u32, FarmError> {
        self.done.wait_async(&self.arena).await
    }
}

impl Drop for ThreadHandle {
    fn drop(&mut self) {
        self.done.discard(&self.arena);
    }
}
