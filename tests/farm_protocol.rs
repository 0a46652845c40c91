//! Integration tests for the call protocol between Refs and a Park

use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use farm_abi::types::{OFLAGS_CREAT, RIGHTS_ALL};
use farm_abi::{Errno, FdResult, LayoutHash};
use wasi_farm::vfs::{ConsoleIn, ConsoleOut, MemDir, MemFile, Node, OpenDirectory, OpenFile};
use wasi_farm::wire::{Reply, Request};
use wasi_farm::{Farm, FarmConfig, FarmError, FarmRef, Fd};

fn config() -> FarmConfig {
    FarmConfig::new(1 << 20, 32)
}

fn stdio_farm() -> (wasi_farm::FarmBuilder, Arc<parking_lot::Mutex<Vec<u8>>>) {
    stdio_farm_with(config())
}

fn stdio_farm_with(config: FarmConfig) -> (wasi_farm::FarmBuilder, Arc<parking_lot::Mutex<Vec<u8>>>) {
    let (out, captured) = ConsoleOut::capture();
    let builder = Farm::builder(config)
        .stdin(ConsoleIn::empty())
        .stdout(out)
        .stderr(ConsoleOut::stderr());
    (builder, captured)
}

fn open(reference: &FarmRef, dir: u32, path: &str, oflags: u16) -> FdResult<u32> {
    reference
        .path_open(dir, 0, path.as_bytes(), oflags, RIGHTS_ALL, RIGHTS_ALL, 0)
        .expect("path_open call")
}

/// Panics on every write.
struct Exploding;

impl Fd for Exploding {
    fn fd_write(&mut self, _data: &[u8]) -> FdResult<u32> {
        panic!("write exploded");
    }
}

/// Answers reads and unlinks only after a delay.
struct Slow;

const SLOW: Duration = Duration::from_millis(150);

impl Fd for Slow {
    fn fd_read(&mut self, len: usize) -> FdResult<Vec<u8>> {
        thread::sleep(SLOW);
        Ok(vec![7; len])
    }

    fn path_unlink(&mut self, _path: &str) -> FdResult<wasi_farm::Inode> {
        thread::sleep(SLOW);
        Err(Errno::NOENT)
    }
}

fn slow_farm() -> Farm {
    stdio_farm_with(config().with_call_timeout(Duration::from_millis(50)))
        .0
        .fd(Slow)
        .fd(Slow)
        .build()
        .expect("build farm")
}

#[test]
fn test_write_reaches_the_park() {
    let (builder, captured) = stdio_farm();
    let farm = builder.build().expect("build farm");
    let reference = FarmRef::connect(&farm.get_ref()).expect("connect");

    let written = reference.fd_write(1, b"hello").expect("call");
    assert_eq!(written, Ok(5));
    assert_eq!(captured.lock().as_slice(), b"hello");
}

#[test]
fn test_concurrent_callers_get_their_own_answers() {
    let file = MemFile::new(vec![0u8; 8 * 64]);
    let farm = stdio_farm()
        .0
        .fd(OpenFile::new(file.clone()))
        .build()
        .expect("build farm");
    let handle = farm.get_ref();
    let barrier = Arc::new(Barrier::new(8));

    let workers: Vec<_> = (0..8u8)
        .map(|worker| {
            let handle = handle.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let reference = FarmRef::connect(&handle).expect("connect");
                barrier.wait();
                for round in 0..64u8 {
                    let offset = u64::from(worker) * 64 + u64::from(round);
                    let byte = worker.wrapping_mul(31).wrapping_add(round);
                    assert_eq!(reference.fd_pwrite(3, &[byte], offset).expect("pwrite"), Ok(1));
                    let read = reference.fd_pread(3, &[1], offset).expect("pread");
                    assert_eq!(read, Ok(vec![byte]));
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().expect("worker");
    }

    let region = handle.region();
    assert_eq!(region.arena().refcount(), 0);
    assert_eq!(region.arena().used_len(), 0);
}

#[test]
fn test_opposite_renames_do_not_deadlock() {
    let left = MemDir::new();
    let right = MemDir::new();
    left.insert("a", Node::File(MemFile::new(b"a".to_vec())));
    right.insert("b", Node::File(MemFile::new(b"b".to_vec())));
    let farm = stdio_farm()
        .0
        .fd(OpenDirectory::new(left.clone()))
        .fd(OpenDirectory::new(right.clone()))
        .build()
        .expect("build farm");
    let handle = farm.get_ref();

    let movers: Vec<_> = [("a", 3u32, 4u32), ("b", 4, 3)]
        .into_iter()
        .map(|(name, from, to)| {
            let handle = handle.clone();
            thread::spawn(move || {
                let reference = FarmRef::connect(&handle).expect("connect");
                for _ in 0..200 {
                    let there = reference
                        .path_rename(from, name.as_bytes(), to, name.as_bytes())
                        .expect("rename");
                    assert_eq!(there, Ok(()));
                    let back = reference
                        .path_rename(to, name.as_bytes(), from, name.as_bytes())
                        .expect("rename back");
                    assert_eq!(back, Ok(()));
                }
            })
        })
        .collect();
    for mover in movers {
        mover.join().expect("mover");
    }

    assert_eq!(left.names(), vec!["a".to_string()]);
    assert_eq!(right.names(), vec!["b".to_string()]);
}

#[test]
fn test_rename_into_missing_descriptor_is_badf() {
    let root = MemDir::new();
    root.insert("a", Node::File(MemFile::new(Vec::new())));
    let farm = stdio_farm()
        .0
        .fd(OpenDirectory::new(root.clone()))
        .build()
        .expect("build farm");
    let reference = FarmRef::connect(&farm.get_ref()).expect("connect");

    let result = reference.path_rename(3, b"a", 9, b"a").expect("rename");
    assert_eq!(result, Err(Errno::BADF));
    assert!(root.get("a").is_some());
}

#[test]
fn test_open_past_slot_table_is_nfile() {
    let farm = stdio_farm_with(FarmConfig::new(1 << 16, 5))
        .0
        .fd(OpenDirectory::preopen("/", MemDir::new()))
        .build()
        .expect("build farm");
    let reference = FarmRef::connect(&farm.get_ref()).expect("connect");

    let first = open(&reference, 3, "a", OFLAGS_CREAT).expect("first open");
    assert_eq!(first, 4);
    assert_eq!(open(&reference, 3, "b", OFLAGS_CREAT), Err(Errno::NFILE));

    assert_eq!(reference.fd_close(first).expect("close"), Ok(()));
    assert_eq!(open(&reference, 3, "c", OFLAGS_CREAT), Ok(4));
}

#[test]
fn test_closed_descriptor_is_badf_and_reusable() {
    let farm = stdio_farm()
        .0
        .fd(OpenDirectory::preopen("/", MemDir::new()))
        .build()
        .expect("build farm");
    let reference = FarmRef::connect(&farm.get_ref()).expect("connect");

    let fd = open(&reference, 3, "x", OFLAGS_CREAT).expect("open");
    assert_eq!(reference.fd_write(fd, b"abc").expect("write"), Ok(3));
    assert_eq!(reference.fd_close(fd).expect("close"), Ok(()));
    assert_eq!(reference.fd_write(fd, b"abc").expect("write"), Err(Errno::BADF));
    assert!(!farm.park().live_fds().contains(&fd));

    let again = open(&reference, 3, "x", 0).expect("reopen");
    assert_eq!(again, fd);
    assert_eq!(reference.fd_read(again, &[8]).expect("read"), Ok(b"abc".to_vec()));
}

#[test]
fn test_calls_after_shutdown_are_badf() {
    let (builder, _captured) = stdio_farm();
    let farm = builder.build().expect("build farm");
    let reference = FarmRef::connect(&farm.get_ref()).expect("connect");
    assert_eq!(reference.fd_write(1, b"x").expect("write"), Ok(1));

    farm.shutdown();
    assert_eq!(reference.fd_write(1, b"x").expect("write"), Err(Errno::BADF));
    assert_eq!(
        reference.set_park_fds_map(&[0, 1, 2]).expect("subscribe"),
        Err(Errno::BADF)
    );
}

#[test]
fn test_panicking_descriptor_faults_the_call_only() {
    let farm = Farm::builder(config())
        .stdin(ConsoleIn::empty())
        .stdout(Exploding)
        .stderr(ConsoleOut::stderr())
        .build()
        .expect("build farm");
    let reference = FarmRef::connect(&farm.get_ref()).expect("connect");

    let result = reference.fd_write(1, b"boom");
    assert!(matches!(result, Err(FarmError::ParkFault { fd: 1 })));
    assert!(!reference.is_broken());

    // The listener keeps serving after a fault.
    assert_eq!(reference.fd_tell(1).expect("tell"), Err(Errno::NOTSUP));
    assert_eq!(farm.get_ref().region().arena().refcount(), 0);
}

#[test]
fn test_timed_out_call_breaks_only_its_own_ref() {
    let farm = slow_farm();
    let handle = farm.get_ref();
    let late = FarmRef::connect(&handle).expect("connect");
    let other = FarmRef::connect(&handle).expect("connect");

    let err = late.fd_read(3, &[64]).expect_err("read outlives the timeout");
    assert!(matches!(err, FarmError::CallTimedOut { fd: 3 }));
    assert!(late.is_broken());
    assert!(matches!(late.fd_write(1, b"x"), Err(FarmError::ChannelBroken)));
    assert!(matches!(late.set_park_fds_map(&[3]), Err(FarmError::ChannelBroken)));

    // Once the Park answers, the abandoned reply is freed and the slot is
    // usable again.
    thread::sleep(SLOW * 2);
    assert_eq!(other.fd_tell(3).expect("tell after abandonment"), Err(Errno::NOTSUP));
    assert!(!other.is_broken());
    assert_eq!(handle.region().arena().refcount(), 0);
}

#[test]
fn test_timed_out_rename_releases_both_slots() {
    let farm = slow_farm();
    let handle = farm.get_ref();
    let late = FarmRef::connect(&handle).expect("connect");
    let other = FarmRef::connect(&handle).expect("connect");

    let err = late.path_rename(3, b"a", 4, b"b").expect_err("rename outlives the timeout");
    assert!(matches!(err, FarmError::CallTimedOut { fd: 3 }));

    thread::sleep(SLOW * 2);
    assert_eq!(other.fd_tell(4).expect("tell on the second slot"), Err(Errno::NOTSUP));
    assert_eq!(other.fd_tell(3).expect("tell on the first slot"), Err(Errno::NOTSUP));
    assert_eq!(other.fd_write(1, b"ok").expect("write"), Ok(2));
    assert_eq!(handle.region().arena().refcount(), 0);
}

#[test]
fn test_close_with_full_close_channel_keeps_descriptor_open() {
    let root = MemDir::new();
    // Room for one single-target record but not two.
    let farm = stdio_farm_with(config().with_close_channel_words(7))
        .0
        .fd(OpenDirectory::preopen("/", root.clone()))
        .build()
        .expect("build farm");
    let handle = farm.get_ref();
    let writer = FarmRef::connect(&handle).expect("connect");
    let observer = FarmRef::connect(&handle).expect("connect");
    assert_eq!(open(&writer, 3, "a", OFLAGS_CREAT), Ok(4));
    assert_eq!(open(&writer, 3, "b", OFLAGS_CREAT), Ok(5));
    assert_eq!(observer.set_park_fds_map(&[4, 5]).expect("subscribe"), Ok(()));

    assert_eq!(writer.fd_close(4).expect("close a"), Ok(()));
    let refused = writer.fd_close(5);
    assert!(matches!(refused, Err(FarmError::ParkFault { fd: 5 })));
    assert!(!writer.is_broken());
    assert!(farm.park().live_fds().contains(&5));
    assert_eq!(farm.park().subscribers(5), vec![observer.id()]);

    // The observer's view of 5 still names file b.
    assert_eq!(observer.fd_write(5, b"still b").expect("write"), Ok(7));
    match root.get("b") {
        Some(Node::File(file)) => assert_eq!(file.contents(), b"still b"),
        _ => panic!("b should be a file"),
    }

    assert_eq!(observer.closed_fds(), Some(vec![4]));
    assert_eq!(writer.fd_close(5).expect("close b"), Ok(()));
    assert_eq!(observer.closed_fds(), Some(vec![5]));
    assert!(!farm.park().live_fds().contains(&5));
}

#[test]
fn test_builder_sizes_region_from_config() {
    let farm = stdio_farm_with(FarmConfig::new(4096, 6)).0.build().expect("build farm");
    let region = farm.get_ref().region().clone();
    assert_eq!(region.max_slots(), 6);
    assert_eq!(region.config().arena_size, 4096);
    assert!(region.slot(5).is_some());
    assert!(region.slot(6).is_none());
}

#[test]
fn test_layout_mismatch_is_refused() {
    let (builder, _captured) = stdio_farm();
    let farm = builder.build().expect("build farm");
    let mut handle = farm.get_ref();
    handle.fingerprint = LayoutHash::from_bytes([0; 32]);

    let err = FarmRef::connect(&handle).expect_err("mismatched layout");
    assert!(matches!(err, FarmError::LayoutMismatch { .. }));
}

#[test]
fn test_prestat_dir_name_truncates() {
    let farm = stdio_farm()
        .0
        .fd(OpenDirectory::preopen("/sandbox", MemDir::new()))
        .build()
        .expect("build farm");
    let reference = FarmRef::connect(&farm.get_ref()).expect("connect");

    let (name, errno) = reference.fd_prestat_dir_name(3, 64).expect("call");
    assert_eq!((name.as_slice(), errno), (&b"/sandbox"[..], Errno::SUCCESS));
    let (name, errno) = reference.fd_prestat_dir_name(3, 4).expect("call");
    assert_eq!((name.as_slice(), errno), (&b"/san"[..], Errno::NAMETOOLONG));
}

#[tokio::test]
async fn test_async_call_round_trip() {
    let (builder, captured) = stdio_farm();
    let farm = builder.build().expect("build farm");
    let reference = FarmRef::connect(&farm.get_ref()).expect("connect");

    let request = Request::FdWrite { fd: 1, data: b"async".to_vec() };
    let (errno, reply) = reference.call_async(&request).await.expect("call");
    assert_eq!(errno, Errno::SUCCESS);
    assert_eq!(reply, Reply::Written(5));
    assert_eq!(captured.lock().as_slice(), b"async");
}
