//! Integration tests for the guest descriptor table

use std::sync::Arc;

use farm_abi::types::{OFLAGS_CREAT, RIGHTS_ALL};
use farm_abi::{Errno, FdResult};
use parking_lot::Mutex;
use wasi_farm::vfs::{ConsoleIn, ConsoleOut, MemDir, MemFile, Node, OpenDirectory, OpenFile};
use wasi_farm::{Animal, Farm, FarmConfig, FarmError, FarmRef, FarmRefHandle, Fd, MappedFd};

fn config() -> FarmConfig {
    FarmConfig::new(1 << 20, 32)
}

struct Fixture {
    farm: Farm,
    root: Arc<MemDir>,
    stdout: Arc<Mutex<Vec<u8>>>,
}

fn fixture() -> Fixture {
    let root = MemDir::new();
    let (out, stdout) = ConsoleOut::capture();
    let farm = Farm::builder(config())
        .stdin(ConsoleIn::from_bytes(b"input".to_vec()))
        .stdout(out)
        .stderr(ConsoleOut::stderr())
        .fd(OpenDirectory::preopen("/", root.clone()))
        .build()
        .expect("build farm");
    Fixture { farm, root, stdout }
}

fn open(animal: &mut Animal, path: &str) -> FdResult<u32> {
    animal
        .path_open(3, 0, path.as_bytes(), OFLAGS_CREAT, RIGHTS_ALL, RIGHTS_ALL, 0)
        .expect("path_open call")
}

#[test]
fn test_stdio_and_preopen_are_mapped() {
    let f = fixture();
    let mut animal = Animal::builder().farm(f.farm.get_ref()).build().expect("animal");

    for fd in 0..4 {
        assert_eq!(animal.mapped(fd), Some(MappedFd { fd, farm: 0 }));
    }
    assert_eq!(animal.fd_read(0, &[2, 8]).expect("read"), Ok(b"input".to_vec()));
    assert_eq!(animal.fd_write(1, b"out").expect("write"), Ok(3));
    assert_eq!(f.stdout.lock().as_slice(), b"out");
    let (name, errno) = animal.fd_prestat_dir_name(3, 16).expect("prestat");
    assert_eq!((name.as_slice(), errno), (&b"/"[..], Errno::SUCCESS));
    assert_eq!(animal.fd_write(7, b"x").expect("write"), Err(Errno::BADF));
}

#[test]
fn test_lowest_free_guest_descriptor_is_reused() {
    let f = fixture();
    let mut animal = Animal::builder().farm(f.farm.get_ref()).build().expect("animal");

    let opened: Vec<u32> = ["a", "b", "c"]
        .into_iter()
        .map(|p| open(&mut animal, p).expect("open"))
        .collect();
    assert_eq!(opened, vec![4, 5, 6]);

    assert_eq!(animal.fd_close(5).expect("close"), Ok(()));
    assert_eq!(animal.mapped(5), None);
    assert_eq!(open(&mut animal, "d"), Ok(5));
    assert_eq!(animal.mapped(5), Some(MappedFd { fd: 5, farm: 0 }));
}

#[test]
fn test_close_reaches_every_subscribed_animal() {
    let f = fixture();
    let mut writer = Animal::builder().farm(f.farm.get_ref()).build().expect("animal");
    let fd = open(&mut writer, "x").expect("open");
    assert_eq!(fd, 4);

    let mut observers: Vec<Animal> = (0..3)
        .map(|_| {
            Animal::builder()
                .farm_with(f.farm.get_ref(), vec![0, 1, 2, 3, 4])
                .build()
                .expect("observer")
        })
        .collect();
    for observer in &observers {
        assert_eq!(observer.mapped(4), Some(MappedFd { fd: 4, farm: 0 }));
    }
    assert_eq!(f.farm.park().subscribers(4).len(), 4);

    assert_eq!(writer.fd_write(fd, b"hi").expect("write"), Ok(2));
    assert_eq!(writer.fd_close(fd).expect("close"), Ok(()));

    for observer in &mut observers {
        observer.check_fds();
        assert_eq!(observer.mapped(4), None);
        assert_eq!(observer.fd_write(4, b"late").expect("write"), Err(Errno::BADF));
    }
    match f.root.get("x") {
        Some(Node::File(file)) => assert_eq!(file.contents(), b"hi"),
        _ => panic!("x should be a file"),
    }
}

#[test]
fn test_reused_real_descriptor_is_not_forgotten() {
    let f = fixture();
    let mut first = Animal::builder().farm(f.farm.get_ref()).build().expect("animal");
    let fd = open(&mut first, "x").expect("open");
    let mut second = Animal::builder()
        .farm_with(f.farm.get_ref(), vec![0, 1, 2, 3, fd])
        .build()
        .expect("animal");
    assert_eq!(second.mapped(4), Some(MappedFd { fd, farm: 0 }));

    assert_eq!(first.fd_close(fd).expect("close"), Ok(()));

    // The second Animal has not looked at its notifications yet when it
    // opens into the freed real slot.
    let reopened = open(&mut second, "y").expect("reopen");
    assert_eq!(reopened, 4);
    assert_eq!(second.mapped(reopened), Some(MappedFd { fd, farm: 0 }));
    second.check_fds();
    assert_eq!(second.mapped(reopened), Some(MappedFd { fd, farm: 0 }));
    assert_eq!(second.fd_write(reopened, b"ok").expect("write"), Ok(2));
}

/// A directory whose opens first close real descriptor 4 through a ref of
/// its own, so the freed number is the one the open is handed.
struct RacingDir {
    inner: OpenDirectory,
    farm: Arc<Mutex<Option<FarmRefHandle>>>,
}

impl Fd for RacingDir {
    fn path_open(
        &mut self,
        dirflags: u32,
        path: &str,
        oflags: u16,
        rights_base: u64,
        rights_inheriting: u64,
        fdflags: u16,
    ) -> FdResult<Box<dyn Fd>> {
        if let Some(handle) = self.farm.lock().clone() {
            let closer = FarmRef::connect(&handle).expect("connect");
            assert_eq!(closer.fd_close(4).expect("close"), Ok(()));
        }
        self.inner
            .path_open(dirflags, path, oflags, rights_base, rights_inheriting, fdflags)
    }
}

#[test]
fn test_open_racing_a_remote_close_keeps_the_new_descriptor() {
    let root = MemDir::new();
    let slot = Arc::new(Mutex::new(None));
    let farm = Farm::builder(config())
        .stdin(ConsoleIn::empty())
        .stdout(ConsoleOut::stderr())
        .stderr(ConsoleOut::stderr())
        .fd(RacingDir {
            inner: OpenDirectory::new(root.clone()),
            farm: Arc::clone(&slot),
        })
        .fd(OpenFile::new(MemFile::new(Vec::new())))
        .build()
        .expect("build farm");
    let mut animal = Animal::builder().farm(farm.get_ref()).build().expect("animal");
    assert_eq!(animal.mapped(4), Some(MappedFd { fd: 4, farm: 0 }));
    *slot.lock() = Some(farm.get_ref());

    let opened = open(&mut animal, "fresh").expect("open");
    assert_eq!(animal.mapped(opened), Some(MappedFd { fd: 4, farm: 0 }));
    assert_eq!(animal.fd_map().iter().flatten().filter(|m| m.fd == 4).count(), 1);

    assert_eq!(animal.fd_write(opened, b"hi").expect("write"), Ok(2));
    assert_eq!(animal.mapped(opened), Some(MappedFd { fd: 4, farm: 0 }));
    match root.get("fresh") {
        Some(Node::File(file)) => assert_eq!(file.contents(), b"hi"),
        _ => panic!("fresh should be a file"),
    }
}

#[test]
fn test_renumber_moves_and_closes_target() {
    let f = fixture();
    let mut animal = Animal::builder().farm(f.farm.get_ref()).build().expect("animal");

    let x = open(&mut animal, "x").expect("open x");
    assert_eq!(animal.fd_renumber(x, 10).expect("renumber"), Ok(()));
    assert_eq!(animal.mapped(x), None);
    assert_eq!(animal.mapped(10), Some(MappedFd { fd: 4, farm: 0 }));
    assert_eq!(animal.fd_map().len(), 11);

    let y = open(&mut animal, "y").expect("open y");
    assert_eq!(y, 4);
    let y_real = animal.mapped(y).expect("y mapped").fd;
    assert_eq!(animal.fd_renumber(y, 10).expect("renumber onto x"), Ok(()));
    assert_eq!(animal.mapped(10), Some(MappedFd { fd: y_real, farm: 0 }));
    assert!(!f.farm.park().live_fds().contains(&4));

    assert_eq!(animal.fd_write(10, b"y").expect("write"), Ok(1));
    match f.root.get("y") {
        Some(Node::File(file)) => assert_eq!(file.contents(), b"y"),
        _ => panic!("y should be a file"),
    }

    assert_eq!(animal.fd_renumber(10, 10).expect("self"), Ok(()));
    assert_eq!(animal.fd_renumber(42, 3).expect("unmapped"), Err(Errno::BADF));
    assert_eq!(animal.fd_renumber(10, u32::MAX).expect("too large"), Err(Errno::BADF));
}

#[test]
fn test_missing_stdio_is_an_error() {
    let farm = Farm::builder(config())
        .stdout(ConsoleOut::stdout())
        .stderr(ConsoleOut::stderr())
        .build()
        .expect("build farm");
    let err = Animal::builder().farm(farm.get_ref()).build().expect_err("no stdin");
    assert!(matches!(err, FarmError::MissingStdio("stdin")));
}

#[test]
fn test_later_farm_overrides_stdio() {
    let (first_out, first) = ConsoleOut::capture();
    let (second_out, second) = ConsoleOut::capture();
    let base = Farm::builder(config())
        .stdin(ConsoleIn::empty())
        .stdout(first_out)
        .stderr(ConsoleOut::stderr())
        .fd(OpenDirectory::preopen("/a", MemDir::new()))
        .build()
        .expect("base farm");
    let overlay = Farm::builder(config())
        .stdout(second_out)
        .fd(OpenDirectory::preopen("/b", MemDir::new()))
        .build()
        .expect("overlay farm");

    let mut animal = Animal::builder()
        .farm(base.get_ref())
        .farm(overlay.get_ref())
        .build()
        .expect("animal");

    assert_eq!(animal.mapped(0), Some(MappedFd { fd: 0, farm: 0 }));
    assert_eq!(animal.mapped(1), Some(MappedFd { fd: 1, farm: 1 }));
    assert_eq!(animal.mapped(3), Some(MappedFd { fd: 3, farm: 0 }));
    assert_eq!(animal.mapped(4), Some(MappedFd { fd: 3, farm: 1 }));

    assert_eq!(animal.fd_write(1, b"to overlay").expect("write"), Ok(10));
    assert!(first.lock().is_empty());
    assert_eq!(second.lock().as_slice(), b"to overlay");

    // Rename across farms has no common Park.
    let cross = animal.path_rename(3, b"f", 4, b"f").expect("rename");
    assert_eq!(cross, Err(Errno::BADF));
}

#[test]
fn test_snapshot_rebuilds_the_table() {
    let f = fixture();
    let mut animal = Animal::builder()
        .farm(f.farm.get_ref())
        .arg("prog")
        .env("K=V")
        .build()
        .expect("animal");
    let x = open(&mut animal, "x").expect("open");

    let snapshot = animal.snapshot();
    let mut copy = Animal::from_snapshot(snapshot).expect("rebuild");
    assert_eq!(copy.fd_map(), animal.fd_map());
    assert_eq!(copy.args(), ["prog".to_string()]);
    assert_eq!(copy.env(), ["K=V".to_string()]);

    assert_eq!(animal.fd_close(x).expect("close"), Ok(()));
    copy.check_fds();
    assert_eq!(copy.mapped(x), None);
}

#[test]
fn test_directory_listing_through_animal() {
    let f = fixture();
    f.root.insert("one", Node::File(MemFile::new(b"1".to_vec())));
    f.root.insert("two", Node::Dir(MemDir::new()));
    let mut animal = Animal::builder().farm(f.farm.get_ref()).build().expect("animal");

    let (buf, used) = animal.fd_readdir(3, 4096, 0).expect("readdir").expect("listing");
    assert_eq!(used as usize, buf.len());
    let text = String::from_utf8_lossy(&buf);
    assert!(text.contains("one") && text.contains("two"));

    let (short, used) = animal.fd_readdir(3, 10, 0).expect("readdir").expect("listing");
    assert_eq!(used, 10);
    assert_eq!(short.len(), 10);

    assert_eq!(animal.path_create_directory(3, b"three").expect("mkdir"), Ok(()));
    assert_eq!(animal.path_create_directory(3, b"three").expect("mkdir"), Err(Errno::EXIST));
    assert_eq!(animal.path_remove_directory(3, b"three").expect("rmdir"), Ok(()));
    assert_eq!(animal.path_unlink_file(3, b"one").expect("unlink"), Ok(()));
    assert!(f.root.get("one").is_none());
}
