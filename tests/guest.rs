//! End-to-end tests running WASI modules against a farm

use std::sync::Arc;

use parking_lot::Mutex;
use wasi_farm::guest::{check_imports, run_module, GuestError};
use wasi_farm::vfs::{ConsoleIn, ConsoleOut, MemDir, Node, OpenDirectory};
use wasi_farm::{Animal, Farm, FarmConfig};
use wasmtime::Engine;

struct Guest {
    farm: Farm,
    root: Arc<MemDir>,
    stdout: Arc<Mutex<Vec<u8>>>,
}

fn guest() -> Guest {
    let root = MemDir::new();
    let (out, stdout) = ConsoleOut::capture();
    let farm = Farm::builder(FarmConfig::new(1 << 20, 32))
        .stdin(ConsoleIn::empty())
        .stdout(out)
        .stderr(ConsoleOut::stderr())
        .fd(OpenDirectory::preopen("/", root.clone()))
        .build()
        .expect("build farm");
    Guest { farm, root, stdout }
}

fn run(g: &Guest, wat: &str, args: &[&str]) -> anyhow::Result<i32> {
    let wasm = wat::parse_str(wat).expect("parse WAT");
    let animal = Animal::builder()
        .farm(g.farm.get_ref())
        .args(args.iter().map(|s| s.to_string()))
        .build()
        .expect("animal");
    run_module(&Engine::default(), &wasm, animal)
}

#[test]
fn test_hello_world_and_exit_code() {
    let module_wat = r#"
    (module
        (import "wasi_snapshot_preview1" "fd_write"
            (func $fd_write (param i32 i32 i32 i32) (result i32)))
        (import "wasi_snapshot_preview1" "proc_exit" (func $proc_exit (param i32)))
        (memory (export "memory") 1)
        (data (i32.const 16) "hi\n")

        (func (export "_start")
            (i32.store (i32.const 0) (i32.const 16))
            (i32.store (i32.const 4) (i32.const 3))
            (drop (call $fd_write (i32.const 1) (i32.const 0) (i32.const 1) (i32.const 8)))
            (call $proc_exit (i32.add (i32.const 4) (i32.load (i32.const 8))))
        )
    )
    "#;

    let g = guest();
    // nwritten (3) + 4
    assert_eq!(run(&g, module_wat, &[]).expect("run"), 7);
    assert_eq!(g.stdout.lock().as_slice(), b"hi\n");
}

#[test]
fn test_start_returning_is_exit_zero() {
    let module_wat = r#"
    (module
        (memory (export "memory") 1)
        (func (export "_start"))
    )
    "#;
    assert_eq!(run(&guest(), module_wat, &[]).expect("run"), 0);
}

#[test]
fn test_errno_reaches_guest() {
    // Writing to an unmapped descriptor exits with the returned errno.
    let module_wat = r#"
    (module
        (import "wasi_snapshot_preview1" "fd_write"
            (func $fd_write (param i32 i32 i32 i32) (result i32)))
        (import "wasi_snapshot_preview1" "proc_exit" (func $proc_exit (param i32)))
        (memory (export "memory") 1)

        (func (export "_start")
            (call $proc_exit
                (call $fd_write (i32.const 99) (i32.const 0) (i32.const 0) (i32.const 8)))
        )
    )
    "#;
    assert_eq!(run(&guest(), module_wat, &[]).expect("run"), 8);
}

#[test]
fn test_out_of_bounds_iovec_is_fault() {
    let module_wat = r#"
    (module
        (import "wasi_snapshot_preview1" "fd_write"
            (func $fd_write (param i32 i32 i32 i32) (result i32)))
        (import "wasi_snapshot_preview1" "proc_exit" (func $proc_exit (param i32)))
        (memory (export "memory") 1)

        (func (export "_start")
            (call $proc_exit
                (call $fd_write (i32.const 1) (i32.const 65532) (i32.const 4) (i32.const 8)))
        )
    )
    "#;
    assert_eq!(run(&guest(), module_wat, &[]).expect("run"), 21);
}

#[test]
fn test_open_write_close_through_guest() {
    let module_wat = r#"
    (module
        (import "wasi_snapshot_preview1" "path_open"
            (func $path_open (param i32 i32 i32 i32 i32 i64 i64 i32 i32) (result i32)))
        (import "wasi_snapshot_preview1" "fd_write"
            (func $fd_write (param i32 i32 i32 i32) (result i32)))
        (import "wasi_snapshot_preview1" "fd_close" (func $fd_close (param i32) (result i32)))
        (import "wasi_snapshot_preview1" "proc_exit" (func $proc_exit (param i32)))
        (memory (export "memory") 1)
        (data (i32.const 32) "notes.txt")
        (data (i32.const 48) "saved")

        (func (export "_start")
            (local $errno i32)
            ;; open "notes.txt" under the preopen with O_CREAT, fd stored at 64
            (local.set $errno
                (call $path_open (i32.const 3) (i32.const 0) (i32.const 32) (i32.const 9)
                    (i32.const 1) (i64.const -1) (i64.const -1) (i32.const 0) (i32.const 64)))
            (if (local.get $errno) (then (call $proc_exit (i32.add (i32.const 100) (local.get $errno)))))
            (i32.store (i32.const 0) (i32.const 48))
            (i32.store (i32.const 4) (i32.const 5))
            (local.set $errno
                (call $fd_write (i32.load (i32.const 64)) (i32.const 0) (i32.const 1) (i32.const 8)))
            (if (local.get $errno) (then (call $proc_exit (i32.add (i32.const 200) (local.get $errno)))))
            (local.set $errno (call $fd_close (i32.load (i32.const 64))))
            (if (local.get $errno) (then (call $proc_exit (i32.add (i32.const 300) (local.get $errno)))))
            (call $proc_exit (i32.load (i32.const 64)))
        )
    )
    "#;

    let g = guest();
    assert_eq!(run(&g, module_wat, &[]).expect("run"), 4);
    match g.root.get("notes.txt") {
        Some(Node::File(file)) => assert_eq!(file.contents(), b"saved"),
        _ => panic!("notes.txt should exist"),
    }
    assert_eq!(g.farm.park().live_fds(), vec![0, 1, 2, 3]);
}

#[test]
fn test_args_are_visible() {
    let module_wat = r#"
    (module
        (import "wasi_snapshot_preview1" "args_sizes_get"
            (func $args_sizes_get (param i32 i32) (result i32)))
        (import "wasi_snapshot_preview1" "proc_exit" (func $proc_exit (param i32)))
        (memory (export "memory") 1)

        (func (export "_start")
            (drop (call $args_sizes_get (i32.const 0) (i32.const 4)))
            ;; argc * 100 + buffer size
            (call $proc_exit
                (i32.add (i32.mul (i32.load (i32.const 0)) (i32.const 100)) (i32.load (i32.const 4))))
        )
    )
    "#;
    // "prog\0" + "-v\0"
    assert_eq!(run(&guest(), module_wat, &["prog", "-v"]).expect("run"), 208);
}

#[test]
fn test_unsupported_import_is_rejected() {
    let module_wat = r#"
    (module
        (import "wasi_snapshot_preview1" "sock_accept"
            (func (param i32 i32 i32) (result i32)))
        (import "env" "host_thing" (func))
        (memory (export "memory") 1)
        (func (export "_start"))
    )
    "#;
    let wasm = wat::parse_str(module_wat).expect("parse WAT");
    match check_imports(&wasm) {
        Err(GuestError::UnsupportedImports(names)) => {
            assert_eq!(names.len(), 2);
            assert!(names.iter().any(|n| n.contains("sock_accept")));
        }
        other => panic!("expected unsupported imports, got {other:?}"),
    }
    assert!(run(&guest(), module_wat, &[]).is_err());
}
