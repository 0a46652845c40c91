//! Import validation before instantiation.

use farm_abi::FuncId;
use wasmparser::{Parser, Payload};

use super::GuestError;

pub const WASI_MODULE: &str = "wasi_snapshot_preview1";

/// Calls the linker provides that are not descriptor operations.
const HOST_CALLS: &[&str] = &[
    "args_get",
    "args_sizes_get",
    "environ_get",
    "environ_sizes_get",
    "clock_res_get",
    "clock_time_get",
    "fd_renumber",
    "poll_oneoff",
    "proc_exit",
    "proc_raise",
    "random_get",
    "sched_yield",
];

/// Whether the linker defines `module`.`name`.
pub fn is_supported(module: &str, name: &str) -> bool {
    module == WASI_MODULE
        && (HOST_CALLS.contains(&name)
            || FuncId::ALL
                .iter()
                .any(|f| *f != FuncId::SetFdsMap && f.name() == name))
}

/// Reject a module that imports anything the linker does not define.
pub fn check_imports(wasm: &[u8]) -> Result<(), GuestError> {
    let mut unsupported = Vec::new();
    for payload in Parser::new(0).parse_all(wasm) {
        if let Payload::ImportSection(reader) = payload? {
            for import in reader {
                let import = import?;
                if !is_supported(import.module, import.name) {
                    unsupported.push(format!("{}::{}", import.module, import.name));
                }
            }
        }
    }
    if unsupported.is_empty() {
        Ok(())
    } else {
        Err(GuestError::UnsupportedImports(unsupported))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_wasi_descriptor_calls() {
        let wasm = wat::parse_str(
            r#"(module
                (import "wasi_snapshot_preview1" "fd_write" (func (param i32 i32 i32 i32) (result i32)))
                (import "wasi_snapshot_preview1" "proc_exit" (func (param i32))))"#,
        )
        .unwrap();
        check_imports(&wasm).unwrap();
    }

    #[test]
    fn rejects_foreign_imports() {
        let wasm = wat::parse_str(
            r#"(module
                (import "env" "host_log" (func (param i32)))
                (import "wasi_snapshot_preview1" "sock_accept" (func (param i32 i32 i32) (result i32))))"#,
        )
        .unwrap();
        match check_imports(&wasm) {
            Err(GuestError::UnsupportedImports(names)) => {
                assert_eq!(names, vec!["env::host_log", "wasi_snapshot_preview1::sock_accept"]);
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }
}
