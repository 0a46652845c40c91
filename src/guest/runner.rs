use anyhow::Context;
use tracing::info;
use wasmtime::{Engine, Linker, Module, Store};

use super::imports::check_imports;
use super::linker::{add_to_linker, GuestState, ProcExit};
use crate::animal::Animal;

/// Instantiate `wasm` against `animal` and run its `_start` export.
///
/// Returns the exit code: 0 when `_start` returns, or the value passed to
/// `proc_exit`. Any other trap is an error.
pub fn run_module(engine: &Engine, wasm: &[u8], animal: Animal) -> anyhow::Result<i32> {
    check_imports(wasm)?;
    let module = Module::new(engine, wasm).context("compiling module")?;
    let mut linker = Linker::new(engine);
    add_to_linker(&mut linker)?;
    let mut store = Store::new(engine, GuestState::new(animal));
    let instance = linker
        .instantiate(&mut store, &module)
        .context("instantiating module")?;
    let start = instance
        .get_typed_func::<(), ()>(&mut store, "_start")
        .context("module has no `_start` export")?;
    let code = match start.call(&mut store, ()) {
        Ok(()) => 0,
        Err(e) => match e.downcast_ref::<ProcExit>() {
            Some(exit) => exit.0,
            None => return Err(e),
        },
    };
    info!(code, "guest finished");
    Ok(code)
}
