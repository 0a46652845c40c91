//! wasi-farm CLI
//!
//! Commands:
//!   wasi-farm run <wasm>     - Run a WASI command against an in-memory farm
//!   wasi-farm layout         - Print the call-record layout and its fingerprint

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use farm_abi::layout::{
    ARENA_HEADER_LEN, CALL_IDLE, CALL_PENDING, CALL_SHUTDOWN, ERRNO_PARK_FAULT, ERRNO_UNSET,
    ERRNO_WORD, FD_WORD, FUNC_WORD, RECORD_WORDS, REPLY_KIND_WORD,
};
use farm_abi::{layout_fingerprint, FuncId};
use tracing_subscriber::EnvFilter;
use wasi_farm::vfs::{ConsoleIn, ConsoleOut, MemDir, MemFile, Node, OpenDirectory};
use wasi_farm::{Animal, Farm, FarmConfig};

#[derive(Parser)]
#[command(name = "wasi-farm")]
#[command(about = "Run WASI modules against a shared descriptor farm", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a WASI command module
    Run {
        /// Path to the WASM file
        wasm_file: PathBuf,

        /// Argument passed to the guest (repeatable)
        #[arg(long = "arg")]
        args: Vec<String>,

        /// Environment entry KEY=VALUE (repeatable)
        #[arg(long = "env")]
        env: Vec<String>,

        /// Copy a host file into the guest root: GUEST=HOST (repeatable)
        #[arg(long = "file")]
        files: Vec<String>,

        /// Farm config as JSON
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Print the call-record layout
    Layout {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            wasm_file,
            args,
            env,
            files,
            config,
        } => {
            let code = run_command(&wasm_file, args, env, &files, config.as_deref())?;
            std::process::exit(code);
        }
        Commands::Layout { json } => layout_command(json),
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<FarmConfig> {
    let Some(path) = path else {
        return Ok(FarmConfig::new(
            wasi_farm::config::DEFAULT_ARENA_SIZE,
            wasi_farm::config::DEFAULT_MAX_SLOTS,
        ));
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let config = FarmConfig::from_json(&text)
        .with_context(|| format!("Failed to parse {}", path.display()))?;
    config.validate()?;
    Ok(config)
}

/// Place the host file `host` at `guest` under `root`, creating directories.
fn add_file(root: &MemDir, entry: &str) -> anyhow::Result<()> {
    let (guest, host) = entry
        .split_once('=')
        .ok_or_else(|| anyhow::anyhow!("--file expects GUEST=HOST, got {entry}"))?;
    let data = std::fs::read(host).with_context(|| format!("Failed to read {host}"))?;
    let mut parts: Vec<&str> = guest.split('/').filter(|p| !p.is_empty()).collect();
    let name = parts
        .pop()
        .ok_or_else(|| anyhow::anyhow!("--file guest path is empty"))?;
    let mut dir = None::<std::sync::Arc<MemDir>>;
    for part in parts {
        let parent: &MemDir = dir.as_deref().unwrap_or(root);
        let next = match parent.get(part) {
            Some(Node::Dir(existing)) => existing,
            Some(Node::File(_)) => anyhow::bail!("{part} in {guest} is a file"),
            None => {
                let created = MemDir::new();
                parent.insert(part, Node::Dir(created.clone()));
                created
            }
        };
        dir = Some(next);
    }
    let parent: &MemDir = dir.as_deref().unwrap_or(root);
    parent.insert(name, Node::File(MemFile::new(data)));
    Ok(())
}

fn run_command(
    wasm_file: &Path,
    args: Vec<String>,
    env: Vec<String>,
    files: &[String],
    config: Option<&Path>,
) -> anyhow::Result<i32> {
    let wasm = std::fs::read(wasm_file)
        .with_context(|| format!("Failed to read {}", wasm_file.display()))?;
    let config = load_config(config)?;

    let root = MemDir::new();
    for entry in files {
        add_file(&root, entry)?;
    }

    let farm = Farm::builder(config)
        .stdin(ConsoleIn::stdin())
        .stdout(ConsoleOut::stdout())
        .stderr(ConsoleOut::stderr())
        .fd(OpenDirectory::preopen("/", root))
        .build()?;

    let program = wasm_file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "main.wasm".into());
    let mut builder = Animal::builder()
        .farm(farm.get_ref())
        .arg(program)
        .args(args);
    for entry in env {
        builder = builder.env(entry);
    }
    let animal = builder.build()?;

    let engine = wasmtime::Engine::default();
    let code = wasi_farm::guest::run_module(&engine, &wasm, animal)?;
    farm.shutdown();
    Ok(code)
}

fn layout_command(json: bool) -> anyhow::Result<()> {
    let fingerprint = layout_fingerprint().to_hex();
    if json {
        let funcs: Vec<_> = FuncId::ALL
            .iter()
            .map(|f| serde_json::json!({ "id": *f as u32, "name": f.name() }))
            .collect();
        let layout = serde_json::json!({
            "fingerprint": fingerprint,
            "record_words": RECORD_WORDS,
            "words": {
                "func": FUNC_WORD,
                "fd": FD_WORD,
                "reply_kind": REPLY_KIND_WORD,
                "errno": ERRNO_WORD,
            },
            "errno_unset": ERRNO_UNSET,
            "errno_park_fault": ERRNO_PARK_FAULT,
            "call": { "idle": CALL_IDLE, "pending": CALL_PENDING, "shutdown": CALL_SHUTDOWN },
            "arena_header_len": ARENA_HEADER_LEN,
            "functions": funcs,
        });
        println!("{}", serde_json::to_string_pretty(&layout)?);
        return Ok(());
    }

    println!("Call record: {RECORD_WORDS} words");
    println!("  word {FUNC_WORD:>2}  function id");
    println!("  word {FD_WORD:>2}  descriptor");
    println!("  word {REPLY_KIND_WORD:>2}  reply kind");
    println!("  word {ERRNO_WORD:>2}  errno ({ERRNO_UNSET} unset, {ERRNO_PARK_FAULT} park fault)");
    println!("Call word: {CALL_IDLE} idle, {CALL_PENDING} pending, {CALL_SHUTDOWN} shutdown");
    println!("Arena header: {ARENA_HEADER_LEN} bytes");
    println!();
    println!("Functions:");
    for f in FuncId::ALL {
        println!("  {:>3}  {}", f as u32, f.name());
    }
    println!();
    println!("Fingerprint: {fingerprint}");
    Ok(())
}
