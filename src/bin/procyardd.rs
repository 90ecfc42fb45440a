//! Procyard daemon binary
//!
//! Spawns the workers declared in the configuration and supervises them
//! until it is told to stop.

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::{Context, Result};
use nix::sys::signal::Signal;
use procyard::logging::{self, LogConfig};
use procyard::signal::ShutdownFlag;
use procyard::{ProcessSupervisor, SupervisorConfig, WorkerRegistry};
use std::env;
use std::path::PathBuf;
use std::process;
use std::thread;
use std::time::Duration;
use tracing::{error, info};

/// How often exited workers are collected
const REAP_INTERVAL: Duration = Duration::from_millis(100);

fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        print_usage();
        return Ok(());
    }

    let command = &args[1];

    match command.as_str() {
        "start" => start(parse_config_flag(&args[2..])?),
        "config" => show_config(parse_config_flag(&args[2..])?),
        "-h" | "--help" => {
            print_usage();
            Ok(())
        }
        _ => {
            eprintln!("Error: Unknown command '{}'", command);
            print_usage();
            process::exit(1);
        }
    }
}

fn parse_config_flag(args: &[String]) -> Result<Option<PathBuf>> {
    match args {
        [] => Ok(None),
        [flag, path] if flag == "--config" => Ok(Some(PathBuf::from(path))),
        _ => {
            print_usage();
            process::exit(1);
        }
    }
}

fn load_config(path: Option<PathBuf>) -> Result<SupervisorConfig> {
    match path {
        Some(path) => SupervisorConfig::from_file(&path)
            .with_context(|| format!("Failed to read config {}", path.display())),
        None => Ok(SupervisorConfig::from_procyardrc()),
    }
}

fn start(config_path: Option<PathBuf>) -> Result<()> {
    logging::init(LogConfig::new().with_env_overrides());

    let config = load_config(config_path)?;
    let shutdown = ShutdownFlag::install().context("Failed to install signal handlers")?;
    let registry = WorkerRegistry::with_builtin_handlers();
    let mut supervisor =
        ProcessSupervisor::new(config.clone()).context("Failed to create supervisor")?;

    info!(
        pid = process::id(),
        workers = config.workers.len(),
        capacity = config.max_processes,
        "procyardd starting"
    );

    for spec in &config.workers {
        match registry.spawn(&mut supervisor, &spec.handler, spec.transport, spec.args.clone()) {
            Ok(worker) => info!(
                name = %spec.name,
                pid = worker.pid,
                transport = %worker.transport,
                socket_path = ?worker.socket_path,
                port = ?worker.port,
                "worker started"
            ),
            Err(e) => error!(name = %spec.name, error = %e, "failed to start worker"),
        }
    }

    while !shutdown.is_requested() {
        supervisor.reap_exited();
        thread::sleep(REAP_INTERVAL);
    }

    info!(reason = shutdown.signal_name(), "procyardd shutting down");
    let signalled = supervisor.shutdown_all(Signal::SIGTERM);
    let reaped = supervisor.wait_all();
    info!(signalled, reaped, "procyardd stopped");

    Ok(())
}

fn show_config(config_path: Option<PathBuf>) -> Result<()> {
    let config = load_config(config_path)?;

    println!("max processes:      {}", config.max_processes);
    println!("poll interval:      {:?}", config.poll_interval);
    println!("handshake timeout:  {:?}", config.handshake_timeout);
    println!("read timeout:       {:?}", config.read_timeout);
    println!("socket dir:         {}", config.socket_dir.display());
    println!("tcp host:           {}", config.tcp_host);
    println!("fault policy:       {}", config.fault_policy);

    if config.workers.is_empty() {
        println!("workers:            (none)");
    }
    for spec in &config.workers {
        let args = serde_json::to_string(&spec.args)?;
        println!("worker {}: {}:{} {}", spec.name, spec.transport, spec.handler, args);
    }

    Ok(())
}

fn print_usage() {
    println!("procyardd - process-per-worker supervisor");
    println!();
    println!("USAGE:");
    println!("    procyardd <COMMAND> [--config PATH]");
    println!();
    println!("COMMANDS:");
    println!("    start     Spawn the configured workers and supervise them");
    println!("    config    Print the resolved configuration");
    println!();
    println!("The configuration defaults to ~/.procyardrc.");
}
