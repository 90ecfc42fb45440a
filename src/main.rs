//! Procyard client: send one request to a socket worker

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::{anyhow, Context, Result};
use procyard::client::Endpoint;
use std::env;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::process;
use std::time::Duration;

fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        print_usage();
        return Ok(());
    }

    match args[1].as_str() {
        "send" => send(&args[2..]),
        "wait" => wait(&args[2..]),
        "-h" | "--help" => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Error: Unknown command '{}'", other);
            print_usage();
            process::exit(1);
        }
    }
}

fn parse_endpoint(kind: &str, target: &str) -> Result<Endpoint> {
    match kind {
        "unix" => Ok(Endpoint::Unix(PathBuf::from(target))),
        "tcp" => Ok(Endpoint::Tcp(target.to_string())),
        _ => Err(anyhow!("Unknown transport '{}', expected unix or tcp", kind)),
    }
}

/// `send (unix PATH | tcp HOST:PORT) [MESSAGE]`, reading stdin without MESSAGE
fn send(args: &[String]) -> Result<()> {
    let (endpoint, message) = match args {
        [kind, target] => (parse_endpoint(kind, target)?, None),
        [kind, target, message] => (parse_endpoint(kind, target)?, Some(message)),
        _ => {
            print_usage();
            process::exit(1);
        }
    };

    let payload = match message {
        Some(message) => message.clone().into_bytes(),
        None => {
            let mut buf = Vec::new();
            io::stdin()
                .read_to_end(&mut buf)
                .context("Failed to read request from stdin")?;
            buf
        }
    };

    let response = endpoint
        .request(&payload)
        .with_context(|| format!("Request to {} failed", endpoint))?;

    let mut stdout = io::stdout().lock();
    stdout.write_all(&response)?;
    if !response.ends_with(b"\n") {
        stdout.write_all(b"\n")?;
    }
    Ok(())
}

/// `wait (unix PATH | tcp HOST:PORT) [TIMEOUT_MS]`
fn wait(args: &[String]) -> Result<()> {
    let (endpoint, timeout_ms) = match args {
        [kind, target] => (parse_endpoint(kind, target)?, 5000),
        [kind, target, ms] => (
            parse_endpoint(kind, target)?,
            ms.parse::<u64>()
                .with_context(|| format!("Invalid timeout '{}'", ms))?,
        ),
        _ => {
            print_usage();
            process::exit(1);
        }
    };

    endpoint.wait_ready(Duration::from_millis(timeout_ms))?;
    println!("{} is ready", endpoint);
    Ok(())
}

fn print_usage() {
    println!("procyard - talk to procyard workers");
    println!();
    println!("USAGE:");
    println!("    procyard send unix <PATH> [MESSAGE]");
    println!("    procyard send tcp <HOST:PORT> [MESSAGE]");
    println!("    procyard wait (unix <PATH> | tcp <HOST:PORT>) [TIMEOUT_MS]");
    println!();
    println!("Without MESSAGE the request is read from stdin.");
}
