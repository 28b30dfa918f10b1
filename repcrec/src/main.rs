//! Line-oriented driver around the transaction engine: read operations from
//! a file (or stdin), feed them to the manager one per tick, and keep
//! pumping empty ticks after the input ends until the retry queue drains.

use std::fs;
use std::io::Read;
use std::path::PathBuf;

use clap::Parser;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use repcrec::{Op, StdoutSink, TransactionManager};

/// Replicated transaction engine: available-copies two-phase locking with
/// multi-version snapshot reads.
#[derive(Debug, Parser)]
#[command(name = "repcrec", version, about)]
struct Args {
    /// Input file with one operation per line; reads stdin when omitted.
    input: Option<PathBuf>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Reports go to stdout, diagnostics to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let text = match &args.input {
        Some(path) => fs::read_to_string(path)?,
        None => {
            let mut buffer = String::new();
            std::io::stdin().read_to_string(&mut buffer)?;
            buffer
        }
    };

    let ops = text.lines().filter_map(|line| {
        let line = line.trim();
        if line.is_empty() || line.starts_with("//") {
            return None;
        }
        match line.parse::<Op>() {
            Ok(op) => Some(op),
            Err(err) => {
                warn!(%err, line, "skipping malformed operation");
                None
            }
        }
    });

    let mut engine = TransactionManager::new(StdoutSink);
    engine.run(ops);
    Ok(())
}
