use std::{fs, path::PathBuf, process::exit};

use anyhow::{Context, Result};
use clap::Parser;
use modelsplit::Trace;
use tracing_subscriber::EnvFilter;

/// Parses and validates every `*.json` trace in a directory.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// The path to the directory containing trace files.
    #[arg(short, long)]
    path: String,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let args = Args::parse();

    let path = PathBuf::from(args.path);

    if !path.is_dir() {
        eprintln!("Error: Path must be a directory.");
        exit(1);
    }

    let mut all_ok = true;

    for entry in fs::read_dir(path).context("Failed to read directory")? {
        let entry = entry.context("Failed to read directory entry")?;
        let file_path = entry.path();

        if file_path.is_file() && file_path.extension().is_some_and(|ext| ext == "json") {
            println!("Parsing file: {}", file_path.display());

            match Trace::from_path(&file_path).and_then(|trace| trace.validate().map(|_| trace)) {
                Ok(trace) => {
                    println!(
                        "  Successfully parsed: {} inputs, {} ops, {} outputs.",
                        trace.inputs.len(),
                        trace.ops.len(),
                        trace.outputs.len()
                    );
                }
                Err(e) => {
                    eprintln!("  Error parsing file: {:?}", e);
                    all_ok = false;
                }
            }
        }
    }

    if !all_ok {
        exit(1);
    }

    Ok(())
}
