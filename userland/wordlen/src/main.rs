//! par-word-lengths -- parallel word-length histogram
//!
//! Counts whitespace-delimited words by length across every file named on
//! the command line, one worker process per file, and prints the summed
//! histogram.  With no files it prints nothing.

use std::{
    io::{self, Write},
    path::PathBuf,
    process::ExitCode,
};

use anyhow::{Context, Result};
use clap::Parser;
use pipework::{aggregate_word_lengths, EngineConfig, Histogram};

#[derive(Parser, Debug)]
#[command(name = "par-word-lengths")]
#[command(about = "Histogram of word lengths across files, one process per file")]
struct Args {
    /// Files to count
    files: Vec<PathBuf>,
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("par-word-lengths: {:#}", err);
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> Result<()> {
    let config = EngineConfig::from_env();
    let Some(total) = totals(&args.files, &config)? else {
        return Ok(());
    };

    let mut out = io::stdout().lock();
    write!(out, "{}", total).context("failed to write totals")?;
    out.flush().context("failed to write totals")?;
    Ok(())
}

/// Aggregate histogram over `files`, or `None` when there is nothing to count.
fn totals(files: &[PathBuf], config: &EngineConfig) -> Result<Option<Histogram>> {
    if files.is_empty() {
        return Ok(None);
    }
    log::debug!("counting {} file(s)", files.len());
    let total = aggregate_word_lengths(files, config)?;
    Ok(Some(total))
}
