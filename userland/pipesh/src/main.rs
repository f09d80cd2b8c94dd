//! pipesh -- minimal pipeline shell
//!
//! Runs `cmd | cmd | ...` lines with one process per stage.  Tokens are
//! whitespace separated; `<`, `>` and `>>` redirect a single stage.  With
//! `-c LINE` one line is run, otherwise lines are read from stdin until EOF
//! or `exit`.  The exit status is that of the last line run.

use std::{io, process::ExitCode};

use anyhow::{Context, Result};
use clap::Parser;
use pipework::{ChainExecutor, CommandRunner, EngineConfig, ExecRunner};

/// Status for a line that could not be parsed into a chain.
const SYNTAX_STATUS: i32 = 2;
/// Status for a line whose chain could not be set up.
const ENGINE_FAILURE_STATUS: i32 = 1;

#[derive(Parser, Debug)]
#[command(name = "pipesh")]
#[command(about = "Run pipelines of external commands")]
struct Args {
    /// Run LINE and exit instead of reading commands from stdin
    #[arg(short = 'c', value_name = "LINE")]
    command: Option<String>,
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();

    let config = EngineConfig::from_env();
    let exec = ChainExecutor::new(&config, ExecRunner);

    let status = match args.command {
        Some(line) => run_line(&exec, &line),
        None => match run_stdin(&exec) {
            Ok(status) => status,
            Err(err) => {
                eprintln!("pipesh: {:#}", err);
                ENGINE_FAILURE_STATUS
            }
        },
    };
    ExitCode::from((status & 0xff) as u8)
}

/// Run one line and return its status.  Blank lines succeed.
fn run_line<R: CommandRunner>(exec: &ChainExecutor<'_, R>, line: &str) -> i32 {
    if line.trim().is_empty() {
        return 0;
    }
    match exec.run_line(line) {
        Ok(report) => report.status(),
        Err(err) => {
            eprintln!("pipesh: {}", err);
            if err.is_validation() {
                SYNTAX_STATUS
            } else {
                ENGINE_FAILURE_STATUS
            }
        }
    }
}

fn run_stdin<R: CommandRunner>(exec: &ChainExecutor<'_, R>) -> Result<i32> {
    let stdin = io::stdin();
    let mut last = 0;
    let mut line = String::new();
    loop {
        line.clear();
        if stdin.read_line(&mut line).context("failed to read command")? == 0 {
            break;
        }
        let cmd = line.trim();
        if cmd == "exit" {
            break;
        }
        if cmd.is_empty() {
            continue;
        }
        last = run_line(exec, cmd);
    }
    Ok(last)
}
