//! Chained execution: `a | b | c`.
//!
//! The token sequence is validated and split into stages before anything is
//! created.  Then `K - 1` pipes are allocated, every stage is forked with its
//! assignment, the parent closes every handle it holds, and all children are
//! waited for.  The chain succeeds only if every stage did; otherwise the
//! status of the lowest-indexed failing stage is the chain's status.

use std::{
    io::{self, Write},
    os::fd::OwnedFd,
};

use crate::{
    assignment::{chain_assignments, chain_pipe_count},
    config::EngineConfig,
    error::Result,
    pipe_set::PipeSet,
    reap::{StageState, StageStatus},
    runner::CommandRunner,
    spawn::Spawner,
    tokenize::{split_stages, tokenize},
};

/// Outer boundary of a chain.  `None` inherits the caller's stdin/stdout;
/// a descriptor is handed to the first (stdin) or last (stdout) stage and
/// closed in the parent once every stage is running.
#[derive(Debug, Default)]
pub struct ChainIo {
    pub stdin: Option<OwnedFd>,
    pub stdout: Option<OwnedFd>,
}

impl ChainIo {
    pub fn inherit() -> Self {
        Self::default()
    }

    pub fn with_stdin(mut self, fd: OwnedFd) -> Self {
        self.stdin = Some(fd);
        self
    }

    pub fn with_stdout(mut self, fd: OwnedFd) -> Self {
        self.stdout = Some(fd);
        self
    }
}

/// Terminal state of every stage of one chain run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainReport {
    states: Vec<StageState>,
}

impl ChainReport {
    pub fn stages(&self) -> &[StageState] {
        &self.states
    }

    /// Lowest-indexed stage that did not succeed.
    pub fn first_failure(&self) -> Option<(usize, StageStatus)> {
        self.states
            .iter()
            .enumerate()
            .find_map(|(i, st)| st.status().filter(|s| !s.success()).map(|s| (i, s)))
    }

    pub fn success(&self) -> bool {
        self.first_failure().is_none()
    }

    /// Chain exit status: 0, or the first failing stage's status word.
    pub fn status(&self) -> i32 {
        self.first_failure().map_or(0, |(_, s)| s.code())
    }
}

/// Runs token sequences as pipelines, one child per stage.
#[derive(Debug)]
pub struct ChainExecutor<'a, R> {
    config: &'a EngineConfig,
    runner: R,
}

impl<'a, R: CommandRunner> ChainExecutor<'a, R> {
    pub fn new(config: &'a EngineConfig, runner: R) -> Self {
        Self { config, runner }
    }

    /// Tokenize `line` and run it with inherited stdin/stdout.
    pub fn run_line(&self, line: &str) -> Result<ChainReport> {
        self.run(&tokenize(line))
    }

    /// Run `tokens` with inherited stdin/stdout.
    pub fn run(&self, tokens: &[String]) -> Result<ChainReport> {
        self.run_with(tokens, ChainIo::default())
    }

    /// Run `tokens` with the chain's outer ends bound as `io` says.
    ///
    /// Validation errors are returned before any pipe or process exists.
    /// If a fork fails partway, no further stages are started; the ones
    /// already running are still waited for and the fork error is returned.
    pub fn run_with(&self, tokens: &[String], io: ChainIo) -> Result<ChainReport> {
        let stages = split_stages(tokens, &self.config.delimiter)?;
        let assignments =
            chain_assignments(stages.len(), io.stdin.is_some(), io.stdout.is_some())?;

        // Dropped after `pipes`, so every handle is closed before reaping.
        let mut spawner = Spawner::new(self.config);
        let mut pipes =
            PipeSet::allocate(chain_pipe_count(stages.len())?)?.with_boundary(io.stdin, io.stdout);
        log::debug!(
            "chain of {} stage(s) over {} pipe(s)",
            stages.len(),
            pipes.len()
        );

        let mut states = vec![StageState::NotSpawned; stages.len()];
        let mut spawn_err = None;
        for (stage, (argv, stage_io)) in stages.iter().zip(assignments).enumerate() {
            if self.config.xtrace {
                trace_stage(argv);
            }
            match spawner.spawn(stage, stage_io, &mut pipes, || self.runner.run(argv)) {
                Ok(pid) => states[stage] = StageState::Running(pid),
                Err(err) => {
                    log::warn!("stage {}: not started: {}", stage, err);
                    spawn_err = Some(err);
                    break;
                }
            }
        }

        let closed = pipes.close_all();
        let waited = spawner.wait_all();
        if let Some(err) = spawn_err {
            return Err(err);
        }
        closed?;
        for (stage, status) in waited? {
            if !status.success() {
                log::warn!("stage {} failed: {:?}", stage, status);
            }
            states[stage] = StageState::Terminated(status);
        }
        Ok(ChainReport { states })
    }
}

fn trace_stage(argv: &[String]) {
    let _ = writeln!(io::stderr(), "+ {}", argv.join(" "));
}
