//! Stage-to-endpoint assignment.
//!
//! Pure mapping from a stage (chain) or worker (fan-out) index to the pipe
//! endpoints it reads from and writes to.  Nothing here touches a
//! descriptor; the spawner turns a [`StageIo`] into closes and `dup2`s.

use crate::{
    error::{EngineError, Result},
    pipe_set::Endpoint,
};

/// Where a stage's standard input comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    /// The process's own stdin, untouched.
    Inherit,
    /// Read end of pipe `n`.
    Pipe(usize),
    /// The descriptor the caller supplied as the chain's stdin.
    Supplied,
}

/// Where a stage's standard output goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sink {
    /// The process's own stdout, untouched.
    Inherit,
    /// Write end of pipe `n`.
    Pipe(usize),
    /// The descriptor the caller supplied as the chain's stdout.
    Supplied,
}

/// Input and output of one stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageIo {
    pub input: Source,
    pub output: Sink,
}

impl StageIo {
    /// Both ends inherited: a lone command.
    pub const INHERIT: StageIo = StageIo {
        input: Source::Inherit,
        output: Sink::Inherit,
    };

    /// The endpoint this stage reads, if any.
    pub fn input_endpoint(&self) -> Option<Endpoint> {
        match self.input {
            Source::Inherit => None,
            Source::Pipe(i) => Some(Endpoint::Read(i)),
            Source::Supplied => Some(Endpoint::SuppliedStdin),
        }
    }

    /// The endpoint this stage writes, if any.
    pub fn output_endpoint(&self) -> Option<Endpoint> {
        match self.output {
            Sink::Inherit => None,
            Sink::Pipe(i) => Some(Endpoint::Write(i)),
            Sink::Supplied => Some(Endpoint::SuppliedStdout),
        }
    }

    /// Endpoints the stage keeps open; everything else is closed in its child.
    pub fn kept_endpoints(&self) -> Vec<Endpoint> {
        self.input_endpoint()
            .into_iter()
            .chain(self.output_endpoint())
            .collect()
    }
}

/// Number of pipes a chain of `stages` stages needs.
pub fn chain_pipe_count(stages: usize) -> Result<usize> {
    stages.checked_sub(1).ok_or(EngineError::EmptyPipeline)
}

/// Assignment for stage `stage` of a `stages`-long chain.
///
/// Stage `i` reads pipe `i - 1` unless it is first and writes pipe `i`
/// unless it is last.
pub fn chain_stage(stage: usize, stages: usize) -> Result<StageIo> {
    if stages == 0 {
        return Err(EngineError::EmptyPipeline);
    }
    if stage >= stages {
        return Err(EngineError::Topology {
            position: stage,
            reason: "stage index past the end of the chain",
        });
    }
    let input = if stage == 0 {
        Source::Inherit
    } else {
        Source::Pipe(stage - 1)
    };
    let output = if stage == stages - 1 {
        Sink::Inherit
    } else {
        Sink::Pipe(stage)
    };
    Ok(StageIo { input, output })
}

/// Assignments for every stage of a chain, with the outer ends optionally
/// bound to caller-supplied descriptors.
pub fn chain_assignments(
    stages: usize,
    supplied_stdin: bool,
    supplied_stdout: bool,
) -> Result<Vec<StageIo>> {
    let mut all = (0..stages)
        .map(|i| chain_stage(i, stages))
        .collect::<Result<Vec<_>>>()?;
    if all.is_empty() {
        return Err(EngineError::EmptyPipeline);
    }
    if supplied_stdin {
        all[0].input = Source::Supplied;
    }
    if supplied_stdout {
        all[stages - 1].output = Sink::Supplied;
    }
    Ok(all)
}

/// Assignment for fan-out worker `worker`: it owns pipe `worker`'s write end
/// and reads its unit from a named file, never from a pipe.
pub fn fan_out_worker(worker: usize) -> StageIo {
    StageIo {
        input: Source::Inherit,
        output: Sink::Pipe(worker),
    }
}
