//! Error types for pipework.
//!
//! Defines the central `EngineError` enum and `Result` type alias used
//! throughout the engine.  Every variant that concerns a particular child
//! carries its stage (chain) or worker (fan-out) index so diagnostics can
//! name the process that failed.

use std::io;

use thiserror::Error;

use crate::pipe_set::Endpoint;

/// Central error type for all engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The token sequence contained no command at all.
    #[error("syntax error: empty command line")]
    EmptyPipeline,
    /// A pipe delimiter was first, last, or next to another delimiter.
    #[error("syntax error near token {position}: {reason}")]
    Topology {
        position: usize,
        reason: &'static str,
    },
    /// A single stage could not be parsed (redirection without a target).
    #[error("syntax error: {0}")]
    Syntax(String),
    /// Pipe creation failed.
    #[error("pipe: failed to create pipe {index}: {source}")]
    Pipe { index: usize, source: io::Error },
    /// Fork failed, or the per-invocation process cap was reached.
    #[error("fork: failed to create child process for stage {stage}: {source}")]
    Fork { stage: usize, source: io::Error },
    /// Restoring a child's default signal disposition failed.
    #[error("signal: stage {stage} could not reset SIGPIPE: {source}")]
    Signal { stage: usize, source: io::Error },
    /// dup2 onto stdin/stdout failed inside a child.
    #[error("dup2: stage {stage} could not redirect fd {target}: {source}")]
    Dup {
        stage: usize,
        target: i32,
        source: io::Error,
    },
    /// Closing a pipe endpoint failed.
    #[error("close: {endpoint}: {source}")]
    Close {
        endpoint: Endpoint,
        source: io::Error,
    },
    /// Reading a worker's result buffer failed.
    #[error("read: worker {worker}: {source}")]
    Read { worker: usize, source: io::Error },
    /// A worker's result buffer arrived incomplete.
    #[error("read: worker {worker}: short read ({got} of {expected} bytes)")]
    ShortRead {
        worker: usize,
        got: usize,
        expected: usize,
    },
    /// Writing a worker's result buffer failed.
    #[error("write: worker {worker}: {source}")]
    Write { worker: usize, source: io::Error },
    /// A worker could not read its input unit.
    #[error("worker {worker}: {path}: {source}")]
    Input {
        worker: usize,
        path: String,
        source: io::Error,
    },
    /// A worker terminated unsuccessfully.
    #[error("worker {worker} exited with status {status}")]
    WorkerFailed { worker: usize, status: i32 },
    /// waitpid failed for a spawned child.
    #[error("wait: failed to reap stage {stage} (pid {pid}): {source}")]
    Wait {
        stage: usize,
        pid: i32,
        source: io::Error,
    },
}

impl EngineError {
    /// Whether this error was raised while validating input, before any
    /// process or pipe existed.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            EngineError::EmptyPipeline | EngineError::Topology { .. } | EngineError::Syntax(_)
        )
    }
}

/// Result type alias for engine operations.
pub type Result<T> = core::result::Result<T, EngineError>;
