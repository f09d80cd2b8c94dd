//! pipework -- multi-process pipe topologies
//!
//! Two shapes are supported, both built from one child process per unit of
//! work connected by anonymous pipes:
//!
//! - **fan-out / aggregate**: N workers each compute a fixed-size
//!   [`Histogram`] and send it to the parent over their own pipe; the parent
//!   reads them in order and sums them ([`aggregate_word_lengths`],
//!   [`run_fan_out`]).
//! - **chain**: `a | b | c`, each stage's stdout feeding the next stage's
//!   stdin ([`ChainExecutor`]).
//!
//! Every descriptor lives in a [`PipeSet`] arena and is closed explicitly;
//! every child is owned by a reaper that waits for it on every return path.

pub mod aggregate;
pub mod assignment;
pub mod chain;
pub mod config;
pub mod error;
pub mod histogram;
pub mod pipe_set;
pub mod reap;
pub mod runner;
pub mod spawn;
pub mod tokenize;

pub use aggregate::{aggregate_word_lengths, run_fan_out};
pub use chain::{ChainExecutor, ChainIo, ChainReport};
pub use config::EngineConfig;
pub use error::{EngineError, Result};
pub use histogram::{Histogram, HISTOGRAM_WIRE_SIZE, MAX_WORD_LEN};
pub use pipe_set::{Endpoint, PipeSet};
pub use reap::{StageState, StageStatus};
pub use runner::{CommandRunner, ExecRunner};
pub use tokenize::tokenize;
