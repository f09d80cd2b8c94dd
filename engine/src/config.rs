//! Engine configuration.
//!
//! Options that control how an invocation partitions its input and how many
//! children it may create.  Values come from `Default`, the builder-style
//! setters, or the process environment.

use std::env;

use crate::tokenize::PIPE_TOKEN;

/// Environment variable capping the children one invocation may fork.
pub const ENV_MAX_PROCS: &str = "PIPEWORK_MAX_PROCS";

/// Environment variable enabling stage tracing (`1`, `true`, `on`).
pub const ENV_XTRACE: &str = "PIPEWORK_XTRACE";

/// Options for a single engine instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Token that separates chain stages.
    pub delimiter: String,
    /// Upper bound on children forked by one invocation.  Spawning past it
    /// fails the same way a refused fork does.  `None` means no cap.
    pub max_processes: Option<usize>,
    /// Print each stage's argv to stderr before it is spawned (like `set -x`).
    pub xtrace: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            delimiter: String::from(PIPE_TOKEN),
            max_processes: None,
            xtrace: false,
        }
    }
}

impl EngineConfig {
    /// Build a configuration from the defaults plus the process environment.
    ///
    /// Unparseable values are ignored with a warning.
    pub fn from_env() -> Self {
        Self::default().apply_vars(|name| env::var(name).ok())
    }

    fn apply_vars(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(raw) = lookup(ENV_MAX_PROCS) {
            match raw.trim().parse::<usize>() {
                Ok(n) => self.max_processes = Some(n),
                Err(_) => log::warn!("ignoring {}={:?}: not a count", ENV_MAX_PROCS, raw),
            }
        }
        if let Some(raw) = lookup(ENV_XTRACE) {
            self.xtrace = matches!(
                raw.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "on" | "yes"
            );
        }
        self
    }

    pub fn with_delimiter(mut self, delimiter: impl Into<String>) -> Self {
        self.delimiter = delimiter.into();
        self
    }

    pub fn with_max_processes(mut self, max: usize) -> Self {
        self.max_processes = Some(max);
        self
    }

    pub fn with_xtrace(mut self, enable: bool) -> Self {
        self.xtrace = enable;
        self
    }

    /// Whether forking one more child would exceed the cap, given how many
    /// this invocation already created.
    pub fn at_process_limit(&self, spawned: usize) -> bool {
        self.max_processes.is_some_and(|max| spawned >= max)
    }
}
