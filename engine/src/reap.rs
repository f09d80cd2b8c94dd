//! Child reaping.
//!
//! Every forked child is registered with a [`Reaper`] the moment `fork`
//! returns in the parent.  `wait_all` collects them in spawn order; the
//! guard's `Drop` waits for anything still outstanding, so an early return
//! on any error path cannot leave a zombie behind.

use std::io;

use nix::{
    errno::Errno,
    sys::wait::{waitpid, WaitStatus},
    unistd::Pid,
};

use crate::error::{EngineError, Result};

/// How a child terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageStatus {
    /// Exited normally with the given code.
    Exited(i32),
    /// Killed by the given signal.
    Signaled(i32),
}

impl StageStatus {
    pub fn success(&self) -> bool {
        matches!(self, StageStatus::Exited(0))
    }

    /// Shell-style status word: the exit code, or 128 + signal number.
    pub fn code(&self) -> i32 {
        match *self {
            StageStatus::Exited(code) => code,
            StageStatus::Signaled(sig) => 128 + sig,
        }
    }
}

/// Lifecycle of one stage.  Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageState {
    NotSpawned,
    Running(Pid),
    Terminated(StageStatus),
}

impl StageState {
    pub fn is_terminated(&self) -> bool {
        matches!(self, StageState::Terminated(_))
    }

    pub fn status(&self) -> Option<StageStatus> {
        match self {
            StageState::Terminated(st) => Some(*st),
            _ => None,
        }
    }
}

/// A child that has been forked but not yet waited for.
#[derive(Debug, Clone, Copy)]
struct Outstanding {
    stage: usize,
    pid: Pid,
}

/// Scoped owner of forked children.
#[derive(Debug, Default)]
pub struct Reaper {
    children: Vec<Outstanding>,
    spawned: usize,
}

impl Reaper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a freshly forked child.
    pub fn track(&mut self, stage: usize, pid: Pid) {
        self.children.push(Outstanding { stage, pid });
        self.spawned += 1;
    }

    /// Children forked over this reaper's lifetime.
    pub fn spawned(&self) -> usize {
        self.spawned
    }

    /// Children not yet waited for.
    pub fn outstanding(&self) -> usize {
        self.children.len()
    }

    /// Wait for every outstanding child, in spawn order.
    ///
    /// A failing `waitpid` does not stop the loop; every child is still
    /// waited for and the first error is returned afterwards.
    pub fn wait_all(&mut self) -> Result<Vec<(usize, StageStatus)>> {
        let mut statuses = Vec::with_capacity(self.children.len());
        let mut first_err = None;
        for child in std::mem::take(&mut self.children) {
            match wait_child(child.pid) {
                Ok(status) => {
                    log::debug!(
                        "stage {} (pid {}) terminated: {:?}",
                        child.stage,
                        child.pid,
                        status
                    );
                    statuses.push((child.stage, status));
                }
                Err(errno) => {
                    first_err.get_or_insert(EngineError::Wait {
                        stage: child.stage,
                        pid: child.pid.as_raw(),
                        source: io::Error::from(errno),
                    });
                }
            }
        }
        first_err.map_or(Ok(statuses), Err)
    }
}

impl Drop for Reaper {
    fn drop(&mut self) {
        for child in self.children.drain(..) {
            match wait_child(child.pid) {
                Ok(status) => log::debug!(
                    "reaped stage {} (pid {}) on unwind: {:?}",
                    child.stage,
                    child.pid,
                    status
                ),
                Err(errno) => log::warn!(
                    "could not reap stage {} (pid {}): {}",
                    child.stage,
                    child.pid,
                    errno
                ),
            }
        }
    }
}

/// Block until `pid` terminates.  Stops and continues are not terminal.
fn wait_child(pid: Pid) -> nix::Result<StageStatus> {
    loop {
        match waitpid(pid, None) {
            Ok(WaitStatus::Exited(_, code)) => return Ok(StageStatus::Exited(code)),
            Ok(WaitStatus::Signaled(_, sig, _)) => return Ok(StageStatus::Signaled(sig as i32)),
            Ok(_) => continue,
            Err(Errno::EINTR) => continue,
            Err(errno) => return Err(errno),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert!(StageStatus::Exited(0).success());
        assert!(!StageStatus::Exited(3).success());
        assert_eq!(StageStatus::Exited(3).code(), 3);
        assert_eq!(StageStatus::Signaled(9).code(), 137);
        assert!(!StageStatus::Signaled(13).success());
    }

    #[test]
    fn test_state_accessors() {
        assert!(!StageState::NotSpawned.is_terminated());
        assert_eq!(StageState::Running(Pid::from_raw(42)).status(), None);
        let done = StageState::Terminated(StageStatus::Exited(1));
        assert!(done.is_terminated());
        assert_eq!(done.status(), Some(StageStatus::Exited(1)));
    }

    #[test]
    fn test_empty_reaper() {
        let mut reaper = Reaper::new();
        assert_eq!(reaper.outstanding(), 0);
        assert!(reaper.wait_all().unwrap().is_empty());
    }
}
