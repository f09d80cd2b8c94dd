//! Process spawning.
//!
//! Forks one child per stage.  Inside the child, before any user code runs,
//! SIGPIPE goes back to its default action (the Rust runtime ignores it, and
//! an ignored SIGPIPE survives `exec`), every endpoint the stage does not own
//! is closed, the owned endpoints are `dup2`'d onto stdin/stdout, and the
//! originals are closed.  A reader only
//! sees EOF once every copy of its pipe's write end is gone, so these closes
//! are what keep a pipeline from hanging.
//!
//! The child never returns into the caller: it leaves through `_exit` with
//! the body's status, and setup failures or panics become non-zero statuses
//! that the parent observes through [`Reaper`].

use std::{
    fmt,
    io::{self, Write},
    os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd},
    panic::{self, AssertUnwindSafe},
};

use nix::{
    errno::Errno,
    fcntl::{fcntl, FcntlArg},
    libc,
    sys::signal::{signal, SigHandler, Signal},
    unistd::{self, fork, ForkResult, Pid},
};

use crate::{
    assignment::StageIo,
    config::EngineConfig,
    error::{EngineError, Result},
    pipe_set::{close_owned, Endpoint, PipeSet},
    reap::{Reaper, StageStatus},
};

/// Exit status of a child whose descriptor setup failed.
pub const SETUP_FAILURE_STATUS: i32 = 1;

/// Exit status of a child whose body panicked.
pub const PANIC_STATUS: i32 = 101;

const STDIN_FD: RawFd = 0;
const STDOUT_FD: RawFd = 1;
const STDERR_FD: RawFd = 2;

/// Forks stages and owns the resulting children until they are reaped.
#[derive(Debug)]
pub struct Spawner<'a> {
    config: &'a EngineConfig,
    reaper: Reaper,
}

impl<'a> Spawner<'a> {
    pub fn new(config: &'a EngineConfig) -> Self {
        Self {
            config,
            reaper: Reaper::new(),
        }
    }

    /// Children forked so far.
    pub fn spawned(&self) -> usize {
        self.reaper.spawned()
    }

    /// Fork stage `stage` with the given stdio assignment and run `body` in
    /// the child.
    ///
    /// `pipes` must already hold every endpoint of the invocation; the child
    /// closes its copy of each one it does not own.
    pub fn spawn<F>(&mut self, stage: usize, io: StageIo, pipes: &mut PipeSet, body: F) -> Result<Pid>
    where
        F: FnOnce() -> i32,
    {
        if self.config.at_process_limit(self.reaper.spawned()) {
            log::warn!(
                "stage {}: process limit of {:?} reached",
                stage,
                self.config.max_processes
            );
            return Err(EngineError::Fork {
                stage,
                source: io::Error::from(Errno::EAGAIN),
            });
        }

        // SAFETY: the child only closes and duplicates descriptors, runs
        // `body`, and leaves through `_exit`, so it never returns into the
        // caller's frames or runs the parent's destructors.
        match unsafe { fork() } {
            Err(errno) => Err(EngineError::Fork {
                stage,
                source: io::Error::from(errno),
            }),
            Ok(ForkResult::Parent { child }) => {
                self.reaper.track(stage, child);
                log::debug!("stage {}: forked pid {} ({:?})", stage, child, io);
                Ok(child)
            }
            Ok(ForkResult::Child) => {
                let status = match prepare_child(stage, io, pipes) {
                    Ok(()) => run_guarded(body),
                    Err(err) => {
                        child_diag(format_args!("{}", err));
                        SETUP_FAILURE_STATUS
                    }
                };
                let status = flush_stdout(status);
                // SAFETY: `_exit` ends the process without running atexit
                // handlers or unwinding, so none of the parent's state
                // copied into this child is finalized twice.
                unsafe { libc::_exit(status) }
            }
        }
    }

    /// Wait for every child forked so far, in spawn order.
    pub fn wait_all(&mut self) -> Result<Vec<(usize, StageStatus)>> {
        self.reaper.wait_all()
    }
}

fn prepare_child(stage: usize, io: StageIo, pipes: &mut PipeSet) -> Result<()> {
    restore_sigpipe(stage)?;
    redirect_stdio(stage, io, pipes)
}

/// Put SIGPIPE back to `SIG_DFL` so a writer whose reader has gone away is
/// terminated instead of spinning on `EPIPE`.
pub fn restore_sigpipe(stage: usize) -> Result<()> {
    // SAFETY: installs the default disposition; no handler function runs.
    unsafe { signal(Signal::SIGPIPE, SigHandler::SigDfl) }
        .map(drop)
        .map_err(|errno| EngineError::Signal {
            stage,
            source: io::Error::from(errno),
        })
}

/// Flush std's stdout buffer before `_exit`.  Output that could not be
/// delivered turns a successful status into a failure.
fn flush_stdout(status: i32) -> i32 {
    match io::stdout().flush() {
        Ok(()) => status,
        Err(err) => {
            child_diag(format_args!("stdout: {}", err));
            if status == 0 {
                SETUP_FAILURE_STATUS
            } else {
                status
            }
        }
    }
}

/// Child-side descriptor setup for one stage.
///
/// Closes every endpoint not assigned to the stage, lifts kept endpoints off
/// fds 0-2, then moves the assigned input onto fd 0 and the assigned output
/// onto fd 1.
pub fn redirect_stdio(stage: usize, io: StageIo, pipes: &mut PipeSet) -> Result<()> {
    let kept = io.kept_endpoints();
    pipes.close_all_except(&kept)?;
    for &ep in &kept {
        lift_off_stdio(stage, pipes, ep)?;
    }
    if let Some(ep) = io.input_endpoint() {
        install(stage, pipes, ep, STDIN_FD)?;
    }
    if let Some(ep) = io.output_endpoint() {
        install(stage, pipes, ep, STDOUT_FD)?;
    }
    Ok(())
}

/// An endpoint that landed on a stdio slot (the process started with one
/// closed) would be overwritten by the other end's `dup2`.  Move it to the
/// lowest free descriptor above 2.
fn lift_off_stdio(stage: usize, pipes: &mut PipeSet, ep: Endpoint) -> Result<()> {
    let Some(raw) = pipes.raw(ep) else {
        return Ok(());
    };
    if raw > STDERR_FD {
        return Ok(());
    }
    let lifted = fcntl(raw, FcntlArg::F_DUPFD_CLOEXEC(STDERR_FD + 1)).map_err(|errno| {
        EngineError::Dup {
            stage,
            target: raw,
            source: io::Error::from(errno),
        }
    })?;
    // SAFETY: `lifted` was just returned by F_DUPFD_CLOEXEC and has no
    // other owner.
    let lifted = unsafe { OwnedFd::from_raw_fd(lifted) };
    match pipes.replace(ep, lifted) {
        Ok(Some(old)) => close_owned(old).map_err(|errno| EngineError::Close {
            endpoint: ep,
            source: io::Error::from(errno),
        }),
        Ok(None) | Err(_) => Ok(()),
    }
}

fn install(stage: usize, pipes: &mut PipeSet, ep: Endpoint, target: RawFd) -> Result<()> {
    let Some(fd) = pipes.take(ep) else {
        return Err(EngineError::Dup {
            stage,
            target,
            source: io::Error::from(Errno::EBADF),
        });
    };
    unistd::dup2(fd.as_raw_fd(), target).map_err(|errno| EngineError::Dup {
        stage,
        target,
        source: io::Error::from(errno),
    })?;
    close_owned(fd).map_err(|errno| EngineError::Close {
        endpoint: ep,
        source: io::Error::from(errno),
    })
}

fn run_guarded<F: FnOnce() -> i32>(body: F) -> i32 {
    panic::catch_unwind(AssertUnwindSafe(body)).unwrap_or(PANIC_STATUS)
}

/// Write a diagnostic from inside a child straight to fd 2.
///
/// Goes through `io::stderr()` rather than `eprintln!` so output capture in
/// the parent (test harness) never swallows it.
pub fn child_diag(args: fmt::Arguments<'_>) {
    let _ = writeln!(io::stderr(), "pipework: {}", args);
}

#[cfg(test)]
mod tests {
    use std::{
        fs::{self, File},
        io::Read,
    };

    use super::*;
    use crate::assignment::{fan_out_worker, Sink, Source};

    #[test]
    fn test_child_status_is_observed() {
        let config = EngineConfig::default();
        let mut pipes = PipeSet::allocate(0).unwrap();
        let mut spawner = Spawner::new(&config);
        spawner
            .spawn(0, StageIo::INHERIT, &mut pipes, || 7)
            .unwrap();
        let statuses = spawner.wait_all().unwrap();
        assert_eq!(statuses, vec![(0, StageStatus::Exited(7))]);
    }

    #[test]
    fn test_panicking_body_exits_nonzero() {
        let config = EngineConfig::default();
        let mut pipes = PipeSet::allocate(0).unwrap();
        let mut spawner = Spawner::new(&config);
        spawner
            .spawn(0, StageIo::INHERIT, &mut pipes, || panic!("boom"))
            .unwrap();
        let statuses = spawner.wait_all().unwrap();
        assert_eq!(statuses[0].1, StageStatus::Exited(PANIC_STATUS));
    }

    #[test]
    fn test_output_is_redirected_into_pipe() {
        let config = EngineConfig::default();
        let mut pipes = PipeSet::allocate(1).unwrap();
        let mut spawner = Spawner::new(&config);
        spawner
            .spawn(0, fan_out_worker(0), &mut pipes, || {
                let mut out = io::stdout().lock();
                let _ = out.write_all(b"from child");
                0
            })
            .unwrap();
        pipes.close(Endpoint::Write(0)).unwrap();

        let mut reader = File::from(pipes.take(Endpoint::Read(0)).unwrap());
        let mut got = String::new();
        reader.read_to_string(&mut got).unwrap();
        assert_eq!(got, "from child");
        assert_eq!(spawner.wait_all().unwrap()[0].1, StageStatus::Exited(0));
    }

    #[test]
    fn test_process_limit_refuses_fork() {
        let config = EngineConfig::default().with_max_processes(1);
        let mut pipes = PipeSet::allocate(0).unwrap();
        let mut spawner = Spawner::new(&config);
        spawner
            .spawn(0, StageIo::INHERIT, &mut pipes, || 0)
            .unwrap();
        let err = spawner
            .spawn(1, StageIo::INHERIT, &mut pipes, || 0)
            .unwrap_err();
        assert!(matches!(err, EngineError::Fork { stage: 1, .. }));
        assert_eq!(spawner.spawned(), 1);
        assert_eq!(spawner.wait_all().unwrap().len(), 1);
    }

    #[test]
    fn test_writer_without_reader_dies_of_sigpipe() {
        let config = EngineConfig::default();
        let mut pipes = PipeSet::allocate(1).unwrap();
        pipes.close(Endpoint::Read(0)).unwrap();
        let mut spawner = Spawner::new(&config);
        spawner
            .spawn(0, fan_out_worker(0), &mut pipes, || loop {
                if io::stdout().write_all(b"y\n").is_err() {
                    return 3;
                }
            })
            .unwrap();
        drop(pipes);
        let statuses = spawner.wait_all().unwrap();
        assert_eq!(statuses[0].1, StageStatus::Signaled(Signal::SIGPIPE as i32));
    }

    #[test]
    fn test_undeliverable_stdout_fails_clean_exit() {
        let config = EngineConfig::default();
        let full: OwnedFd = File::options()
            .write(true)
            .open("/dev/full")
            .unwrap()
            .into();
        let mut pipes = PipeSet::allocate(0).unwrap().with_boundary(None, Some(full));
        let io = StageIo {
            input: Source::Inherit,
            output: Sink::Supplied,
        };
        let mut spawner = Spawner::new(&config);
        spawner
            .spawn(0, io, &mut pipes, || {
                // No newline: stays in the line buffer until the final flush.
                let _ = io::stdout().write_all(b"lost");
                0
            })
            .unwrap();
        drop(pipes);
        let statuses = spawner.wait_all().unwrap();
        assert_eq!(statuses[0].1, StageStatus::Exited(SETUP_FAILURE_STATUS));
    }

    #[test]
    fn test_endpoint_on_stdin_slot_is_lifted() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out");
        let config = EngineConfig::default();
        let mut outer = PipeSet::allocate(0).unwrap();
        let mut spawner = Spawner::new(&config);

        let target = dest.clone();
        spawner
            .spawn(0, StageIo::INHERIT, &mut outer, move || {
                // With fd 0 free, the output file opens on it.
                if unistd::close(STDIN_FD).is_err() {
                    return 10;
                }
                let Ok(file) = File::create(&target) else {
                    return 11;
                };
                if file.as_raw_fd() != STDIN_FD {
                    return 12;
                }
                let Ok(pipes) = PipeSet::allocate(1) else {
                    return 13;
                };
                let mut pipes = pipes.with_boundary(None, Some(file.into()));
                let Some(writer) = pipes.take(Endpoint::Write(0)) else {
                    return 14;
                };
                if File::from(writer).write_all(b"lifted").is_err() {
                    return 15;
                }
                let stage_io = StageIo {
                    input: Source::Pipe(0),
                    output: Sink::Supplied,
                };
                if redirect_stdio(1, stage_io, &mut pipes).is_err() {
                    return 16;
                }
                let mut buf = Vec::new();
                if io::stdin().read_to_end(&mut buf).is_err() {
                    return 17;
                }
                match io::stdout().write_all(&buf) {
                    Ok(()) => 0,
                    Err(_) => 18,
                }
            })
            .unwrap();
        let statuses = spawner.wait_all().unwrap();
        assert_eq!(statuses[0].1, StageStatus::Exited(0));
        assert_eq!(fs::read_to_string(&dest).unwrap(), "lifted");
    }
}
