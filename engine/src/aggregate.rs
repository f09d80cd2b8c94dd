//! Fan-out execution and result aggregation.
//!
//! One worker per input unit.  Each worker computes a [`Histogram`] and
//! writes it to its own pipe in a single `write`.  The parent closes every
//! write end, performs one read of [`HISTOGRAM_WIRE_SIZE`] bytes per worker
//! in index order, sums into the aggregate, and finally reaps every worker.
//! A short or failed read aborts the invocation: a partial buffer cannot be
//! interpreted.

use std::{
    fs::File,
    io::{self, Read, Write},
    os::fd::AsFd,
    path::Path,
};

use crate::{
    assignment::fan_out_worker,
    config::EngineConfig,
    error::{EngineError, Result},
    histogram::{count_word_lengths, Histogram, HISTOGRAM_WIRE_SIZE},
    pipe_set::{close_owned, Endpoint, PipeSet},
    spawn::{child_diag, Spawner},
};

/// Status of a worker that could not produce or send its result.
pub const WORKER_FAILURE_STATUS: i32 = 1;

/// Word-length histogram over all `paths`, one worker process per path.
///
/// Zero paths yield an all-zero histogram without spawning anything.
pub fn aggregate_word_lengths<P: AsRef<Path>>(paths: &[P], config: &EngineConfig) -> Result<Histogram> {
    run_fan_out(paths, config, |worker, path| {
        let path = path.as_ref();
        count_word_lengths(path).map_err(|source| EngineError::Input {
            worker,
            path: path.display().to_string(),
            source,
        })
    })
}

/// Run `compute` for every unit in its own child and sum the results.
///
/// `compute` runs only in the children; its error is printed there and turns
/// into a non-zero worker status, which the parent sees as a short read.
pub fn run_fan_out<U, F>(units: &[U], config: &EngineConfig, compute: F) -> Result<Histogram>
where
    F: Fn(usize, &U) -> Result<Histogram>,
{
    if units.is_empty() {
        return Ok(Histogram::new());
    }

    // Declared before the pipes so it drops after them: on an early return
    // the read ends are closed before the workers are waited for.
    let mut spawner = Spawner::new(config);
    let mut pipes = PipeSet::allocate(units.len())?;

    for (worker, unit) in units.iter().enumerate() {
        spawner.spawn(worker, fan_out_worker(worker), &mut pipes, || {
            worker_main(worker, unit, &compute)
        })?;
    }

    pipes.close_write_ends()?;

    let mut total = Histogram::new();
    for worker in 0..units.len() {
        let hist = read_result(&mut pipes, worker)?;
        log::debug!("worker {}: {} words", worker, hist.total());
        total.accumulate(&hist);
    }

    for (worker, status) in spawner.wait_all()? {
        if !status.success() {
            return Err(EngineError::WorkerFailed {
                worker,
                status: status.code(),
            });
        }
    }
    Ok(total)
}

/// Child body: compute, then send the histogram down stdout (the worker's
/// pipe) in exactly one write.
fn worker_main<U, F>(worker: usize, unit: &U, compute: &F) -> i32
where
    F: Fn(usize, &U) -> Result<Histogram>,
{
    let hist = match compute(worker, unit) {
        Ok(hist) => hist,
        Err(err) => {
            child_diag(format_args!("{}", err));
            return WORKER_FAILURE_STATUS;
        }
    };
    match send_result(worker, &hist) {
        Ok(()) => 0,
        Err(err) => {
            child_diag(format_args!("{}", err));
            WORKER_FAILURE_STATUS
        }
    }
}

/// Write `hist` to fd 1 with a single unbuffered `write`.
pub fn send_result(worker: usize, hist: &Histogram) -> Result<()> {
    let wire = hist.to_wire();
    let write_err = |source| EngineError::Write { worker, source };
    let mut out = io::stdout()
        .as_fd()
        .try_clone_to_owned()
        .map(File::from)
        .map_err(write_err)?;
    let n = out.write(&wire).map_err(write_err)?;
    if n != wire.len() {
        return Err(write_err(io::Error::new(
            io::ErrorKind::WriteZero,
            format!("wrote {} of {} bytes", n, wire.len()),
        )));
    }
    Ok(())
}

/// One blocking read of a full result buffer from worker `worker`, then
/// close its read end.
pub fn read_result(pipes: &mut PipeSet, worker: usize) -> Result<Histogram> {
    let fd = pipes.take(Endpoint::Read(worker)).ok_or_else(|| EngineError::Read {
        worker,
        source: io::Error::from_raw_os_error(nix::libc::EBADF),
    })?;
    let mut reader = File::from(fd);
    let mut buf = [0u8; HISTOGRAM_WIRE_SIZE];
    let got = loop {
        match reader.read(&mut buf) {
            Ok(n) => break n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(source) => return Err(EngineError::Read { worker, source }),
        }
    };
    close_owned(reader.into()).map_err(|errno| EngineError::Close {
        endpoint: Endpoint::Read(worker),
        source: errno.into(),
    })?;
    if got != HISTOGRAM_WIRE_SIZE {
        return Err(EngineError::ShortRead {
            worker,
            got,
            expected: HISTOGRAM_WIRE_SIZE,
        });
    }
    Histogram::from_wire(&buf).ok_or(EngineError::ShortRead {
        worker,
        got,
        expected: HISTOGRAM_WIRE_SIZE,
    })
}
