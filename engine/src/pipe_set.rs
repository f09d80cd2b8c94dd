//! Pipe endpoint arena.
//!
//! A `PipeSet` owns every pipe endpoint one engine invocation creates, plus
//! the optional caller-supplied descriptors that bound a chain.  Endpoints
//! are addressed by [`Endpoint`] instead of raw descriptor arithmetic, so
//! "close everything except mine" is a bounds-checked walk over the arena.
//!
//! Every endpoint is closed exactly once: either explicitly through
//! [`PipeSet::close`] (which reports errors) or when the set is dropped.

use std::{
    fmt,
    os::fd::{AsFd, AsRawFd, BorrowedFd, IntoRawFd, OwnedFd, RawFd},
};

use nix::unistd;

use crate::error::{EngineError, Result};

/// One endpoint in a [`PipeSet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    /// Read end of pipe `n`.
    Read(usize),
    /// Write end of pipe `n`.
    Write(usize),
    /// Descriptor supplied by the caller as the chain's stdin.
    SuppliedStdin,
    /// Descriptor supplied by the caller as the chain's stdout.
    SuppliedStdout,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Read(i) => write!(f, "pipe {} read end", i),
            Endpoint::Write(i) => write!(f, "pipe {} write end", i),
            Endpoint::SuppliedStdin => write!(f, "supplied stdin"),
            Endpoint::SuppliedStdout => write!(f, "supplied stdout"),
        }
    }
}

/// Both ends of one OS pipe.
#[derive(Debug)]
struct PipePair {
    read: Option<OwnedFd>,
    write: Option<OwnedFd>,
}

/// Arena of pipe endpoint pairs, indexed by stage boundary.
#[derive(Debug, Default)]
pub struct PipeSet {
    pairs: Vec<PipePair>,
    supplied_stdin: Option<OwnedFd>,
    supplied_stdout: Option<OwnedFd>,
}

impl PipeSet {
    /// Create `count` pipes.
    ///
    /// Fails as a whole: if any pipe cannot be created, the pairs already
    /// made are closed before the error is returned.
    pub fn allocate(count: usize) -> Result<Self> {
        let mut set = PipeSet {
            pairs: Vec::with_capacity(count),
            ..PipeSet::default()
        };
        for index in 0..count {
            let (read, write) = create_pipe().map_err(|errno| EngineError::Pipe {
                index,
                source: errno.into(),
            })?;
            log::trace!(
                "pipe {}: read fd {}, write fd {}",
                index,
                read.as_raw_fd(),
                write.as_raw_fd()
            );
            set.pairs.push(PipePair {
                read: Some(read),
                write: Some(write),
            });
        }
        Ok(set)
    }

    /// Attach caller-owned descriptors as the chain's outer stdin/stdout.
    pub fn with_boundary(mut self, stdin: Option<OwnedFd>, stdout: Option<OwnedFd>) -> Self {
        self.supplied_stdin = stdin;
        self.supplied_stdout = stdout;
        self
    }

    /// Number of pipe pairs (supplied descriptors are not counted).
    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn has_supplied_stdin(&self) -> bool {
        self.supplied_stdin.is_some()
    }

    pub fn has_supplied_stdout(&self) -> bool {
        self.supplied_stdout.is_some()
    }

    /// Read end of pipe `i`, if it is still open in this process.
    pub fn read_end(&self, i: usize) -> Option<BorrowedFd<'_>> {
        self.get(Endpoint::Read(i))
    }

    /// Write end of pipe `i`, if it is still open in this process.
    pub fn write_end(&self, i: usize) -> Option<BorrowedFd<'_>> {
        self.get(Endpoint::Write(i))
    }

    /// Borrow any endpoint that is still open.
    pub fn get(&self, ep: Endpoint) -> Option<BorrowedFd<'_>> {
        self.slot(ep).and_then(|s| s.as_ref()).map(|fd| fd.as_fd())
    }

    /// Raw descriptor number of an open endpoint.
    pub fn raw(&self, ep: Endpoint) -> Option<RawFd> {
        self.get(ep).map(|fd| fd.as_raw_fd())
    }

    /// Remove an endpoint from the arena, transferring ownership.
    pub fn take(&mut self, ep: Endpoint) -> Option<OwnedFd> {
        self.slot_mut(ep).and_then(Option::take)
    }

    /// Store `fd` as endpoint `ep`, returning whatever was there.  An
    /// out-of-range pipe index hands `fd` straight back.
    pub fn replace(&mut self, ep: Endpoint, fd: OwnedFd) -> core::result::Result<Option<OwnedFd>, OwnedFd> {
        match self.slot_mut(ep) {
            Some(slot) => Ok(slot.replace(fd)),
            None => Err(fd),
        }
    }

    /// Number of endpoints still open in this process.
    pub fn open_count(&self) -> usize {
        let pipes: usize = self
            .pairs
            .iter()
            .map(|p| p.read.is_some() as usize + p.write.is_some() as usize)
            .sum();
        pipes + self.supplied_stdin.is_some() as usize + self.supplied_stdout.is_some() as usize
    }

    /// Close one endpoint, reporting the close error if any.
    ///
    /// Closing an endpoint that is already closed is a no-op.
    pub fn close(&mut self, ep: Endpoint) -> Result<()> {
        match self.take(ep) {
            Some(fd) => close_owned(fd).map_err(|errno| EngineError::Close {
                endpoint: ep,
                source: errno.into(),
            }),
            None => Ok(()),
        }
    }

    /// Close every endpoint not listed in `keep`.
    ///
    /// Keeps going after a failure so no endpoint is left open; the first
    /// error is returned.
    pub fn close_all_except(&mut self, keep: &[Endpoint]) -> Result<()> {
        let mut first_err = None;
        for ep in self.endpoints() {
            if keep.contains(&ep) {
                continue;
            }
            if let Err(e) = self.close(ep) {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Close every endpoint still held.
    pub fn close_all(&mut self) -> Result<()> {
        self.close_all_except(&[])
    }

    /// Close the write end of every pipe (the aggregating parent never writes).
    pub fn close_write_ends(&mut self) -> Result<()> {
        let mut first_err = None;
        for i in 0..self.pairs.len() {
            if let Err(e) = self.close(Endpoint::Write(i)) {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Every endpoint this set can address, open or not.
    fn endpoints(&self) -> Vec<Endpoint> {
        let mut all = Vec::with_capacity(self.pairs.len() * 2 + 2);
        for i in 0..self.pairs.len() {
            all.push(Endpoint::Read(i));
            all.push(Endpoint::Write(i));
        }
        all.push(Endpoint::SuppliedStdin);
        all.push(Endpoint::SuppliedStdout);
        all
    }

    fn slot(&self, ep: Endpoint) -> Option<&Option<OwnedFd>> {
        match ep {
            Endpoint::Read(i) => self.pairs.get(i).map(|p| &p.read),
            Endpoint::Write(i) => self.pairs.get(i).map(|p| &p.write),
            Endpoint::SuppliedStdin => Some(&self.supplied_stdin),
            Endpoint::SuppliedStdout => Some(&self.supplied_stdout),
        }
    }

    fn slot_mut(&mut self, ep: Endpoint) -> Option<&mut Option<OwnedFd>> {
        match ep {
            Endpoint::Read(i) => self.pairs.get_mut(i).map(|p| &mut p.read),
            Endpoint::Write(i) => self.pairs.get_mut(i).map(|p| &mut p.write),
            Endpoint::SuppliedStdin => Some(&mut self.supplied_stdin),
            Endpoint::SuppliedStdout => Some(&mut self.supplied_stdout),
        }
    }
}

/// Close a descriptor and surface the result instead of ignoring it the way
/// `OwnedFd`'s destructor does.
pub fn close_owned(fd: OwnedFd) -> nix::Result<()> {
    unistd::close(fd.into_raw_fd())
}

/// Create one close-on-exec pipe as `(read, write)`.
#[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
fn create_pipe() -> nix::Result<(OwnedFd, OwnedFd)> {
    unistd::pipe2(nix::fcntl::OFlag::O_CLOEXEC)
}

/// Create one close-on-exec pipe as `(read, write)`.
#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
fn create_pipe() -> nix::Result<(OwnedFd, OwnedFd)> {
    use nix::fcntl::{fcntl, FcntlArg, FdFlag};

    let (read, write) = unistd::pipe()?;
    for fd in [&read, &write] {
        fcntl(fd.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))?;
    }
    Ok((read, write))
}

#[cfg(test)]
mod tests {
    use std::{
        fs::File,
        io::{Read, Write},
    };

    use super::*;

    #[test]
    fn test_allocate_zero_is_empty() {
        let set = PipeSet::allocate(0).unwrap();
        assert!(set.is_empty());
        assert_eq!(set.open_count(), 0);
        assert!(set.read_end(0).is_none());
    }

    #[test]
    fn test_allocate_opens_both_ends() {
        let set = PipeSet::allocate(3).unwrap();
        assert_eq!(set.len(), 3);
        assert_eq!(set.open_count(), 6);
        for i in 0..3 {
            assert!(set.read_end(i).is_some());
            assert!(set.write_end(i).is_some());
        }
        assert!(set.write_end(3).is_none());
    }

    #[test]
    fn test_close_is_idempotent() {
        let mut set = PipeSet::allocate(1).unwrap();
        set.close(Endpoint::Read(0)).unwrap();
        set.close(Endpoint::Read(0)).unwrap();
        assert!(set.read_end(0).is_none());
        assert_eq!(set.open_count(), 1);
    }

    #[test]
    fn test_close_out_of_range_is_noop() {
        let mut set = PipeSet::allocate(1).unwrap();
        set.close(Endpoint::Write(7)).unwrap();
        assert_eq!(set.open_count(), 2);
    }

    #[test]
    fn test_close_all_except_keeps_assigned_ends() {
        let mut set = PipeSet::allocate(4).unwrap();
        set.close_all_except(&[Endpoint::Read(1), Endpoint::Write(2)])
            .unwrap();
        assert_eq!(set.open_count(), 2);
        assert!(set.read_end(1).is_some());
        assert!(set.write_end(2).is_some());
        assert!(set.read_end(2).is_none());
        assert!(set.write_end(1).is_none());
    }

    #[test]
    fn test_close_write_ends() {
        let mut set = PipeSet::allocate(2).unwrap();
        set.close_write_ends().unwrap();
        assert_eq!(set.open_count(), 2);
        assert!(set.read_end(0).is_some());
        assert!(set.write_end(0).is_none());
    }

    #[test]
    fn test_boundary_descriptors_are_tracked() {
        let (r, w) = create_pipe().unwrap();
        let mut set = PipeSet::allocate(1).unwrap().with_boundary(Some(r), Some(w));
        assert!(set.has_supplied_stdin());
        assert_eq!(set.open_count(), 4);
        set.close_all().unwrap();
        assert_eq!(set.open_count(), 0);
        assert!(!set.has_supplied_stdout());
    }

    #[test]
    fn test_replace_swaps_descriptor() {
        let mut set = PipeSet::allocate(1).unwrap();
        let (r, _w) = create_pipe().unwrap();
        let new_raw = r.as_raw_fd();
        let old = set.replace(Endpoint::Read(0), r).unwrap().unwrap();
        assert_ne!(old.as_raw_fd(), new_raw);
        assert_eq!(set.raw(Endpoint::Read(0)), Some(new_raw));

        let (stray, _w2) = create_pipe().unwrap();
        assert!(set.replace(Endpoint::Read(5), stray).is_err());
    }

    #[test]
    fn test_bytes_flow_through_pipe() {
        let mut set = PipeSet::allocate(1).unwrap();
        let mut writer = File::from(set.take(Endpoint::Write(0)).unwrap());
        writer.write_all(b"hello").unwrap();
        drop(writer);

        let mut reader = File::from(set.take(Endpoint::Read(0)).unwrap());
        let mut out = String::new();
        reader.read_to_string(&mut out).unwrap();
        assert_eq!(out, "hello");
        assert_eq!(set.open_count(), 0);
    }

    #[test]
    fn test_endpoints_are_close_on_exec() {
        use nix::fcntl::{fcntl, FcntlArg, FdFlag};

        let set = PipeSet::allocate(1).unwrap();
        let raw = set.raw(Endpoint::Read(0)).unwrap();
        let flags = FdFlag::from_bits_truncate(fcntl(raw, FcntlArg::F_GETFD).unwrap());
        assert!(flags.contains(FdFlag::FD_CLOEXEC));
    }
}
