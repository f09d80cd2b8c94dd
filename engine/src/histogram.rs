//! Word-length histograms.
//!
//! A [`Histogram`] is the fixed-shape result each fan-out worker reports:
//! slot `j` counts words of length `j + 1`.  On the wire it is exactly
//! [`MAX_WORD_LEN`] native-endian `i32`s, written with one `write` and read
//! back with one matching `read`.  Changing the slot count changes the wire
//! size on both sides.

use std::{
    fmt,
    fs::File,
    io::{self, Read},
    mem::size_of,
    path::Path,
};

/// Longest word length with its own slot.
pub const MAX_WORD_LEN: usize = 25;

/// Bytes one histogram occupies on a pipe.
pub const HISTOGRAM_WIRE_SIZE: usize = MAX_WORD_LEN * size_of::<i32>();

/// Count of words per length, lengths 1 through [`MAX_WORD_LEN`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Histogram {
    counts: [i32; MAX_WORD_LEN],
}

impl Histogram {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_counts(counts: [i32; MAX_WORD_LEN]) -> Self {
        Self { counts }
    }

    pub fn counts(&self) -> &[i32; MAX_WORD_LEN] {
        &self.counts
    }

    /// Count for words of exactly `len` characters.
    pub fn get(&self, len: usize) -> Option<i32> {
        len.checked_sub(1).and_then(|j| self.counts.get(j)).copied()
    }

    /// Record one word of length `len`.  Returns false (and records
    /// nothing) when `len` has no slot.
    pub fn record(&mut self, len: usize) -> bool {
        match len.checked_sub(1).and_then(|j| self.counts.get_mut(j)) {
            Some(slot) => {
                *slot = slot.saturating_add(1);
                true
            }
            None => false,
        }
    }

    /// Element-wise add `other` into `self`.
    pub fn accumulate(&mut self, other: &Histogram) {
        for (acc, n) in self.counts.iter_mut().zip(other.counts.iter()) {
            *acc = acc.saturating_add(*n);
        }
    }

    /// Total words counted.
    pub fn total(&self) -> i64 {
        self.counts.iter().map(|&n| i64::from(n)).sum()
    }

    /// Serialize for the pipe.
    pub fn to_wire(&self) -> [u8; HISTOGRAM_WIRE_SIZE] {
        let mut buf = [0u8; HISTOGRAM_WIRE_SIZE];
        for (chunk, n) in buf.chunks_exact_mut(size_of::<i32>()).zip(self.counts) {
            chunk.copy_from_slice(&n.to_ne_bytes());
        }
        buf
    }

    /// Deserialize a buffer read from the pipe.  Anything other than exactly
    /// [`HISTOGRAM_WIRE_SIZE`] bytes is rejected.
    pub fn from_wire(buf: &[u8]) -> Option<Self> {
        if buf.len() != HISTOGRAM_WIRE_SIZE {
            return None;
        }
        let mut counts = [0i32; MAX_WORD_LEN];
        for (n, chunk) in counts.iter_mut().zip(buf.chunks_exact(size_of::<i32>())) {
            *n = i32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        Some(Self { counts })
    }
}

impl fmt::Display for Histogram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (j, n) in self.counts.iter().enumerate() {
            writeln!(f, "{}-Character Words: {}", j + 1, n)?;
        }
        Ok(())
    }
}

/// Histogram of whitespace-delimited words in `bytes`.
///
/// Lengths are in bytes.  Words longer than [`MAX_WORD_LEN`] are skipped.
pub fn count_words(bytes: &[u8]) -> Histogram {
    let mut hist = Histogram::new();
    for word in bytes
        .split(|b| b.is_ascii_whitespace())
        .filter(|w| !w.is_empty())
    {
        hist.record(word.len());
    }
    hist
}

/// Histogram of the words in the file at `path`.
pub fn count_word_lengths(path: &Path) -> io::Result<Histogram> {
    let mut bytes = Vec::new();
    File::open(path)?.read_to_end(&mut bytes)?;
    Ok(count_words(&bytes))
}
