//! Spill-to-disk collector for downloaded headers.
//!
//! The PoS reverse download receives headers newest-first, while the database
//! wants them oldest-first. The [`Collector`] buffers raw headers keyed by
//! `(block number, hash)`, flushes sorted runs to temporary files once the
//! buffer exceeds its capacity, and yields everything back in ascending key
//! order through a k-way merge.

#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

use std::{
    cmp::Reverse,
    collections::BinaryHeap,
    io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write},
    path::Path,
};
use strata_primitives::{BlockNumber, B256};
use tempfile::{NamedTempFile, TempDir};

/// Sort key of a collected header: big-endian block number followed by the
/// block hash, so byte order equals `(number, hash)` order.
pub type HeaderKey = [u8; 40];

/// Builds the sort key for a header.
pub fn header_key(number: BlockNumber, hash: B256) -> HeaderKey {
    let mut key = [0u8; 40];
    key[..8].copy_from_slice(&number.to_be_bytes());
    key[8..].copy_from_slice(hash.as_slice());
    key
}

fn split_key(key: HeaderKey) -> (BlockNumber, B256) {
    let mut number = [0u8; 8];
    number.copy_from_slice(&key[..8]);
    (BlockNumber::from_be_bytes(number), B256::from_slice(&key[8..]))
}

/// A collector of `(header key, raw header)` pairs.
///
/// Pairs are accepted in any order; [`Collector::iter`] returns them sorted
/// across the in-memory buffer and every spilled run.
#[derive(Debug)]
pub struct Collector {
    /// Directory holding the spilled runs; removed when the collector drops.
    dir: TempDir,
    /// Spilled sorted runs.
    files: Vec<RunFile>,
    /// In-memory buffer of not-yet-spilled pairs.
    buffer: Vec<(HeaderKey, Vec<u8>)>,
    /// Current buffer size in bytes.
    buffer_size_bytes: usize,
    /// Buffer capacity in bytes; a flush triggers past this.
    buffer_capacity_bytes: usize,
    /// Total number of collected pairs, buffered and spilled.
    len: usize,
}

impl Collector {
    /// Creates a collector that spills to disk once the in-memory buffer
    /// exceeds `buffer_capacity_bytes`.
    pub fn new(buffer_capacity_bytes: usize) -> io::Result<Self> {
        Ok(Self {
            dir: TempDir::new()?,
            files: Vec::new(),
            buffer: Vec::new(),
            buffer_size_bytes: 0,
            buffer_capacity_bytes,
            len: 0,
        })
    }

    /// Number of collected pairs.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if nothing has been collected.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Collects one raw header under its `(number, hash)` key.
    pub fn collect(&mut self, number: BlockNumber, hash: B256, raw: &[u8]) -> io::Result<()> {
        self.buffer_size_bytes += 40 + raw.len();
        self.buffer.push((header_key(number, hash), raw.to_vec()));
        self.len += 1;
        if self.buffer_size_bytes > self.buffer_capacity_bytes {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.buffer_size_bytes = 0;
        self.buffer.sort_unstable_by(|a, b| a.0.cmp(&b.0));
        let run = std::mem::take(&mut self.buffer);
        self.files.push(RunFile::new(self.dir.path(), run)?);
        Ok(())
    }

    /// Returns an iterator over all collected pairs in ascending key order.
    pub fn iter(&mut self) -> io::Result<CollectorIter<'_>> {
        if self.buffer_size_bytes > 0 {
            self.flush()?;
        }

        let mut heap = BinaryHeap::new();
        for (id, file) in self.files.iter_mut().enumerate() {
            if let Some(entry) = file.read_next()? {
                heap.push((Reverse(entry), id));
            }
        }
        Ok(CollectorIter { heap, files: &mut self.files })
    }
}

/// Merging iterator over the sorted runs of a [`Collector`].
#[derive(Debug)]
pub struct CollectorIter<'a> {
    heap: BinaryHeap<(Reverse<(HeaderKey, Vec<u8>)>, usize)>,
    files: &'a mut Vec<RunFile>,
}

impl Iterator for CollectorIter<'_> {
    type Item = io::Result<(BlockNumber, B256, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        let (Reverse((key, value)), id) = self.heap.pop()?;
        match self.files[id].read_next() {
            Ok(Some(entry)) => {
                self.heap.push((Reverse(entry), id));
            }
            Ok(None) => {}
            Err(err) => return Some(Err(err)),
        }
        let (number, hash) = split_key(key);
        Some(Ok((number, hash, value)))
    }
}

/// One sorted run spilled to a temporary file.
///
/// Entries are stored as `value length ‖ key ‖ value`; the key length is
/// fixed.
#[derive(Debug)]
struct RunFile {
    file: BufReader<NamedTempFile>,
    remaining: usize,
}

impl RunFile {
    fn new(dir: &Path, run: Vec<(HeaderKey, Vec<u8>)>) -> io::Result<Self> {
        let mut w = BufWriter::new(NamedTempFile::new_in(dir)?);
        for (key, value) in &run {
            w.write_all(&(value.len() as u64).to_be_bytes())?;
            w.write_all(key)?;
            w.write_all(value)?;
        }
        let mut file = BufReader::new(w.into_inner().map_err(|e| e.into_error())?);
        file.seek(SeekFrom::Start(0))?;
        Ok(Self { file, remaining: run.len() })
    }

    fn read_next(&mut self) -> io::Result<Option<(HeaderKey, Vec<u8>)>> {
        if self.remaining == 0 {
            return Ok(None)
        }
        let mut len = [0u8; 8];
        self.file.read_exact(&mut len)?;
        let mut key = [0u8; 40];
        self.file.read_exact(&mut key)?;
        let mut value = vec![0u8; u64::from_be_bytes(len) as usize];
        self.file.read_exact(&mut value)?;
        self.remaining -= 1;
        Ok(Some((key, value)))
    }
}
