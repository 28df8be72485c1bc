//! Shared test doubles: a consensus engine with scriptable verdicts and an
//! in-memory header database.

mod generators;
pub use generators::{child_header, random_header, random_header_range};

use crate::{
    consensus::{Consensus, ConsensusError},
    db::{DatabaseError, HeaderReader, HeaderWriter, SnapshotReader},
};
use alloy_rlp::Decodable;
use parking_lot::RwLock;
use std::{
    collections::{BTreeMap, HashMap},
    sync::atomic::{AtomicBool, Ordering},
};
use strata_primitives::{BlockNumber, Bytes, Header, SegmentHeader, B256, U256};

/// Consensus engine implementation for testing.
#[derive(Debug, Default)]
pub struct TestConsensus {
    /// Flag whether header validation should purposefully fail.
    fail_validation: AtomicBool,
    /// Flag whether header validation should report a future block.
    future_block: AtomicBool,
}

impl TestConsensus {
    /// Update the validation flag.
    pub fn set_fail_validation(&self, val: bool) {
        self.fail_validation.store(val, Ordering::SeqCst)
    }

    /// Update the future-block flag.
    pub fn set_future_block(&self, val: bool) {
        self.future_block.store(val, Ordering::SeqCst)
    }
}

impl Consensus for TestConsensus {
    fn validate_header(
        &self,
        _reader: &dyn HeaderReader,
        header: &Header,
        hash: B256,
        _seal: bool,
    ) -> Result<(), ConsensusError> {
        if self.future_block.load(Ordering::SeqCst) {
            return Err(ConsensusError::TimestampIsInFuture {
                timestamp: header.timestamp,
                present_timestamp: 0,
            })
        }
        if self.fail_validation.load(Ordering::SeqCst) {
            return Err(ConsensusError::InvalidSeal(hash))
        }
        Ok(())
    }
}

/// In-memory header database implementing the reader/writer contract.
#[derive(Debug, Default)]
pub struct TestDb(RwLock<TestDbInner>);

#[derive(Debug, Default)]
struct TestDbInner {
    /// Raw headers keyed by `(number, hash)`.
    headers: BTreeMap<(BlockNumber, B256), Bytes>,
    hash_to_number: HashMap<B256, BlockNumber>,
    canonical: BTreeMap<BlockNumber, B256>,
    td: HashMap<(B256, BlockNumber), U256>,
    progress: BlockNumber,
}

impl TestDb {
    /// Writes a segment header together with its total difficulty, optionally
    /// marking it canonical and advancing the stage progress.
    pub fn commit(&self, sh: &SegmentHeader, td: U256, canonical: bool) {
        let mut inner = self.0.write();
        inner.headers.insert((sh.number, sh.hash), sh.raw.clone());
        inner.hash_to_number.insert(sh.hash, sh.number);
        inner.td.insert((sh.hash, sh.number), td);
        if canonical {
            inner.canonical.insert(sh.number, sh.hash);
            inner.progress = inner.progress.max(sh.number);
        }
    }

    /// Number of stored headers.
    pub fn header_count(&self) -> usize {
        self.0.read().headers.len()
    }
}

impl HeaderReader for TestDb {
    fn header(&self, hash: B256, number: BlockNumber) -> Result<Option<Header>, DatabaseError> {
        let inner = self.0.read();
        let Some(raw) = inner.headers.get(&(number, hash)) else { return Ok(None) };
        Ok(Some(Header::decode(&mut raw.as_ref())?))
    }

    fn header_by_hash(&self, hash: B256) -> Result<Option<Header>, DatabaseError> {
        let Some(number) = self.0.read().hash_to_number.get(&hash).copied() else {
            return Ok(None)
        };
        self.header(hash, number)
    }

    fn canonical_hash(&self, number: BlockNumber) -> Result<Option<B256>, DatabaseError> {
        Ok(self.0.read().canonical.get(&number).copied())
    }

    fn total_difficulty(
        &self,
        hash: B256,
        number: BlockNumber,
    ) -> Result<Option<U256>, DatabaseError> {
        Ok(self.0.read().td.get(&(hash, number)).copied())
    }

    fn stage_progress(&self) -> Result<BlockNumber, DatabaseError> {
        Ok(self.0.read().progress)
    }

    fn headers_newest_first(&self, limit: usize) -> Result<Vec<Bytes>, DatabaseError> {
        Ok(self.0.read().headers.values().rev().take(limit).cloned().collect())
    }
}

impl HeaderWriter for TestDb {
    fn write_header_raw(
        &self,
        number: BlockNumber,
        hash: B256,
        raw: &[u8],
    ) -> Result<(), DatabaseError> {
        let mut inner = self.0.write();
        inner.headers.insert((number, hash), Bytes::copy_from_slice(raw));
        inner.hash_to_number.insert(hash, number);
        Ok(())
    }

    fn write_td(&self, hash: B256, number: BlockNumber, td: U256) -> Result<(), DatabaseError> {
        self.0.write().td.insert((hash, number), td);
        Ok(())
    }

    fn write_canonical_hash(&self, number: BlockNumber, hash: B256) -> Result<(), DatabaseError> {
        self.0.write().canonical.insert(number, hash);
        Ok(())
    }

    fn save_stage_progress(&self, number: BlockNumber) -> Result<(), DatabaseError> {
        self.0.write().progress = number;
        Ok(())
    }
}

/// Frozen-history reader backed by a plain list of headers.
#[derive(Debug, Default)]
pub struct TestSnapshotReader {
    headers: BTreeMap<BlockNumber, Header>,
}

impl TestSnapshotReader {
    /// Creates a reader over the given frozen headers.
    pub fn new(headers: impl IntoIterator<Item = Header>) -> Self {
        Self { headers: headers.into_iter().map(|h| (h.number, h)).collect() }
    }
}

impl SnapshotReader for TestSnapshotReader {
    fn frozen_blocks(&self) -> BlockNumber {
        self.headers.keys().next_back().copied().unwrap_or_default()
    }

    fn header_by_number(&self, number: BlockNumber) -> Result<Option<Header>, DatabaseError> {
        Ok(self.headers.get(&number).cloned())
    }
}
