//! Narrow reader/writer contract over the header tables.
//!
//! The engine never owns a transaction; the caller hands a reader or writer
//! into each operation, and implementations are free to back these with
//! whatever storage they like. The in-memory `test_utils` implementation is
//! the reference for the expected semantics.

use strata_primitives::{BlockNumber, Bytes, Header, B256, U256};

/// Database failure surfaced through the reader/writer contract.
///
/// The engine propagates these untouched; it never mutates its own state in
/// response to a database error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DatabaseError {
    /// A stored value failed to decode.
    #[error("failed to decode stored header: {0}")]
    Decode(#[from] alloy_rlp::Error),

    /// The backend reported a failure.
    #[error("database backend error: {0}")]
    Backend(String),
}

/// Read access to the headers, total-difficulty and canonical-hash tables.
#[auto_impl::auto_impl(&, Arc, Box)]
pub trait HeaderReader: Send + Sync {
    /// Returns the header stored under the `(number, hash)` key.
    fn header(&self, hash: B256, number: BlockNumber) -> Result<Option<Header>, DatabaseError>;

    /// Returns the header with the given hash, whatever its height.
    fn header_by_hash(&self, hash: B256) -> Result<Option<Header>, DatabaseError>;

    /// Returns the canonical hash at the given height, if one is recorded.
    fn canonical_hash(&self, number: BlockNumber) -> Result<Option<B256>, DatabaseError>;

    /// Returns the accumulated total difficulty of the given block.
    fn total_difficulty(
        &self,
        hash: B256,
        number: BlockNumber,
    ) -> Result<Option<U256>, DatabaseError>;

    /// Returns the committed progress of the header stage.
    fn stage_progress(&self) -> Result<BlockNumber, DatabaseError>;

    /// Returns up to `limit` raw headers, newest first.
    ///
    /// Used to rehydrate the highest persisted links at startup.
    fn headers_newest_first(&self, limit: usize) -> Result<Vec<Bytes>, DatabaseError>;
}

/// Write access on top of [`HeaderReader`].
#[auto_impl::auto_impl(&, Arc, Box)]
pub trait HeaderWriter: HeaderReader {
    /// Writes a raw header under its `(number, hash)` key.
    fn write_header_raw(
        &self,
        number: BlockNumber,
        hash: B256,
        raw: &[u8],
    ) -> Result<(), DatabaseError>;

    /// Writes the accumulated total difficulty of a block.
    fn write_td(&self, hash: B256, number: BlockNumber, td: U256) -> Result<(), DatabaseError>;

    /// Marks the given hash canonical at the given height.
    fn write_canonical_hash(&self, number: BlockNumber, hash: B256) -> Result<(), DatabaseError>;

    /// Commits progress of the header stage.
    fn save_stage_progress(&self, number: BlockNumber) -> Result<(), DatabaseError>;
}

/// Read access to the frozen-history files.
#[auto_impl::auto_impl(&, Arc, Box)]
pub trait SnapshotReader: Send + Sync {
    /// Highest block number covered by the frozen files.
    fn frozen_blocks(&self) -> BlockNumber;

    /// Returns the frozen header at the given height.
    fn header_by_number(&self, number: BlockNumber) -> Result<Option<Header>, DatabaseError>;
}
