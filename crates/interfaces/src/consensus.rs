//! Consensus engine contract used for per-header validation.

use crate::db::HeaderReader;
use std::fmt::Debug;
use strata_primitives::{BlockNumber, Header, B256};

/// Consensus is a protocol that decides whether a single header is valid.
///
/// The engine calls this in parent-before-child order, so implementations may
/// assume the parent is readable through the supplied `reader`.
#[auto_impl::auto_impl(&, Arc)]
pub trait Consensus: Debug + Send + Sync {
    /// Validate if header is correct and follows the consensus specification.
    ///
    /// `seal` requests the expensive seal verification on top of the
    /// structural checks.
    fn validate_header(
        &self,
        reader: &dyn HeaderReader,
        header: &Header,
        hash: B256,
        seal: bool,
    ) -> Result<(), ConsensusError>;
}

/// Consensus errors.
///
/// [`ConsensusError::TimestampIsInFuture`] is the one retryable kind: the
/// header may become valid once the wall clock catches up. Every other kind
/// is fatal for the header and its descendants.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConsensusError {
    /// Error when the parent hash of a header is not known.
    #[error("block parent [hash={0}] is not known")]
    ParentUnknown(B256),

    /// Error when the block number does not match the parent block number.
    #[error(
        "block number {block_number} does not match parent block number {parent_block_number}"
    )]
    ParentBlockNumberMismatch {
        /// The parent block number.
        parent_block_number: BlockNumber,
        /// The block number.
        block_number: BlockNumber,
    },

    /// Error when the block timestamp is in the past compared to the parent timestamp.
    #[error("block timestamp {timestamp} is in the past compared to the parent timestamp {parent_timestamp}")]
    TimestampIsInPast {
        /// The parent block's timestamp.
        parent_timestamp: u64,
        /// The block's timestamp.
        timestamp: u64,
    },

    /// Error when the block timestamp is in the future compared to our clock time.
    #[error("block timestamp {timestamp} is in the future compared to our clock time {present_timestamp}")]
    TimestampIsInFuture {
        /// The block's timestamp.
        timestamp: u64,
        /// The current timestamp.
        present_timestamp: u64,
    },

    /// Error when the seal of the block does not verify.
    #[error("invalid seal for block {0}")]
    InvalidSeal(B256),

    /// Error when the difficulty of the block is not the expected one.
    #[error("invalid difficulty for block {0}")]
    InvalidDifficulty(B256),
}

impl ConsensusError {
    /// Returns `true` for verdicts that may flip to valid once the wall clock
    /// catches up with the header.
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::TimestampIsInFuture { .. })
    }
}
