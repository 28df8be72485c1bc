use strata_interfaces::db::DatabaseError;
use strata_primitives::{BlockNumber, B256};

/// Errors the download engine surfaces to the outer driver.
///
/// Database errors pass through untouched; none of these mutate engine state
/// on the way out.
#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    /// A header was fed whose parent is not in the database.
    #[error("parent [hash={hash}, number={number}] not found for header {child}")]
    ParentNotFound {
        /// Hash of the missing parent.
        hash: B256,
        /// Height of the missing parent.
        number: BlockNumber,
        /// The header that required it.
        child: B256,
    },

    /// The total difficulty of a parent block is not recorded.
    #[error("total difficulty of parent [hash={hash}, number={number}] not found")]
    ParentTdNotFound {
        /// Hash of the parent.
        hash: B256,
        /// Height of the parent.
        number: BlockNumber,
    },

    /// A PoS segment connected to a known header at the wrong height.
    #[error("invalid PoS segment: got block number {got}, expected {expected}")]
    InvalidPosSegment {
        /// Height carried by the delivered header.
        got: BlockNumber,
        /// Height implied by the known parent.
        expected: BlockNumber,
    },

    /// The PoS reverse walk ran below height 1 without meeting a known header.
    #[error("wrong genesis during PoS sync")]
    WrongGenesis,

    /// The spill-to-disk collector failed.
    #[error(transparent)]
    Collector(#[from] std::io::Error),

    /// Database failure, propagated from the reader/writer.
    #[error(transparent)]
    Database(#[from] DatabaseError),
}
