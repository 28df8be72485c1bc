//! Data crossing the boundary to the peer-to-peer layer: header range
//! requests going out, penalties and tip announces coming back from the
//! engine for the outer layer to act on.

use strata_primitives::{BlockNumber, PeerId, B256};

/// A request for a range of headers, sent to a connected peer.
///
/// The field values of the two shapes the engine emits are protocol-fixed:
/// skeleton requests are `{length: 192, skip: 192, reverse: false}` and
/// anchor requests are `{length: 192, skip: 0, reverse: true}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderRequest {
    /// For reverse requests, the hash whose ancestors are wanted; doubles as
    /// the identity of the anchor the request was planned for. `None` for
    /// forward skeleton requests.
    pub hash: Option<B256>,
    /// The block number the range starts at.
    pub number: BlockNumber,
    /// Maximum number of headers in the response.
    pub length: u64,
    /// Stride between returned headers; `0` for a contiguous range.
    pub skip: u64,
    /// Walk towards genesis when set.
    pub reverse: bool,
}

/// Abstract penalty the engine emits towards the peer-scoring layer.
///
/// Scoring itself is out of scope here; these only name the offense.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Penalty {
    /// Peer relayed a header that is marked bad.
    BadBlock,
    /// Ancestors of an anchor stayed unavailable through every retry.
    AbandonedAnchor,
    /// Peer gossiped a zero-difficulty block after the merge.
    NewBlockGossipAfterMerge,
}

/// A [`Penalty`] attributed to the peer that earned it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PenaltyItem {
    /// The offense.
    pub penalty: Penalty,
    /// The peer it applies to.
    pub peer_id: PeerId,
}

/// A persisted tip worth relaying to peers that announced interest in it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Announce {
    /// Hash of the block.
    pub hash: B256,
    /// Height of the block.
    pub number: BlockNumber,
}
