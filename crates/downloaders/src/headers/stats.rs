use strata_primitives::BlockNumber;

/// Counters accumulated under the engine lock and drained by the outer
/// driver through [`HeaderSync::extract_stats`](super::HeaderSync::extract_stats).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    /// Ancestor requests planned.
    pub requests: u64,
    /// Skeleton requests planned.
    pub skeleton_requests: u64,
    /// Response batches processed.
    pub responses: u64,
    /// Headers already present in the forest.
    pub duplicates: u64,
    /// Headers that failed consensus verification.
    pub invalid_headers: u64,
    /// Headers rejected because they, or their parent, were marked bad.
    pub rejected_bad_headers: u64,
    /// Anchors invalidated after exhausting their retries.
    pub invalidated_anchors: u64,
    /// Lowest block number covered by an ancestor request.
    pub req_min_block: BlockNumber,
    /// Highest block number covered by an ancestor request.
    pub req_max_block: BlockNumber,
    /// Lowest block number covered by a skeleton request.
    pub skeleton_req_min_block: BlockNumber,
    /// Highest block number covered by a skeleton request.
    pub skeleton_req_max_block: BlockNumber,
    /// Lowest block number seen in responses.
    pub resp_min_block: BlockNumber,
    /// Highest block number seen in responses.
    pub resp_max_block: BlockNumber,
}
