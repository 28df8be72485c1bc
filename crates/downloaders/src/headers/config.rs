use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration of the header download engine.
///
/// The limits bound the memory held by the in-flight forest; the prune
/// passes enforce them after every batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeadersConfig {
    /// Maximum number of non-persisted links kept in memory.
    pub link_limit: usize,
    /// Maximum number of persisted links kept in memory.
    pub persisted_link_limit: usize,
    /// Maximum number of open anchors.
    pub anchor_limit: usize,
    /// Depth below the database tip past which parentless headers are
    /// dropped instead of opening a new anchor.
    pub immutability_threshold: u64,
    /// Delay before an unanswered ancestor request is retried.
    #[serde(with = "humantime_serde")]
    pub retry_delay: Duration,
}

impl Default for HeadersConfig {
    fn default() -> Self {
        let link_limit = 1024 * 1024;
        Self {
            link_limit,
            persisted_link_limit: link_limit / 16,
            anchor_limit: 512,
            immutability_threshold: 90_000,
            retry_delay: Duration::from_secs(30),
        }
    }
}
