//! Header download and chain assembly.
//!
//! Peers announce and relay headers out of order and across forks. The types
//! here organize that stream into a forest of linked chains, request missing
//! ancestors ([`HeaderSync::request_more_headers`]), verify headers
//! parent-before-child and hand them to a persistence callback
//! ([`HeaderSync::insert_headers`]), and pick the canonical chain on forks by
//! total difficulty ([`HeaderInserter`]). After the merge the same state
//! machine runs in reverse from a consensus-layer target
//! ([`HeaderSync::process_headers_pos`]).

use std::time::Duration;

mod config;
mod error;
mod forest;
mod inserter;
mod pos;
mod stats;
mod sync;

pub use config::HeadersConfig;
pub use error::DownloadError;
pub use inserter::HeaderInserter;
pub use pos::SyncStatus;
pub use stats::Stats;
pub use sync::{HeaderSync, InsertOutcome};

/// Number of headers asked for in a single request. Protocol-fixed.
pub const HEADER_REQUEST_LENGTH: u64 = 192;

/// Stride between the headers of a skeleton request. Protocol-fixed.
pub const SKELETON_STRIDE: u64 = 192;

/// Retries after which a proof-of-work anchor is considered unavailable.
pub(crate) const MAX_ANCHOR_TIMEOUTS: u32 = 10;

/// Retries after which the PoS reverse download is abandoned.
pub(crate) const MAX_POS_TIMEOUTS: u32 = 3;

/// Cadence of the periodic progress logs.
pub(crate) const LOG_INTERVAL: Duration = Duration::from_secs(30);

/// Tick of the PoS downloader loop.
pub(crate) const POS_LOOP_TICK: Duration = Duration::from_millis(2);
