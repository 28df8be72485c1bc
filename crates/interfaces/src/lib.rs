//! Contracts between the header sync engine and its collaborators: the
//! consensus engine, the header database, the snapshot files and the
//! peer-to-peer layer.
//!
//! The engine itself lives in `strata-downloaders`; everything here is either
//! implemented by the caller or plain data crossing the boundary.

#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

pub mod consensus;
pub mod db;
pub mod p2p;

/// Common test helpers for the crates that consume these contracts.
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
