//! Commonly used types for header synchronization.
//!
//! The header payload itself is [`alloy_consensus::Header`]; this crate adds
//! the wire form headers travel in ([`SegmentHeader`]) and a few aliases.

#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

pub use alloy_consensus::Header;
pub use alloy_primitives::{keccak256, Bytes, B256, B512, U256};

/// An Ethereum block number.
pub type BlockNumber = u64;

/// A block hash.
pub type BlockHash = B256;

/// Network identifier of a peer, the 64-byte uncompressed secp256k1 public key.
pub type PeerId = B512;

mod segment;
pub use segment::{sort_ascending, sort_descending, SegmentHeader};
