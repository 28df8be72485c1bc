use crate::{BlockNumber, Header};
use alloy_primitives::{keccak256, Bytes, B256};
use alloy_rlp::{Decodable, Encodable};

/// A single header as delivered by a peer: the decoded payload together with
/// the exact bytes it arrived in.
///
/// The hash is always derived from [`Self::raw`], so the raw bytes round-trip
/// through the hash function by construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentHeader {
    /// Decoded header payload.
    pub header: Header,
    /// RLP encoding the header was delivered with.
    pub raw: Bytes,
    /// `keccak256` of the raw encoding.
    pub hash: B256,
    /// Block number, denormalized out of the header.
    pub number: BlockNumber,
}

impl SegmentHeader {
    /// Decodes a header from its wire encoding and seals it with the hash of
    /// those bytes.
    pub fn from_raw(raw: Bytes) -> Result<Self, alloy_rlp::Error> {
        let mut buf = raw.as_ref();
        let header = Header::decode(&mut buf)?;
        let hash = keccak256(&raw);
        let number = header.number;
        Ok(Self { header, raw, hash, number })
    }

    /// Encodes the given header and seals it with the hash of the encoding.
    pub fn from_header(header: Header) -> Self {
        let mut buf = Vec::new();
        header.encode(&mut buf);
        let raw = Bytes::from(buf);
        let hash = keccak256(&raw);
        let number = header.number;
        Self { header, raw, hash, number }
    }

    /// Parent hash of the carried header.
    pub fn parent_hash(&self) -> B256 {
        self.header.parent_hash
    }

    /// Timestamp of the carried header.
    pub fn timestamp(&self) -> u64 {
        self.header.timestamp
    }
}

/// Sorts segment headers by ascending block number, hash as the tie break.
pub fn sort_ascending(headers: &mut [SegmentHeader]) {
    headers.sort_unstable_by(|a, b| (a.number, a.hash).cmp(&(b.number, b.hash)));
}

/// Sorts segment headers by descending block number, hash as the tie break.
pub fn sort_descending(headers: &mut [SegmentHeader]) {
    headers.sort_unstable_by(|a, b| (b.number, b.hash).cmp(&(a.number, a.hash)));
}
