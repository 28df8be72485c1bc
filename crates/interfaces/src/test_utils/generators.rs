use rand::Rng;
use strata_primitives::{BlockNumber, Header, SegmentHeader, B256, U256};

/// Generates a random header wired to the given parent hash.
///
/// The header is not assumed to pass real consensus validation.
pub fn random_header(number: BlockNumber, parent: Option<B256>) -> SegmentHeader {
    let mut rng = rand::thread_rng();
    let header = Header {
        number,
        parent_hash: parent.unwrap_or_default(),
        difficulty: U256::from(rng.gen::<u32>()),
        timestamp: rng.gen::<u32>() as u64,
        gas_limit: rng.gen::<u32>() as u64,
        ..Default::default()
    };
    SegmentHeader::from_header(header)
}

/// Generates a contiguous range of random headers.
///
/// The parent hash of the first header in the result equals `head`.
pub fn random_header_range(range: std::ops::Range<u64>, head: B256) -> Vec<SegmentHeader> {
    let mut headers = Vec::with_capacity(range.end.saturating_sub(range.start) as usize);
    for number in range {
        let parent = headers.last().map(|h: &SegmentHeader| h.hash).unwrap_or(head);
        headers.push(random_header(number, Some(parent)));
    }
    headers
}

/// Generates a random child of the given header.
pub fn child_header(parent: &SegmentHeader) -> SegmentHeader {
    random_header(parent.number + 1, Some(parent.hash))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_is_linked() {
        let head = B256::random();
        let chain = random_header_range(3..8, head);
        assert_eq!(chain.len(), 5);
        assert_eq!(chain[0].parent_hash(), head);
        for pair in chain.windows(2) {
            assert_eq!(pair[1].parent_hash(), pair[0].hash);
            assert_eq!(pair[1].number, pair[0].number + 1);
        }
    }
}
