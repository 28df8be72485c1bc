//! Persists verified headers and decides when the canonical head changes.

use super::DownloadError;
use schnellru::{ByLength, LruMap};
use std::fmt;
use strata_interfaces::db::HeaderWriter;
use strata_primitives::{BlockNumber, Header, SegmentHeader, B256, U256};

/// Canonical hashes of recently inserted headers, to spare database walks
/// when computing forking points.
const CANONICAL_CACHE_LIMIT: u32 = 1000;

/// Feeds verified headers into the database and tracks the candidate
/// canonical head across one insertion batch.
///
/// On a fork the chain with the higher total difficulty wins; at equal
/// difficulty the lower height wins, and at equal height the
/// lexicographically larger hash.
pub struct HeaderInserter {
    /// Total difficulty of the current canonical head.
    local_td: U256,
    /// Height of the current canonical head.
    highest: BlockNumber,
    /// Hash of the current canonical head.
    highest_hash: B256,
    /// Timestamp of the current canonical head.
    highest_timestamp: u64,
    /// Hash fed by the previous call, to skip immediate duplicates.
    prev_hash: B256,
    /// Height later stages must revert to before the new canonical chain
    /// applies.
    unwind_point: BlockNumber,
    unwind: bool,
    /// Whether any fed header changed the canonical head.
    new_canonical: bool,
    canonical_cache: LruMap<BlockNumber, B256>,
}

impl fmt::Debug for HeaderInserter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeaderInserter")
            .field("local_td", &self.local_td)
            .field("highest", &self.highest)
            .field("highest_hash", &self.highest_hash)
            .field("unwind_point", &self.unwind_point)
            .field("unwind", &self.unwind)
            .field("new_canonical", &self.new_canonical)
            .finish_non_exhaustive()
    }
}

impl HeaderInserter {
    /// Creates an inserter seeded with the current canonical head.
    pub fn new(
        local_td: U256,
        highest: BlockNumber,
        highest_hash: B256,
        unwind_point: BlockNumber,
    ) -> Self {
        Self {
            local_td,
            highest,
            highest_hash,
            highest_timestamp: 0,
            prev_hash: B256::ZERO,
            unwind_point,
            unwind: false,
            new_canonical: false,
            canonical_cache: LruMap::new(ByLength::new(CANONICAL_CACHE_LIMIT)),
        }
    }

    /// Persistence callback of the proof-of-work sync: writes total
    /// difficulty and raw header, and moves the candidate head when the fed
    /// chain overtakes it.
    ///
    /// Returns the accumulated total difficulty, or `None` if the header was
    /// already known.
    pub fn feed_header_pow(
        &mut self,
        db: &dyn HeaderWriter,
        sh: &SegmentHeader,
    ) -> Result<Option<U256>, DownloadError> {
        let (hash, height) = (sh.hash, sh.number);
        if hash == self.prev_hash {
            // Skip duplicates.
            return Ok(None)
        }
        if db.header(hash, height)?.is_some() {
            // Already inserted.
            return Ok(None)
        }
        let parent = db.header(sh.parent_hash(), height - 1)?.ok_or_else(|| {
            DownloadError::ParentNotFound {
                hash: sh.parent_hash(),
                number: height - 1,
                child: hash,
            }
        })?;
        let parent_td = db.total_difficulty(sh.parent_hash(), height - 1)?.ok_or(
            DownloadError::ParentTdNotFound { hash: sh.parent_hash(), number: height - 1 },
        )?;
        let td = parent_td + sh.header.difficulty;

        // Decide whether this header changes the canonical head.
        if td >= self.local_td {
            let mut reorg = true;
            if td == self.local_td {
                if height > self.highest {
                    reorg = false;
                } else if height == self.highest {
                    // Tie break: the lexicographically larger hash wins.
                    reorg = self.highest_hash < hash;
                }
            }
            if reorg {
                self.new_canonical = true;
                let forking_point = self.forking_point(db, sh, &parent)?;
                self.highest = height;
                self.highest_hash = hash;
                self.highest_timestamp = sh.timestamp();
                self.canonical_cache.insert(height, hash);
                // A forking point below the unwind point forces the later
                // stages to revert further back.
                if forking_point < self.unwind_point {
                    self.unwind_point = forking_point;
                    self.unwind = true;
                }
                self.local_td = td;
            }
        }
        db.write_td(hash, height, td)?;
        db.write_header_raw(height, hash, &sh.raw)?;
        self.prev_hash = hash;
        Ok(Some(td))
    }

    /// Finds the highest height at which the fed chain and the persisted
    /// canonical chain share a hash.
    ///
    /// The common case is the parent itself; otherwise walk back through the
    /// cache of recently inserted canonical hashes, then through the
    /// database.
    fn forking_point(
        &mut self,
        db: &dyn HeaderWriter,
        sh: &SegmentHeader,
        parent: &Header,
    ) -> Result<BlockNumber, DownloadError> {
        let height = sh.number;
        let ch = match self.canonical_cache.get(&(height - 1)) {
            Some(hash) => Some(*hash),
            None => db.canonical_hash(height - 1)?,
        };
        if ch == Some(sh.parent_hash()) {
            return Ok(height - 1)
        }
        let mut ancestor_hash = parent.parent_hash;
        let mut ancestor_height = height - 2;
        while let Some(cached) = self.canonical_cache.get(&ancestor_height).copied() {
            if cached == ancestor_hash {
                break
            }
            let ancestor = db.header(ancestor_hash, ancestor_height)?.ok_or_else(|| {
                DownloadError::ParentNotFound {
                    hash: ancestor_hash,
                    number: ancestor_height,
                    child: sh.hash,
                }
            })?;
            ancestor_hash = ancestor.parent_hash;
            ancestor_height -= 1;
        }
        loop {
            if db.canonical_hash(ancestor_height)? == Some(ancestor_hash) {
                break
            }
            let ancestor = db.header(ancestor_hash, ancestor_height)?.ok_or_else(|| {
                DownloadError::ParentNotFound {
                    hash: ancestor_hash,
                    number: ancestor_height,
                    child: sh.hash,
                }
            })?;
            ancestor_hash = ancestor.parent_hash;
            ancestor_height -= 1;
        }
        Ok(ancestor_height)
    }

    /// Persistence path of the PoS sync: append-only, the consensus layer
    /// already decided the head.
    pub fn feed_header_pos(
        &mut self,
        db: &dyn HeaderWriter,
        header: &Header,
        hash: B256,
    ) -> Result<(), DownloadError> {
        let height = header.number;
        let parent_td = db.total_difficulty(header.parent_hash, height - 1)?.ok_or(
            DownloadError::ParentTdNotFound { hash: header.parent_hash, number: height - 1 },
        )?;
        let td = parent_td + header.difficulty;
        db.write_header_raw(height, hash, &alloy_rlp::encode(header))?;
        db.write_td(hash, height, td)?;
        self.highest = height;
        self.highest_hash = hash;
        self.highest_timestamp = header.timestamp;
        Ok(())
    }

    /// Total difficulty of the candidate canonical head.
    pub fn local_td(&self) -> U256 {
        self.local_td
    }

    /// Height of the candidate canonical head.
    pub fn highest(&self) -> BlockNumber {
        self.highest
    }

    /// Hash of the candidate canonical head.
    pub fn highest_hash(&self) -> B256 {
        self.highest_hash
    }

    /// Timestamp of the candidate canonical head.
    pub fn highest_timestamp(&self) -> u64 {
        self.highest_timestamp
    }

    /// Height later stages must revert to before applying the new chain.
    pub fn unwind_point(&self) -> BlockNumber {
        self.unwind_point
    }

    /// Whether an unwind is required.
    pub fn unwind(&self) -> bool {
        self.unwind
    }

    /// Whether any fed header moved the canonical head.
    pub fn best_header_changed(&self) -> bool {
        self.new_canonical
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_interfaces::db::HeaderReader;
    use strata_interfaces::test_utils::{random_header, TestDb};
    use strata_primitives::Bytes;

    /// Commits a linear canonical chain with the given difficulties and
    /// returns it together with the accumulated tip difficulty.
    fn canonical_chain(db: &TestDb, difficulties: &[u64]) -> (Vec<SegmentHeader>, U256) {
        let mut chain = Vec::new();
        let mut td = U256::ZERO;
        let mut parent = None;
        for (i, diff) in difficulties.iter().enumerate() {
            let mut sh = random_header(i as u64, parent);
            sh.header.difficulty = U256::from(*diff);
            let sh = SegmentHeader::from_header(sh.header);
            td += sh.header.difficulty;
            db.commit(&sh, td, true);
            parent = Some(sh.hash);
            chain.push(sh);
        }
        (chain, td)
    }

    /// Builds a fork off `ancestor` with the given difficulties.
    fn fork(ancestor: &SegmentHeader, difficulties: &[u64]) -> Vec<SegmentHeader> {
        let mut chain = Vec::new();
        let mut parent = ancestor.clone();
        for diff in difficulties {
            let mut sh = random_header(parent.number + 1, Some(parent.hash));
            sh.header.difficulty = U256::from(*diff);
            let sh = SegmentHeader::from_header(sh.header);
            parent = sh.clone();
            chain.push(sh);
        }
        chain
    }

    #[test]
    fn duplicate_headers_are_skipped() {
        let db = TestDb::default();
        let (chain, td) = canonical_chain(&db, &[0, 10]);
        let mut inserter = HeaderInserter::new(td, 1, chain[1].hash, 1);

        let next = fork(&chain[1], &[10]);
        assert!(inserter.feed_header_pow(&db, &next[0]).unwrap().is_some());
        // Same hash again: both the prev-hash shortcut and the database probe.
        assert!(inserter.feed_header_pow(&db, &next[0]).unwrap().is_none());
        let mut other = HeaderInserter::new(td, 1, chain[1].hash, 1);
        assert!(other.feed_header_pow(&db, &next[0]).unwrap().is_none());
    }

    #[test]
    fn missing_parent_and_td_are_errors() {
        let db = TestDb::default();
        let (chain, td) = canonical_chain(&db, &[0, 10]);
        let mut inserter = HeaderInserter::new(td, 1, chain[1].hash, 1);

        let orphan = random_header(5, Some(B256::random()));
        assert!(matches!(
            inserter.feed_header_pow(&db, &orphan),
            Err(DownloadError::ParentNotFound { .. })
        ));

        // Parent present but its TD is not recorded.
        let parent = random_header(4, None);
        db.write_header_raw(4, parent.hash, &parent.raw).unwrap();
        let child = fork(&parent, &[1]);
        assert!(matches!(
            inserter.feed_header_pow(&db, &child[0]),
            Err(DownloadError::ParentTdNotFound { .. })
        ));
    }

    #[test]
    fn lower_difficulty_does_not_reorg() {
        let db = TestDb::default();
        let (chain, td) = canonical_chain(&db, &[0, 10, 10]);
        let mut inserter = HeaderInserter::new(td, 2, chain[2].hash, 2);

        // Fork off height 1 with less cumulative work.
        let side = fork(&chain[1], &[5]);
        let side_td = inserter.feed_header_pow(&db, &side[0]).unwrap().unwrap();
        assert_eq!(side_td, U256::from(15));
        assert!(!inserter.best_header_changed());
        assert_eq!(inserter.highest_hash(), chain[2].hash);
        // The header is persisted regardless.
        assert_eq!(db.total_difficulty(side[0].hash, 2).unwrap(), Some(side_td));
    }

    #[test]
    fn higher_difficulty_reorgs_and_lowers_the_unwind_point() {
        let db = TestDb::default();
        let (chain, td) = canonical_chain(&db, &[0, 10, 10, 10]);
        assert_eq!(td, U256::from(30));
        let mut inserter = HeaderInserter::new(td, 3, chain[3].hash, 3);

        // Fork off height 1 that overtakes the canonical chain.
        let side = fork(&chain[1], &[12, 12]);
        assert!(inserter.feed_header_pow(&db, &side[0]).unwrap().is_some());
        assert!(!inserter.best_header_changed());
        let tip_td = inserter.feed_header_pow(&db, &side[1]).unwrap().unwrap();
        assert_eq!(tip_td, U256::from(34));
        assert!(inserter.best_header_changed());
        assert_eq!(inserter.highest(), 3);
        assert_eq!(inserter.highest_hash(), side[1].hash);
        assert_eq!(inserter.local_td(), tip_td);
        // Forking point is the shared ancestor at height 1.
        assert_eq!(inserter.unwind_point(), 1);
        assert!(inserter.unwind());
    }

    #[test]
    fn equal_difficulty_tie_breaks_on_the_larger_hash() {
        let db = TestDb::default();
        let (chain, td) = canonical_chain(&db, &[0, 10]);
        let mut low = random_header(2, Some(chain[1].hash));
        low.header.difficulty = U256::from(7);
        low.header.extra_data = Bytes::from_static(b"a");
        let mut high = random_header(2, Some(chain[1].hash));
        high.header.difficulty = U256::from(7);
        high.header.extra_data = Bytes::from_static(b"b");
        let mut low = SegmentHeader::from_header(low.header);
        let mut high = SegmentHeader::from_header(high.header);
        if high.hash < low.hash {
            std::mem::swap(&mut low, &mut high);
        }

        let mut inserter = HeaderInserter::new(td, 1, chain[1].hash, 1);
        assert!(inserter.feed_header_pow(&db, &low).unwrap().is_some());
        assert_eq!(inserter.highest_hash(), low.hash);
        // Equal TD and height: the larger hash takes over.
        assert!(inserter.feed_header_pow(&db, &high).unwrap().is_some());
        assert!(inserter.best_header_changed());
        assert_eq!(inserter.highest_hash(), high.hash);

        // And the smaller one does not win back.
        let mut again = HeaderInserter::new(inserter.local_td(), 2, high.hash, 2);
        let mut third = random_header(2, Some(chain[1].hash));
        third.header.difficulty = U256::from(7);
        third.header.extra_data = Bytes::from_static(b"c");
        let third = SegmentHeader::from_header(third.header);
        if third.hash < high.hash {
            again.feed_header_pow(&db, &third).unwrap();
            assert!(!again.best_header_changed());
        }
    }

    #[test]
    fn pos_feed_appends_and_moves_the_head() {
        let db = TestDb::default();
        let (chain, td) = canonical_chain(&db, &[0, 10]);
        let mut inserter = HeaderInserter::new(td, 1, chain[1].hash, 1);

        let next = fork(&chain[1], &[0]);
        inserter.feed_header_pos(&db, &next[0].header, next[0].hash).unwrap();
        assert_eq!(inserter.highest(), 2);
        assert_eq!(inserter.highest_hash(), next[0].hash);
        assert_eq!(db.total_difficulty(next[0].hash, 2).unwrap(), Some(td));
        assert_eq!(db.header(next[0].hash, 2).unwrap(), Some(next[0].header.clone()));
    }
}
