//! The header download engine: ingest, verification/insertion, request
//! planning and recovery.

use super::{
    forest::{Anchor, QueueId, SyncState},
    stats::Stats,
    DownloadError, HeadersConfig, HEADER_REQUEST_LENGTH, LOG_INTERVAL, MAX_ANCHOR_TIMEOUTS,
    SKELETON_STRIDE,
};
use parking_lot::RwLock;
use std::{
    fmt,
    sync::Arc,
    time::{Duration, Instant},
};
use strata_interfaces::{
    consensus::Consensus,
    db::{DatabaseError, HeaderReader, SnapshotReader},
    p2p::{Announce, HeaderRequest, Penalty, PenaltyItem},
};
use strata_primitives::{BlockNumber, PeerId, SegmentHeader, B256, U256};
use tokio::sync::Notify;
use tracing::{debug, info, trace, warn};

/// Outcome of a single [`HeaderSync::insert_header`] step.
#[derive(Debug, Clone, Copy, Default)]
pub struct InsertOutcome {
    /// Another link is ready for insertion right away.
    pub more: bool,
    /// Terminal total difficulty was reached; forward sync must stop and
    /// hand over to the consensus layer.
    pub terminal: bool,
    /// Estimated number of blocks until the terminal total difficulty.
    pub blocks_to_ttd: Option<u64>,
    /// Timestamp of the header handled by this step, `0` if none was.
    pub last_block_time: u64,
}

/// The header download and chain-assembly engine.
///
/// All state sits behind one reader/writer lock: mutations take the writer
/// half, pure observers the reader half. The consensus engine and the
/// persistence callback are invoked under the writer lock so they observe a
/// consistent forest; they must stay O(1) per header and never re-enter the
/// engine.
pub struct HeaderSync {
    pub(crate) state: RwLock<SyncState>,
    pub(crate) engine: Arc<dyn Consensus>,
    /// Chain view handed to the consensus engine for parent lookups.
    pub(crate) header_reader: Arc<dyn HeaderReader>,
    /// Single-slot wake-up towards the driver loop.
    pub(crate) delivery_notify: Notify,
    pub(crate) config: HeadersConfig,
}

impl fmt::Debug for HeaderSync {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.read();
        f.debug_struct("HeaderSync")
            .field("links", &state.links.len())
            .field("anchors", &state.anchors.len())
            .field("highest_in_db", &state.highest_in_db)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl HeaderSync {
    /// Creates the engine with the injected consensus engine and chain view.
    pub fn new(
        config: HeadersConfig,
        engine: Arc<dyn Consensus>,
        header_reader: Arc<dyn HeaderReader>,
    ) -> Self {
        Self {
            state: RwLock::new(SyncState::new()),
            engine,
            header_reader,
            delivery_notify: Notify::new(),
            config,
        }
    }

    /// Resolves once the driver should run another cycle. Missed wake-ups are
    /// harmless; the driver polls as well.
    pub async fn wait_for_delivery(&self) {
        self.delivery_notify.notified().await
    }

    // === ingest ===

    /// Classifies one header and attaches it to the forest.
    ///
    /// Returns `true` if a new anchor was opened, meaning its ancestors
    /// should be requested.
    pub fn process_header(&self, sh: &SegmentHeader, peer_id: PeerId) -> bool {
        let mut state = self.state.write();
        if sh.number > state.stats.resp_max_block {
            state.stats.resp_max_block = sh.number;
        }
        if state.stats.resp_min_block == 0 || sh.number < state.stats.resp_min_block {
            state.stats.resp_min_block = sh.number;
        }
        if state.links.contains_key(&sh.hash) {
            state.stats.duplicates += 1;
            return false
        }
        let found_parent = state.links.contains_key(&sh.parent_hash());
        let found_anchor = state.anchors.contains_key(&sh.hash);
        if !found_parent && !found_anchor {
            if sh.number < state.highest_in_db {
                debug!(
                    target: "downloaders::headers",
                    number = sh.number,
                    highest_in_db = state.highest_in_db,
                    "New anchor too far in the past"
                );
                return false
            }
            if state.anchors.len() >= self.config.anchor_limit {
                debug!(
                    target: "downloaders::headers",
                    anchors = state.anchors.len(),
                    limit = self.config.anchor_limit,
                    "Too many anchors"
                );
                return false
            }
        }
        state.add_header_as_link(sh, false, peer_id);
        if found_anchor {
            // The link is what the anchor was waiting for: it takes over the
            // anchor's children and the anchor is resolved.
            if let Some(anchor) = state.remove_anchor(sh.hash) {
                if let Some(link) = state.links.get_mut(&sh.hash) {
                    link.children = anchor.links;
                }
            }
        }
        if let Some(parent_anchor) = state.anchors.get_mut(&sh.parent_hash()) {
            // Alternative branch under an existing anchor; join it instead of
            // opening a second anchor for the same parent.
            parent_anchor.links.push(sh.hash);
            return false
        }
        if found_parent {
            let parent_persisted = {
                let Some(parent) = state.links.get_mut(&sh.parent_hash()) else { return false };
                parent.children.push(sh.hash);
                parent.persisted
            };
            if parent_persisted {
                if let Some(link) = state.links.get_mut(&sh.hash) {
                    link.linked = true;
                }
                state.move_link_to_queue(sh.hash, QueueId::Insert);
            }
            false
        } else {
            // No parent anywhere: the link becomes an anchor, unless it is
            // too deep below the database tip to ever matter.
            if sh.number + self.config.immutability_threshold < state.highest_in_db {
                debug!(
                    target: "downloaders::headers",
                    height = sh.number,
                    hash = %sh.hash,
                    "Dropping parentless header below the immutability threshold"
                );
                state.remove_upwards(sh.hash);
                return false
            }
            let mut anchor = Anchor::new(sh.parent_hash(), sh.number, peer_id);
            anchor.links.push(sh.hash);
            state.insert_anchor(anchor);
            true
        }
    }

    /// Processes a segment header-by-header, then prunes and wakes the
    /// driver.
    ///
    /// Returns `true` if ancestors of a fresh anchor should be requested.
    pub fn process_headers(&self, headers: &[SegmentHeader], peer_id: PeerId) -> bool {
        let mut request_more = false;
        for sh in headers {
            if self.process_header(sh, peer_id) {
                request_more = true;
            }
        }
        let initial_cycle = {
            let mut state = self.state.write();
            state.stats.responses += 1;
            trace!(target: "downloaders::headers", size = state.link_queue.len(), "Link queue");
            if state.link_queue.len() > self.config.link_limit {
                trace!(
                    target: "downloaders::headers",
                    count = state.link_queue.len(),
                    limit = self.config.link_limit,
                    "Too many links, pruning"
                );
                state.prune_link_queue(self.config.link_limit);
            }
            state.initial_cycle
        };
        self.delivery_notify.notify_one();
        !initial_cycle && request_more
    }

    /// Admission check for a single gossiped header.
    ///
    /// Returns the header as a one-element segment, or the penalty its sender
    /// earned instead.
    pub fn single_header_as_segment(
        &self,
        sh: SegmentHeader,
        penalize_pos_blocks: bool,
    ) -> (Option<SegmentHeader>, Option<Penalty>) {
        let mut state = self.state.write();
        if state.bad_headers.contains(&sh.hash) {
            state.stats.rejected_bad_headers += 1;
            warn!(
                target: "downloaders::headers",
                hash = %sh.hash,
                height = sh.number,
                "Rejected header marked as bad"
            );
            return (None, Some(Penalty::BadBlock))
        }
        if penalize_pos_blocks && sh.header.difficulty.is_zero() {
            return (None, Some(Penalty::NewBlockGossipAfterMerge))
        }
        (Some(sh), None)
    }

    // === verification and insertion ===

    /// Takes the lowest link off the insert queue, verifies it and hands it
    /// to the persistence callback `hf`, which returns the accumulated total
    /// difficulty.
    ///
    /// When `ttd` is configured and reached, [`InsertOutcome::terminal`] is
    /// set and forward sync must hand over to the consensus layer.
    pub fn insert_header<F>(
        &self,
        hf: &mut F,
        ttd: Option<U256>,
    ) -> Result<InsertOutcome, DownloadError>
    where
        F: FnMut(&SegmentHeader) -> Result<Option<U256>, DownloadError>,
    {
        let mut guard = self.state.write();
        let state = &mut *guard;
        let mut outcome = InsertOutcome::default();
        let mut return_td = None;
        let mut last_difficulty = None;

        if let Some(&(height, hash)) = state.insert_queue.iter().next() {
            let Some(link) = state.links.get(&hash) else {
                state.insert_queue.remove(&(height, hash));
                return Ok(outcome)
            };
            let mut bad = state.bad_headers.contains(&hash);
            if !bad && !link.persisted {
                bad = state.bad_headers.contains(&link.parent_hash);
            }
            if bad {
                // The link or its parent is marked bad; evict the subtree.
                state.remove_upwards(hash);
                state.stats.rejected_bad_headers += 1;
                warn!(
                    target: "downloaders::headers",
                    %hash,
                    height,
                    "Rejected header marked as bad"
                );
                outcome.more = true;
                return Ok(outcome)
            }
            let verified = state.links.get(&hash).is_some_and(|link| link.verified);
            if !verified {
                let verdict = {
                    let Some(link) = state.links.get(&hash) else { return Ok(outcome) };
                    let Some(header) = link.header.as_ref() else { return Ok(outcome) };
                    self.engine.validate_header(&*self.header_reader, header, hash, true)
                };
                if let Err(err) = verdict {
                    if err.is_retryable() {
                        // May become valid later; leave the link in place.
                        warn!(
                            target: "downloaders::headers",
                            %hash,
                            height,
                            "Added future link"
                        );
                        return Ok(outcome)
                    }
                    let parent_hash =
                        state.links.get(&hash).map(|link| link.parent_hash).unwrap_or_default();
                    debug!(
                        target: "downloaders::headers",
                        %hash,
                        height,
                        %err,
                        "Verification failed for header"
                    );
                    state.bad_pos_headers.insert(hash, parent_hash);
                    state.remove_upwards(hash);
                    state.stats.invalid_headers += 1;
                    outcome.more = true;
                    return Ok(outcome)
                }
            }
            if let Some(link) = state.links.get_mut(&hash) {
                link.verified = true;
            }

            let (td, timestamp, difficulty) = {
                let Some(link) = state.links.get(&hash) else { return Ok(outcome) };
                let Some(header) = link.header.as_ref() else { return Ok(outcome) };
                let Some(raw) = link.raw.as_ref() else { return Ok(outcome) };
                let segment = SegmentHeader {
                    header: header.clone(),
                    raw: raw.clone(),
                    hash,
                    number: height,
                };
                (hf(&segment)?, header.timestamp, header.difficulty)
            };
            // A PoS verdict recorded for this hash is obsolete now.
            state.bad_pos_headers.remove(&hash);
            if let Some(td) = td {
                if state.seen_announces.remove(&hash).is_some() {
                    state.to_announce.push(Announce { hash, number: height });
                }
                if let Some(ttd) = ttd {
                    if td >= ttd {
                        state.highest_in_db = height;
                        outcome.terminal = true;
                        outcome.more = true;
                        self.delivery_notify.notify_one();
                        return Ok(outcome)
                    }
                    return_td = Some(td);
                    last_difficulty = Some(difficulty);
                }
            }
            if height > state.highest_in_db {
                state.highest_in_db = height;
            }
            outcome.last_block_time = timestamp;
            if let Some(link) = state.links.get_mut(&hash) {
                link.persisted = true;
                // Payload lives in the database now; free the memory.
                link.header = None;
                link.raw = None;
            }
            state.move_link_to_queue(hash, QueueId::Persisted);
            let children = state.links.get(&hash).map(|link| link.children.clone()).unwrap_or_default();
            for child in children {
                let promote = state.links.get(&child).is_some_and(|link| !link.persisted);
                if promote {
                    if let Some(link) = state.links.get_mut(&child) {
                        link.linked = true;
                    }
                    state.move_link_to_queue(child, QueueId::Insert);
                }
            }
        }
        state.prune_persisted_queue(self.config.persisted_link_limit);

        if let (Some(ttd), Some(td), Some(diff)) = (ttd, return_td, last_difficulty) {
            outcome.blocks_to_ttd =
                (ttd - td).checked_div(diff).and_then(|blocks| u64::try_from(blocks).ok());
        }
        outcome.more = outcome.more ||
            state
                .insert_queue
                .iter()
                .next()
                .is_some_and(|&(next_height, _)| next_height <= state.highest_in_db + 1);
        Ok(outcome)
    }

    /// Drains the insert queue through [`Self::insert_header`].
    ///
    /// Returns `true` if the chain is considered in sync: the terminal total
    /// difficulty was reached, or the tip is past the preverified height and
    /// within a minute of `now_unix`.
    pub fn insert_headers<F>(
        &self,
        hf: &mut F,
        header_limit: Option<u64>,
        ttd: Option<U256>,
        now_unix: u64,
    ) -> Result<bool, DownloadError>
    where
        F: FnMut(&SegmentHeader) -> Result<Option<U256>, DownloadError>,
    {
        let start_height = self.state.read().highest_in_db;
        let mut last_time = 0;
        let mut blocks_to_ttd = None;
        let mut last_log = Instant::now();
        loop {
            let outcome = self.insert_header(hf, ttd)?;
            if outcome.terminal {
                return Ok(true)
            }
            last_time = outcome.last_block_time;
            if outcome.blocks_to_ttd.is_some() {
                blocks_to_ttd = outcome.blocks_to_ttd;
            }
            if !outcome.more {
                break
            }
            if last_log.elapsed() >= LOG_INTERVAL {
                last_log = Instant::now();
                info!(
                    target: "downloaders::headers",
                    progress = self.state.read().highest_in_db,
                    "Inserting headers"
                );
            }
            if let Some(limit) = header_limit {
                if self.state.read().highest_in_db.saturating_sub(start_height) > limit {
                    break
                }
            }
        }
        if let Some(blocks) = blocks_to_ttd {
            trace!(target: "downloaders::headers", blocks, "Estimated to reach TTD");
        }
        let state = self.state.read();
        let within_minute = last_time + 60 >= now_unix;
        Ok(state.highest_in_db >= state.preverified_height && within_minute)
    }

    // === request planning ===

    /// Plans the forward skeleton request sketching the chain ahead of the
    /// tip. One already-known header is included so responses at the tip are
    /// never empty.
    pub fn request_skeleton(&self) -> HeaderRequest {
        let state = self.state.read();
        let stride = if state.initial_cycle { SKELETON_STRIDE } else { 0 };
        let from = if state.highest_in_db <= 1 { 1 } else { state.highest_in_db - 1 };
        HeaderRequest {
            hash: None,
            number: from,
            length: HEADER_REQUEST_LENGTH,
            skip: stride,
            reverse: false,
        }
    }

    /// Plans an ancestor request for the first anchor that is due at `now`.
    ///
    /// Every anchor that exhausted its retries on the way is invalidated, its
    /// subtree evicted and a penalty emitted for its peer; the ascent then
    /// continues until a request can be returned.
    pub fn request_more_headers(
        &self,
        now: Instant,
    ) -> (Option<HeaderRequest>, Vec<PenaltyItem>) {
        let mut state = self.state.write();
        let mut penalties = Vec::new();
        let anchors: Vec<(BlockNumber, B256)> = state.anchor_tree.iter().copied().collect();
        for (height, parent_hash) in anchors {
            if height == 0 {
                // Has no parent to request.
                continue
            }
            let Some(anchor) = state.anchors.get(&parent_hash) else { continue };
            if !anchor.ready(now) {
                continue
            }
            if anchor.timeouts >= MAX_ANCHOR_TIMEOUTS {
                // Ancestors of this anchor seem unavailable; give up on it.
                let peer_id = anchor.peer_id;
                state.invalidate_anchor(parent_hash, "suspected unavailability");
                penalties.push(PenaltyItem { penalty: Penalty::AbandonedAnchor, peer_id });
                continue
            }
            return (
                Some(HeaderRequest {
                    hash: Some(parent_hash),
                    number: height - 1,
                    length: HEADER_REQUEST_LENGTH,
                    skip: 0,
                    reverse: true,
                }),
                penalties,
            )
        }
        (None, penalties)
    }

    /// Bumps the timeout counter and retry time of the anchor a request was
    /// planned for.
    pub fn update_retry_time(&self, req: &HeaderRequest, now: Instant, timeout: Duration) {
        let Some(hash) = req.hash else { return };
        let mut state = self.state.write();
        if let Some(anchor) = state.anchors.get_mut(&hash) {
            anchor.timeouts += 1;
            anchor.next_retry_time = Some(now + timeout);
        } else if let Some(anchor) = state.pos_anchor.as_mut() {
            if anchor.parent_hash == hash {
                anchor.timeouts += 1;
                anchor.next_retry_time = Some(now + timeout);
            }
        }
    }

    /// Records a planned request in the stats counters.
    pub fn update_stats(&self, req: &HeaderRequest, skeleton: bool) {
        let mut state = self.state.write();
        let stats = &mut state.stats;
        if skeleton {
            stats.skeleton_requests += 1;
            if stats.skeleton_req_min_block == 0 || req.number < stats.skeleton_req_min_block {
                stats.skeleton_req_min_block = req.number;
            }
            if req.number + req.length * req.skip > stats.skeleton_req_max_block {
                stats.skeleton_req_max_block = req.number + req.length * (req.skip + 1);
            }
        } else {
            stats.requests += 1;
            // Reverse request with skip 0: `number` is the upper bound.
            if req.number > stats.req_max_block {
                stats.req_max_block = req.number;
            }
            if stats.req_min_block == 0 || req.number < stats.req_min_block + req.length {
                if req.number >= req.length {
                    stats.req_min_block = req.number - req.length;
                }
            }
        }
    }

    // === recovery ===

    /// Rehydrates the highest persisted links from the database at startup.
    pub fn recover_from_db(&self, db: &dyn HeaderReader) -> Result<(), DownloadError> {
        let started = Instant::now();
        let mut state = self.state.write();
        state.drain_persisted_queue();
        state.highest_in_db = db.stage_progress()?;
        for raw in db.headers_newest_first(self.config.persisted_link_limit)? {
            let sh = SegmentHeader::from_raw(raw).map_err(DatabaseError::Decode)?;
            if sh.number <= state.highest_in_db {
                state.add_header_as_link(&sh, true, PeerId::ZERO);
            }
        }
        debug!(
            target: "downloaders::headers",
            links = state.persisted_queue.len(),
            elapsed = ?started.elapsed(),
            "Recovered persisted links from db"
        );
        Ok(())
    }

    /// Re-reads the header stage progress, for when a transaction aborted and
    /// the in-memory tip ran ahead of the database.
    pub fn read_progress_from_db(&self, db: &dyn HeaderReader) -> Result<(), DownloadError> {
        let mut state = self.state.write();
        state.highest_in_db = db.stage_progress()?;
        Ok(())
    }

    /// Loads the newest frozen headers as persisted links and raises the
    /// database tip and preverified height over the frozen range.
    pub fn add_headers_from_snapshot(
        &self,
        reader: &dyn SnapshotReader,
    ) -> Result<(), DownloadError> {
        let frozen = reader.frozen_blocks();
        let mut state = self.state.write();
        let mut number = frozen;
        while number > 0 && state.persisted_queue.len() < self.config.persisted_link_limit {
            if let Some(header) = reader.header_by_number(number)? {
                let sh = SegmentHeader::from_header(header);
                state.add_header_as_link(&sh, true, PeerId::ZERO);
            }
            number -= 1;
        }
        if state.highest_in_db < frozen {
            state.highest_in_db = frozen;
        }
        if state.preverified_height < frozen {
            state.preverified_height = frozen;
        }
        Ok(())
    }

    // === bad headers ===

    /// Marks a header bad; its subtree is evicted when next encountered.
    pub fn report_bad_header(&self, hash: B256) {
        self.state.write().bad_headers.insert(hash);
    }

    /// Returns whether the hash is marked bad.
    pub fn is_bad_header(&self, hash: B256) -> bool {
        self.state.read().bad_headers.contains(&hash)
    }

    /// Removes the link and all its descendants from every queue.
    pub fn unlink_header(&self, hash: B256) {
        let mut state = self.state.write();
        if state.links.contains_key(&hash) {
            state.remove_upwards(hash);
        }
    }

    /// Records a bad PoS tip together with its last valid ancestor.
    pub fn report_bad_pos_header(&self, bad: B256, last_valid_ancestor: B256) {
        self.state.write().bad_pos_headers.insert(bad, last_valid_ancestor);
    }

    /// Returns the last valid ancestor if the tip is marked bad for PoS.
    pub fn is_bad_pos_header(&self, tip: B256) -> Option<B256> {
        self.state.read().bad_pos_headers.get(&tip).copied()
    }

    /// Height up to which headers match the hard-coded trust list.
    pub fn preverified_height(&self) -> BlockNumber {
        self.state.read().preverified_height
    }

    /// Raises the height below which verification can be bypassed.
    pub fn set_preverified_height(&self, height: BlockNumber) {
        let mut state = self.state.write();
        if state.preverified_height < height {
            state.preverified_height = height;
        }
    }

    /// Marks every queued link verified, bypassing consensus below the
    /// preverified height.
    pub fn mark_all_verified(&self) {
        let mut state = self.state.write();
        let queued: Vec<B256> = state.insert_queue.iter().map(|&(_, hash)| hash).collect();
        for hash in queued {
            if let Some(link) = state.links.get_mut(&hash) {
                if !link.verified {
                    link.linked = true;
                    link.verified = true;
                }
            }
        }
        let pending: Vec<B256> = state.entry_queue.iter().map(|&(_, hash)| hash).collect();
        for hash in pending {
            if let Some(link) = state.links.get_mut(&hash) {
                if !link.verified {
                    link.linked = true;
                    link.verified = true;
                }
            }
            state.move_link_to_queue(hash, QueueId::Insert);
        }
    }

    // === announce bus and stats ===

    /// Marks a hash as externally announced; only such hashes are relayed
    /// further once persisted.
    pub fn save_external_announce(&self, hash: B256) {
        self.state.write().seen_announces.insert(hash, ());
    }

    /// Returns all pending announces and forgets them.
    pub fn grab_announces(&self) -> Vec<Announce> {
        std::mem::take(&mut self.state.write().to_announce)
    }

    /// Returns a snapshot of the stats counters and resets them.
    pub fn extract_stats(&self) -> Stats {
        std::mem::take(&mut self.state.write().stats)
    }

    // === observers and mode flags ===

    /// Height the download has progressed to: the PoS anchor floor while a
    /// reverse download runs, the database tip otherwise.
    pub fn progress(&self) -> BlockNumber {
        let state = self.state.read();
        if state.pos_sync {
            if let Some(anchor) = &state.pos_anchor {
                return anchor.block_height - 1
            }
        }
        state.highest_in_db
    }

    /// Returns whether a link with the given hash is in the store.
    pub fn has_link(&self, hash: B256) -> bool {
        self.state.read().links.contains_key(&hash)
    }

    /// Returns the peer that delivered the given link.
    pub fn source_peer_id(&self, hash: B256) -> Option<PeerId> {
        self.state.read().links.get(&hash).map(|link| link.peer_id)
    }

    /// Highest block number committed to the database.
    pub fn highest_in_db(&self) -> BlockNumber {
        self.state.read().highest_in_db
    }

    /// Whether the first skeleton-striding download cycle is still running.
    pub fn initial_cycle(&self) -> bool {
        self.state.read().initial_cycle
    }

    /// Switches from the striding skeleton to contiguous tip-following.
    pub fn after_initial_cycle(&self) {
        self.state.write().initial_cycle = false;
    }

    /// Whether the engine is fetching newly announced blocks.
    pub fn fetching_new(&self) -> bool {
        self.state.read().fetching_new
    }

    /// Sets the fetching-new flag.
    pub fn set_fetching_new(&self, fetching: bool) {
        self.state.write().fetching_new = fetching;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headers::SyncStatus;
    use strata_interfaces::test_utils::{
        child_header, random_header, random_header_range, TestConsensus, TestDb,
        TestSnapshotReader,
    };

    fn engine() -> HeaderSync {
        engine_with_config(HeadersConfig::default())
    }

    fn engine_with_config(config: HeadersConfig) -> HeaderSync {
        HeaderSync::new(config, Arc::new(TestConsensus::default()), Arc::new(TestDb::default()))
    }

    fn peer() -> PeerId {
        PeerId::random()
    }

    #[test]
    fn duplicate_header_is_counted_and_ignored() {
        let hd = engine();
        let sh = random_header(1, None);
        assert!(hd.process_header(&sh, peer()));
        assert!(!hd.process_header(&sh, peer()));

        let state = hd.state.read();
        assert_eq!(state.stats.duplicates, 1);
        assert_eq!(state.links.len(), 1);
        assert_eq!(state.anchors.len(), 1);
    }

    #[test]
    fn parentless_header_opens_anchor_and_requests_more() {
        let hd = engine();
        let sh = random_header(10, None);
        assert!(hd.process_header(&sh, peer()));

        let state = hd.state.read();
        let anchor = state.anchors.get(&sh.parent_hash()).expect("anchor created");
        assert_eq!(anchor.block_height, 10);
        assert_eq!(anchor.links, vec![sh.hash]);
        assert!(state.entry_queue.contains(&(10, sh.hash)));
    }

    #[test]
    fn sibling_joins_existing_anchor_without_new_request() {
        let hd = engine();
        let parent_hash = B256::random();
        let first = random_header(10, Some(parent_hash));
        let second = random_header(10, Some(parent_hash));
        assert!(hd.process_header(&first, peer()));
        assert!(!hd.process_header(&second, peer()));

        let state = hd.state.read();
        assert_eq!(state.anchors.len(), 1);
        assert_eq!(state.anchors[&parent_hash].links.len(), 2);
    }

    #[test]
    fn link_closing_an_anchor_adopts_its_children() {
        let hd = engine();
        let missing = random_header(5, None);
        let child = child_header(&missing);
        assert!(hd.process_header(&child, peer()));
        // The missing parent arrives; the anchor at its hash resolves, a new
        // one opens one level down.
        assert!(hd.process_header(&missing, peer()));

        let state = hd.state.read();
        assert!(!state.anchors.contains_key(&missing.hash));
        assert!(state.anchors.contains_key(&missing.parent_hash()));
        assert_eq!(state.links[&missing.hash].children, vec![child.hash]);
        state.assert_invariants();
    }

    #[test]
    fn too_old_parentless_header_is_rejected() {
        let hd = engine();
        hd.state.write().highest_in_db = 100;
        let sh = random_header(50, None);
        assert!(!hd.process_header(&sh, peer()));
        assert!(hd.state.read().links.is_empty());
    }

    #[test]
    fn anchor_cap_rejects_new_anchors() {
        let config = HeadersConfig { anchor_limit: 2, ..Default::default() };
        let hd = engine_with_config(config);
        assert!(hd.process_header(&random_header(1, None), peer()));
        assert!(hd.process_header(&random_header(2, None), peer()));
        assert!(!hd.process_header(&random_header(3, None), peer()));
        assert_eq!(hd.state.read().anchors.len(), 2);
    }

    #[test]
    fn child_of_persisted_parent_goes_to_insert_queue() {
        let hd = engine();
        let genesis = random_header(0, None);
        hd.state.write().add_header_as_link(&genesis, true, PeerId::ZERO);
        let child = child_header(&genesis);
        assert!(!hd.process_header(&child, peer()));

        let state = hd.state.read();
        assert!(state.insert_queue.contains(&(1, child.hash)));
        assert!(state.links[&child.hash].linked);
        state.assert_invariants();
    }

    #[test]
    fn process_headers_prunes_past_link_limit() {
        let config = HeadersConfig { link_limit: 5, ..Default::default() };
        let hd = engine_with_config(config);
        let chain = random_header_range(1..11, B256::random());
        hd.process_headers(&chain, peer());

        let state = hd.state.read();
        assert!(state.link_queue.len() <= 5);
        assert_eq!(state.stats.responses, 1);
        state.assert_invariants();
    }

    #[test]
    fn request_skeleton_strides_only_in_the_initial_cycle() {
        let hd = engine();
        hd.state.write().highest_in_db = 1000;
        let req = hd.request_skeleton();
        assert_eq!(req.number, 999);
        assert_eq!(req.skip, SKELETON_STRIDE);
        assert!(!req.reverse);

        hd.after_initial_cycle();
        let req = hd.request_skeleton();
        assert_eq!(req.skip, 0);

        hd.state.write().highest_in_db = 0;
        assert_eq!(hd.request_skeleton().number, 1);
    }

    #[test]
    fn request_more_headers_targets_the_lowest_ready_anchor() {
        let hd = engine();
        let low = random_header(10, None);
        let high = random_header(20, None);
        hd.process_header(&high, peer());
        hd.process_header(&low, peer());

        let now = Instant::now();
        let (req, penalties) = hd.request_more_headers(now);
        let req = req.expect("request planned");
        assert!(penalties.is_empty());
        assert_eq!(req.hash, Some(low.parent_hash()));
        assert_eq!(req.number, 9);
        assert_eq!(req.length, HEADER_REQUEST_LENGTH);
        assert!(req.reverse);

        // Not retried before its timeout elapses.
        hd.update_retry_time(&req, now, Duration::from_secs(30));
        let (req2, _) = hd.request_more_headers(now + Duration::from_secs(1));
        assert_eq!(req2.expect("next anchor").hash, Some(high.parent_hash()));
    }

    #[test]
    fn exhausted_anchor_is_invalidated_with_penalty() {
        let hd = engine();
        let sh = random_header(10, None);
        let peer_id = peer();
        hd.process_header(&sh, peer_id);

        let mut now = Instant::now();
        for _ in 0..MAX_ANCHOR_TIMEOUTS {
            let (req, penalties) = hd.request_more_headers(now);
            assert!(penalties.is_empty());
            hd.update_retry_time(&req.expect("still retryable"), now, Duration::from_secs(30));
            now += Duration::from_secs(31);
        }
        let (req, penalties) = hd.request_more_headers(now);
        assert!(req.is_none());
        assert_eq!(penalties, vec![PenaltyItem { penalty: Penalty::AbandonedAnchor, peer_id }]);

        let state = hd.state.read();
        assert!(state.anchors.is_empty());
        assert!(state.links.is_empty());
        assert_eq!(state.stats.invalidated_anchors, 1);
    }

    #[test]
    fn update_stats_tracks_request_ranges() {
        let hd = engine();
        let skeleton = HeaderRequest {
            hash: None,
            number: 1000,
            length: HEADER_REQUEST_LENGTH,
            skip: SKELETON_STRIDE,
            reverse: false,
        };
        hd.update_stats(&skeleton, true);
        let anchor = HeaderRequest {
            hash: Some(B256::random()),
            number: 500,
            length: HEADER_REQUEST_LENGTH,
            skip: 0,
            reverse: true,
        };
        hd.update_stats(&anchor, false);

        let stats = hd.extract_stats();
        assert_eq!(stats.skeleton_requests, 1);
        assert_eq!(stats.skeleton_req_min_block, 1000);
        assert_eq!(stats.skeleton_req_max_block, 1000 + 192 * 193);
        assert_eq!(stats.requests, 1);
        assert_eq!(stats.req_max_block, 500);
        assert_eq!(stats.req_min_block, 500 - 192);
        // Extraction resets the counters.
        assert_eq!(hd.extract_stats(), Stats::default());
    }

    #[test]
    fn single_header_admission() {
        let hd = engine();
        let sh = random_header(5, None);
        let (seg, penalty) = hd.single_header_as_segment(sh.clone(), false);
        assert_eq!(seg, Some(sh.clone()));
        assert_eq!(penalty, None);

        hd.report_bad_header(sh.hash);
        let (seg, penalty) = hd.single_header_as_segment(sh.clone(), false);
        assert!(seg.is_none());
        assert_eq!(penalty, Some(Penalty::BadBlock));
        assert_eq!(hd.state.read().stats.rejected_bad_headers, 1);

        let mut merged = random_header(6, None);
        merged.header.difficulty = U256::ZERO;
        let merged = SegmentHeader::from_header(merged.header);
        let (seg, penalty) = hd.single_header_as_segment(merged, true);
        assert!(seg.is_none());
        assert_eq!(penalty, Some(Penalty::NewBlockGossipAfterMerge));
    }

    #[test]
    fn mark_all_verified_promotes_entry_links() {
        let hd = engine();
        let sh = random_header(10, None);
        hd.process_header(&sh, peer());
        hd.mark_all_verified();

        let state = hd.state.read();
        let link = &state.links[&sh.hash];
        assert!(link.verified);
        assert!(state.insert_queue.contains(&(10, sh.hash)));
    }

    #[test]
    fn announces_round_trip() {
        let hd = engine();
        let hash = B256::random();
        hd.save_external_announce(hash);
        assert!(hd.grab_announces().is_empty());
        hd.state.write().to_announce.push(Announce { hash, number: 3 });
        assert_eq!(hd.grab_announces(), vec![Announce { hash, number: 3 }]);
        assert!(hd.grab_announces().is_empty());
    }

    #[test]
    fn snapshot_loader_raises_tip_and_preverified() {
        let hd = engine();
        let chain = random_header_range(1..6, B256::ZERO);
        let reader = TestSnapshotReader::new(chain.iter().map(|sh| sh.header.clone()));
        hd.add_headers_from_snapshot(&reader).unwrap();

        let state = hd.state.read();
        assert_eq!(state.highest_in_db, 5);
        assert_eq!(state.preverified_height, 5);
        assert_eq!(state.persisted_queue.len(), 5);
        for sh in &chain {
            assert!(state.links[&sh.hash].persisted);
        }
        state.assert_invariants();
    }

    #[test]
    fn recover_from_db_loads_highest_persisted_links() {
        let config = HeadersConfig { persisted_link_limit: 3, ..Default::default() };
        let hd = engine_with_config(config);
        let db = TestDb::default();
        let chain = random_header_range(0..10, B256::ZERO);
        for (i, sh) in chain.iter().enumerate() {
            db.commit(sh, U256::from(i as u64), true);
        }
        hd.recover_from_db(&db).unwrap();

        let state = hd.state.read();
        assert_eq!(state.highest_in_db, 9);
        assert_eq!(state.persisted_queue.len(), 3);
        for sh in &chain[7..] {
            assert!(state.links.contains_key(&sh.hash));
        }
        state.assert_invariants();
    }

    #[test]
    fn progress_follows_the_pos_anchor_during_reverse_sync() {
        let hd = engine();
        hd.state.write().highest_in_db = 7;
        assert_eq!(hd.progress(), 7);

        hd.set_pos_sync(true);
        hd.set_pos_target(B256::random(), 99);
        assert_eq!(hd.progress(), 99);
        hd.set_pos_status(SyncStatus::Synced);
        assert_eq!(hd.pos_status(), SyncStatus::Synced);
    }
}
