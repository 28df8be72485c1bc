//! Post-merge download: a reverse walk from a consensus-layer target back to
//! a locally known ancestor.
//!
//! A single PoS anchor records the hash still to be fetched. Incoming reverse
//! segments advance it towards genesis while raw headers stream into the
//! spill-to-disk collector; the walk ends when a delivered header's parent is
//! already in the database.

use super::{
    forest::{Anchor, SyncState},
    sync::HeaderSync,
    DownloadError, HEADER_REQUEST_LENGTH, LOG_INTERVAL, MAX_POS_TIMEOUTS, POS_LOOP_TICK,
};
use std::{sync::Arc, time::Instant};
use strata_etl::Collector;
use strata_interfaces::{
    db::HeaderReader,
    p2p::{HeaderRequest, Penalty, PenaltyItem},
};
use strata_primitives::{BlockNumber, PeerId, SegmentHeader, B256};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Status of the PoS reverse download.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncStatus {
    /// No download in flight.
    #[default]
    Idle,
    /// Reverse walk towards a known ancestor in progress.
    Syncing,
    /// Target connected to the local chain.
    Synced,
}

impl HeaderSync {
    /// Points the reverse download at a new target: `hash` is the parent of
    /// the lowest header already obtained, `height` its height.
    pub fn set_pos_target(&self, hash: B256, height: BlockNumber) {
        let mut state = self.state.write();
        debug!(target: "downloaders::headers", block_height = height + 1, "Setting PoS anchor");
        state.pos_anchor = Some(Anchor::new(hash, height + 1, PeerId::ZERO));
    }

    /// The hash the reverse download still has to fetch and the height of the
    /// lowest header obtained so far.
    pub fn pos_target(&self) -> Option<(B256, BlockNumber)> {
        self.state.read().pos_anchor.as_ref().map(|anchor| (anchor.parent_hash, anchor.block_height))
    }

    /// Ingests one reverse segment (highest header first).
    ///
    /// Headers that do not match the anchor are skipped without penalty;
    /// duplicate responses are common. A matching header streams into the
    /// collector and either finishes the walk, when its parent is found in
    /// `db`, or advances the anchor one step down.
    pub fn process_headers_pos(
        &self,
        headers: &[SegmentHeader],
        db: &dyn HeaderReader,
        peer_id: PeerId,
    ) -> Result<(), DownloadError> {
        let (Some(from), Some(to)) = (headers.first(), headers.last()) else { return Ok(()) };
        debug!(
            target: "downloaders::headers",
            from = from.number,
            from_hash = %from.hash,
            to = to.number,
            to_hash = %to.hash,
            len = headers.len(),
            peer = %peer_id,
            "Collecting PoS headers"
        );

        let mut guard = self.state.write();
        let state = &mut *guard;
        if state.pos_anchor.is_none() {
            // Peers keep sending unrequested packets after we have synced.
            debug!(target: "downloaders::headers", "PoS anchor is gone");
            return Ok(())
        }
        if state.headers_collector.is_none() {
            // Request raced the collector shutdown.
            return Ok(())
        }

        for sh in headers {
            let Some(anchor) = state.pos_anchor.as_ref() else { break };
            if sh.hash != anchor.parent_hash {
                if anchor.block_height == sh.number + 1 {
                    debug!(
                        target: "downloaders::headers",
                        hash = %sh.hash,
                        expected = %anchor.parent_hash,
                        peer = %peer_id,
                        "Unexpected header"
                    );
                }
                // No penalty: we may have sent the request twice.
                continue
            }

            if let Some(collector) = state.headers_collector.as_mut() {
                collector.collect(sh.number, sh.hash, &sh.raw)?;
            }

            if let Some(parent) = db.header_by_hash(sh.parent_hash())? {
                debug!(target: "downloaders::headers", height = sh.number, "Reverse walk connected");
                if sh.number != parent.number + 1 {
                    state.bad_pos_headers.insert(sh.hash, sh.parent_hash());
                    return Err(DownloadError::InvalidPosSegment {
                        got: sh.number,
                        expected: parent.number + 1,
                    })
                }
                state.pos_anchor = None;
                state.pos_status = SyncStatus::Synced;
                self.delivery_notify.notify_one();
                return Ok(())
            }

            state.pos_anchor = Some(Anchor::new(sh.parent_hash(), sh.number, peer_id));
            if sh.number <= 1 {
                return Err(DownloadError::WrongGenesis)
            }
        }
        Ok(())
    }

    /// Plans the next reverse request if the anchor is due.
    ///
    /// Returns `(timed_out, request, penalties)`; on timeout the download is
    /// to be abandoned.
    fn request_more_headers_pos(
        state: &mut SyncState,
        now: Instant,
    ) -> (bool, Option<HeaderRequest>, Vec<PenaltyItem>) {
        let Some(anchor) = state.pos_anchor.as_ref() else {
            debug!(target: "downloaders::headers", "No PoS anchor");
            return (false, None, Vec::new())
        };
        if !anchor.ready(now) {
            return (false, None, Vec::new())
        }
        if anchor.timeouts >= MAX_POS_TIMEOUTS {
            warn!(target: "downloaders::headers", peer = %anchor.peer_id, "PoS download timed out");
            let penalty = PenaltyItem { penalty: Penalty::AbandonedAnchor, peer_id: anchor.peer_id };
            return (true, None, vec![penalty])
        }
        trace!(
            target: "downloaders::headers",
            number = anchor.block_height - 1,
            length = HEADER_REQUEST_LENGTH,
            "Requesting PoS headers"
        );
        let request = HeaderRequest {
            hash: Some(anchor.parent_hash),
            number: anchor.block_height - 1,
            length: HEADER_REQUEST_LENGTH,
            skip: 0,
            reverse: true,
        };
        (false, Some(request), Vec::new())
    }

    /// Attaches the spill buffer the next download collects into.
    pub fn set_headers_collector(&self, collector: Collector) {
        self.state.write().headers_collector = Some(collector);
    }

    /// Detaches the collector, handing its contents to the caller.
    pub fn take_headers_collector(&self) -> Option<Collector> {
        self.state.write().headers_collector.take()
    }

    fn clean_up_pos_download(state: &mut SyncState) {
        // Dropping the collector removes its spill files.
        state.headers_collector = None;
        state.pos_status = SyncStatus::Idle;
    }

    /// Runs the PoS download loop until cancelled: plans reverse requests on
    /// a small tick, hands them to `send_request`, reports penalties through
    /// `penalize` and logs progress every 30 seconds.
    ///
    /// `send_request` returns whether the request actually went out to a
    /// peer; only then is the retry clock armed.
    pub fn spawn_pos_downloader<S, P>(
        self: Arc<Self>,
        cancel: CancellationToken,
        mut send_request: S,
        mut penalize: P,
    ) -> tokio::task::JoinHandle<()>
    where
        S: FnMut(&HeaderRequest) -> bool + Send + 'static,
        P: FnMut(Vec<PenaltyItem>) + Send + 'static,
    {
        tokio::spawn(async move {
            let mut prev_progress = 0u64;
            let mut last_log = Instant::now();
            loop {
                let now = Instant::now();
                let mut request = None;
                let mut penalties = Vec::new();
                {
                    let mut state = self.state.write();
                    if state.pos_status == SyncStatus::Syncing {
                        let (timed_out, req, pen) =
                            Self::request_more_headers_pos(&mut state, now);
                        if timed_out {
                            Self::clean_up_pos_download(&mut state);
                        }
                        request = req;
                        penalties = pen;
                    } else {
                        prev_progress = 0;
                    }
                }
                if let Some(request) = &request {
                    if send_request(request) {
                        self.update_retry_time(request, now, self.config.retry_delay);
                        debug!(
                            target: "downloaders::headers",
                            number = request.number,
                            "Sent PoS headers request"
                        );
                    }
                }
                if !penalties.is_empty() {
                    penalize(penalties);
                }

                if last_log.elapsed() >= LOG_INTERVAL {
                    last_log = Instant::now();
                    if self.pos_status() == SyncStatus::Syncing {
                        let progress = self.progress();
                        if prev_progress == 0 {
                            prev_progress = progress;
                        } else if progress <= prev_progress {
                            let blocks = prev_progress - progress;
                            info!(
                                target: "downloaders::headers",
                                now = progress,
                                blk_per_sec = blocks / LOG_INTERVAL.as_secs(),
                                "Downloaded PoS headers"
                            );
                            prev_progress = progress;
                        }
                    }
                }

                tokio::select! {
                    _ = cancel.cancelled() => {
                        Self::clean_up_pos_download(&mut self.state.write());
                        return
                    }
                    _ = tokio::time::sleep(POS_LOOP_TICK) => {}
                }
            }
        })
    }

    /// Whether the engine is in PoS mode.
    pub fn pos_sync(&self) -> bool {
        self.state.read().pos_sync
    }

    /// Switches the engine into or out of PoS mode.
    pub fn set_pos_sync(&self, pos_sync: bool) {
        self.state.write().pos_sync = pos_sync;
    }

    /// Status of the reverse download.
    pub fn pos_status(&self) -> SyncStatus {
        self.state.read().pos_status
    }

    /// Sets the status of the reverse download.
    pub fn set_pos_status(&self, status: SyncStatus) {
        self.state.write().pos_status = status;
    }

    /// Height of the first PoS block ever observed, if any.
    pub fn first_pos_height(&self) -> Option<BlockNumber> {
        self.state.read().first_pos_height
    }

    /// Records the first observed PoS height; later calls keep the first
    /// value.
    pub fn set_first_pos_height(&self, height: BlockNumber) {
        let mut state = self.state.write();
        if state.first_pos_height.is_none() {
            state.first_pos_height = Some(height);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headers::HeadersConfig;
    use assert_matches::assert_matches;
    use strata_interfaces::test_utils::{random_header_range, TestConsensus, TestDb};
    use strata_primitives::U256;

    fn engine() -> HeaderSync {
        HeaderSync::new(
            HeadersConfig::default(),
            Arc::new(TestConsensus::default()),
            Arc::new(TestDb::default()),
        )
    }

    fn with_collector(hd: &HeaderSync) {
        hd.set_headers_collector(Collector::new(1024 * 1024).unwrap());
        hd.set_pos_status(SyncStatus::Syncing);
    }

    #[test]
    fn segments_without_anchor_are_ignored() {
        let hd = engine();
        let db = TestDb::default();
        let chain = random_header_range(1..4, B256::random());
        assert!(hd.process_headers_pos(&chain, &db, PeerId::ZERO).is_ok());
        assert_eq!(hd.pos_target(), None);
    }

    #[test]
    fn mismatched_headers_are_skipped_without_penalty() {
        let hd = engine();
        let db = TestDb::default();
        with_collector(&hd);
        hd.set_pos_target(B256::random(), 99);

        let stray = random_header_range(90..95, B256::random());
        let stray: Vec<_> = stray.into_iter().rev().collect();
        assert!(hd.process_headers_pos(&stray, &db, PeerId::ZERO).is_ok());
        // Anchor untouched.
        assert_eq!(hd.pos_target().map(|t| t.1), Some(100));
    }

    #[test]
    fn reverse_walk_advances_and_connects() {
        let hd = engine();
        let db = TestDb::default();
        with_collector(&hd);

        // Chain 0..=20; the database knows header 10.
        let chain = random_header_range(0..21, B256::ZERO);
        db.commit(&chain[10], U256::from(10), true);

        // Walk down from header 19 (anchor waits for hash of 19).
        hd.set_pos_target(chain[19].hash, 19);
        let mut segment: Vec<_> = chain[12..20].to_vec();
        segment.reverse();
        assert!(hd.process_headers_pos(&segment, &db, PeerId::ZERO).is_ok());
        // Lowest delivered header is 12; the anchor now wants hash of 11.
        assert_eq!(hd.pos_target(), Some((chain[12].parent_hash(), 12)));
        assert_eq!(hd.pos_status(), SyncStatus::Syncing);

        // The next segment connects: header 11's parent is in the database.
        assert!(hd.process_headers_pos(&chain[11..12].to_vec(), &db, PeerId::ZERO).is_ok());
        assert_eq!(hd.pos_target(), None);
        assert_eq!(hd.pos_status(), SyncStatus::Synced);

        // Everything that matched was collected.
        let mut collector = hd.take_headers_collector().unwrap();
        let collected: Vec<_> =
            collector.iter().unwrap().map(|e| e.unwrap()).map(|(n, _, _)| n).collect();
        assert_eq!(collected, (11..20).collect::<Vec<_>>());
    }

    #[test]
    fn wrong_height_at_connection_is_an_invalid_segment() {
        let hd = engine();
        let db = TestDb::default();
        with_collector(&hd);

        let parent = random_header_range(10..11, B256::ZERO).remove(0);
        db.commit(&parent, U256::from(10), true);
        // A child that lies about its height.
        let mut bad = random_header_range(11..12, parent.hash).remove(0);
        bad.header.number = 13;
        let bad = SegmentHeader::from_header(bad.header);

        hd.set_pos_target(bad.hash, 12);
        let err = hd.process_headers_pos(&[bad.clone()], &db, PeerId::ZERO).unwrap_err();
        assert_matches!(err, DownloadError::InvalidPosSegment { got: 13, expected: 11 });
        assert_eq!(hd.is_bad_pos_header(bad.hash), Some(parent.hash));
    }

    #[test]
    fn walking_into_genesis_is_an_error() {
        let hd = engine();
        let db = TestDb::default();
        with_collector(&hd);

        let chain = random_header_range(0..2, B256::ZERO);
        hd.set_pos_target(chain[1].hash, 1);
        let err = hd.process_headers_pos(&chain[1..2].to_vec(), &db, PeerId::ZERO).unwrap_err();
        assert_matches!(err, DownloadError::WrongGenesis);
    }

    #[test]
    fn pos_requests_time_out_after_three_retries() {
        let hd = engine();
        with_collector(&hd);
        hd.set_pos_target(B256::random(), 99);

        let mut now = Instant::now();
        for _ in 0..MAX_POS_TIMEOUTS {
            let (timed_out, request, penalties) = {
                let mut state = hd.state.write();
                HeaderSync::request_more_headers_pos(&mut state, now)
            };
            assert!(!timed_out);
            assert!(penalties.is_empty());
            let request = request.expect("still retryable");
            assert_eq!(request.number, 99);
            assert!(request.reverse);
            hd.update_retry_time(&request, now, std::time::Duration::from_secs(30));
            now += std::time::Duration::from_secs(31);
        }
        let (timed_out, request, penalties) = {
            let mut state = hd.state.write();
            HeaderSync::request_more_headers_pos(&mut state, now)
        };
        assert!(timed_out);
        assert!(request.is_none());
        assert_eq!(penalties.len(), 1);
        assert_eq!(penalties[0].penalty, Penalty::AbandonedAnchor);
    }

    #[tokio::test]
    async fn pos_downloader_loop_sends_requests_and_stops_on_cancel() {
        let hd = Arc::new(engine());
        with_collector(&hd);
        hd.set_pos_target(B256::random(), 99);

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let handle = hd.clone().spawn_pos_downloader(
            cancel.clone(),
            move |req: &HeaderRequest| {
                let _ = tx.send(req.clone());
                true
            },
            |_| {},
        );

        let sent = rx.recv().await.expect("request planned");
        assert_eq!(sent.number, 99);
        assert!(sent.reverse);

        cancel.cancel();
        handle.await.unwrap();
        // Cancellation cleans up the collector and resets the status.
        assert!(hd.take_headers_collector().is_none());
        assert_eq!(hd.pos_status(), SyncStatus::Idle);
    }
}
