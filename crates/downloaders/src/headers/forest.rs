//! The link forest and its queue bookkeeping.
//!
//! Every known header is a [`Link`] in a parent→children forest. Subtrees
//! whose topmost parent is still unknown hang off an [`Anchor`]. Links move
//! between ordered queues as they progress from "seen" to "verified" to
//! "persisted"; all queues are keyed by `(height, hash)` so dequeue order is
//! ascending height with a deterministic tie break.

use super::{pos::SyncStatus, stats::Stats};
use schnellru::{ByLength, LruMap};
use std::{
    collections::{BTreeSet, HashMap, HashSet},
    time::Instant,
};
use strata_etl::Collector;
use strata_interfaces::p2p::Announce;
use strata_primitives::{BlockNumber, Bytes, Header, PeerId, SegmentHeader, B256};
use tracing::debug;

/// Bound of the seen-announces set.
const SEEN_ANNOUNCES_LIMIT: u32 = 1024;

/// Ordering key of every queue: block height first, hash as the tie break.
pub(crate) type LinkKey = (BlockNumber, B256);

/// Which queue a link currently sits in.
///
/// Membership in the full set of non-persisted links (the link queue) is
/// tracked separately: a link stays there from creation until it is persisted
/// or removed, whatever this tag says.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum QueueId {
    /// In no work queue.
    #[default]
    None,
    /// Newly ingested, parent not yet persisted.
    Entry,
    /// Parent persisted, ready for verification and insertion.
    Insert,
    /// Persisted, retained only to link late children.
    Persisted,
}

/// In-memory node for one header.
#[derive(Debug)]
pub(crate) struct Link {
    pub(crate) block_height: BlockNumber,
    pub(crate) hash: B256,
    pub(crate) parent_hash: B256,
    /// Header payload; released once persisted.
    pub(crate) header: Option<Header>,
    /// Raw encoding; released once persisted.
    pub(crate) raw: Option<Bytes>,
    /// Hashes of the known children.
    pub(crate) children: Vec<B256>,
    /// Peer that delivered the header.
    pub(crate) peer_id: PeerId,
    pub(crate) queue_id: QueueId,
    /// Parent link exists and is persisted, or the link was loaded as
    /// persisted from the database.
    pub(crate) linked: bool,
    pub(crate) verified: bool,
    pub(crate) persisted: bool,
}

impl Link {
    pub(crate) fn key(&self) -> LinkKey {
        (self.block_height, self.hash)
    }

    fn remove_child(&mut self, hash: B256) {
        self.children.retain(|c| *c != hash);
    }
}

/// Root of a subtree whose parent header has not been seen yet. Identified by
/// that parent hash, the hash that still has to be fetched.
#[derive(Debug, Clone)]
pub(crate) struct Anchor {
    pub(crate) parent_hash: B256,
    /// Height of the topmost links hanging off this anchor.
    pub(crate) block_height: BlockNumber,
    /// `None` means the anchor is due immediately.
    pub(crate) next_retry_time: Option<Instant>,
    pub(crate) timeouts: u32,
    /// Peer that supplied the anchor.
    pub(crate) peer_id: PeerId,
    /// Topmost links of the subtree.
    pub(crate) links: Vec<B256>,
}

impl Anchor {
    pub(crate) fn new(parent_hash: B256, block_height: BlockNumber, peer_id: PeerId) -> Self {
        Self { parent_hash, block_height, next_retry_time: None, timeouts: 0, peer_id, links: Vec::new() }
    }

    pub(crate) fn ready(&self, now: Instant) -> bool {
        self.next_retry_time.map_or(true, |at| at <= now)
    }
}

/// The complete mutable state of the engine, guarded by its single lock.
pub(crate) struct SyncState {
    /// Every known link by hash.
    pub(crate) links: HashMap<B256, Link>,
    /// Every open anchor by the parent hash it waits for.
    pub(crate) anchors: HashMap<B256, Anchor>,
    /// Anchors ordered by `(height, parent hash)`.
    pub(crate) anchor_tree: BTreeSet<(BlockNumber, B256)>,
    /// Every non-persisted link, for cap enforcement.
    pub(crate) link_queue: BTreeSet<LinkKey>,
    /// Non-linked links awaiting a persisted parent.
    pub(crate) entry_queue: BTreeSet<LinkKey>,
    /// Linked links awaiting verification and insertion.
    pub(crate) insert_queue: BTreeSet<LinkKey>,
    /// Persisted links, oldest evicted first.
    pub(crate) persisted_queue: BTreeSet<LinkKey>,
    /// Hashes that failed verification; their subtrees are evicted on sight.
    pub(crate) bad_headers: HashSet<B256>,
    /// Bad PoS tip → its last valid ancestor.
    pub(crate) bad_pos_headers: HashMap<B256, B256>,
    pub(crate) highest_in_db: BlockNumber,
    pub(crate) preverified_height: BlockNumber,
    pub(crate) initial_cycle: bool,
    pub(crate) fetching_new: bool,
    pub(crate) pos_sync: bool,
    pub(crate) pos_status: SyncStatus,
    pub(crate) pos_anchor: Option<Anchor>,
    pub(crate) first_pos_height: Option<BlockNumber>,
    /// Hashes peers announced; persisted matches go out via `to_announce`.
    pub(crate) seen_announces: LruMap<B256, ()>,
    pub(crate) to_announce: Vec<Announce>,
    pub(crate) stats: Stats,
    /// Spill buffer of the in-flight PoS download.
    pub(crate) headers_collector: Option<Collector>,
}

impl SyncState {
    pub(crate) fn new() -> Self {
        Self {
            links: HashMap::new(),
            anchors: HashMap::new(),
            anchor_tree: BTreeSet::new(),
            link_queue: BTreeSet::new(),
            entry_queue: BTreeSet::new(),
            insert_queue: BTreeSet::new(),
            persisted_queue: BTreeSet::new(),
            bad_headers: HashSet::new(),
            bad_pos_headers: HashMap::new(),
            highest_in_db: 0,
            preverified_height: 0,
            initial_cycle: true,
            fetching_new: false,
            pos_sync: false,
            pos_status: SyncStatus::Idle,
            pos_anchor: None,
            first_pos_height: None,
            seen_announces: LruMap::new(ByLength::new(SEEN_ANNOUNCES_LIMIT)),
            to_announce: Vec::new(),
            stats: Stats::default(),
            headers_collector: None,
        }
    }

    /// Detaches the link from its current queue and inserts it into `target`,
    /// updating the membership tag. The link queue is left alone except when
    /// the link graduates to the persisted queue.
    pub(crate) fn move_link_to_queue(&mut self, hash: B256, target: QueueId) {
        let Some(link) = self.links.get_mut(&hash) else { return };
        if link.queue_id == target {
            return
        }
        let key = link.key();
        match link.queue_id {
            QueueId::None => {}
            QueueId::Entry => {
                self.entry_queue.remove(&key);
            }
            QueueId::Insert => {
                self.insert_queue.remove(&key);
            }
            QueueId::Persisted => {
                self.persisted_queue.remove(&key);
            }
        }
        match target {
            QueueId::None => {}
            QueueId::Entry => {
                self.entry_queue.insert(key);
            }
            QueueId::Insert => {
                debug_assert!(link.linked, "only linked links are ready for insertion");
                self.insert_queue.insert(key);
            }
            QueueId::Persisted => {
                self.persisted_queue.insert(key);
                self.link_queue.remove(&key);
            }
        }
        link.queue_id = target;
    }

    /// Wraps a header into a link and files it into the queues.
    pub(crate) fn add_header_as_link(
        &mut self,
        sh: &SegmentHeader,
        persisted: bool,
        peer_id: PeerId,
    ) {
        let link = Link {
            block_height: sh.number,
            hash: sh.hash,
            parent_hash: sh.parent_hash(),
            // Persisted payloads live in the database already.
            header: (!persisted).then(|| sh.header.clone()),
            raw: (!persisted).then(|| sh.raw.clone()),
            children: Vec::new(),
            peer_id,
            queue_id: QueueId::None,
            linked: persisted,
            verified: persisted,
            persisted,
        };
        let key = link.key();
        self.links.insert(sh.hash, link);
        if persisted {
            self.move_link_to_queue(sh.hash, QueueId::Persisted);
        } else {
            self.link_queue.insert(key);
            self.move_link_to_queue(sh.hash, QueueId::Entry);
        }
    }

    /// Deletes the link and every descendant from the store and all queues.
    pub(crate) fn remove_upwards(&mut self, hash: B256) {
        if let Some(parent_hash) = self.links.get(&hash).map(|link| link.parent_hash) {
            if let Some(parent) = self.links.get_mut(&parent_hash) {
                parent.remove_child(hash);
            }
        }
        let mut to_remove = vec![hash];
        while let Some(hash) = to_remove.pop() {
            if let Some(link) = self.links.remove(&hash) {
                let key = link.key();
                match link.queue_id {
                    QueueId::None => {}
                    QueueId::Entry => {
                        self.entry_queue.remove(&key);
                    }
                    QueueId::Insert => {
                        self.insert_queue.remove(&key);
                    }
                    QueueId::Persisted => {
                        self.persisted_queue.remove(&key);
                    }
                }
                self.link_queue.remove(&key);
                to_remove.extend(link.children);
            }
        }
    }

    pub(crate) fn insert_anchor(&mut self, anchor: Anchor) {
        self.anchor_tree.insert((anchor.block_height, anchor.parent_hash));
        self.anchors.insert(anchor.parent_hash, anchor);
    }

    /// Removes the anchor from the map and the ordered tree.
    pub(crate) fn remove_anchor(&mut self, parent_hash: B256) -> Option<Anchor> {
        let anchor = self.anchors.remove(&parent_hash)?;
        self.anchor_tree.remove(&(anchor.block_height, anchor.parent_hash));
        Some(anchor)
    }

    /// Drops the anchor together with every subtree hanging off it.
    pub(crate) fn invalidate_anchor(&mut self, parent_hash: B256, reason: &str) {
        let Some(anchor) = self.remove_anchor(parent_hash) else { return };
        debug!(
            target: "downloaders::headers",
            height = anchor.block_height,
            hash = %anchor.parent_hash,
            reason,
            "Invalidating anchor"
        );
        for child in anchor.links {
            self.remove_upwards(child);
        }
        self.stats.invalidated_anchors += 1;
    }

    /// Evicts lowest-height non-persisted links until the cap holds.
    ///
    /// Children of evicted links stay in the store; they are either pruned in
    /// turn or resolved by a later response. Never touches persisted links.
    pub(crate) fn prune_link_queue(&mut self, limit: usize) {
        while self.link_queue.len() > limit {
            let Some(&key) = self.link_queue.iter().next() else { break };
            self.link_queue.remove(&key);
            let (_, hash) = key;
            let Some(link) = self.links.remove(&hash) else { continue };
            match link.queue_id {
                QueueId::None => {}
                QueueId::Entry => {
                    self.entry_queue.remove(&key);
                }
                QueueId::Insert => {
                    self.insert_queue.remove(&key);
                }
                QueueId::Persisted => {
                    self.persisted_queue.remove(&key);
                }
            }
            if let Some(parent) = self.links.get_mut(&link.parent_hash) {
                parent.remove_child(hash);
            }
            let mut anchor_emptied = false;
            if let Some(anchor) = self.anchors.get_mut(&link.parent_hash) {
                anchor.links.retain(|c| *c != hash);
                anchor_emptied = anchor.links.is_empty();
            }
            if anchor_emptied {
                self.remove_anchor(link.parent_hash);
            }
        }
    }

    /// Evicts oldest persisted links until the cap holds.
    pub(crate) fn prune_persisted_queue(&mut self, limit: usize) {
        while self.persisted_queue.len() > limit {
            let Some(&key) = self.persisted_queue.iter().next() else { break };
            self.persisted_queue.remove(&key);
            self.links.remove(&key.1);
        }
    }

    /// Drops every persisted link; recovery repopulates from the database.
    pub(crate) fn drain_persisted_queue(&mut self) {
        while let Some(&key) = self.persisted_queue.iter().next() {
            self.persisted_queue.remove(&key);
            self.links.remove(&key.1);
        }
    }
}
