use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Instant;

use parking_lot::RwLock;

use super::node::{NodeEntry, NodeId};

/// Bucket capacity.
pub const K: usize = 8;
const NUM_BUCKETS: usize = 160;
const BUCKET_STALE_SECS: u64 = 15 * 60;

/// Result of offering a node to the table.
#[derive(Debug)]
pub enum InsertOutcome {
    Added,
    Refreshed,
    /// The bucket is full. The candidate was parked and the returned entry,
    /// the bucket's least-recently-seen occupant, should be probed; two
    /// failed probes evict it and promote the candidate.
    Probe(NodeEntry),
}

#[derive(Debug)]
struct Bucket {
    entries: VecDeque<NodeEntry>,
    pending: VecDeque<NodeEntry>,
    last_refresh: Instant,
}

impl Bucket {
    fn new() -> Self {
        Self {
            entries: VecDeque::with_capacity(K),
            pending: VecDeque::with_capacity(K),
            last_refresh: Instant::now(),
        }
    }

    fn offer(&mut self, node: NodeEntry) -> InsertOutcome {
        if let Some(pos) = self.entries.iter().position(|n| n.id == node.id) {
            let mut existing = self.entries.remove(pos).unwrap();
            existing.touch();
            self.entries.push_back(existing);
            return InsertOutcome::Refreshed;
        }

        if self.entries.len() < K {
            self.entries.push_back(node);
            return InsertOutcome::Added;
        }

        if self.pending.len() < K && !self.pending.iter().any(|n| n.id == node.id) {
            self.pending.push_back(node);
        }

        // Oldest entry goes out for a liveness probe.
        InsertOutcome::Probe(self.entries.front().cloned().expect("bucket full"))
    }

    fn remove(&mut self, id: &NodeId) -> Option<NodeEntry> {
        let pos = self.entries.iter().position(|n| &n.id == id)?;
        let removed = self.entries.remove(pos);
        if let Some(replacement) = self.pending.pop_front() {
            self.entries.push_back(replacement);
        }
        removed
    }

    fn get_mut(&mut self, id: &NodeId) -> Option<&mut NodeEntry> {
        self.entries.iter_mut().find(|n| &n.id == id)
    }

    fn is_stale(&self) -> bool {
        !self.entries.is_empty() && self.last_refresh.elapsed().as_secs() > BUCKET_STALE_SECS
    }
}

/// The Kademlia routing table: 160 buckets over the XOR keyspace, indexed by
/// the longest common prefix with the local id.
///
/// A single writer lock guards each bucket; reads take snapshots.
pub struct RoutingTable {
    local_id: NodeId,
    buckets: Vec<RwLock<Bucket>>,
}

impl RoutingTable {
    pub fn new(local_id: NodeId) -> Self {
        let buckets = (0..NUM_BUCKETS).map(|_| RwLock::new(Bucket::new())).collect();
        Self { local_id, buckets }
    }

    pub fn local_id(&self) -> &NodeId {
        &self.local_id
    }

    /// Offers an observed node to its bucket.
    pub fn insert(&self, node: NodeEntry) -> InsertOutcome {
        if node.id == self.local_id {
            return InsertOutcome::Refreshed;
        }
        let idx = self.local_id.bucket_index(&node.id);
        self.buckets[idx].write().offer(node)
    }

    pub fn remove(&self, id: &NodeId) {
        let idx = self.local_id.bucket_index(id);
        self.buckets[idx].write().remove(id);
    }

    /// Records a failed query against `id`; evicts after two consecutive
    /// failures and promotes a pending candidate.
    pub fn mark_failed(&self, id: &NodeId) {
        let idx = self.local_id.bucket_index(id);
        let mut bucket = self.buckets[idx].write();
        if let Some(node) = bucket.get_mut(id) {
            node.fail();
            if node.is_bad() {
                bucket.remove(id);
            }
        }
    }

    pub fn mark_seen(&self, id: &NodeId) {
        let idx = self.local_id.bucket_index(id);
        let mut bucket = self.buckets[idx].write();
        if let Some(pos) = bucket.entries.iter().position(|n| &n.id == id) {
            let mut entry = bucket.entries.remove(pos).unwrap();
            entry.touch();
            bucket.entries.push_back(entry);
        }
    }

    /// The `count` entries closest to `target` by XOR distance, good nodes
    /// first.
    pub fn find_closest(&self, target: &NodeId, count: usize) -> Vec<NodeEntry> {
        let mut nodes: Vec<(NodeEntry, [u8; 20], bool)> = Vec::new();
        for bucket in &self.buckets {
            let bucket = bucket.read();
            for node in &bucket.entries {
                nodes.push((node.clone(), node.id.distance(target), node.is_good()));
            }
        }

        nodes.sort_by(|a, b| b.2.cmp(&a.2).then_with(|| a.1.cmp(&b.1)));
        nodes.truncate(count);
        nodes.sort_by(|a, b| a.1.cmp(&b.1));
        nodes.into_iter().map(|(n, _, _)| n).collect()
    }

    /// Marks the bucket covering `target` as freshly looked up.
    pub fn note_refreshed(&self, target: &NodeId) {
        if *target == self.local_id {
            return;
        }
        let idx = self.local_id.bucket_index(target);
        self.buckets[idx].write().last_refresh = Instant::now();
    }

    /// Indexes of buckets that have entries but no recent lookup.
    pub fn stale_buckets(&self) -> Vec<usize> {
        self.buckets
            .iter()
            .enumerate()
            .filter(|(_, b)| b.read().is_stale())
            .map(|(i, _)| i)
            .collect()
    }

    /// A random id falling into bucket `idx` relative to the local id, used
    /// as the target for refresh lookups.
    pub fn random_id_in_bucket(&self, idx: usize) -> NodeId {
        if idx >= NUM_BUCKETS {
            return NodeId::generate();
        }

        let mut id = self.local_id.0;
        let byte_idx = idx / 8;
        let bit_idx = 7 - (idx % 8);

        id[byte_idx] ^= 1 << bit_idx;

        if bit_idx > 0 {
            let random_byte: u8 = rand::random();
            let random_mask = (1u8 << bit_idx) - 1;
            id[byte_idx] = (id[byte_idx] & !random_mask) | (random_byte & random_mask);
        }
        for byte in id.iter_mut().skip(byte_idx + 1) {
            *byte = rand::random();
        }

        NodeId(id)
    }

    pub fn node_count(&self) -> usize {
        self.buckets.iter().map(|b| b.read().entries.len()).sum()
    }

    pub fn populated_buckets(&self) -> usize {
        self.buckets
            .iter()
            .filter(|b| !b.read().entries.is_empty())
            .count()
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        let idx = self.local_id.bucket_index(id);
        self.buckets[idx].read().entries.iter().any(|n| &n.id == id)
    }

    pub fn find_by_addr(&self, addr: &SocketAddr) -> Option<NodeEntry> {
        for bucket in &self.buckets {
            let bucket = bucket.read();
            if let Some(node) = bucket.entries.iter().find(|n| &n.addr == addr) {
                return Some(node.clone());
            }
        }
        None
    }

    pub fn all_nodes(&self) -> Vec<NodeEntry> {
        let mut nodes = Vec::new();
        for bucket in &self.buckets {
            nodes.extend(bucket.read().entries.iter().cloned());
        }
        nodes
    }

    /// Per-bucket entry counts, for invariant checks.
    #[cfg(test)]
    pub fn bucket_sizes(&self) -> Vec<usize> {
        self.buckets.iter().map(|b| b.read().entries.len()).collect()
    }
}
