// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use lattice_types::{hash128, BusAddress, Hash128, MetadataRecord, NodeRecord, HASH_MAGIC_SEED};

/// Hash points each node contributes to the ring, half seeded from its id and
/// half from its name, to smooth load across lookups.
pub const HASH_POINT_PER_INS: usize = 8;

/// One known peer. Nodes are constructed from registry PUT events and dropped
/// when the peer is deleted, its lease expires, or the session is torn down.
pub struct DiscoveryNode {
    record: NodeRecord,
    name_hash: Hash128,
    ingress_cursor: AtomicUsize,
    on_destroy: Mutex<Option<Box<dyn FnOnce(&NodeRecord) + Send>>>,
}

pub type NodeHandle = Arc<DiscoveryNode>;

impl DiscoveryNode {
    pub fn new(record: NodeRecord) -> NodeHandle {
        let name_hash = hash128(record.name.as_bytes(), HASH_MAGIC_SEED);
        Arc::new(DiscoveryNode {
            record,
            name_hash,
            ingress_cursor: AtomicUsize::new(0),
            on_destroy: Mutex::new(None),
        })
    }

    pub fn record(&self) -> &NodeRecord {
        &self.record
    }

    pub fn id(&self) -> u64 {
        self.record.id
    }

    pub fn name(&self) -> &str {
        &self.record.name
    }

    /// Hash of the node name, precomputed at construction.
    pub fn name_hash(&self) -> Hash128 {
        self.name_hash
    }

    /// Rotates through the published ingress gateways, falling back to the
    /// listen addresses when the peer has no gateway records.
    pub fn next_ingress_address(&self) -> Option<&str> {
        if !self.record.gateways.is_empty() {
            let index = self.advance_ingress(self.record.gateways.len());
            return self.record.gateways.get(index).map(|gateway| gateway.address.as_str());
        }
        if self.record.listen.is_empty() {
            return None;
        }
        let index = self.advance_ingress(self.record.listen.len());
        self.record.listen.get(index).map(String::as_str)
    }

    pub fn ingress_size(&self) -> usize {
        if !self.record.gateways.is_empty() {
            self.record.gateways.len()
        } else {
            self.record.listen.len()
        }
    }

    /// Next ingress address parsed into its bus form. Rotates past entries
    /// that do not parse; gives up after one full cycle.
    pub fn next_ingress_bus_address(&self) -> Option<BusAddress> {
        for _ in 0..self.ingress_size() {
            if let Some(address) = self.next_ingress_address() {
                if let Ok(parsed) = address.parse::<BusAddress>() {
                    return Some(parsed);
                }
            }
        }
        None
    }

    /// Registers a callback fired once when the node is dropped.
    pub fn set_on_destroy(&self, callback: Box<dyn FnOnce(&NodeRecord) + Send>) {
        *self.on_destroy.lock() = Some(callback);
    }

    pub fn reset_on_destroy(&self) {
        *self.on_destroy.lock() = None;
    }

    fn advance_ingress(&self, len: usize) -> usize {
        self.ingress_cursor.fetch_add(1, AtomicOrdering::Relaxed) % len
    }
}

impl Drop for DiscoveryNode {
    fn drop(&mut self) {
        if let Some(callback) = self.on_destroy.get_mut().take() {
            callback(&self.record);
        }
    }
}

/// A `(hash code, node)` entry on the consistent-hash ring.
#[derive(Clone)]
pub struct HashPoint {
    pub code: Hash128,
    pub node: NodeHandle,
}

/// Duplicate handling for ring walks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HashSearchMode {
    /// Every hash point, duplicates allowed.
    All,
    /// Skip points whose node already appeared.
    UniqueNode,
    /// Skip points whose code equals the previous point's.
    Compact,
    /// Both of the above.
    CompactUnique,
}

#[derive(Default)]
struct IndexCache {
    round_robin: Vec<NodeHandle>,
    round_robin_cursor: usize,
    hash_points: Vec<HashPoint>,
}

impl IndexCache {
    fn is_built(&self) -> bool {
        !self.hash_points.is_empty()
    }

    fn clear(&mut self) {
        self.round_robin.clear();
        self.hash_points.clear();
    }
}

#[derive(Default)]
struct CacheTable {
    default_index: IndexCache,
    by_rule: HashMap<MetadataRecord, IndexCache>,
}

/// In-memory index of known peers with id/name/hash/round-robin/random
/// lookups and metadata-filtered sub-indices.
///
/// The node maps are owned by the main thread; index caches are built lazily
/// under an internal lock and dropped eagerly whenever a mutation could
/// change their content.
pub struct DiscoverySet {
    node_by_id: HashMap<u64, NodeHandle>,
    node_by_name: HashMap<String, NodeHandle>,
    caches: Mutex<CacheTable>,
    rng: Mutex<StdRng>,
}

impl Default for DiscoverySet {
    fn default() -> Self {
        DiscoverySet::new()
    }
}

fn node_order(l: &NodeHandle, r: &NodeHandle) -> Ordering {
    l.id()
        .cmp(&r.id())
        .then_with(|| l.name_hash().cmp(&r.name_hash()))
        .then_with(|| l.name().cmp(r.name()))
}

fn hash_point_order(l: &HashPoint, r: &HashPoint) -> Ordering {
    l.code
        .cmp(&r.code)
        .then_with(|| node_order(&l.node, &r.node))
}

/// `strncmp(name, probe, probe.len())` semantics: only the probe's length is
/// compared, so a probe acts as a prefix bound.
fn name_prefix_cmp(name: &str, probe: &str) -> Ordering {
    let name = name.as_bytes();
    let probe = probe.as_bytes();
    let shared = name.len().min(probe.len());
    match name[..shared].cmp(&probe[..shared]) {
        Ordering::Equal if name.len() < probe.len() => Ordering::Less,
        ordering @ (Ordering::Less | Ordering::Greater) => ordering,
        Ordering::Equal => Ordering::Equal,
    }
}

impl DiscoverySet {
    pub fn new() -> Self {
        DiscoverySet {
            node_by_id: HashMap::new(),
            node_by_name: HashMap::new(),
            caches: Mutex::new(CacheTable::default()),
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.node_by_id.is_empty() && self.node_by_name.is_empty()
    }

    /// Number of live metadata-filtered index caches.
    pub fn metadata_index_size(&self) -> usize {
        self.caches.lock().by_rule.len()
    }

    pub fn get_by_id(&self, id: u64) -> Option<NodeHandle> {
        self.node_by_id.get(&id).cloned()
    }

    pub fn get_by_name(&self, name: &str) -> Option<NodeHandle> {
        self.node_by_name.get(name).cloned()
    }

    /// Inserts `node`, replacing any peer that already holds its id or name.
    /// A replaced peer's stale complementary index entry is evicted too, so a
    /// node that re-registered under a new name does not linger under the old
    /// one.
    pub fn add_node(&mut self, node: NodeHandle) {
        let mut inserted = false;
        let mut old_name = String::new();
        let mut old_id = 0u64;

        if node.id() != 0 {
            match self.node_by_id.get_mut(&node.id()) {
                None => {
                    self.node_by_id.insert(node.id(), node.clone());
                    inserted = true;
                }
                Some(existing) if !Arc::ptr_eq(existing, &node) => {
                    if existing.name() != node.name() {
                        old_name = existing.name().to_string();
                    }
                    *existing = node.clone();
                    inserted = true;
                }
                Some(_) => {}
            }
        }

        if !node.name().is_empty() {
            match self.node_by_name.get_mut(node.name()) {
                None => {
                    self.node_by_name.insert(node.name().to_string(), node.clone());
                    inserted = true;
                }
                Some(existing) if !Arc::ptr_eq(existing, &node) => {
                    if existing.id() != node.id() {
                        old_id = existing.id();
                    }
                    *existing = node.clone();
                    inserted = true;
                }
                Some(_) => {}
            }
        }

        if !inserted {
            return;
        }

        if old_id != 0 {
            if let Some(stale) = self.node_by_id.get(&old_id) {
                if !Arc::ptr_eq(stale, &node) {
                    self.node_by_id.remove(&old_id);
                }
            }
        }
        if !old_name.is_empty() {
            if let Some(stale) = self.node_by_name.get(&old_name) {
                if !Arc::ptr_eq(stale, &node) {
                    self.node_by_name.remove(&old_name);
                }
            }
        }

        debug!(id = node.id(), name = node.name(), "discovery node added");
        self.invalidate_caches_for(&node);
    }

    /// Removes a specific node instance. Absent nodes are a no-op.
    pub fn remove_node(&mut self, node: &NodeHandle) {
        let mut removed = false;
        if !node.name().is_empty() {
            if let Some(existing) = self.node_by_name.get(node.name()) {
                if Arc::ptr_eq(existing, node) {
                    self.node_by_name.remove(node.name());
                    removed = true;
                }
            }
        }
        if node.id() != 0 {
            if let Some(existing) = self.node_by_id.get(&node.id()) {
                if Arc::ptr_eq(existing, node) {
                    self.node_by_id.remove(&node.id());
                    removed = true;
                }
            }
        }
        if removed {
            self.invalidate_caches_for(node);
        }
    }

    pub fn remove_by_id(&mut self, id: u64) {
        let Some(node) = self.node_by_id.get(&id).cloned() else {
            return;
        };
        if !node.name().is_empty() {
            if let Some(by_name) = self.node_by_name.get(node.name()) {
                if Arc::ptr_eq(by_name, &node) {
                    self.node_by_name.remove(node.name());
                }
            }
        }
        self.node_by_id.remove(&id);
        self.invalidate_caches_for(&node);
    }

    pub fn remove_by_name(&mut self, name: &str) {
        let Some(node) = self.node_by_name.get(name).cloned() else {
            return;
        };
        if node.id() != 0 {
            if let Some(by_id) = self.node_by_id.get(&node.id()) {
                if Arc::ptr_eq(by_id, &node) {
                    self.node_by_id.remove(&node.id());
                }
            }
        }
        self.node_by_name.remove(name);
        self.invalidate_caches_for(&node);
    }

    /// Locates the node owning the first hash point at or after `key`'s hash,
    /// wrapping to the smallest point past the end of the ring.
    pub fn get_by_consistent_hash(
        &self,
        key: &[u8],
        rule: Option<&MetadataRecord>,
    ) -> Option<NodeHandle> {
        let key_hash = hash128(key, HASH_MAGIC_SEED);
        self.with_cache(rule, |cache| {
            if cache.hash_points.is_empty() {
                return None;
            }
            let position = cache
                .hash_points
                .partition_point(|point| point.code < key_hash);
            let point = cache
                .hash_points
                .get(position)
                .unwrap_or(&cache.hash_points[0]);
            Some(point.node.clone())
        })
    }

    pub fn get_by_consistent_hash_u64(
        &self,
        key: u64,
        rule: Option<&MetadataRecord>,
    ) -> Option<NodeHandle> {
        self.get_by_consistent_hash(&key.to_le_bytes(), rule)
    }

    /// Walks the ring from `key`'s location, collecting up to `max_count`
    /// nodes under `mode`. `exclude_first` skips the located point itself,
    /// which lists a key's neighbors instead of its owner.
    pub fn search_by_consistent_hash(
        &self,
        key: &[u8],
        mode: HashSearchMode,
        exclude_first: bool,
        max_count: usize,
        rule: Option<&MetadataRecord>,
    ) -> Vec<NodeHandle> {
        let key_hash = hash128(key, HASH_MAGIC_SEED);
        self.with_cache(rule, |cache| {
            let points = &cache.hash_points;
            if points.is_empty() || max_count == 0 {
                return Vec::new();
            }

            let start = {
                let position = points.partition_point(|point| point.code < key_hash);
                if position == points.len() {
                    0
                } else {
                    position
                }
            };

            let unique = matches!(
                mode,
                HashSearchMode::UniqueNode | HashSearchMode::CompactUnique
            );
            let compact = matches!(
                mode,
                HashSearchMode::Compact | HashSearchMode::CompactUnique
            );

            let mut output: Vec<NodeHandle> = Vec::new();
            let mut previous_code: Option<Hash128> = None;
            for offset in 0..points.len() {
                let point = &points[(start + offset) % points.len()];
                if offset == 0 && exclude_first {
                    previous_code = Some(point.code);
                    continue;
                }
                if compact && previous_code == Some(point.code) {
                    continue;
                }
                if unique
                    && output
                        .iter()
                        .any(|candidate| Arc::ptr_eq(candidate, &point.node))
                {
                    previous_code = Some(point.code);
                    continue;
                }

                output.push(point.node.clone());
                previous_code = Some(point.code);
                if output.len() >= max_count {
                    break;
                }
            }
            output
        })
    }

    /// Next node in canonical `(id, name hash, name)` order; the cursor is
    /// per index cache and survives until the cache is invalidated.
    pub fn get_by_round_robin(&self, rule: Option<&MetadataRecord>) -> Option<NodeHandle> {
        self.with_cache(rule, |cache| {
            if cache.round_robin.is_empty() {
                return None;
            }
            if cache.round_robin_cursor >= cache.round_robin.len() {
                cache.round_robin_cursor %= cache.round_robin.len();
            }
            let node = cache.round_robin[cache.round_robin_cursor].clone();
            cache.round_robin_cursor += 1;
            Some(node)
        })
    }

    /// Uniform pick over the filtered node set.
    pub fn get_by_random(&self, rule: Option<&MetadataRecord>) -> Option<NodeHandle> {
        self.with_cache(rule, |cache| {
            if cache.round_robin.is_empty() {
                return None;
            }
            let index = self.rng.lock().gen_range(0..cache.round_robin.len());
            Some(cache.round_robin[index].clone())
        })
    }

    /// All matching nodes in canonical order.
    pub fn get_sorted_nodes(&self, rule: Option<&MetadataRecord>) -> Vec<NodeHandle> {
        self.with_cache(rule, |cache| cache.round_robin.clone())
    }

    /// Index of the first sorted node not ordered before `(id, name)`. An
    /// empty name compares on id alone; a non-empty name compares as a
    /// prefix bound.
    pub fn lower_bound_sorted_nodes(
        &self,
        id: u64,
        name: &str,
        rule: Option<&MetadataRecord>,
    ) -> usize {
        self.with_cache(rule, |cache| {
            cache.round_robin.partition_point(|node| {
                match node.id().cmp(&id) {
                    Ordering::Less => true,
                    Ordering::Greater => false,
                    Ordering::Equal => {
                        if name.is_empty() {
                            false
                        } else {
                            name_prefix_cmp(node.name(), name) == Ordering::Less
                        }
                    }
                }
            })
        })
    }

    /// Index of the first sorted node ordered after `(id, name)`.
    pub fn upper_bound_sorted_nodes(
        &self,
        id: u64,
        name: &str,
        rule: Option<&MetadataRecord>,
    ) -> usize {
        self.with_cache(rule, |cache| {
            cache.round_robin.partition_point(|node| {
                match node.id().cmp(&id) {
                    Ordering::Less => true,
                    Ordering::Greater => false,
                    Ordering::Equal => {
                        if name.is_empty() {
                            true
                        } else {
                            name_prefix_cmp(node.name(), name) != Ordering::Greater
                        }
                    }
                }
            })
        })
    }

    fn with_cache<R>(
        &self,
        rule: Option<&MetadataRecord>,
        operation: impl FnOnce(&mut IndexCache) -> R,
    ) -> R {
        let mut caches = self.caches.lock();
        match rule {
            None => {
                let cache = &mut caches.default_index;
                if !cache.is_built() {
                    self.rebuild_cache(cache, None);
                }
                operation(cache)
            }
            Some(rule) => {
                let cache = caches.by_rule.entry(rule.clone()).or_default();
                if !cache.is_built() {
                    self.rebuild_cache(cache, Some(rule));
                }
                let result = operation(cache);
                // A cache that stayed empty holds no state worth indexing.
                if !caches.by_rule.get(rule).map_or(true, IndexCache::is_built) {
                    caches.by_rule.remove(rule);
                }
                result
            }
        }
    }

    /// Rebuilds a cache whole: an index cache is either empty or complete.
    fn rebuild_cache(&self, cache: &mut IndexCache, rule: Option<&MetadataRecord>) {
        cache.clear();
        if self.node_by_id.is_empty() && self.node_by_name.is_empty() {
            return;
        }

        let accepts = |node: &DiscoveryNode| match rule {
            None => true,
            Some(rule) => {
                let default_metadata = MetadataRecord::default();
                let metadata = node.record().metadata.as_ref().unwrap_or(&default_metadata);
                MetadataRecord::matches(rule, metadata)
            }
        };

        for node in self.node_by_id.values() {
            if !accepts(node) {
                continue;
            }
            cache.round_robin.push(node.clone());
            for seed in 0..HASH_POINT_PER_INS / 2 {
                cache.hash_points.push(HashPoint {
                    code: hash128(&node.id().to_le_bytes(), seed as u32),
                    node: node.clone(),
                });
            }
        }

        for node in self.node_by_name.values() {
            if !accepts(node) {
                continue;
            }
            // Already in the round-robin list through the id map.
            if node.id() == 0 {
                cache.round_robin.push(node.clone());
            }
            for seed in 0..HASH_POINT_PER_INS / 2 {
                cache.hash_points.push(HashPoint {
                    code: hash128(node.name().as_bytes(), seed as u32),
                    node: node.clone(),
                });
            }
        }

        cache.round_robin.sort_by(node_order);
        cache.round_robin_cursor = 0;
        cache.hash_points.sort_by(hash_point_order);
    }

    /// Drops the default cache plus every filtered cache whose rule could
    /// include the mutated node.
    fn invalidate_caches_for(&self, node: &NodeHandle) {
        let default_metadata = MetadataRecord::default();
        let metadata = node.record().metadata.as_ref().unwrap_or(&default_metadata);

        let mut caches = self.caches.lock();
        caches.default_index.clear();
        caches
            .by_rule
            .retain(|rule, _| !MetadataRecord::matches(rule, metadata));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::atomic::AtomicBool;

    fn record(id: u64, name: &str) -> NodeRecord {
        NodeRecord {
            id,
            name: name.to_string(),
            ..NodeRecord::default()
        }
    }

    fn populated_set(count: u64) -> DiscoverySet {
        let mut set = DiscoverySet::new();
        for index in 0..count {
            set.add_node(DiscoveryNode::new(record(index + 1, &format!("node-{index}"))));
        }
        set
    }

    #[test]
    fn id_and_name_lookups_match_membership() {
        let mut set = populated_set(4);
        let node = set.get_by_id(2).unwrap();
        assert_eq!(node.name(), "node-1");
        assert!(Arc::ptr_eq(
            &set.get_by_name("node-1").unwrap(),
            &node
        ));

        set.remove_by_id(2);
        assert!(set.get_by_id(2).is_none());
        assert!(set.get_by_name("node-1").is_none());

        // Removing again is a no-op.
        set.remove_by_id(2);
        set.remove_by_name("node-1");
    }

    #[test]
    fn empty_set_lookups_return_not_found() {
        let set = DiscoverySet::new();
        assert!(set.get_by_consistent_hash(b"key", None).is_none());
        assert!(set.get_by_round_robin(None).is_none());
        assert!(set.get_by_random(None).is_none());
        assert!(set.get_sorted_nodes(None).is_empty());
    }

    #[test]
    fn consistent_hash_is_deterministic_and_moves_on_removal() {
        let mut set = populated_set(32);

        let first = set.get_by_consistent_hash_u64(1234567, None).unwrap();
        let second = set.get_by_consistent_hash_u64(1234567, None).unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        set.remove_by_id(first.id());
        let third = set.get_by_consistent_hash_u64(1234567, None).unwrap();
        assert!(!Arc::ptr_eq(&first, &third));
    }

    #[test]
    fn remove_and_readd_restores_lookup_results() {
        let mut set = populated_set(8);
        let before = set.get_by_consistent_hash(b"stable-key", None).unwrap();

        let removed = set.get_by_id(3).unwrap();
        set.remove_by_id(3);
        set.add_node(DiscoveryNode::new(removed.record().clone()));

        let after = set.get_by_consistent_hash(b"stable-key", None).unwrap();
        assert_eq!(before.id(), after.id());
        assert_eq!(
            set.get_sorted_nodes(None)
                .iter()
                .map(|node| node.id())
                .collect::<Vec<_>>(),
            (1..=8).collect::<Vec<_>>()
        );
    }

    #[test]
    fn round_robin_cycles_in_canonical_order() {
        let set = populated_set(3);
        let mut seen = Vec::new();
        for _ in 0..6 {
            seen.push(set.get_by_round_robin(None).unwrap().id());
        }
        assert_eq!(seen, vec![1, 2, 3, 1, 2, 3]);
    }

    #[test]
    fn sorted_nodes_under_rule_equal_filtered_default_order() {
        let mut set = DiscoverySet::new();
        for index in 0..6u64 {
            let mut node = record(index + 1, &format!("node-{index}"));
            if index % 2 == 0 {
                node.metadata = Some(MetadataRecord {
                    labels: BTreeMap::from([("selector".to_string(), "even".to_string())]),
                    ..MetadataRecord::default()
                });
            }
            set.add_node(DiscoveryNode::new(node));
        }

        let rule = MetadataRecord {
            labels: BTreeMap::from([("selector".to_string(), "even".to_string())]),
            ..MetadataRecord::default()
        };

        let filtered: Vec<u64> = set
            .get_sorted_nodes(Some(&rule))
            .iter()
            .map(|node| node.id())
            .collect();
        let manual: Vec<u64> = set
            .get_sorted_nodes(None)
            .iter()
            .filter(|node| {
                let default_metadata = MetadataRecord::default();
                MetadataRecord::matches(
                    &rule,
                    node.record().metadata.as_ref().unwrap_or(&default_metadata),
                )
            })
            .map(|node| node.id())
            .collect();
        assert_eq!(filtered, manual);
        assert_eq!(filtered, vec![1, 3, 5]);
    }

    #[test]
    fn metadata_filter_scenario_drops_index_on_removal() {
        let mut set = DiscoverySet::new();
        let selectors = [None, Some("s2"), Some("s3")];
        for (index, selector) in selectors.iter().enumerate() {
            let mut node = record(index as u64 + 1, &format!("node-{index}"));
            if let Some(selector) = selector {
                node.metadata = Some(MetadataRecord {
                    labels: BTreeMap::from([(
                        "selector".to_string(),
                        selector.to_string(),
                    )]),
                    ..MetadataRecord::default()
                });
            }
            set.add_node(DiscoveryNode::new(node));
        }

        let rule = MetadataRecord {
            labels: BTreeMap::from([("selector".to_string(), "s3".to_string())]),
            ..MetadataRecord::default()
        };

        let matched = set.get_sorted_nodes(Some(&rule));
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].id(), 3);
        assert_eq!(set.metadata_index_size(), 1);

        set.remove_by_id(3);
        assert!(set.get_sorted_nodes(Some(&rule)).is_empty());
        assert_eq!(set.metadata_index_size(), 0);
    }

    #[test]
    fn search_modes_control_duplicates() {
        let set = populated_set(4);
        let total_points = 4 * HASH_POINT_PER_INS;

        let all = set.search_by_consistent_hash(
            b"probe",
            HashSearchMode::All,
            false,
            usize::MAX,
            None,
        );
        assert_eq!(all.len(), total_points);

        let unique = set.search_by_consistent_hash(
            b"probe",
            HashSearchMode::UniqueNode,
            false,
            usize::MAX,
            None,
        );
        assert_eq!(unique.len(), 4);
        for pair in unique.windows(2) {
            assert!(!Arc::ptr_eq(&pair[0], &pair[1]));
        }

        // The "next" variant starts past the owner of the probe.
        let owner = set.get_by_consistent_hash(b"probe", None).unwrap();
        let neighbors = set.search_by_consistent_hash(
            b"probe",
            HashSearchMode::UniqueNode,
            true,
            1,
            None,
        );
        assert_eq!(neighbors.len(), 1);
        let _ = owner;

        let compact = set.search_by_consistent_hash(
            b"probe",
            HashSearchMode::Compact,
            false,
            usize::MAX,
            None,
        );
        assert!(compact.len() <= total_points);
    }

    #[test]
    fn bounds_partition_sorted_nodes() {
        let set = populated_set(5);
        assert_eq!(set.lower_bound_sorted_nodes(3, "", None), 2);
        assert_eq!(set.upper_bound_sorted_nodes(3, "", None), 3);
        assert_eq!(set.lower_bound_sorted_nodes(3, "node-2", None), 2);
        assert_eq!(set.upper_bound_sorted_nodes(3, "node-2", None), 3);
        assert_eq!(set.lower_bound_sorted_nodes(99, "", None), 5);
    }

    #[test]
    fn add_replaces_renamed_peer_and_evicts_stale_name() {
        let mut set = DiscoverySet::new();
        set.add_node(DiscoveryNode::new(record(7, "old-name")));
        set.add_node(DiscoveryNode::new(record(7, "new-name")));

        assert!(set.get_by_name("old-name").is_none());
        assert_eq!(set.get_by_name("new-name").unwrap().id(), 7);
        assert_eq!(set.get_sorted_nodes(None).len(), 1);
    }

    #[test]
    fn on_destroy_fires_when_node_is_dropped() {
        static FIRED: AtomicBool = AtomicBool::new(false);

        let mut set = DiscoverySet::new();
        let node = DiscoveryNode::new(record(1, "node-0"));
        node.set_on_destroy(Box::new(|record| {
            assert_eq!(record.id, 1);
            FIRED.store(true, AtomicOrdering::SeqCst);
        }));
        set.add_node(node);

        set.remove_by_id(1);
        assert!(FIRED.load(AtomicOrdering::SeqCst));
    }

    #[test]
    fn ingress_rotation_prefers_gateways() {
        let mut node = record(1, "node-0");
        node.listen = vec!["ipv4://10.0.0.1:1".to_string(), "ipv4://10.0.0.1:2".to_string()];
        let plain = DiscoveryNode::new(node.clone());
        assert_eq!(plain.ingress_size(), 2);
        assert_eq!(plain.next_ingress_address(), Some("ipv4://10.0.0.1:1"));
        assert_eq!(plain.next_ingress_address(), Some("ipv4://10.0.0.1:2"));
        assert_eq!(plain.next_ingress_address(), Some("ipv4://10.0.0.1:1"));

        node.gateways = vec![lattice_types::GatewayRecord {
            address: "dns://gw:9".to_string(),
            ..lattice_types::GatewayRecord::default()
        }];
        let gated = DiscoveryNode::new(node);
        assert_eq!(gated.ingress_size(), 1);
        assert_eq!(gated.next_ingress_address(), Some("dns://gw:9"));
        assert_eq!(
            gated.next_ingress_bus_address(),
            Some(BusAddress::Dns {
                host: "gw".to_string(),
                port: 9
            })
        );
    }

    #[test]
    fn ingress_bus_address_skips_unparseable_entries() {
        let mut node = record(1, "node-0");
        node.listen = vec!["garbage".to_string(), "unix:///run/a.sock".to_string()];
        let handle = DiscoveryNode::new(node);
        assert_eq!(
            handle.next_ingress_bus_address(),
            Some(BusAddress::Unix("/run/a.sock".to_string()))
        );
    }
}
