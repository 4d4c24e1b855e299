//! A single layer of the graph: an arena of nodes plus the four traversal
//! and maintenance primitives (`search`, `add_neighbor`, `replenish`,
//! `isolate`).
//!
//! Nodes live in a slot vector with a free list; a key index maps caller
//! keys to slots. Neighbor maps are `BTreeMap<K, SlotId>` so every neighbor
//! iteration is in ascending key order, which makes search results and the
//! serialized form deterministic for a fixed insertion history.

use crate::distance::Distance;
use crate::encode::Key;
use crate::heap::IntervalHeap;
use ordered_float::OrderedFloat;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

/// Index of a node within a layer's slot vector. Slot ids are internal:
/// all externally observable behavior is keyed on `K` alone.
pub(crate) type SlotId = u32;

/// A node resident in one layer: the caller's key, a shared handle to the
/// vector, and the undirected neighbor set.
#[derive(Debug)]
pub(crate) struct LayerNode<K: Key> {
    pub key: K,
    pub value: Arc<[f32]>,
    pub neighbors: BTreeMap<K, SlotId>,
}

/// A scored node produced by greedy search. Ordered by `(distance, key)` so
/// ties resolve deterministically; NaN distances order greatest.
#[derive(Debug, Clone)]
pub(crate) struct Candidate<K> {
    pub dist: OrderedFloat<f32>,
    pub key: K,
    pub slot: SlotId,
}

impl<K: Ord> PartialEq for Candidate<K> {
    fn eq(&self, other: &Self) -> bool {
        self.dist == other.dist && self.key == other.key
    }
}

impl<K: Ord> Eq for Candidate<K> {}

impl<K: Ord> PartialOrd for Candidate<K> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<K: Ord> Ord for Candidate<K> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.dist
            .cmp(&other.dist)
            .then_with(|| self.key.cmp(&other.key))
    }
}

/// One layer of the graph.
#[derive(Debug)]
pub(crate) struct Layer<K: Key> {
    slots: Vec<Option<LayerNode<K>>>,
    free: Vec<SlotId>,
    index: HashMap<K, SlotId>,
    /// Slot of the smallest-key member, the deterministic entry point.
    entry: Option<SlotId>,
}

impl<K: Key> Layer<K> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            index: HashMap::new(),
            entry: None,
        }
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.index.contains_key(key)
    }

    pub fn slot_of(&self, key: &K) -> Option<SlotId> {
        self.index.get(key).copied()
    }

    /// The layer's entry point: the resident with the smallest key.
    pub fn entry(&self) -> Option<SlotId> {
        self.entry
    }

    pub fn node(&self, slot: SlotId) -> &LayerNode<K> {
        self.slots[slot as usize]
            .as_ref()
            .expect("slot referenced after vacation")
    }

    pub fn node_mut(&mut self, slot: SlotId) -> &mut LayerNode<K> {
        self.slots[slot as usize]
            .as_mut()
            .expect("slot referenced after vacation")
    }

    /// Installs a detached node (no neighbors yet) and returns its slot.
    pub fn insert(&mut self, key: K, value: Arc<[f32]>) -> SlotId {
        let node = LayerNode {
            key: key.clone(),
            value,
            neighbors: BTreeMap::new(),
        };
        let slot = match self.free.pop() {
            Some(slot) => {
                self.slots[slot as usize] = Some(node);
                slot
            }
            None => {
                self.slots.push(Some(node));
                (self.slots.len() - 1) as SlotId
            }
        };
        let replaces_entry = match self.entry {
            None => true,
            Some(e) => key < self.node(e).key,
        };
        if replaces_entry {
            self.entry = Some(slot);
        }
        self.index.insert(key, slot);
        slot
    }

    /// Removes a key from the index, returning its slot. The slot stays
    /// occupied until [`Self::vacate`] so `isolate` can still reach the node.
    pub fn detach(&mut self, key: &K) -> Option<SlotId> {
        let slot = self.index.remove(key)?;
        if self.entry == Some(slot) {
            self.entry = self
                .index
                .iter()
                .min_by(|a, b| a.0.cmp(b.0))
                .map(|(_, &s)| s);
        }
        Some(slot)
    }

    /// Returns a detached slot to the free list.
    pub fn vacate(&mut self, slot: SlotId) {
        self.slots[slot as usize] = None;
        self.free.push(slot);
    }

    /// Occupied slots in ascending key order.
    pub fn sorted_slots(&self) -> Vec<SlotId> {
        let mut entries: Vec<(&K, SlotId)> = self.index.iter().map(|(k, &s)| (k, s)).collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        entries.into_iter().map(|(_, s)| s).collect()
    }

    /// Iterates all resident nodes in arbitrary order.
    pub fn nodes(&self) -> impl Iterator<Item = &LayerNode<K>> + '_ {
        self.index.values().map(move |&slot| self.node(slot))
    }

    /// Creates an undirected edge between `a` and `b`, pruning whichever
    /// endpoint this pushes past `m` neighbors.
    pub fn add_neighbor(&mut self, a: SlotId, b: SlotId, m: usize, dist: &Distance) {
        if a == b {
            return;
        }
        let a_key = self.node(a).key.clone();
        let b_key = self.node(b).key.clone();
        self.node_mut(a).neighbors.insert(b_key, b);
        self.node_mut(b).neighbors.insert(a_key, a);
        self.prune(a, m, dist);
        self.prune(b, m, dist);
    }

    // Evict the worst neighbor of an overfull node: the one at maximum
    // distance, NaN counting as infinitely far, ties going to the smallest
    // key. The evicted node loses the reciprocal edge and is replenished.
    fn prune(&mut self, slot: SlotId, m: usize, dist: &Distance) {
        if self.node(slot).neighbors.len() <= m {
            return;
        }
        let own = self.node(slot);
        let own_value = own.value.clone();
        let own_key = own.key.clone();

        let mut worst: Option<(OrderedFloat<f32>, K, SlotId)> = None;
        for (key, &neighbor) in &own.neighbors {
            let d = OrderedFloat(dist.compute(&own_value, &self.node(neighbor).value));
            let is_worse = match &worst {
                None => true,
                Some((worst_d, _, _)) => d > *worst_d,
            };
            if is_worse {
                worst = Some((d, key.clone(), neighbor));
            }
        }

        if let Some((_, worst_key, worst_slot)) = worst {
            self.node_mut(slot).neighbors.remove(&worst_key);
            self.node_mut(worst_slot).neighbors.remove(&own_key);
            self.replenish(worst_slot, m, dist);
        }
    }

    /// Greedy best-first traversal from `entry` toward `target`.
    ///
    /// Maintains a candidate frontier bounded by `ef` and a result set
    /// bounded by `k`; stops once no newly expanded neighbor improves on the
    /// current best and the result set is full. Returns up to `k` candidates
    /// in ascending `(distance, key)` order.
    pub fn search(
        &self,
        entry: SlotId,
        k: usize,
        ef: usize,
        target: &[f32],
        dist: &Distance,
    ) -> Vec<Candidate<K>> {
        let mut candidates: IntervalHeap<Candidate<K>> = IntervalHeap::with_capacity(ef + 1);
        let mut result: IntervalHeap<Candidate<K>> = IntervalHeap::with_capacity(k + 1);
        let mut visited: HashSet<K> = HashSet::new();

        let entry_node = self.node(entry);
        let entry_candidate = Candidate {
            dist: OrderedFloat(dist.compute(&entry_node.value, target)),
            key: entry_node.key.clone(),
            slot: entry,
        };
        visited.insert(entry_candidate.key.clone());
        candidates.push(entry_candidate.clone());
        result.push(entry_candidate);

        while let Some(current) = candidates.pop_min() {
            let mut improved = false;

            for (neighbor_key, &neighbor_slot) in &self.node(current.slot).neighbors {
                if !visited.insert(neighbor_key.clone()) {
                    continue;
                }
                let d = OrderedFloat(dist.compute(&self.node(neighbor_slot).value, target));
                let candidate = Candidate {
                    dist: d,
                    key: neighbor_key.clone(),
                    slot: neighbor_slot,
                };

                if let Some(best) = result.peek_min() {
                    improved = improved || d < best.dist;
                }
                if result.len() < k {
                    result.push(candidate.clone());
                } else if result.peek_max().is_some_and(|worst| d < worst.dist) {
                    result.pop_max();
                    result.push(candidate.clone());
                }

                candidates.push(candidate);
                if candidates.len() > ef {
                    candidates.pop_max();
                }
            }

            if !improved && result.len() >= k {
                break;
            }
        }

        result.into_sorted_vec()
    }

    /// Restores a node's degree toward `m` after it lost neighbors.
    ///
    /// Walks the two-hop neighborhood, scores candidates by distance to the
    /// node, and links the closest ones. Only candidates with spare degree
    /// are linked, so repair can never push another node over `m` and the
    /// cascade terminates.
    pub fn replenish(&mut self, slot: SlotId, m: usize, dist: &Distance) {
        if self.node(slot).neighbors.len() >= m {
            return;
        }
        let own = self.node(slot);
        let own_key = own.key.clone();
        let own_value = own.value.clone();

        let mut seen: HashSet<K> = own.neighbors.keys().cloned().collect();
        seen.insert(own_key.clone());

        let mut candidates: IntervalHeap<Candidate<K>> = IntervalHeap::with_capacity(m * 2);
        for &neighbor in own.neighbors.values() {
            for (two_hop_key, &two_hop_slot) in &self.node(neighbor).neighbors {
                if !seen.insert(two_hop_key.clone()) {
                    continue;
                }
                candidates.push(Candidate {
                    dist: OrderedFloat(
                        dist.compute(&self.node(two_hop_slot).value, &own_value),
                    ),
                    key: two_hop_key.clone(),
                    slot: two_hop_slot,
                });
            }
        }

        while self.node(slot).neighbors.len() < m {
            let Some(best) = candidates.pop_min() else {
                break;
            };
            if self.node(best.slot).neighbors.len() >= m {
                continue;
            }
            self.node_mut(slot).neighbors.insert(best.key.clone(), best.slot);
            self.node_mut(best.slot).neighbors.insert(own_key.clone(), slot);
        }
    }

    /// Detaches a node from every neighbor and repairs the holes it leaves.
    ///
    /// All reciprocal edges are removed before any replenish runs, so repair
    /// can never re-link to the departing node through a stale two-hop path.
    pub fn isolate(&mut self, slot: SlotId, m: usize, dist: &Distance) {
        let own_key = self.node(slot).key.clone();
        let former: Vec<SlotId> = self.node(slot).neighbors.values().copied().collect();
        self.node_mut(slot).neighbors.clear();

        for &neighbor in &former {
            self.node_mut(neighbor).neighbors.remove(&own_key);
        }
        for &neighbor in &former {
            self.replenish(neighbor, m, dist);
        }
    }
}
