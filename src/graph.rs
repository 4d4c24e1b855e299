//! The HNSW graph: configuration, construction, mutation, and search.
//!
//! [`Graph`] is a cloneable handle around one reader/writer lock protecting
//! the layer stack. Readers (search, lookup, export, analytics) take shared
//! access; writers (add, delete, import) take exclusive access; batch
//! variants take the lock once for the whole batch. All internal methods
//! operate on the locked state directly and never re-acquire the lock.

use crate::config;
use crate::distance::Distance;
use crate::encode::{self, Key};
use crate::error::{GraphError, Result};
use crate::layer::{Candidate, Layer};
use ordered_float::OrderedFloat;
use parking_lot::RwLock;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::io::{Read, Write};
use std::sync::Arc;

/// A key/vector pair: the unit of insertion and of search results.
#[derive(Debug, Clone, PartialEq)]
pub struct Node<K> {
    pub key: K,
    pub value: Vec<f32>,
}

impl<K> Node<K> {
    pub fn new(key: K, value: Vec<f32>) -> Self {
        Self { key, value }
    }
}

/// Tuning parameters, fixed at construction.
///
/// `m` is the maximum number of neighbors kept per node per layer, `ml` the
/// level-generation factor (each layer holds roughly `ml` times the nodes of
/// the one below), and `ef_search` the candidate-frontier size during greedy
/// traversal. Importing a serialized graph replaces all of these with the
/// values from the stream.
#[derive(Debug, Clone)]
pub struct GraphConfig {
    pub m: usize,
    pub ml: f64,
    pub ef_search: usize,
    pub distance: Distance,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            m: config::DEFAULT_M,
            ml: config::DEFAULT_ML,
            ef_search: config::DEFAULT_EF_SEARCH,
            distance: Distance::cosine(),
        }
    }
}

impl GraphConfig {
    /// Checks every parameter against its permitted range.
    pub fn validate(&self) -> Result<()> {
        if self.m == 0 {
            return Err(GraphError::InvalidConfig(format!(
                "M must be greater than 0, got {}",
                self.m
            )));
        }
        if self.ml <= 0.0 || self.ml >= 1.0 {
            return Err(GraphError::InvalidConfig(format!(
                "Ml must be between 0 and 1 (exclusive), got {}",
                self.ml
            )));
        }
        if self.ef_search == 0 {
            return Err(GraphError::InvalidConfig(format!(
                "EfSearch must be greater than 0, got {}",
                self.ef_search
            )));
        }
        Ok(())
    }
}

// Upper bound on the level a new node may be assigned, derived from the
// base-layer population so that level-L occupancy is ~N * Ml^L.
fn max_level(ml: f64, num_nodes: usize) -> usize {
    if num_nodes == 0 {
        return 1;
    }
    let levels = (num_nodes as f64).ln() / (1.0 / ml).ln();
    levels.round() as usize + 1
}

/// Graph state behind the lock: parameters, the level-generation RNG, and
/// the layer stack (index 0 is the base layer holding every node).
#[derive(Debug)]
pub(crate) struct GraphInner<K: Key> {
    pub config: GraphConfig,
    pub rng: StdRng,
    pub layers: Vec<Layer<K>>,
}

impl<K: Key> GraphInner<K> {
    pub fn len(&self) -> usize {
        self.layers.first().map_or(0, Layer::len)
    }

    /// The graph's dimension, or 0 while it holds no nodes.
    pub fn dims(&self) -> usize {
        self.layers
            .first()
            .and_then(|base| base.entry())
            .map_or(0, |slot| self.layers[0].node(slot).value.len())
    }

    fn check_dims(&self, vector: &[f32]) -> Result<()> {
        if self.len() > 0 {
            let expected = self.dims();
            if expected != vector.len() {
                return Err(GraphError::DimensionMismatch {
                    expected,
                    got: vector.len(),
                });
            }
        }
        Ok(())
    }

    // Draws a level for a new node: the first draw above Ml wins, capped by
    // the population-derived maximum.
    fn random_level(&mut self) -> usize {
        let max = if self.layers.is_empty() {
            1
        } else {
            max_level(self.config.ml, self.layers[0].len())
        };
        for level in 0..max {
            if self.rng.gen::<f64>() > self.config.ml {
                return level;
            }
        }
        max
    }

    pub fn add(&mut self, node: Node<K>) -> Result<()> {
        let Node { key, value } = node;
        self.check_dims(&value)?;

        // A duplicate key replaces the prior node.
        if self.layers.first().is_some_and(|base| base.contains(&key)) {
            self.delete(&key);
        }
        let pre_len = self.len();

        let insert_level = self.random_level();
        while self.layers.len() <= insert_level {
            self.layers.push(Layer::new());
        }

        let value: Arc<[f32]> = value.into();
        let m = self.config.m;
        let ef = self.config.ef_search;
        let dist = self.config.distance.clone();

        // Phase one: descend read-only, collecting the neighborhood for
        // every layer the node will join and carrying the best key seen so
        // far (the elevator) as the next layer's entry. Aborting here leaves
        // the graph untouched.
        let mut planned: Vec<(usize, Vec<Candidate<K>>)> = Vec::new();
        let mut elevator: Option<K> = None;
        for i in (0..self.layers.len()).rev() {
            let layer = &self.layers[i];
            if layer.is_empty() {
                // The node becomes the sole member of a freshly created layer.
                planned.push((i, Vec::new()));
                continue;
            }
            let entry = match &elevator {
                None => layer.entry().ok_or_else(|| {
                    GraphError::Internal("non-empty layer has no entry point".into())
                })?,
                Some(key) => layer.slot_of(key).ok_or_else(|| {
                    GraphError::Internal(format!("elevator key {key:?} missing from layer {i}"))
                })?,
            };
            let neighborhood = layer.search(entry, m, ef, &value, &dist);
            if neighborhood.is_empty() {
                return Err(GraphError::Internal(
                    "no nodes found in neighborhood search".into(),
                ));
            }
            elevator = Some(neighborhood[0].key.clone());
            if i <= insert_level {
                planned.push((i, neighborhood));
            }
        }

        // Phase two: install the node and wire undirected edges.
        for (i, neighborhood) in planned {
            let layer = &mut self.layers[i];
            let slot = layer.insert(key.clone(), value.clone());
            for candidate in &neighborhood {
                layer.add_neighbor(slot, candidate.slot, m, &dist);
            }
        }

        if self.len() != pre_len + 1 {
            return Err(GraphError::Internal("node was not added to the graph".into()));
        }
        Ok(())
    }

    pub fn delete(&mut self, key: &K) -> bool {
        if self.layers.is_empty() {
            return false;
        }
        let m = self.config.m;
        let dist = self.config.distance.clone();

        let mut deleted = false;
        for layer in self.layers.iter_mut().rev() {
            let Some(slot) = layer.detach(key) else {
                continue;
            };
            layer.isolate(slot, m, &dist);
            layer.vacate(slot);
            deleted = true;
        }

        // Hollow top layers would otherwise capture a later insert above its
        // drawn level; the base layer always remains.
        while self.layers.len() > 1 && self.layers.last().is_some_and(|l| l.is_empty()) {
            self.layers.pop();
        }
        deleted
    }

    pub fn lookup(&self, key: &K) -> Option<Vec<f32>> {
        let base = self.layers.first()?;
        let slot = base.slot_of(key)?;
        Some(base.node(slot).value.to_vec())
    }

    // Full search pipeline returning base-layer candidates with distances,
    // for reuse by the negative-example rescoring path.
    fn search_candidates(&self, query: &[f32], k: usize) -> Result<Vec<Candidate<K>>> {
        if k == 0 {
            return Err(GraphError::InvalidK(k));
        }
        if self.len() == 0 {
            return Ok(Vec::new());
        }
        self.check_dims(query)?;

        let ef = self.config.ef_search;
        let dist = self.config.distance.clone();

        let mut elevator: Option<K> = None;
        for i in (0..self.layers.len()).rev() {
            let layer = &self.layers[i];
            let entry = match &elevator {
                None => layer.entry().ok_or_else(|| {
                    GraphError::Internal("non-empty layer has no entry point".into())
                })?,
                Some(key) => layer.slot_of(key).ok_or_else(|| {
                    GraphError::Internal(format!("elevator key {key:?} missing from layer {i}"))
                })?,
            };
            if i > 0 {
                let nearest = layer.search(entry, 1, ef, query, &dist);
                let best = nearest.first().ok_or_else(|| {
                    GraphError::Internal("empty neighborhood during search descent".into())
                })?;
                elevator = Some(best.key.clone());
            } else {
                return Ok(layer.search(entry, k, ef, query, &dist));
            }
        }
        Err(GraphError::Internal("graph has no base layer".into()))
    }

    fn materialize(&self, candidates: Vec<Candidate<K>>) -> Vec<Node<K>> {
        if candidates.is_empty() {
            return Vec::new();
        }
        let base = &self.layers[0];
        candidates
            .into_iter()
            .map(|c| Node {
                key: c.key,
                value: base.node(c.slot).value.to_vec(),
            })
            .collect()
    }

    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<Node<K>>> {
        let candidates = self.search_candidates(query, k)?;
        Ok(self.materialize(candidates))
    }

    pub fn search_with_negatives(
        &self,
        query: &[f32],
        negatives: &[Vec<f32>],
        k: usize,
        neg_weight: f32,
    ) -> Result<Vec<Node<K>>> {
        if !(0.0..=1.0).contains(&neg_weight) {
            return Err(GraphError::InvalidWeight(neg_weight));
        }
        if negatives.is_empty() {
            return self.search(query, k);
        }
        if self.len() > 0 {
            for negative in negatives {
                self.check_dims(negative)?;
            }
        }

        // Overscan, then rescore: similarity to a negative raises the score
        // and pushes the candidate down the ascending ranking. The penalty
        // is averaged over the negative set so the weight keeps the same
        // meaning regardless of how many negatives there are.
        let expanded = k.saturating_mul(config::NEGATIVE_SEARCH_EXPANSION);
        let candidates = self.search_candidates(query, expanded)?;
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let dist = &self.config.distance;
        let base = &self.layers[0];
        let mut scored: Vec<(OrderedFloat<f32>, Candidate<K>)> = candidates
            .into_iter()
            .map(|c| {
                let value = base.node(c.slot).value.clone();
                let penalty: f32 = negatives
                    .iter()
                    .map(|negative| 1.0 - dist.compute(&value, negative))
                    .sum::<f32>()
                    / negatives.len() as f32;
                (OrderedFloat(c.dist.0 + neg_weight * penalty), c)
            })
            .collect();
        scored.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.key.cmp(&b.1.key)));
        scored.truncate(k);

        Ok(self.materialize(scored.into_iter().map(|(_, c)| c).collect()))
    }
}

/// A Hierarchical Navigable Small World graph over vectors keyed by `K`.
///
/// The handle is cheap to clone and safe to share across threads; all
/// clones address the same graph through one reader/writer lock.
#[derive(Debug)]
pub struct Graph<K: Key> {
    inner: Arc<RwLock<GraphInner<K>>>,
}

impl<K: Key> Clone for Graph<K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K: Key> Default for Graph<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Key> Graph<K> {
    /// An empty graph with default parameters (M=16, Ml=0.25, EfSearch=20,
    /// cosine distance) and an entropy-seeded level RNG.
    pub fn new() -> Self {
        Self::from_parts(GraphConfig::default(), StdRng::from_entropy())
    }

    /// An empty default graph whose level generation replays
    /// deterministically from `seed`.
    pub fn with_seed(seed: u64) -> Self {
        Self::from_parts(GraphConfig::default(), StdRng::seed_from_u64(seed))
    }

    /// An empty graph with the given parameters.
    pub fn with_config(config: GraphConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::from_parts(config, StdRng::from_entropy()))
    }

    /// An empty graph with the given parameters and a deterministic seed.
    pub fn with_config_and_seed(config: GraphConfig, seed: u64) -> Result<Self> {
        config.validate()?;
        Ok(Self::from_parts(config, StdRng::seed_from_u64(seed)))
    }

    fn from_parts(config: GraphConfig, rng: StdRng) -> Self {
        Self {
            inner: Arc::new(RwLock::new(GraphInner {
                config,
                rng,
                layers: Vec::new(),
            })),
        }
    }

    /// Runs a closure against the locked state; used by the analyzer and
    /// serializer so they share the readers' lock discipline.
    pub(crate) fn with_inner<R>(&self, f: impl FnOnce(&GraphInner<K>) -> R) -> R {
        f(&self.inner.read())
    }

    /// A snapshot of the current parameters.
    pub fn config(&self) -> GraphConfig {
        self.inner.read().config.clone()
    }

    /// Inserts a node. A node with the same key is replaced; the first
    /// inserted vector fixes the graph's dimension.
    pub fn add(&self, node: Node<K>) -> Result<()> {
        self.inner.write().add(node)
    }

    /// Inserts several nodes under one exclusive lock acquisition. On the
    /// first error, nodes inserted so far remain in the graph.
    pub fn batch_add(&self, nodes: Vec<Node<K>>) -> Result<()> {
        let mut inner = self.inner.write();
        for node in nodes {
            inner.add(node)?;
        }
        Ok(())
    }

    /// Removes a key from every layer, repairing the neighborhoods it
    /// leaves. Returns whether the key was present.
    pub fn delete(&self, key: &K) -> bool {
        self.inner.write().delete(key)
    }

    /// Deletes each key under one lock acquisition, reporting per-key
    /// presence. A key listed twice reports `true` once, then `false`.
    pub fn batch_delete(&self, keys: &[K]) -> Vec<bool> {
        let mut inner = self.inner.write();
        keys.iter().map(|key| inner.delete(key)).collect()
    }

    /// The vector stored under `key`, if present.
    pub fn lookup(&self, key: &K) -> Option<Vec<f32>> {
        self.inner.read().lookup(key)
    }

    /// The number of nodes in the graph.
    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The graph's dimension, or 0 while it is empty.
    pub fn dims(&self) -> usize {
        self.inner.read().dims()
    }

    /// Returns the `k` approximate nearest neighbors of `query`, ascending
    /// by distance. An empty graph yields an empty result.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<Node<K>>> {
        self.inner.read().search(query, k)
    }

    /// Like [`Graph::search`], but candidates near `negative` are pushed
    /// down the ranking. `neg_weight` in `[0, 1]` scales the penalty.
    pub fn search_with_negative(
        &self,
        query: &[f32],
        negative: &[f32],
        k: usize,
        neg_weight: f32,
    ) -> Result<Vec<Node<K>>> {
        let negatives = [negative.to_vec()];
        self.inner
            .read()
            .search_with_negatives(query, &negatives, k, neg_weight)
    }

    /// Like [`Graph::search_with_negative`] with the penalty averaged over a
    /// set of negative examples. An empty set behaves exactly like `search`.
    pub fn search_with_negatives(
        &self,
        query: &[f32],
        negatives: &[Vec<f32>],
        k: usize,
        neg_weight: f32,
    ) -> Result<Vec<Node<K>>> {
        self.inner
            .read()
            .search_with_negatives(query, negatives, k, neg_weight)
    }

    /// Runs several searches under one shared lock acquisition.
    pub fn batch_search(&self, queries: &[Vec<f32>], k: usize) -> Result<Vec<Vec<Node<K>>>> {
        let inner = self.inner.read();
        queries.iter().map(|query| inner.search(query, k)).collect()
    }

    /// Runs several negative-example searches under one shared lock
    /// acquisition. `negatives[i]` is the negative set for `queries[i]`.
    pub fn batch_search_with_negatives(
        &self,
        queries: &[Vec<f32>],
        negatives: &[Vec<Vec<f32>>],
        k: usize,
        neg_weight: f32,
    ) -> Result<Vec<Vec<Node<K>>>> {
        if queries.len() != negatives.len() {
            return Err(GraphError::InvalidConfig(format!(
                "queries and negative sets must have equal length, got {} and {}",
                queries.len(),
                negatives.len()
            )));
        }
        let inner = self.inner.read();
        queries
            .iter()
            .zip(negatives)
            .map(|(query, negative_set)| {
                inner.search_with_negatives(query, negative_set, k, neg_weight)
            })
            .collect()
    }

    /// Writes the graph to `w` in the versioned binary format.
    pub fn export<W: Write>(&self, w: &mut W) -> Result<()> {
        encode::export(&self.inner.read(), w)
    }

    /// Replaces this graph's state with one decoded from `r`.
    ///
    /// Parameters come from the stream; subsequent inserts converge onto
    /// them. On error the graph is left unchanged.
    pub fn import<R: Read>(&self, r: &mut R) -> Result<()> {
        let mut guard = self.inner.write();
        let mut fresh = encode::import::<K, R>(r)?;
        fresh.rng = guard.rng.clone();
        *guard = fresh;
        Ok(())
    }
}
