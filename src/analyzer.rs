//! Read-only derived metrics over a graph.
//!
//! Everything here takes the shared side of the graph's lock: topography and
//! connectivity are cheap scans, while the distortion ratio samples up to
//! [`crate::config::DISTORTION_SAMPLE_CAP`] base-layer nodes and compares
//! BFS hop counts against metric distances for every sampled pair.

use crate::config;
use crate::encode::Key;
use crate::graph::{Graph, GraphInner};
use crate::layer::{Layer, SlotId};
use std::collections::{HashMap, VecDeque};

/// Aggregate health metrics for a graph.
#[derive(Debug, Clone, PartialEq)]
pub struct QualityMetrics {
    /// Number of nodes in the graph.
    pub node_count: usize,
    /// Average base-layer degree.
    pub avg_connectivity: f64,
    /// Standard deviation of the base-layer degree.
    pub connectivity_std_dev: f64,
    /// How closely layer occupancy follows the `Ml` geometric expectation,
    /// from 0 (far off) to 1 (exact).
    pub layer_balance: f64,
    /// Sampled mean of BFS-hop distance over metric distance; lower means
    /// graph routes track the underlying metric more faithfully.
    pub distortion_ratio: f64,
    /// Number of layers.
    pub graph_height: usize,
}

/// Read-only analysis over a [`Graph`].
pub struct Analyzer<'a, K: Key> {
    graph: &'a Graph<K>,
}

impl<'a, K: Key> Analyzer<'a, K> {
    pub fn new(graph: &'a Graph<K>) -> Self {
        Self { graph }
    }

    /// The number of layers in the graph.
    pub fn height(&self) -> usize {
        self.graph.with_inner(|inner| inner.layers.len())
    }

    /// Per-layer node counts, base layer first.
    pub fn topography(&self) -> Vec<usize> {
        self.graph
            .with_inner(|inner| inner.layers.iter().map(Layer::len).collect())
    }

    /// Average degree for each non-empty layer, base layer first.
    pub fn connectivity(&self) -> Vec<f64> {
        self.graph.with_inner(|inner| {
            inner
                .layers
                .iter()
                .filter(|layer| !layer.is_empty())
                .map(average_degree)
                .collect()
        })
    }

    /// Hop distance between two keys on the base layer, bounded by the BFS
    /// depth cap. `None` if either key is absent or no path was found within
    /// the cap.
    pub fn estimate_graph_distance(&self, from: &K, to: &K) -> Option<usize> {
        self.graph.with_inner(|inner| {
            let base = inner.layers.first()?;
            let source = base.slot_of(from)?;
            let target = base.slot_of(to)?;
            bfs_hops(base, source, config::DISTORTION_BFS_DEPTH_CAP)
                .get(&target)
                .copied()
        })
    }

    /// Computes all aggregate metrics in one pass under the shared lock.
    pub fn quality_metrics(&self) -> QualityMetrics {
        self.graph.with_inner(|inner| {
            let node_count = inner.len();
            if node_count == 0 {
                return QualityMetrics {
                    node_count: 0,
                    avg_connectivity: 0.0,
                    connectivity_std_dev: 0.0,
                    layer_balance: 0.0,
                    distortion_ratio: 0.0,
                    graph_height: inner.layers.len(),
                };
            }

            let base = &inner.layers[0];
            let avg = average_degree(base);
            let variance = base
                .nodes()
                .map(|node| {
                    let diff = node.neighbors.len() as f64 - avg;
                    diff * diff
                })
                .sum::<f64>()
                / node_count as f64;

            QualityMetrics {
                node_count,
                avg_connectivity: avg,
                connectivity_std_dev: variance.sqrt(),
                layer_balance: layer_balance(inner),
                distortion_ratio: distortion_ratio(inner),
                graph_height: inner.layers.len(),
            }
        })
    }
}

fn average_degree<K: Key>(layer: &Layer<K>) -> f64 {
    if layer.is_empty() {
        return 0.0;
    }
    let total: usize = layer.nodes().map(|node| node.neighbors.len()).sum();
    total as f64 / layer.len() as f64
}

// Mean relative deviation of consecutive layer-size ratios from Ml, mapped
// onto [0, 1] where 1 means occupancy decays exactly geometrically.
fn layer_balance<K: Key>(inner: &GraphInner<K>) -> f64 {
    let sizes: Vec<usize> = inner
        .layers
        .iter()
        .map(Layer::len)
        .take_while(|&n| n > 0)
        .collect();
    if sizes.len() < 2 {
        return 1.0;
    }
    let ml = inner.config.ml;
    let mean_deviation = sizes
        .windows(2)
        .map(|pair| {
            let ratio = pair[1] as f64 / pair[0] as f64;
            (ratio - ml).abs() / ml
        })
        .sum::<f64>()
        / (sizes.len() - 1) as f64;
    (1.0 - mean_deviation).clamp(0.0, 1.0)
}

// Sampled estimate of how far graph routing diverges from the metric:
// the mean of hop-distance / metric-distance over sampled base-layer pairs
// reachable within the BFS depth cap.
fn distortion_ratio<K: Key>(inner: &GraphInner<K>) -> f64 {
    let base = &inner.layers[0];
    let mut samples = base.sorted_slots();
    samples.truncate(config::DISTORTION_SAMPLE_CAP);
    if samples.len() < 2 {
        return 0.0;
    }

    let dist = &inner.config.distance;
    let mut total = 0.0f64;
    let mut pairs = 0usize;

    for (i, &source) in samples.iter().enumerate() {
        let hops = bfs_hops(base, source, config::DISTORTION_BFS_DEPTH_CAP);
        for &target in &samples[i + 1..] {
            let Some(&hop_count) = hops.get(&target) else {
                continue;
            };
            let metric = f64::from(
                dist.compute(&base.node(source).value, &base.node(target).value),
            );
            if metric > f64::EPSILON && metric.is_finite() {
                total += hop_count as f64 / metric;
                pairs += 1;
            }
        }
    }

    if pairs == 0 {
        0.0
    } else {
        total / pairs as f64
    }
}

fn bfs_hops<K: Key>(
    layer: &Layer<K>,
    source: SlotId,
    max_depth: usize,
) -> HashMap<SlotId, usize> {
    let mut hops = HashMap::new();
    hops.insert(source, 0);
    let mut queue = VecDeque::from([source]);
    while let Some(current) = queue.pop_front() {
        let depth = hops[&current];
        if depth >= max_depth {
            continue;
        }
        for &neighbor in layer.node(current).neighbors.values() {
            if !hops.contains_key(&neighbor) {
                hops.insert(neighbor, depth + 1);
                queue.push_back(neighbor);
            }
        }
    }
    hops
}
