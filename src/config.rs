//! Default tuning parameters and analyzer limits.
//!
//! These are compile-time constants; per-graph configuration is handled by
//! [`crate::graph::GraphConfig`].

/// Default number of bidirectional links per node per layer.
///
/// Higher values improve recall but increase memory and build time.
/// Typical range: 8–64. Default: 16.
pub const DEFAULT_M: usize = 16;

/// Default level-generation factor.
///
/// Each layer holds roughly `Ml` times the nodes of the layer below it,
/// so 0.25 yields a 4× decay per level. Must lie strictly between 0 and 1.
pub const DEFAULT_ML: f64 = 0.25;

/// Default size of the candidate frontier during greedy layer search.
///
/// Higher values improve recall at the cost of latency.
pub const DEFAULT_EF_SEARCH: usize = 20;

/// Overscan factor for negative-example search.
///
/// `search_with_negatives` pulls `k * NEGATIVE_SEARCH_EXPANSION` candidates
/// from the regular search before rescoring against the negative set.
pub const NEGATIVE_SEARCH_EXPANSION: usize = 2;

/// Maximum number of base-layer nodes sampled for the distortion ratio.
pub const DISTORTION_SAMPLE_CAP: usize = 100;

/// Depth cap for the BFS used to estimate graph distances.
pub const DISTORTION_BFS_DEPTH_CAP: usize = 10;
