//! # smallworld
//!
//! An in-memory Hierarchical Navigable Small World (HNSW) index for
//! approximate nearest neighbor search over `f32` vectors, generic over a
//! caller-chosen key type.
//!
//! A [`Graph`] supports insert, delete, lookup, and k-NN search (including
//! search biased away from negative example vectors), plus batch variants,
//! a compact versioned binary format ([`Graph::export`] / [`Graph::import`]
//! and the file-backed [`SavedGraph`]), and read-only graph analytics
//! through [`Analyzer`]. A single graph may be shared freely across
//! threads: one reader/writer lock linearizes all operations.
//!
//! ```
//! use smallworld::{Graph, Node};
//!
//! let graph: Graph<i64> = Graph::new();
//! graph.add(Node::new(1, vec![1.0, 0.0]))?;
//! graph.add(Node::new(2, vec![0.0, 1.0]))?;
//!
//! let nearest = graph.search(&[0.9, 0.1], 1)?;
//! assert_eq!(nearest[0].key, 1);
//! # Ok::<(), smallworld::GraphError>(())
//! ```

/// Read-only derived metrics: topography, connectivity, quality metrics.
pub mod analyzer;
/// Default tuning parameters and analyzer limits.
pub mod config;
/// Distance kernels and the named distance registry.
pub mod distance;
/// Versioned binary serialization and the file-backed graph façade.
pub mod encode;
/// The crate error type.
pub mod error;
/// The HNSW graph: configuration, mutation, and search.
pub mod graph;
mod heap;
mod layer;

pub use analyzer::{Analyzer, QualityMetrics};
pub use distance::{
    cosine_distance, distance_by_name, euclidean_distance, register_distance, Distance,
};
pub use encode::{Key, SavedGraph, ENCODING_VERSION};
pub use error::{GraphError, Result};
pub use graph::{Graph, GraphConfig, Node};
