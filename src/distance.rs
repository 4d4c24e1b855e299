//! Distance kernels and the process-wide distance registry.
//!
//! A [`Distance`] pairs a kernel with the name it is registered under, so a
//! serialized graph can recover the function on import. The two built-in
//! metrics, `"cosine"` and `"euclidean"`, are registered at first use;
//! custom metrics should be registered during program startup, before any
//! graph is exported or imported.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, LazyLock};

/// Cosine distance: `1 - (a·b) / (‖a‖·‖b‖)`. Range: \[0, 2\].
///
/// If either vector has zero norm the distance is 0: direction-less vectors
/// are not comparable, and this convention is pinned by tests.
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    1.0 - dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Euclidean (L2) distance: `sqrt(Σ (aᵢ-bᵢ)²)`. Range: \[0, ∞).
pub fn euclidean_distance(a: &[f32], b: &[f32]) -> f32 {
    let mut sum = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        let diff = x - y;
        sum += diff * diff;
    }
    sum.sqrt()
}

/// A named distance function.
///
/// Lower values mean more similar. The name travels with the graph when it
/// is exported; import resolves the name back through the registry.
#[derive(Clone)]
pub struct Distance {
    name: Arc<str>,
    func: Arc<dyn Fn(&[f32], &[f32]) -> f32 + Send + Sync>,
}

impl Distance {
    /// Wraps a kernel under the given name. The result is usable immediately;
    /// call [`register_distance`] if graphs using it will be exported.
    pub fn new(name: &str, func: impl Fn(&[f32], &[f32]) -> f32 + Send + Sync + 'static) -> Self {
        Self {
            name: Arc::from(name),
            func: Arc::new(func),
        }
    }

    /// The built-in cosine distance.
    pub fn cosine() -> Self {
        Self::new("cosine", cosine_distance)
    }

    /// The built-in Euclidean distance.
    pub fn euclidean() -> Self {
        Self::new("euclidean", euclidean_distance)
    }

    /// The registry name of this function.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Computes the distance between two vectors.
    #[inline]
    pub fn compute(&self, a: &[f32], b: &[f32]) -> f32 {
        (self.func)(a, b)
    }
}

impl fmt::Debug for Distance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Distance").field(&self.name).finish()
    }
}

impl PartialEq for Distance {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

static REGISTRY: LazyLock<RwLock<HashMap<String, Distance>>> = LazyLock::new(|| {
    let mut map = HashMap::new();
    map.insert("cosine".to_string(), Distance::cosine());
    map.insert("euclidean".to_string(), Distance::euclidean());
    RwLock::new(map)
});

/// Registers a distance function under its name, replacing any previous
/// registration. Required before exporting or importing graphs that use a
/// custom metric.
pub fn register_distance(distance: Distance) {
    REGISTRY
        .write()
        .insert(distance.name().to_string(), distance);
}

/// Looks up a registered distance function by name.
pub fn distance_by_name(name: &str) -> Option<Distance> {
    REGISTRY.read().get(name).cloned()
}
