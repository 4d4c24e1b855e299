//! Versioned binary serialization and the file-backed graph façade.
//!
//! The format is a single little-endian byte stream: integers are signed
//! (zigzag) varints, strings and f32 arrays are varint-length-prefixed, and
//! `Ml` is 8 raw f64 bytes. Layout: version, M, Ml, EfSearch, distance name,
//! then per layer the node count followed by each node's key, vector,
//! neighbor count, and neighbor keys. Nodes and neighbor lists are written
//! in ascending key order so the same graph always encodes to the same
//! bytes. [`SavedGraph`] adds write-to-temp-then-rename persistence so a
//! crash mid-save never leaves a partial file behind.

use crate::distance::distance_by_name;
use crate::error::{GraphError, Result};
use crate::graph::{Graph, GraphConfig, GraphInner};
use crate::layer::Layer;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::hash::Hash;
use std::io::{self, BufReader, Read, Write};
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Format version written as the leading varint. Importers reject anything
/// else with [`GraphError::IncompatibleVersion`].
pub const ENCODING_VERSION: i64 = 1;

// Guards against absurd length prefixes in corrupt or hostile input.
const MAX_LEN: i64 = 1 << 30;

/// A graph key: totally ordered, hashable, and encodable to the wire format.
///
/// Implemented for the primitive integer types (encoded as signed varints)
/// and `String` (length-prefixed UTF-8).
pub trait Key: Clone + Ord + Hash + fmt::Debug + Send + Sync {
    /// Writes the key to the stream.
    fn write_key<W: Write>(&self, w: &mut W) -> io::Result<()>;
    /// Reads a key back from the stream.
    fn read_key<R: Read>(r: &mut R) -> io::Result<Self>;
}

macro_rules! impl_key_for_int {
    ($($t:ty),*) => {
        $(
            impl Key for $t {
                fn write_key<W: Write>(&self, w: &mut W) -> io::Result<()> {
                    write_varint(w, *self as i64)
                }

                fn read_key<R: Read>(r: &mut R) -> io::Result<Self> {
                    let v = read_varint(r)?;
                    <$t>::try_from(v).map_err(|_| {
                        io::Error::new(
                            io::ErrorKind::InvalidData,
                            format!("key {v} out of range for {}", stringify!($t)),
                        )
                    })
                }
            }
        )*
    };
}

impl_key_for_int!(i8, i16, i32, i64, isize, u8, u16, u32);

// u64 and usize round-trip through a bit cast: the zigzag varint encodes
// all 64 bit patterns, so no range check applies.
impl Key for u64 {
    fn write_key<W: Write>(&self, w: &mut W) -> io::Result<()> {
        write_varint(w, *self as i64)
    }

    fn read_key<R: Read>(r: &mut R) -> io::Result<Self> {
        Ok(read_varint(r)? as u64)
    }
}

impl Key for usize {
    fn write_key<W: Write>(&self, w: &mut W) -> io::Result<()> {
        write_varint(w, *self as u64 as i64)
    }

    fn read_key<R: Read>(r: &mut R) -> io::Result<Self> {
        Ok(read_varint(r)? as u64 as usize)
    }
}

impl Key for String {
    fn write_key<W: Write>(&self, w: &mut W) -> io::Result<()> {
        write_string(w, self)
    }

    fn read_key<R: Read>(r: &mut R) -> io::Result<Self> {
        read_string(r)
    }
}

/// Writes a signed varint (zigzag LEB128).
pub(crate) fn write_varint<W: Write>(w: &mut W, v: i64) -> io::Result<()> {
    let mut ux = ((v << 1) ^ (v >> 63)) as u64;
    loop {
        let mut byte = (ux & 0x7f) as u8;
        ux >>= 7;
        if ux != 0 {
            byte |= 0x80;
        }
        w.write_all(&[byte])?;
        if ux == 0 {
            return Ok(());
        }
    }
}

/// Reads a signed varint, consuming exactly the bytes it occupies.
pub(crate) fn read_varint<R: Read>(r: &mut R) -> io::Result<i64> {
    let mut ux: u64 = 0;
    let mut shift = 0u32;
    loop {
        let mut buf = [0u8; 1];
        r.read_exact(&mut buf)?;
        if shift > 63 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "varint overflows 64 bits",
            ));
        }
        ux |= u64::from(buf[0] & 0x7f) << shift;
        if buf[0] & 0x80 == 0 {
            break;
        }
        shift += 7;
    }
    Ok(((ux >> 1) as i64) ^ -((ux & 1) as i64))
}

fn write_string<W: Write>(w: &mut W, s: &str) -> io::Result<()> {
    write_varint(w, s.len() as i64)?;
    w.write_all(s.as_bytes())
}

fn read_string<R: Read>(r: &mut R) -> io::Result<String> {
    let len = read_varint(r)?;
    if !(0..=MAX_LEN).contains(&len) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("invalid string length {len}"),
        ));
    }
    let mut buf = vec![0u8; len as usize];
    r.read_exact(&mut buf)?;
    String::from_utf8(buf)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))
}

fn write_f32s<W: Write>(w: &mut W, values: &[f32]) -> io::Result<()> {
    write_varint(w, values.len() as i64)?;
    for v in values {
        w.write_all(&v.to_le_bytes())?;
    }
    Ok(())
}

fn read_f32s<R: Read>(r: &mut R) -> io::Result<Vec<f32>> {
    let len = read_varint(r)?;
    if !(0..=MAX_LEN / 4).contains(&len) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("invalid vector length {len}"),
        ));
    }
    let mut out = Vec::with_capacity(len as usize);
    let mut buf = [0u8; 4];
    for _ in 0..len {
        r.read_exact(&mut buf)?;
        out.push(f32::from_le_bytes(buf));
    }
    Ok(out)
}

// Reads a varint that must be a non-negative, sane count.
fn read_count<R: Read>(r: &mut R) -> Result<usize> {
    let v = read_varint(r)?;
    if !(0..=MAX_LEN).contains(&v) {
        return Err(GraphError::Serialization(format!("invalid count {v}")));
    }
    Ok(v as usize)
}

/// Writes the complete graph state to `w` in the versioned format.
pub(crate) fn export<K: Key, W: Write>(inner: &GraphInner<K>, w: &mut W) -> Result<()> {
    let name = inner.config.distance.name().to_string();
    if distance_by_name(&name).is_none() {
        return Err(GraphError::UnknownDistanceFunction(name));
    }

    write_varint(w, ENCODING_VERSION)?;
    write_varint(w, inner.config.m as i64)?;
    w.write_all(&inner.config.ml.to_le_bytes())?;
    write_varint(w, inner.config.ef_search as i64)?;
    write_string(w, &name)?;

    write_varint(w, inner.layers.len() as i64)?;
    for layer in &inner.layers {
        write_varint(w, layer.len() as i64)?;
        for slot in layer.sorted_slots() {
            let node = layer.node(slot);
            node.key.write_key(w)?;
            write_f32s(w, &node.value)?;
            write_varint(w, node.neighbors.len() as i64)?;
            for neighbor_key in node.neighbors.keys() {
                neighbor_key.write_key(w)?;
            }
        }
    }
    Ok(())
}

/// Decodes a complete graph state from `r`.
///
/// Nodes are materialized first with their neighbor keys stashed; a second
/// pass per layer resolves keys to slots. Parameters come from the stream
/// and replace whatever the receiving graph was configured with.
pub(crate) fn import<K: Key, R: Read>(r: &mut R) -> Result<GraphInner<K>> {
    let version = read_varint(r)?;
    if version != ENCODING_VERSION {
        return Err(GraphError::IncompatibleVersion(version));
    }

    let m = read_count(r)?;
    let mut ml_buf = [0u8; 8];
    r.read_exact(&mut ml_buf)?;
    let ml = f64::from_le_bytes(ml_buf);
    let ef_search = read_count(r)?;
    let name = read_string(r)?;
    let distance =
        distance_by_name(&name).ok_or(GraphError::UnknownDistanceFunction(name))?;

    let config = GraphConfig {
        m,
        ml,
        ef_search,
        distance,
    };
    config.validate()?;

    let layer_count = read_count(r)?;
    let mut layers: Vec<Layer<K>> = Vec::new();
    let mut base_vectors: HashMap<K, Arc<[f32]>> = HashMap::new();
    let mut dims: Option<usize> = None;

    for layer_index in 0..layer_count {
        let node_count = read_count(r)?;
        let mut layer = Layer::new();
        let mut pending = Vec::new();

        for _ in 0..node_count {
            let key = K::read_key(r)?;
            let vector = read_f32s(r)?;
            match dims {
                None => dims = Some(vector.len()),
                Some(d) if d != vector.len() => {
                    return Err(GraphError::Serialization(format!(
                        "vector length {} for key {:?} does not match dimension {}",
                        vector.len(),
                        key,
                        d
                    )));
                }
                _ => {}
            }

            // Higher layers share the base layer's vector storage.
            let value: Arc<[f32]> = if layer_index == 0 {
                let value: Arc<[f32]> = vector.into();
                base_vectors.insert(key.clone(), value.clone());
                value
            } else {
                base_vectors.get(&key).cloned().ok_or_else(|| {
                    GraphError::Serialization(format!(
                        "key {key:?} in layer {layer_index} is missing from the base layer"
                    ))
                })?
            };

            let neighbor_count = read_count(r)?;
            let mut neighbor_keys = Vec::new();
            for _ in 0..neighbor_count {
                neighbor_keys.push(K::read_key(r)?);
            }

            let slot = layer.insert(key, value);
            pending.push((slot, neighbor_keys));
        }

        for (slot, neighbor_keys) in pending {
            for neighbor_key in neighbor_keys {
                let neighbor_slot = layer.slot_of(&neighbor_key).ok_or_else(|| {
                    GraphError::Serialization(format!(
                        "neighbor {neighbor_key:?} not present in layer {layer_index}"
                    ))
                })?;
                layer
                    .node_mut(slot)
                    .neighbors
                    .insert(neighbor_key, neighbor_slot);
            }
        }
        layers.push(layer);
    }

    tracing::debug!(
        layers = layers.len(),
        nodes = layers.first().map_or(0, Layer::len),
        "imported graph"
    );

    Ok(GraphInner {
        config,
        rng: StdRng::from_entropy(),
        layers,
    })
}

/// A graph bound to a filesystem path, persisted on [`SavedGraph::save`].
///
/// More convenient but less flexible than calling [`Graph::export`] and
/// [`Graph::import`] directly. Derefs to the wrapped [`Graph`].
pub struct SavedGraph<K: Key> {
    graph: Graph<K>,
    path: PathBuf,
}

impl<K: Key> SavedGraph<K> {
    /// Opens the graph stored at `path`, or an empty default graph if the
    /// file does not exist yet. No file descriptor is held open afterwards.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let graph = Graph::new();
        match fs::File::open(&path) {
            Ok(file) => {
                if file.metadata()?.len() > 0 {
                    let mut reader = BufReader::new(file);
                    graph.import(&mut reader)?;
                    tracing::info!(nodes = graph.len(), path = %path.display(), "loaded saved graph");
                }
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no saved graph on disk, starting empty");
            }
            Err(e) => return Err(e.into()),
        }
        Ok(Self { graph, path })
    }

    /// Atomically writes the graph to its path: encode to a sibling temp
    /// file, then rename into place so readers never observe a partial file.
    pub fn save(&self) -> Result<()> {
        let mut buf = Vec::new();
        self.graph.export(&mut buf)?;

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        fs::write(&tmp, &buf)?;
        fs::rename(&tmp, &self.path)?;

        tracing::info!(
            bytes = buf.len(),
            nodes = self.graph.len(),
            path = %self.path.display(),
            "saved graph"
        );
        Ok(())
    }

    /// The wrapped graph handle.
    pub fn graph(&self) -> &Graph<K> {
        &self.graph
    }

    /// The path this graph persists to.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl<K: Key> Deref for SavedGraph<K> {
    type Target = Graph<K>;

    fn deref(&self) -> &Self::Target {
        &self.graph
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Node;
    use rand::Rng;

    #[test]
    fn test_varint_known_width() {
        let mut buf = Vec::new();
        write_varint(&mut buf, 1337).unwrap();
        assert_eq!(buf.len(), 2);

        // Trailing bytes must not be consumed past the varint.
        buf.extend_from_slice(&[0, 0, 0, 0]);
        let mut reader = buf.as_slice();
        assert_eq!(read_varint(&mut reader).unwrap(), 1337);
        assert_eq!(reader, &[0u8, 0, 0, 0][..]);
    }

    #[test]
    fn test_varint_roundtrip_extremes() {
        for v in [0i64, -1, 1, 63, -64, i64::MAX, i64::MIN, 1 << 40] {
            let mut buf = Vec::new();
            write_varint(&mut buf, v).unwrap();
            assert_eq!(read_varint(&mut buf.as_slice()).unwrap(), v, "value {v}");
        }
    }

    #[test]
    fn test_string_roundtrip() {
        let mut buf = Vec::new();
        write_string(&mut buf, "hello").unwrap();
        // 1 length byte + 5 payload bytes.
        assert_eq!(buf.len(), 6);
        assert_eq!(read_string(&mut buf.as_slice()).unwrap(), "hello");
    }

    #[test]
    fn test_f32s_roundtrip() {
        let values = vec![0.0f32, -1.5, 3.25, f32::MAX];
        let mut buf = Vec::new();
        write_f32s(&mut buf, &values).unwrap();
        assert_eq!(read_f32s(&mut buf.as_slice()).unwrap(), values);
    }

    #[test]
    fn test_key_roundtrip_ints_and_strings() {
        let mut buf = Vec::new();
        42i64.write_key(&mut buf).unwrap();
        u64::MAX.write_key(&mut buf).unwrap();
        "alpha".to_string().write_key(&mut buf).unwrap();

        let mut reader = buf.as_slice();
        assert_eq!(i64::read_key(&mut reader).unwrap(), 42);
        assert_eq!(u64::read_key(&mut reader).unwrap(), u64::MAX);
        assert_eq!(String::read_key(&mut reader).unwrap(), "alpha");
        assert!(reader.is_empty());
    }

    fn seeded_graph(seed: u64) -> Graph<i64> {
        let config = GraphConfig {
            m: 6,
            ml: 0.5,
            ef_search: 20,
            distance: crate::distance::Distance::euclidean(),
        };
        let g = Graph::with_config_and_seed(config, seed).unwrap();
        let mut rng = StdRng::seed_from_u64(7);
        for i in 0..128 {
            g.add(Node::new(i, vec![rng.gen::<f32>()])).unwrap();
        }
        g
    }

    fn assert_graphs_equivalent(g1: &Graph<i64>, g2: &Graph<i64>) {
        let a1 = crate::analyzer::Analyzer::new(g1);
        let a2 = crate::analyzer::Analyzer::new(g2);
        assert_eq!(g1.len(), g2.len());
        assert_eq!(a1.topography(), a2.topography());
        assert_eq!(a1.connectivity(), a2.connectivity());
        let c1 = g1.config();
        let c2 = g2.config();
        assert_eq!(c1.m, c2.m);
        assert_eq!(c1.ml, c2.ml);
        assert_eq!(c1.ef_search, c2.ef_search);
        assert_eq!(c1.distance.name(), c2.distance.name());
    }

    #[test]
    fn test_export_import_roundtrip() {
        let g1 = seeded_graph(0);

        let mut buf = Vec::new();
        g1.export(&mut buf).unwrap();

        // Import into a graph with different parameters: they are replaced.
        let g2: Graph<i64> = Graph::new();
        g2.import(&mut buf.as_slice()).unwrap();

        assert_graphs_equivalent(&g1, &g2);

        // The round-tripped graph answers every query identically.
        for k in [1, 4, 10] {
            let n1 = g1.search(&[0.5], k).unwrap();
            let n2 = g2.search(&[0.5], k).unwrap();
            assert_eq!(n1, n2, "search diverged for k={k}");
        }
    }

    #[test]
    fn test_export_is_deterministic() {
        let g = seeded_graph(3);
        let mut buf1 = Vec::new();
        let mut buf2 = Vec::new();
        g.export(&mut buf1).unwrap();
        g.export(&mut buf2).unwrap();
        assert_eq!(buf1, buf2);
    }

    #[test]
    fn test_import_neighbors_resolved() {
        let g1 = seeded_graph(1);
        let mut buf = Vec::new();
        g1.export(&mut buf).unwrap();

        let g2: Graph<i64> = Graph::new();
        g2.import(&mut buf.as_slice()).unwrap();

        // Every neighbor reference must resolve to a resident of the same
        // layer, with the reciprocal edge present.
        g2.with_inner(|inner| {
            for layer in &inner.layers {
                for node in layer.nodes() {
                    for (neighbor_key, &neighbor_slot) in &node.neighbors {
                        let neighbor = layer.node(neighbor_slot);
                        assert_eq!(&neighbor.key, neighbor_key);
                        assert!(neighbor.neighbors.contains_key(&node.key));
                    }
                }
            }
        });
    }

    #[test]
    fn test_string_key_roundtrip() {
        let g1: Graph<String> = Graph::with_seed(11);
        for (key, v) in [
            ("dog", [1.0, 0.2]),
            ("cat", [0.1, 1.0]),
            ("bird", [0.2, 0.3]),
        ] {
            g1.add(Node::new(key.to_string(), v.to_vec())).unwrap();
        }

        let mut buf = Vec::new();
        g1.export(&mut buf).unwrap();
        let g2: Graph<String> = Graph::new();
        g2.import(&mut buf.as_slice()).unwrap();

        assert_eq!(g2.len(), 3);
        assert_eq!(g2.lookup(&"dog".to_string()), Some(vec![1.0, 0.2]));
        assert_eq!(
            g1.search(&[1.0, 0.1], 2).unwrap(),
            g2.search(&[1.0, 0.1], 2).unwrap()
        );
    }

    #[test]
    fn test_incompatible_version_rejected() {
        let mut buf = Vec::new();
        write_varint(&mut buf, 2).unwrap();
        let g: Graph<i64> = Graph::new();
        let err = g.import(&mut buf.as_slice()).unwrap_err();
        assert!(matches!(err, GraphError::IncompatibleVersion(2)));
    }

    #[test]
    fn test_unknown_distance_rejected_on_import() {
        let g1 = seeded_graph(2);
        let mut buf = Vec::new();
        g1.export(&mut buf).unwrap();

        // Corrupt the distance name: "euclidean" -> "euclidexn".
        let pos = buf
            .windows(9)
            .position(|w| w == b"euclidean")
            .expect("distance name present in encoding");
        buf[pos + 7] = b'x';

        let g2: Graph<i64> = Graph::new();
        let err = g2.import(&mut buf.as_slice()).unwrap_err();
        assert!(matches!(err, GraphError::UnknownDistanceFunction(_)));
    }

    #[test]
    fn test_unregistered_distance_rejected_on_export() {
        let config = GraphConfig {
            distance: crate::distance::Distance::new("never_registered", |a, b| {
                euclidean_stub(a, b)
            }),
            ..GraphConfig::default()
        };
        let g: Graph<i64> = Graph::with_config(config).unwrap();
        g.add(Node::new(1, vec![1.0])).unwrap();

        let mut buf = Vec::new();
        let err = g.export(&mut buf).unwrap_err();
        assert!(matches!(err, GraphError::UnknownDistanceFunction(_)));
    }

    fn euclidean_stub(a: &[f32], b: &[f32]) -> f32 {
        crate::distance::euclidean_distance(a, b)
    }

    #[test]
    fn test_truncated_stream_leaves_graph_intact() {
        let g1 = seeded_graph(4);
        let mut buf = Vec::new();
        g1.export(&mut buf).unwrap();
        buf.truncate(buf.len() / 2);

        let g2: Graph<i64> = Graph::with_seed(9);
        g2.add(Node::new(500, vec![0.25])).unwrap();
        let err = g2.import(&mut buf.as_slice()).unwrap_err();
        assert!(matches!(err, GraphError::Io(_) | GraphError::Serialization(_)));

        // The failed import must not have touched the receiving graph.
        assert_eq!(g2.len(), 1);
        assert_eq!(g2.lookup(&500), Some(vec![0.25]));
    }

    #[test]
    fn test_empty_graph_roundtrip() {
        let g1: Graph<i64> = Graph::new();
        let mut buf = Vec::new();
        g1.export(&mut buf).unwrap();

        let g2: Graph<i64> = Graph::new();
        g2.import(&mut buf.as_slice()).unwrap();
        assert_eq!(g2.len(), 0);
        assert!(g2.search(&[1.0], 3).unwrap().is_empty());
    }

    // ── SavedGraph ─────────────────────────────────────────────────────

    fn tmp_dir() -> PathBuf {
        let id = uuid::Uuid::new_v4();
        let dir = std::env::temp_dir().join(format!("smallworld_{id}"));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_saved_graph_roundtrip() {
        let dir = tmp_dir();
        let path = dir.join("graph");

        let g1: SavedGraph<i64> = SavedGraph::load(&path).unwrap();
        assert_eq!(g1.len(), 0);
        let mut rng = StdRng::seed_from_u64(5);
        for i in 0..128 {
            g1.add(Node::new(i, vec![rng.gen::<f32>()])).unwrap();
        }
        g1.save().unwrap();

        let g2: SavedGraph<i64> = SavedGraph::load(&path).unwrap();
        assert_eq!(g2.len(), 128);
        assert_graphs_equivalent(g1.graph(), g2.graph());

        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn test_saved_graph_missing_file_starts_empty() {
        let dir = tmp_dir();
        let g: SavedGraph<i64> = SavedGraph::load(dir.join("absent")).unwrap();
        assert_eq!(g.len(), 0);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn test_saved_graph_save_replaces_atomically() {
        let dir = tmp_dir();
        let path = dir.join("graph");

        let g: SavedGraph<i64> = SavedGraph::load(&path).unwrap();
        g.add(Node::new(1, vec![1.0])).unwrap();
        g.save().unwrap();
        g.add(Node::new(2, vec![2.0])).unwrap();
        g.save().unwrap();

        // No temp file left behind, and the newest state is on disk.
        assert!(!dir.join("graph.tmp").exists());
        let reloaded: SavedGraph<i64> = SavedGraph::load(&path).unwrap();
        assert_eq!(reloaded.len(), 2);

        let _ = std::fs::remove_dir_all(dir);
    }
}
