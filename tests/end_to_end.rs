//! End-to-end tests driving the full public surface: build, query, mutate,
//! persist, reload, and analyze a graph the way an embedding application
//! would.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use smallworld::{
    Analyzer, Distance, Graph, GraphConfig, GraphError, Node, SavedGraph,
};
use std::path::PathBuf;

const DIM: usize = 16;

fn random_vector(rng: &mut StdRng) -> Vec<f32> {
    (0..DIM).map(|_| rng.gen()).collect()
}

fn build_graph(n: i64, seed: u64) -> Graph<i64> {
    let config = GraphConfig {
        m: 16,
        ml: 0.25,
        ef_search: 40,
        distance: Distance::euclidean(),
    };
    let graph = Graph::with_config_and_seed(config, seed).expect("valid config");
    let mut rng = StdRng::seed_from_u64(seed);
    let nodes: Vec<Node<i64>> = (0..n).map(|i| Node::new(i, random_vector(&mut rng))).collect();
    graph.batch_add(nodes).expect("batch insert");
    graph
}

fn brute_force_top_k(graph: &Graph<i64>, query: &[f32], k: usize) -> Vec<i64> {
    let mut scored: Vec<(f32, i64)> = (0..graph.len() as i64)
        .filter_map(|key| {
            graph
                .lookup(&key)
                .map(|v| (smallworld::euclidean_distance(query, &v), key))
        })
        .collect();
    scored.sort_by(|a, b| a.partial_cmp(b).unwrap());
    scored.into_iter().take(k).map(|(_, key)| key).collect()
}

fn tmp_path(name: &str) -> PathBuf {
    let id = uuid::Uuid::new_v4();
    std::env::temp_dir().join(format!("smallworld_e2e_{id}_{name}"))
}

#[test]
fn test_crud_workflow() {
    let graph = build_graph(500, 0);
    assert_eq!(graph.len(), 500);
    assert_eq!(graph.dims(), DIM);

    let mut rng = StdRng::seed_from_u64(1234);
    let query = random_vector(&mut rng);
    let results = graph.search(&query, 10).expect("search");
    assert_eq!(results.len(), 10);
    for node in &results {
        assert_eq!(node.value, graph.lookup(&node.key).expect("result key resident"));
    }

    assert_eq!(graph.batch_delete(&[0, 1, 2]), vec![true, true, true]);
    assert_eq!(graph.len(), 497);
    assert!(graph.lookup(&0).is_none());

    let results = graph.search(&query, 10).expect("search after delete");
    assert!(!results.iter().any(|n| n.key <= 2));
}

#[test]
fn test_search_recall_against_brute_force() {
    let graph = build_graph(500, 7);
    let mut rng = StdRng::seed_from_u64(77);

    let queries = 20;
    let k = 10;
    let mut hits = 0usize;
    for _ in 0..queries {
        let query = random_vector(&mut rng);
        let exact: Vec<i64> = brute_force_top_k(&graph, &query, k);
        let approx = graph.search(&query, k).expect("search");
        hits += approx.iter().filter(|n| exact.contains(&n.key)).count();
    }

    let recall = hits as f64 / (queries * k) as f64;
    assert!(
        recall >= 0.5,
        "recall@{k} degraded to {recall:.2} over {queries} queries"
    );
}

#[test]
fn test_persist_and_reload_cycle() {
    let path = tmp_path("graph");
    {
        let saved: SavedGraph<i64> = SavedGraph::load(&path).expect("fresh load");
        assert!(saved.is_empty());
        let mut rng = StdRng::seed_from_u64(3);
        for i in 0..200 {
            saved.add(Node::new(i, random_vector(&mut rng))).expect("add");
        }
        saved.save().expect("save");
    }

    let reloaded: SavedGraph<i64> = SavedGraph::load(&path).expect("reload");
    assert_eq!(reloaded.len(), 200);

    // The reloaded graph keeps answering and keeps accepting mutations.
    let mut rng = StdRng::seed_from_u64(4);
    let query = random_vector(&mut rng);
    let before = reloaded.search(&query, 5).expect("search");
    assert_eq!(before.len(), 5);

    reloaded.add(Node::new(9999, random_vector(&mut rng))).expect("add after reload");
    assert!(reloaded.delete(&9999));
    reloaded.save().expect("second save");

    let _ = std::fs::remove_file(&path);
}

#[test]
fn test_analyzer_over_live_graph() {
    let graph = build_graph(300, 5);
    let analyzer = Analyzer::new(&graph);

    assert!(analyzer.height() >= 1);
    let topography = analyzer.topography();
    assert_eq!(topography[0], 300);

    let metrics = analyzer.quality_metrics();
    assert_eq!(metrics.node_count, 300);
    assert!(metrics.avg_connectivity > 0.0);
    assert!((0.0..=1.0).contains(&metrics.layer_balance));

    // Metrics stay consistent after churn.
    for i in 0..150 {
        graph.delete(&i);
    }
    let metrics = analyzer.quality_metrics();
    assert_eq!(metrics.node_count, 150);
}

#[test]
fn test_negative_search_workflow() {
    let graph = build_graph(200, 11);
    let mut rng = StdRng::seed_from_u64(21);
    let query = random_vector(&mut rng);

    let plain = graph.search(&query, 5).expect("plain search");
    // Use the best hit as the negative: it must lose its top spot.
    let negative = plain[0].value.clone();
    let reranked = graph
        .search_with_negative(&query, &negative, 5, 1.0)
        .expect("negative search");
    assert_eq!(reranked.len(), 5);
    assert_ne!(
        reranked[0].key, plain[0].key,
        "a fully-weighted negative should displace itself from the top"
    );

    let err = graph
        .search_with_negative(&query, &negative, 5, 2.0)
        .unwrap_err();
    assert!(matches!(err, GraphError::InvalidWeight(_)));
}

#[test]
fn test_export_import_across_key_types() {
    let graph: Graph<String> = Graph::with_seed(13);
    graph
        .batch_add(vec![
            Node::new("alpha".into(), vec![1.0, 0.0, 0.0]),
            Node::new("beta".into(), vec![0.0, 1.0, 0.0]),
            Node::new("gamma".into(), vec![0.0, 0.0, 1.0]),
        ])
        .expect("insert");

    let mut buf = Vec::new();
    graph.export(&mut buf).expect("export");

    let copy: Graph<String> = Graph::new();
    copy.import(&mut buf.as_slice()).expect("import");
    assert_eq!(
        graph.search(&[0.9, 0.1, 0.0], 2).expect("original"),
        copy.search(&[0.9, 0.1, 0.0], 2).expect("copy")
    );
}
