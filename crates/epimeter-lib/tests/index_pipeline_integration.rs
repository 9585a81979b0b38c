//! Integration tests for the indexing and query pipeline
//!
//! These tests exercise the full path from protein sequences to persisted
//! shards and back to query results.

use epimeter_lib::serialization::shard_file_path;
use epimeter_lib::{
    EpimeterError, IndexConfig, IndexManager, KmerBounds, KmerIndexer, QueryEngine, SearchK,
    SubstitutionMetric, VectorEncoder,
};
use proptest::prelude::*;
use std::io::Write;
use tempfile::{NamedTempFile, TempDir};

fn config(seed: u64) -> IndexConfig {
    IndexConfig {
        n_trees: 8,
        leaf_size: 4,
        seed: Some(seed),
        num_threads: 2,
    }
}

fn ids_and_distances(manager: &IndexManager, epitope: &str, n: usize) -> Vec<(u64, f32, String)> {
    manager
        .query(epitope, n, SearchK::Exhaustive)
        .unwrap()
        .neighbors
        .into_iter()
        .map(|n| (n.item_id, n.distance, n.peptide))
        .collect()
}

#[test]
fn test_acdefg_kmers_and_query() {
    let mut manager = IndexManager::with_config(config(1)).unwrap();
    let mut indexer = KmerIndexer::new(KmerBounds::new(3, 3).unwrap());
    indexer.index_sequence(&mut manager, b"ACDEFG").unwrap();
    manager.build_all().unwrap();

    let hits = ids_and_distances(&manager, "ACD", 10);
    let ids: Vec<u64> = hits.iter().map(|h| h.0).collect();
    assert_eq!(ids, vec![1, 2, 4, 3]);
    assert_eq!(hits[0].2, "ACD");
    // BLOSUM62's diagonal for A, C, D sits below its global maximum of 11
    assert_eq!(hits[0].1, 14.0);
    assert!(hits.windows(2).all(|w| w[0].1 <= w[1].1));
}

#[test]
fn test_self_distance_zero_with_flat_diagonal() {
    let alphabet = epimeter_lib::Alphabet::new(b"ACDEFG").unwrap();
    let rows: Vec<Vec<i32>> = (0..6)
        .map(|i| (0..6).map(|j| if i == j { 5 } else { -(i as i32 - j as i32).abs() }).collect())
        .collect();
    let matrix = epimeter_lib::SubstitutionMatrix::new(alphabet, &rows).unwrap();
    let mut manager =
        IndexManager::with_metric(config(2), SubstitutionMetric::new(matrix)).unwrap();

    let mut indexer = KmerIndexer::new(KmerBounds::new(3, 3).unwrap());
    indexer.index_sequence(&mut manager, b"ACDEFG").unwrap();
    manager.build_all().unwrap();

    let hits = ids_and_distances(&manager, "ACD", 4);
    assert_eq!((hits[0].0, hits[0].1), (1, 0.0));
    assert_eq!(hits.iter().map(|h| h.0).collect::<Vec<_>>(), vec![1, 2, 3, 4]);
}

#[test]
fn test_kmer_count_per_length() {
    let protein = b"MKTAYIAKQRQISFVKSHFSRQ";
    for k in [1usize, 5, 22, 23, 30] {
        let mut manager = IndexManager::with_config(config(3)).unwrap();
        let mut indexer = KmerIndexer::new(KmerBounds::new(k, k).unwrap());
        indexer.index_sequence(&mut manager, protein).unwrap();

        let expected = (protein.len() + 1).saturating_sub(k);
        assert_eq!(indexer.stats().kmers as usize, expected, "k={}", k);
        if expected > 0 {
            assert_eq!(manager.num_items(k).unwrap(), expected);
            let first = manager.peptide(k, 1).unwrap().unwrap();
            let last = manager.peptide(k, expected as u64).unwrap().unwrap();
            assert_eq!(first.as_bytes(), &protein[..k]);
            assert_eq!(last.as_bytes(), &protein[protein.len() - k..]);
        }
    }
}

#[test]
fn test_fasta_save_load_roundtrip() {
    let mut fasta = NamedTempFile::new().unwrap();
    writeln!(fasta, ">sp|P01|one\nMKTAYIAKQRQISFVKSHFSRQLEERLGLIEVQ").unwrap();
    writeln!(fasta, ">sp|P02|two\nGILGFVFTLTVPSERGLQRRRFVQNALNGNGDP").unwrap();
    fasta.flush().unwrap();

    let dir = TempDir::new().unwrap();
    let mut manager = IndexManager::with_config(config(4)).unwrap();
    let mut indexer = KmerIndexer::new(KmerBounds::new(8, 10).unwrap());
    let stats = indexer.index_fasta(&mut manager, fasta.path()).unwrap();
    assert_eq!(stats.sequences, 2);
    assert_eq!(stats.skipped, 0);

    manager.save(dir.path()).unwrap();
    for k in 8..=10 {
        assert!(shard_file_path(dir.path(), k).is_file());
    }

    let mut reopened = IndexManager::new();
    reopened.load(dir.path()).unwrap();
    assert_eq!(reopened.kmer_lengths().unwrap(), vec![8, 9, 10]);

    for epitope in ["GILGFVFTL", "SIINFEKL", "KQRQISFVKS"] {
        assert_eq!(
            ids_and_distances(&manager, epitope, 25),
            ids_and_distances(&reopened, epitope, 25),
            "epitope {}",
            epitope
        );
    }
    let hits = ids_and_distances(&reopened, "GILGFVFTL", 1);
    assert_eq!(hits[0].2, "GILGFVFTL");
}

#[test]
fn test_frozen_after_save_and_load() {
    let dir = TempDir::new().unwrap();
    let mut manager = IndexManager::with_config(config(5)).unwrap();
    manager.add_peptide("ACDEF", 1).unwrap();
    manager.save(dir.path()).unwrap();

    assert!(matches!(manager.add_peptide("GHIKL", 2), Err(EpimeterError::Frozen(_))));
    assert_eq!(manager.num_items(5).unwrap(), 1);

    let mut reopened = IndexManager::new();
    reopened.load(dir.path()).unwrap();
    assert!(matches!(reopened.add_peptide("GHIKL", 2), Err(EpimeterError::Frozen(_))));
    assert_eq!(reopened.num_items(5).unwrap(), 1);
    assert_eq!(reopened.peptide(5, 2).unwrap(), None);
}

#[test]
fn test_weights_survive_roundtrip() {
    let dir = TempDir::new().unwrap();
    let metric = SubstitutionMetric::blosum62()
        .with_weights(vec![1.0, 2.0, 0.5, 1.0])
        .unwrap();
    let mut manager = IndexManager::with_metric(config(6), metric.clone()).unwrap();
    for (i, p) in ["ACDE", "CDEF", "WYVA"].iter().enumerate() {
        manager.add_peptide(p, i as u64 + 1).unwrap();
    }
    manager.save(dir.path()).unwrap();

    let mut reopened = IndexManager::new();
    reopened.load(dir.path()).unwrap();
    assert_eq!(reopened.metric(), &metric);
    assert_eq!(
        ids_and_distances(&manager, "ACDF", 3),
        ids_and_distances(&reopened, "ACDF", 3)
    );
}

#[test]
fn test_missing_and_corrupt_shards() {
    let dir = TempDir::new().unwrap();
    let mut manager = IndexManager::with_config(config(7)).unwrap();
    manager.add_peptide("ACDEF", 1).unwrap();
    manager.add_peptide("ACDEFG", 1).unwrap();
    manager.save(dir.path()).unwrap();

    // a 6-mer shard renamed to the 5-mer slot holds the wrong k
    std::fs::rename(shard_file_path(dir.path(), 6), shard_file_path(dir.path(), 5)).unwrap();

    let mut reopened = IndexManager::new();
    reopened.load(dir.path()).unwrap();
    assert!(matches!(
        reopened.query("ACDEF", 1, SearchK::Auto),
        Err(EpimeterError::Corruption(_))
    ));
    assert!(matches!(
        reopened.query("ACDEFG", 1, SearchK::Auto),
        Err(EpimeterError::ShardNotFound { k: 6, .. })
    ));
    assert!(matches!(
        reopened.query("ACJ", 1, SearchK::Auto),
        Err(EpimeterError::UnknownSymbol { symbol: 'J', .. })
    ));
}

#[test]
fn test_concurrent_queries_on_loaded_index() {
    let dir = TempDir::new().unwrap();
    let mut manager = IndexManager::with_config(config(8)).unwrap();
    let mut indexer = KmerIndexer::new(KmerBounds::new(4, 6).unwrap());
    indexer
        .index_sequence(&mut manager, b"MKTAYIAKQRQISFVKSHFSRQLEERLGLIEVQ")
        .unwrap();
    manager.save(dir.path()).unwrap();

    let mut reopened = IndexManager::new();
    reopened.load(dir.path()).unwrap();
    let epitopes: Vec<String> = ["MKTA", "QISFV", "LGLIEV", "KTAY", "SHFSR"]
        .iter()
        .cycle()
        .take(50)
        .map(|s| s.to_string())
        .collect();
    let engine = QueryEngine::new(&reopened).num_neighbors(3).search_k(SearchK::Exhaustive);
    let results = engine.query_all(&epitopes);

    for (epitope, result) in epitopes.iter().zip(results) {
        let result = result.unwrap();
        assert_eq!(&result.epitope, epitope);
        assert_eq!(&result.neighbors[0].peptide, epitope);
    }
}

fn brute_force(vectors: &[Vec<u8>], query: &[u8], n: usize) -> Vec<(u64, f32)> {
    let metric = SubstitutionMetric::blosum62();
    let mut all: Vec<(u64, f32)> = vectors
        .iter()
        .enumerate()
        .map(|(i, v)| (i as u64 + 1, metric.distance(query, v).unwrap()))
        .collect();
    all.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
    all.truncate(n);
    all
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_exhaustive_query_matches_brute_force(
        peptides in prop::collection::vec("[ACDEFGHIKLMNPQRSTVWY]{5}", 1..60),
        query in "[ACDEFGHIKLMNPQRSTVWY]{5}",
        seed in any::<u64>(),
        n in 1usize..80,
    ) {
        let mut manager = IndexManager::with_config(IndexConfig {
            n_trees: 3,
            leaf_size: 2,
            seed: Some(seed),
            num_threads: 1,
        }).unwrap();
        let encoder = VectorEncoder::default();
        let mut vectors = Vec::new();
        for (i, p) in peptides.iter().enumerate() {
            manager.add_peptide(p, i as u64 + 1).unwrap();
            vectors.push(encoder.encode(p).unwrap().into_inner());
        }
        manager.build_all().unwrap();

        let got: Vec<(u64, f32)> = manager
            .query(&query, n, SearchK::Exhaustive)
            .unwrap()
            .neighbors
            .iter()
            .map(|nb| (nb.item_id, nb.distance))
            .collect();
        let expected = brute_force(&vectors, &encoder.encode(&query).unwrap(), n);
        prop_assert_eq!(got, expected);
    }
}
