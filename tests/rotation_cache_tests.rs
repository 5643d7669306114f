// In tests/rotation_cache_tests.rs

use approx::assert_abs_diff_eq;
use ndarray::array;
use pathway_pca::rotation_cache::{split_id_from_compound_filename, MapKind};
use pathway_pca::{CacheError, CompoundFile, CompoundFileError, RotationCache, ScalingMap};
use std::fs;

fn gene_ids() -> Vec<String> {
    vec!["g1".to_string(), "g2".to_string(), "g3".to_string()]
}

#[test]
fn rotation_round_trips_with_its_feature_ids() {
    let dir = tempfile::tempdir().unwrap();
    let cache = RotationCache::open(dir.path(), 2).unwrap();
    // 2 components x 3 features
    let rotation = array![[0.6, 0.0, -0.8], [0.0, 1.0, 0.0]];

    assert!(!cache.is_table_cached("ER", "p53 signalling"));
    cache.save_rotation_matrix("ER", "p53 signalling", &gene_ids(), &rotation).unwrap();
    assert!(cache.is_table_cached("ER", "p53 signalling"));

    let mut row_ids = Vec::new();
    let loaded = cache.get_rotation_matrix("ER", "p53 signalling", &mut row_ids).unwrap();
    assert_eq!(row_ids, gene_ids());
    assert_eq!(loaded.dim(), (2, 3));
    for (x, y) in loaded.iter().zip(rotation.iter()) {
        assert_abs_diff_eq!(*x, *y, epsilon = 1e-15);
    }

    // Loaded ids are appended, not substituted.
    let mut existing = vec!["keep".to_string()];
    cache.get_rotation_matrix("ER", "p53 signalling", &mut existing).unwrap();
    assert_eq!(existing.len(), 4);
    assert_eq!(existing[0], "keep");
}

#[test]
fn cache_miss_returns_none() {
    let dir = tempfile::tempdir().unwrap();
    let cache = RotationCache::open(dir.path(), 1).unwrap();
    cache
        .save_rotation_matrix("ER", "apoptosis", &gene_ids(), &array![[1.0, 0.0, 0.0]])
        .unwrap();

    let mut row_ids = Vec::new();
    assert!(cache.get_rotation_matrix("ER", "never-saved", &mut row_ids).is_none());
    assert!(cache.get_rotation_matrix("PR", "apoptosis", &mut row_ids).is_none());
    assert!(row_ids.is_empty());
    assert!(!cache.is_table_cached("ER", "never-saved"));
}

#[test]
fn scaling_maps_round_trip_and_are_deleted_with_the_rotation() {
    let dir = tempfile::tempdir().unwrap();
    let cache = RotationCache::open(dir.path(), 0).unwrap();
    let mean: ScalingMap = [("g1".to_string(), 1.5), ("g2".to_string(), -2.0)].into_iter().collect();
    let range: ScalingMap = [("g1".to_string(), 3.0), ("g2".to_string(), 0.5)].into_iter().collect();

    cache
        .save_rotation_matrix("ER", "p", &gene_ids()[..2], &array![[1.0, 0.0]])
        .unwrap();
    cache.save_map("ER", "p", MapKind::Mean, &mean).unwrap();
    cache.save_map("ER", "p", MapKind::Range, &range).unwrap();
    assert_eq!(cache.load_map("ER", "p", MapKind::Mean), Some(mean));
    assert_eq!(cache.load_map("ER", "p", MapKind::Range), Some(range));

    assert!(cache.delete_rotation("ER", "p").unwrap());
    assert!(!cache.is_table_cached("ER", "p"));
    assert!(cache.load_map("ER", "p", MapKind::Mean).is_none());
    assert!(!cache.delete_rotation("ER", "p").unwrap());
}

#[test]
fn saving_twice_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let cache = RotationCache::open(dir.path(), 0).unwrap();
    let rotation = array![[1.0, 0.0, 0.0]];
    cache.save_rotation_matrix("ER", "p", &gene_ids(), &rotation).unwrap();
    let err = cache.save_rotation_matrix("ER", "p", &gene_ids(), &rotation).unwrap_err();
    assert!(matches!(
        err,
        CacheError::CompoundFile(CompoundFileError::EntryExists { .. })
    ));
}

#[test]
fn rotation_files_are_found_across_splits() {
    let dir = tempfile::tempdir().unwrap();
    let rotation = array![[1.0, 0.0, 0.0]];
    for split in 0..3 {
        let cache = RotationCache::open(dir.path(), split).unwrap();
        cache.save_rotation_matrix("ER", "p53", &gene_ids(), &rotation).unwrap();
        cache.save_map("ER", "p53", MapKind::Mean, &ScalingMap::new()).unwrap();
        cache.save_rotation_matrix("ER", "other", &gene_ids(), &rotation).unwrap();
        cache.save_rotation_matrix("PR", "p53", &gene_ids(), &rotation).unwrap();
        cache.close().unwrap();
    }
    // Unreadable and unrelated files are skipped.
    fs::write(dir.path().join("Rotation-Cache-ER-Split-9.compound-file"), b"not a compound file").unwrap();
    fs::write(dir.path().join("notes.txt"), b"ignore me").unwrap();

    let cache = RotationCache::open(dir.path(), 0).unwrap();
    let found = cache.get_rotation_files("ER", "p53");
    assert_eq!(found.len(), 3);
    for (path, entries) in &found {
        let split = split_id_from_compound_filename(path.to_str().unwrap()).unwrap();
        assert!(split < 3);
        let expected = format!("ER/split-{}/pca-rotation-p53.bin", split);
        assert_eq!(entries.iter().collect::<Vec<_>>(), vec![&expected]);

        let mut ids = Vec::new();
        let loaded = cache.get_rotation_matrix_from(path, &expected, &mut ids).unwrap();
        assert_eq!(loaded, rotation);
        assert_eq!(ids, gene_ids());
    }
}

#[test]
fn physical_file_follows_naming_pattern() {
    let dir = tempfile::tempdir().unwrap();
    let cache = RotationCache::open(dir.path(), 4).unwrap();
    cache
        .save_rotation_matrix("ER status", "KEGG/p53", &gene_ids(), &array![[0.0, 1.0, 0.0]])
        .unwrap();
    cache.close().unwrap();

    let path = dir.path().join("Rotation-Cache-ER_status-Split-4.compound-file");
    assert!(path.exists());
    assert_eq!(split_id_from_compound_filename(path.to_str().unwrap()), Some(4));
    let compound = CompoundFile::open_read_only(&path).unwrap();
    assert_eq!(compound.list_entries(), vec!["ER_status/split-4/pca-rotation-KEGG_p53.bin".to_string()]);
}
