//! Reruns, resets and empty sources

use super::{archive_name, at, default_series, manifest_rows, site_config};
use crate::error::GhgError;
use crate::models::RecordStatus;
use crate::processor::GhgProcessor;
use crate::store::InventoryStore;
use chrono::Duration;
use std::fs;
use tempfile::TempDir;

#[tokio::test]
async fn test_rerun_only_handles_new_files() {
    let temp_dir = TempDir::new().unwrap();
    let raw = temp_dir.path().join("raw");
    default_series(&raw, at(2024, 1, 1), 24);

    let processor = GhgProcessor::new(site_config(&temp_dir)).unwrap();
    let first = processor.process().await.unwrap();
    assert_eq!(first.files_discovered, 24);
    assert_eq!(first.files_parsed, 24);

    default_series(&raw, at(2024, 1, 1) + Duration::hours(12), 24);
    let second = processor.process().await.unwrap();
    assert_eq!(second.files_discovered, 24);
    assert_eq!(second.files_copied, 24);
    assert_eq!(second.files_parsed, 24);
    assert_eq!(second.groups, 1);

    let third = processor.process().await.unwrap();
    assert_eq!(third.files_discovered, 0);
    assert_eq!(third.files_copied, 0);
    assert_eq!(third.files_parsed, 0);
    assert_eq!(third.groups, 1);
    assert_eq!(third.batches, 5);

    let metadata_dir = temp_dir.path().join("metadata");
    let store = InventoryStore::open(&metadata_dir).unwrap();
    assert_eq!(store.records().len(), 48);
    assert!(
        store
            .records()
            .values()
            .all(|r| r.status == RecordStatus::Parsed)
    );
    assert_eq!(manifest_rows(&metadata_dir, "group_1_fcc"), 48);
}

#[tokio::test]
async fn test_missing_interval_becomes_gap() {
    let temp_dir = TempDir::new().unwrap();
    let raw = temp_dir.path().join("raw");
    let files = default_series(&raw, at(2024, 1, 1), 6);
    fs::remove_file(&files[2]).unwrap();

    let processor = GhgProcessor::new(site_config(&temp_dir)).unwrap();
    let stats = processor.scan().await.unwrap();
    assert_eq!(stats.files_discovered, 5);
    assert_eq!(stats.files_parsed, 0);

    let store = InventoryStore::open(&temp_dir.path().join("metadata")).unwrap();
    assert_eq!(store.records().len(), 6);
    let gap = &store.records()[&(at(2024, 1, 1) + Duration::minutes(60))];
    assert_eq!(gap.status, RecordStatus::Gap);
    assert!(gap.source.is_none());
    assert_eq!(store.pending().len(), 5);
}

#[tokio::test]
async fn test_reset_starts_over() {
    let temp_dir = TempDir::new().unwrap();
    default_series(&temp_dir.path().join("raw"), at(2024, 1, 1), 8);

    let processor = GhgProcessor::new(site_config(&temp_dir)).unwrap();
    processor.process().await.unwrap();
    assert!(temp_dir.path().join("metadata/file_inventory.csv").exists());

    processor.reset().await.unwrap();
    assert!(!temp_dir.path().join("metadata").exists());
    assert!(!temp_dir.path().join("output").exists());

    let stats = processor.process().await.unwrap();
    assert_eq!(stats.files_discovered, 8);
    assert_eq!(stats.files_copied, 0, "archive copies survive a reset");
    assert_eq!(stats.files_parsed, 8);
}

#[tokio::test]
async fn test_empty_source_is_fatal() {
    let temp_dir = TempDir::new().unwrap();
    fs::create_dir_all(temp_dir.path().join("raw")).unwrap();
    fs::write(temp_dir.path().join("raw/notes.txt"), "nothing here").unwrap();

    let processor = GhgProcessor::new(site_config(&temp_dir)).unwrap();
    match processor.process().await.unwrap_err() {
        GhgError::NoSourceFiles { context } => assert!(context.contains("raw")),
        other => panic!("Expected NoSourceFiles, got {:?}", other),
    }
}

#[tokio::test]
async fn test_date_range_limits_inventory() {
    let temp_dir = TempDir::new().unwrap();
    let raw = temp_dir.path().join("raw");
    default_series(&raw, at(2024, 1, 1), 4);
    default_series(&raw, at(2024, 1, 3), 4);

    let config = site_config(&temp_dir).with_date_range(Some("2024-01-03".into()), None);
    let stats = GhgProcessor::new(config).unwrap().process().await.unwrap();
    assert_eq!(stats.files_discovered, 4);

    let store = InventoryStore::open(&temp_dir.path().join("metadata")).unwrap();
    assert!(
        store
            .records()
            .contains_key(&at(2024, 1, 3))
    );
    assert!(!store.records().contains_key(&at(2024, 1, 1)));
    assert!(
        !temp_dir
            .path()
            .join("archive/2024/01")
            .join(archive_name(at(2024, 1, 1)))
            .exists()
    );
}

#[test]
fn test_missing_paths_are_configuration_errors() {
    let temp_dir = TempDir::new().unwrap();
    let mut config = site_config(&temp_dir);
    config.paths.output_dir = None;
    assert!(matches!(
        GhgProcessor::new(config),
        Err(GhgError::Configuration { .. })
    ));

    let mut config = site_config(&temp_dir);
    config.paths.source_dirs.clear();
    assert!(matches!(
        GhgProcessor::new(config),
        Err(GhgError::Configuration { .. })
    ));
}

#[tokio::test]
async fn test_scan_keeps_configuration_groups() {
    let temp_dir = TempDir::new().unwrap();
    default_series(&temp_dir.path().join("raw"), at(2024, 1, 1), 8);

    let processor = GhgProcessor::new(site_config(&temp_dir)).unwrap();
    processor.process().await.unwrap();
    let groups_table = temp_dir.path().join("metadata/configuration_groups.csv");
    let before = fs::read_to_string(&groups_table).unwrap();
    assert_eq!(before.lines().count(), 2);
    assert!(before.lines().nth(1).unwrap().starts_with('1'));

    processor.scan().await.unwrap();
    let after = fs::read_to_string(&groups_table).unwrap();
    assert_eq!(before, after);
}
