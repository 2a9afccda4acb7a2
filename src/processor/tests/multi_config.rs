//! Sites whose instrument setup changes over time

use super::{at, manifest_rows, site_config, write_series};
use crate::archive::tests::METADATA;
use crate::processor::GhgProcessor;
use crate::store::InventoryStore;
use std::fs;
use tempfile::TempDir;

#[tokio::test]
async fn test_alternating_analyzers_form_two_groups() {
    let temp_dir = TempDir::new().unwrap();
    let raw = temp_dir.path().join("raw");
    let enclosed = METADATA.replace("instr_2_model=li7500", "instr_2_model=li7200");

    write_series(&raw, at(2024, 1, 1), 4, METADATA, |_| 15.0);
    write_series(&raw, at(2024, 2, 1), 4, &enclosed, |_| 15.0);
    write_series(&raw, at(2024, 3, 1), 4, METADATA, |_| 15.0);

    let stats = GhgProcessor::new(site_config(&temp_dir))
        .unwrap()
        .process()
        .await
        .unwrap();
    assert_eq!(stats.files_parsed, 12);
    assert_eq!(stats.groups, 2);
    assert_eq!(stats.batches, 10);

    let metadata_dir = temp_dir.path().join("metadata");
    let store = InventoryStore::open(&metadata_dir).unwrap();
    let members = |group_id: u32| {
        store
            .records()
            .values()
            .filter(|r| r.group_id == Some(group_id))
            .count()
    };
    assert_eq!(members(1), 8);
    assert_eq!(members(2), 4);
    assert_eq!(store.metadata_groups().get(&at(2024, 2, 1)), Some(&2));

    let first = fs::read_to_string(metadata_dir.join("group_1.metadata")).unwrap();
    let second = fs::read_to_string(metadata_dir.join("group_2.metadata")).unwrap();
    assert!(first.contains("instr_2_model=li7500"));
    assert!(second.contains("instr_2_model=li7200"));
    assert!(metadata_dir.join("group_1.eddypro").exists());
    assert!(metadata_dir.join("group_2.eddypro").exists());

    assert_eq!(manifest_rows(&metadata_dir, "group_1_fcc"), 8);
    assert_eq!(manifest_rows(&metadata_dir, "group_2_fcc"), 4);
    assert!(temp_dir.path().join("output/group_2").is_dir());
}

#[tokio::test]
async fn test_missing_field_is_its_own_category() {
    let temp_dir = TempDir::new().unwrap();
    let raw = temp_dir.path().join("raw");
    let with_height = METADATA.replace(
        "instr_1_model=wm_81000\n",
        "instr_1_model=wm_81000\ninstr_1_height=3.5\n",
    );

    write_series(&raw, at(2024, 1, 1), 3, METADATA, |_| 15.0);
    write_series(&raw, at(2024, 1, 2), 3, &with_height, |_| 15.0);

    let stats = GhgProcessor::new(site_config(&temp_dir))
        .unwrap()
        .process()
        .await
        .unwrap();
    assert_eq!(stats.groups, 2);
}
