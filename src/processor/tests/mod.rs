//! Pipeline integration tests
//!
//! Build small archive trees in temporary directories and run the
//! complete pipeline against them.

pub mod incremental;
pub mod multi_config;

use crate::archive::tests::{METADATA, data, write_archive};
use crate::config::ProcessingConfig;
use chrono::{Duration, NaiveDate, NaiveDateTime};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

pub(crate) fn at(year: i32, month: u32, day: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(year, month, day)
        .unwrap()
        .and_hms_opt(0, 0, 0)
        .unwrap()
}

pub(crate) fn archive_name(timestamp: NaiveDateTime) -> String {
    format!("{}_AIU-1234.ghg", timestamp.format("%Y-%m-%dT%H%M%S"))
}

/// Write `count` half-hourly archives from `start`; `co2` gives the base
/// concentration of each archive by index
pub(crate) fn write_series(
    dir: &Path,
    start: NaiveDateTime,
    count: usize,
    metadata: &str,
    co2: impl Fn(usize) -> f64,
) -> Vec<PathBuf> {
    fs::create_dir_all(dir).unwrap();
    (0..count)
        .map(|i| {
            let timestamp = start + Duration::minutes(30 * i as i64);
            let path = dir.join(archive_name(timestamp));
            write_archive(&path, metadata, &data(20, co2(i)));
            path
        })
        .collect()
}

pub(crate) fn default_series(dir: &Path, start: NaiveDateTime, count: usize) -> Vec<PathBuf> {
    write_series(dir, start, count, METADATA, |_| 15.0)
}

pub(crate) fn site_config(temp_dir: &TempDir) -> ProcessingConfig {
    ProcessingConfig::default()
        .with_site_id("AIU")
        .with_workers(4)
        .with_source_dir(temp_dir.path().join("raw"))
        .with_destination_dir(temp_dir.path().join("archive"))
        .with_metadata_dir(temp_dir.path().join("metadata"))
        .with_output_dir(temp_dir.path().join("output"))
}

/// Rows of the batch manifest carrying `label`
pub(crate) fn manifest_rows(metadata_dir: &Path, label: &str) -> usize {
    let df = crate::store::read_table(&metadata_dir.join("batches.csv"))
        .unwrap()
        .unwrap();
    df.column("label")
        .unwrap()
        .as_materialized_series()
        .str()
        .unwrap()
        .into_iter()
        .filter(|v| *v == Some(label))
        .count()
}
