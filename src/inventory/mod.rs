//! File inventory building.
//!
//! Walks the source directories for raw files of the active file type,
//! derives each file's interval from its name, optionally copies it into
//! a dated destination tree, and hands the result to the timeline merge.

pub mod naming;
pub mod timeline;

use chrono::{Datelike, NaiveDateTime};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

use self::naming::FileNamePattern;
use crate::config::ProcessingConfig;
use crate::error::{GhgError, Result};
use crate::models::DateRange;

/// A newly seen file, before it is placed on the grid
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredFile {
    pub timestamp: NaiveDateTime,
    pub source: PathBuf,
    pub filename: String,
    pub file_prototype: String,
    /// Whether this run copied it into the destination tree
    pub copied: bool,
}

/// Scans sources and derives intervals for one file type
#[derive(Debug, Clone)]
pub struct InventoryBuilder {
    pattern: FileNamePattern,
    destination: Option<PathBuf>,
    by_year: bool,
    by_month: bool,
    date_range: DateRange,
}

impl InventoryBuilder {
    pub fn new(config: &ProcessingConfig) -> Result<Self> {
        let file_type = config.active_file_type()?;
        Ok(Self {
            pattern: FileNamePattern::from_config(file_type)?,
            destination: config.paths.destination_dir.clone(),
            by_year: file_type.by_year,
            by_month: file_type.by_month,
            date_range: config.date_range()?,
        })
    }

    /// Every candidate file below the source directories, sorted by path.
    ///
    /// Missing source directories are skipped with a warning; the caller
    /// decides whether an empty result is fatal.
    pub fn candidates(&self, source_dirs: &[PathBuf]) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for dir in source_dirs {
            if !dir.is_dir() {
                warn!("Source directory {} does not exist", dir.display());
                continue;
            }
            debug!("Searching for raw files in: {}", dir.display());
            for entry in WalkDir::new(dir).follow_links(true) {
                let entry = entry?;
                if entry.file_type().is_file() && self.pattern.is_candidate(entry.path()) {
                    files.push(entry.into_path());
                }
            }
        }
        files.sort();
        files.dedup();
        Ok(files)
    }

    /// Derive the interval of one candidate, copying it when configured.
    ///
    /// Returns `None` for names without a parseable timestamp, names
    /// already in the inventory and timestamps outside the date range.
    pub fn inspect(&self, path: &Path, known: &HashSet<String>) -> Result<Option<DiscoveredFile>> {
        let Some(source_name) = path.file_name().and_then(|n| n.to_str()) else {
            return Ok(None);
        };
        if known.contains(source_name) {
            return Ok(None);
        }
        let Some(named) = self.pattern.describe(source_name) else {
            debug!("No timestamp in {}", source_name);
            return Ok(None);
        };
        if known.contains(&named.output_name) || !self.date_range.contains(&named.timestamp) {
            return Ok(None);
        }

        let copied = match &self.destination {
            Some(destination) => {
                let target = self.destination_path(destination, &named.timestamp, &named.output_name);
                copy_if_absent(path, &target)?
            }
            None => false,
        };

        Ok(Some(DiscoveredFile {
            timestamp: named.timestamp,
            source: path.to_path_buf(),
            filename: named.output_name,
            file_prototype: named.prototype,
            copied,
        }))
    }

    fn destination_path(&self, root: &Path, timestamp: &NaiveDateTime, name: &str) -> PathBuf {
        let mut path = root.to_path_buf();
        if self.by_year {
            path.push(format!("{:04}", timestamp.year()));
        }
        if self.by_month {
            path.push(format!("{:02}", timestamp.month()));
        }
        path.join(name)
    }
}

/// Copy unless the target exists; true when a copy was made
fn copy_if_absent(source: &Path, target: &Path) -> Result<bool> {
    if target.exists() {
        return Ok(false);
    }
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::copy(source, target).map_err(|e| GhgError::ProcessingFailed {
        path: source.to_path_buf(),
        reason: format!("copy to {} failed: {}", target.display(), e),
    })?;
    Ok(true)
}
