//! Per-interval archive parsing.
//!
//! Opens one raw archive (a zip container holding `.metadata` and `.data`
//! components, or a plain delimited file with a companion metadata file),
//! extracts the instrument metadata and aggregates every numeric data
//! column into summary statistics.

pub mod description;
pub mod table;

use chrono::NaiveDateTime;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Read;
use std::path::Path;
use tracing::debug;
use zip::ZipArchive;

use self::description::FileDescription;
use self::table::{DataTable, read_data_component};
use crate::config::{FileTypeConfig, ProcessingConfig};
use crate::constants::{CUSTOM_SECTION, FILE_DESCRIPTION_SECTION, IGNORE_TAG, NAN_TAG};
use crate::error::{GhgError, Result};
use crate::ini::IniDocument;
use crate::models::{IntervalStatistics, MetadataRecord, ParsedInterval, StatKey, Statistic};

const METADATA_SUFFIX: &str = ".metadata";
const DATA_SUFFIX: &str = ".data";
const AUXILIARY_TAG: &str = "biomet";

/// Parser for one file type, shared read-only across workers
#[derive(Debug, Clone)]
pub struct ArchiveParser {
    file_type: FileTypeConfig,
    delimiters: BTreeMap<String, String>,
    statistics: Vec<Statistic>,
}

impl ArchiveParser {
    pub fn new(config: &ProcessingConfig) -> Result<Self> {
        Ok(Self {
            file_type: config.active_file_type()?.clone(),
            delimiters: config.delimiters.clone(),
            statistics: config.statistics.clone(),
        })
    }

    /// Parse one interval's file into statistics and metadata
    pub fn parse(&self, path: &Path, timestamp: NaiveDateTime) -> Result<ParsedInterval> {
        let (metadata_text, data) = if self.is_container(path) {
            read_container(path)?
        } else {
            self.read_plain(path)?
        };

        let mut document = IniDocument::parse(&metadata_text)
            .map_err(|e| GhgError::invalid_archive(path, format!("metadata: {}", e)))?;
        let description = FileDescription::resolve(
            &mut document,
            &self.file_type.description_overrides,
            &self.delimiters,
            path,
        )?;
        let table = read_data_component(&data, &description, path)?;

        let mut metadata = MetadataRecord::new();
        for (section, field, value) in document.flatten() {
            metadata.set(section, field, value);
        }

        let statistics = self.aggregate(&table, &mut metadata)?;
        metadata.set(CUSTOM_SECTION, "n_samples", table.height().to_string());

        debug!(
            "Parsed {} ({}): {} rows, {} statistics",
            path.display(),
            timestamp,
            table.height(),
            statistics.len()
        );

        Ok(ParsedInterval {
            statistics,
            metadata,
        })
    }

    fn is_container(&self, path: &Path) -> bool {
        self.file_type.container
            || path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e.eq_ignore_ascii_case("zip"))
    }

    /// Plain data file with a template or sibling `.metadata` file
    fn read_plain(&self, path: &Path) -> Result<(String, Vec<u8>)> {
        let metadata_path = self
            .file_type
            .metadata_template
            .clone()
            .unwrap_or_else(|| path.with_extension("metadata"));
        if !metadata_path.exists() {
            return Err(GhgError::invalid_archive(
                path,
                format!("no metadata file at {}", metadata_path.display()),
            ));
        }
        let metadata = fs::read_to_string(&metadata_path)?;
        let data = fs::read(path)?;
        Ok((metadata, data))
    }

    /// Name every column, drop ignored ones and compute statistics
    fn aggregate(
        &self,
        table: &DataTable,
        metadata: &mut MetadataRecord,
    ) -> Result<IntervalStatistics> {
        let mut statistics = IntervalStatistics::new();
        let mut ignored = Vec::new();

        for index in 0..table.width() {
            let n = index + 1;
            let variable = metadata
                .get(FILE_DESCRIPTION_SECTION, &format!("col_{}_variable", n))
                .map(str::to_string);

            let name = match table.names[index].as_str() {
                "" => variable.clone().unwrap_or_else(|| format!("col_{}", n)),
                named => named.to_string(),
            };
            metadata.set(CUSTOM_SECTION, &format!("col_{}_header_name", n), name.clone());

            let is_ignored = variable
                .as_deref()
                .is_some_and(|v| v.eq_ignore_ascii_case(IGNORE_TAG));
            if is_ignored || table.is_empty_column(index) {
                ignored.push(n.to_string());
                continue;
            }

            let Some(values) = table.numeric_values(index)? else {
                continue;
            };

            let unit = self.unit_for(table, metadata, index);
            for statistic in &self.statistics {
                if let Some(value) = statistic.compute(&values) {
                    statistics.insert(StatKey::new(name.clone(), unit.clone(), *statistic), value);
                }
            }
        }

        metadata.set(CUSTOM_SECTION, "ignored_columns", ignored.join(","));
        Ok(statistics)
    }

    /// Unit from the unit row, else from `col_N_unit_in`
    fn unit_for(&self, table: &DataTable, metadata: &MetadataRecord, index: usize) -> String {
        let from_row = table
            .units
            .as_ref()
            .and_then(|units| units.get(index))
            .filter(|u| !u.is_empty())
            .cloned();
        from_row
            .or_else(|| {
                metadata
                    .get(
                        FILE_DESCRIPTION_SECTION,
                        &format!("col_{}_unit_in", index + 1),
                    )
                    .filter(|u| !u.is_empty())
                    .map(str::to_string)
            })
            .unwrap_or_else(|| NAN_TAG.to_string())
    }
}

/// Pull the metadata and data components out of a zip container
fn read_container(path: &Path) -> Result<(String, Vec<u8>)> {
    let file = File::open(path)?;
    let mut archive = ZipArchive::new(file)
        .map_err(|e| GhgError::invalid_archive(path, format!("not a readable container: {}", e)))?;

    let names: Vec<String> = archive
        .file_names()
        .filter(|name| !name.to_ascii_lowercase().contains(AUXILIARY_TAG))
        .map(str::to_string)
        .collect();
    let component = |suffix: &str| -> Result<String> {
        names
            .iter()
            .find(|name| name.ends_with(suffix))
            .cloned()
            .ok_or_else(|| {
                GhgError::invalid_archive(path, format!("no {} component", suffix))
            })
    };
    let metadata_name = component(METADATA_SUFFIX)?;
    let data_name = component(DATA_SUFFIX)?;

    let mut metadata = String::new();
    archive
        .by_name(&metadata_name)?
        .read_to_string(&mut metadata)?;
    let mut data = Vec::new();
    archive.by_name(&data_name)?.read_to_end(&mut data)?;

    Ok((metadata, data))
}
