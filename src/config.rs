//! Configuration management and validation.
//!
//! Provides the site configuration loaded from TOML: source and output
//! paths, per file-type naming rules, the metadata taxonomy used for
//! grouping, quality-filter rules, batching policy and descriptor layout.

use glob::Pattern;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::constants::{
    CUSTOM_SECTION, DEFAULT_ARCHIVE_EXTENSION, DEFAULT_INTERVAL_MINUTES, FILE_DESCRIPTION_SECTION,
    INSTRUMENTS_SECTION, TIMING_SECTION, default_workers,
};
use crate::error::{GhgError, Result};
use crate::filter::Threshold;
use crate::models::{DateRange, Statistic};

/// Filesystem locations used by a run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Directories searched recursively for raw files
    pub source_dirs: Vec<PathBuf>,

    /// Optional copy target; files land in `YYYY/MM/` below it
    pub destination_dir: Option<PathBuf>,

    /// Inventory tables, group descriptors, batch run files and manifest
    pub metadata_dir: Option<PathBuf>,

    /// Per-group merge directories and per-batch output directories
    pub output_dir: Option<PathBuf>,
}

/// Inclusive processing window as written in the config file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DateRangeConfig {
    pub start: Option<String>,
    pub end: Option<String>,
}

/// How files of one type are named, laid out and described
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FileTypeConfig {
    /// File extension without the dot
    pub extension: String,

    /// Files are zip containers with metadata and data components
    pub container: bool,

    /// Regex locating the timestamp inside the file stem
    pub search: String,

    /// chrono format of the matched timestamp
    pub format: String,

    /// Token substituted for the timestamp in the file prototype
    pub wildcard: String,

    /// Substring a filename must contain to be considered
    pub search_tag: Option<String>,

    /// Offset applied to the parsed timestamp, in minutes
    pub time_shift_minutes: i64,

    pub by_year: bool,
    pub by_month: bool,

    /// Companion metadata for plain data files
    pub metadata_template: Option<PathBuf>,

    /// Values layered over the `FileDescription` section
    pub description_overrides: BTreeMap<String, String>,
}

impl Default for FileTypeConfig {
    fn default() -> Self {
        Self {
            extension: DEFAULT_ARCHIVE_EXTENSION.to_string(),
            container: true,
            search: r"\d{4}-\d{2}-\d{2}T\d{6}".to_string(),
            format: "%Y-%m-%dT%H%M%S".to_string(),
            wildcard: "yyyy-mm-ddTHHMMSS".to_string(),
            search_tag: None,
            time_shift_minutes: 0,
            by_year: true,
            by_month: true,
            metadata_template: None,
            description_overrides: BTreeMap::new(),
        }
    }
}

impl FileTypeConfig {
    /// Campbell-style TOA5 text files with names and units rows
    pub fn toa5() -> Self {
        let description_overrides = BTreeMap::from([
            ("header_rows".to_string(), "4".to_string()),
            ("skip_rows".to_string(), "1".to_string()),
            ("separator".to_string(), "comma".to_string()),
            ("data_label".to_string(), "Not set".to_string()),
            ("na_values".to_string(), "NAN".to_string()),
        ]);
        Self {
            extension: "dat".to_string(),
            container: false,
            search: r"\d{4}_\d{2}_\d{2}_\d{4}".to_string(),
            format: "%Y_%m_%d_%H%M".to_string(),
            wildcard: "yyyy_mm_dd_HHMM".to_string(),
            description_overrides,
            ..Self::default()
        }
    }
}

/// Metadata fields, by section, expanded from glob patterns
pub type FieldPatterns = BTreeMap<String, Vec<String>>;

/// Which metadata fields define, accompany and describe a group
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TaxonomyConfig {
    /// Fields whose values form the fingerprint
    pub group_by: FieldPatterns,

    /// Numeric fields aggregated per group
    pub track: FieldPatterns,

    /// Fields carried through by first value
    pub pass: FieldPatterns,
}

fn patterns(entries: &[(&str, &[&str])]) -> FieldPatterns {
    entries
        .iter()
        .map(|(section, fields)| {
            (
                section.to_string(),
                fields.iter().map(|f| f.to_string()).collect(),
            )
        })
        .collect()
}

impl Default for TaxonomyConfig {
    fn default() -> Self {
        Self {
            group_by: patterns(&[
                (
                    INSTRUMENTS_SECTION,
                    &[
                        "instr_*_manufacturer",
                        "instr_*_model",
                        "instr_*_sn",
                        "instr_*_height",
                        "instr_*_northward_separation",
                        "instr_*_eastward_separation",
                        "instr_*_vertical_separation",
                        "instr_*_tube_length",
                    ],
                ),
                (
                    FILE_DESCRIPTION_SECTION,
                    &["col_*_variable", "col_*_measure_type", "col_*_instrument"],
                ),
                (CUSTOM_SECTION, &["col_*_header_name"]),
                (TIMING_SECTION, &["acquisition_frequency", "file_duration"]),
            ]),
            track: patterns(&[
                (CUSTOM_SECTION, &["n_samples"]),
                (TIMING_SECTION, &["expected_samples"]),
                ("Site", &["canopy_height"]),
            ]),
            pass: patterns(&[
                ("Site", &["site_name", "altitude", "latitude", "longitude"]),
                (
                    FILE_DESCRIPTION_SECTION,
                    &[
                        "separator",
                        "header_rows",
                        "data_label",
                        "col_*_unit_in",
                        "col_*_unit_out",
                        "col_*_conversion_type",
                        "col_*_min_value",
                        "col_*_max_value",
                        "col_*_nom_timelag",
                        "col_*_min_timelag",
                        "col_*_max_timelag",
                    ],
                ),
                (CUSTOM_SECTION, &["ignored_columns"]),
            ]),
        }
    }
}

/// Manual correction of a metadata value over a time window
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataOverride {
    pub start: String,
    pub end: Option<String>,
    pub section: String,
    pub field: String,
    pub value: String,
}

/// One named condition of a filter rule
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterCondition {
    /// `col_N_variable` values selecting the data column
    pub variables: Vec<String>,

    /// `col_N_measure_type` value selecting the data column
    pub measure_type: Option<String>,

    /// Predicate per statistic; satisfying any flags the interval
    pub thresholds: BTreeMap<Statistic, Threshold>,
}

/// Filter rules: rule name to condition name to condition
pub type FilterRules = BTreeMap<String, BTreeMap<String, FilterCondition>>;

/// Minimum batch size implied by one downstream setting
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MinDataRequirement {
    pub section: String,
    pub option: String,
    /// Setting value to the minimum number of intervals
    pub requirements: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchingConfig {
    pub min_batch_size: usize,
    pub max_batch_size: usize,
    pub min_data_requirements: Vec<MinDataRequirement>,

    /// Downstream settings template (INI)
    pub static_settings_template: Option<PathBuf>,

    /// Settings layered over the template; values may use placeholders
    pub user_settings: BTreeMap<String, BTreeMap<String, String>>,
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            min_batch_size: 1,
            max_batch_size: 2880,
            min_data_requirements: Vec::new(),
            static_settings_template: None,
            user_settings: BTreeMap::new(),
        }
    }
}

/// Logical column the downstream tool needs located in the data table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnDefinition {
    pub key: String,
    pub variable: String,
    #[serde(default)]
    pub measure_types: Vec<String>,
}

impl ColumnDefinition {
    pub fn new(key: &str, variable: &str, measure_types: &[&str]) -> Self {
        Self {
            key: key.to_string(),
            variable: variable.to_string(),
            measure_types: measure_types.iter().map(|m| m.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DescriptorConfig {
    /// Metadata template (INI) whose layout descriptors follow
    pub metadata_template: Option<PathBuf>,
    pub metadata_filename: String,
    pub column_map_filename: String,
    pub run_filename: String,
    pub column_definitions: Vec<ColumnDefinition>,
}

impl Default for DescriptorConfig {
    fn default() -> Self {
        let gases = ["molar_density", "mole_fraction", "mixing_ratio"];
        Self {
            metadata_template: None,
            metadata_filename: "group_{group_id}.metadata".to_string(),
            column_map_filename: "group_{group_id}.eddypro".to_string(),
            run_filename: "{label}.eddypro".to_string(),
            column_definitions: vec![
                ColumnDefinition::new("col_co2", "co2", &gases),
                ColumnDefinition::new("col_h2o", "h2o", &gases),
                ColumnDefinition::new("col_ch4", "ch4", &gases),
                ColumnDefinition::new("col_n2o", "n2o", &gases),
                ColumnDefinition::new("col_cell_t", "cell_t", &[]),
                ColumnDefinition::new("col_int_t_1", "int_t_1", &[]),
                ColumnDefinition::new("col_int_t_2", "int_t_2", &[]),
                ColumnDefinition::new("col_int_p", "int_p", &[]),
                ColumnDefinition::new("col_air_t", "air_t", &[]),
                ColumnDefinition::new("col_air_p", "air_p", &[]),
                ColumnDefinition::new("col_diag_72", "diag_72", &[]),
                ColumnDefinition::new("col_diag_75", "diag_75", &[]),
                ColumnDefinition::new("col_diag_77", "diag_77", &[]),
            ],
        }
    }
}

/// Site configuration for GHG pre-processing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingConfig {
    pub site_id: String,

    /// Number of worker tasks for scanning and parsing
    pub workers: usize,

    /// Key into `file_types` selecting the active naming rules
    pub file_type: String,

    /// Canonical interval length in minutes
    pub interval_minutes: i64,

    pub paths: PathsConfig,
    pub date_range: DateRangeConfig,
    pub file_types: BTreeMap<String, FileTypeConfig>,

    /// Delimiter names to escaped characters
    pub delimiters: BTreeMap<String, String>,

    /// Statistics computed per data column
    pub statistics: Vec<Statistic>,

    pub taxonomy: TaxonomyConfig,
    pub metadata_overrides: Vec<MetadataOverride>,
    pub filters: FilterRules,
    pub batching: BatchingConfig,
    pub descriptors: DescriptorConfig,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        let file_types = BTreeMap::from([
            (
                DEFAULT_ARCHIVE_EXTENSION.to_string(),
                FileTypeConfig::default(),
            ),
            ("dat".to_string(), FileTypeConfig::toa5()),
        ]);

        let delimiters = [
            ("tab", "\\t"),
            ("comma", ","),
            ("semicolon", ";"),
            ("space", " "),
            ("pipe", "|"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        Self {
            site_id: "site".to_string(),
            workers: default_workers(),
            file_type: DEFAULT_ARCHIVE_EXTENSION.to_string(),
            interval_minutes: DEFAULT_INTERVAL_MINUTES,
            paths: PathsConfig::default(),
            date_range: DateRangeConfig::default(),
            file_types,
            delimiters,
            statistics: vec![
                Statistic::Mean,
                Statistic::Std,
                Statistic::Max,
                Statistic::Min,
                Statistic::Count,
            ],
            taxonomy: TaxonomyConfig::default(),
            metadata_overrides: Vec::new(),
            filters: FilterRules::new(),
            batching: BatchingConfig::default(),
            descriptors: DescriptorConfig::default(),
        }
    }
}

impl ProcessingConfig {
    /// Load a TOML configuration file.
    ///
    /// Relative paths inside the file are resolved against its directory.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| {
            GhgError::configuration(format!("Cannot read {}: {}", path.display(), e))
        })?;
        let mut config: Self = toml::from_str(&text)?;
        if let Some(base) = path.parent() {
            config.resolve_relative_paths(base);
        }
        debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    fn resolve_relative_paths(&mut self, base: &Path) {
        let paths = self
            .paths
            .source_dirs
            .iter_mut()
            .chain(self.paths.destination_dir.iter_mut())
            .chain(self.paths.metadata_dir.iter_mut())
            .chain(self.paths.output_dir.iter_mut())
            .chain(self.batching.static_settings_template.iter_mut())
            .chain(self.descriptors.metadata_template.iter_mut())
            .chain(
                self.file_types
                    .values_mut()
                    .filter_map(|f| f.metadata_template.as_mut()),
            );
        for path in paths {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        }
    }

    /// Check everything that can be checked before touching data.
    ///
    /// Regexes, glob patterns and date bounds are compiled here so a bad
    /// config fails at load time rather than mid-run.
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(GhgError::configuration("workers must be at least 1"));
        }
        if self.interval_minutes <= 0 {
            return Err(GhgError::configuration(
                "interval_minutes must be positive",
            ));
        }
        if self.batching.min_batch_size == 0
            || self.batching.min_batch_size > self.batching.max_batch_size
        {
            return Err(GhgError::configuration(format!(
                "Invalid batch size bounds: min {} max {}",
                self.batching.min_batch_size, self.batching.max_batch_size
            )));
        }

        let file_type = self.active_file_type()?;
        Regex::new(&file_type.search)?;

        for fields in [
            &self.taxonomy.group_by,
            &self.taxonomy.track,
            &self.taxonomy.pass,
        ] {
            for pattern in fields.values().flatten() {
                Pattern::new(pattern)?;
            }
        }

        self.date_range()?;
        for entry in &self.metadata_overrides {
            DateRange::parse_start(&entry.start)?;
            if let Some(end) = &entry.end {
                DateRange::parse_end(end)?;
            }
        }

        for (rule, conditions) in &self.filters {
            for (name, condition) in conditions {
                if condition.variables.is_empty() && condition.measure_type.is_none() {
                    return Err(GhgError::configuration(format!(
                        "Filter '{}: {}' selects no variables or measure type",
                        rule, name
                    )));
                }
            }
        }

        Ok(())
    }

    /// Naming rules for the configured file type
    pub fn active_file_type(&self) -> Result<&FileTypeConfig> {
        self.file_types.get(&self.file_type).ok_or_else(|| {
            GhgError::configuration(format!(
                "Unknown file type '{}' (configured: {})",
                self.file_type,
                self.file_types
                    .keys()
                    .cloned()
                    .collect::<Vec<_>>()
                    .join(", ")
            ))
        })
    }

    pub fn date_range(&self) -> Result<DateRange> {
        let start = self
            .date_range
            .start
            .as_deref()
            .map(DateRange::parse_start)
            .transpose()?;
        let end = self
            .date_range
            .end
            .as_deref()
            .map(DateRange::parse_end)
            .transpose()?;
        Ok(DateRange::new(start, end))
    }

    pub fn interval(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.interval_minutes)
    }

    pub fn metadata_dir(&self) -> Result<&Path> {
        self.paths
            .metadata_dir
            .as_deref()
            .ok_or_else(|| GhgError::configuration("paths.metadata_dir is not set"))
    }

    pub fn output_dir(&self) -> Result<&Path> {
        self.paths
            .output_dir
            .as_deref()
            .ok_or_else(|| GhgError::configuration("paths.output_dir is not set"))
    }

    /// Set the site identifier
    pub fn with_site_id(mut self, site_id: impl Into<String>) -> Self {
        self.site_id = site_id.into();
        self
    }

    /// Create configuration with custom worker count
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_file_type(mut self, file_type: impl Into<String>) -> Self {
        self.file_type = file_type.into();
        self
    }

    pub fn with_source_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.paths.source_dirs.push(dir.into());
        self
    }

    /// Replace the configured source directories
    pub fn with_source_dirs(mut self, dirs: Vec<PathBuf>) -> Self {
        self.paths.source_dirs = dirs;
        self
    }

    pub fn with_destination_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.paths.destination_dir = Some(dir.into());
        self
    }

    pub fn with_metadata_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.paths.metadata_dir = Some(dir.into());
        self
    }

    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.paths.output_dir = Some(dir.into());
        self
    }

    /// Restrict processing to an inclusive window
    pub fn with_date_range(mut self, start: Option<String>, end: Option<String>) -> Self {
        if start.is_some() {
            self.date_range.start = start;
        }
        if end.is_some() {
            self.date_range.end = end;
        }
        self
    }

    /// Add one named condition to a filter rule
    pub fn with_filter(
        mut self,
        rule: impl Into<String>,
        condition: impl Into<String>,
        filter: FilterCondition,
    ) -> Self {
        self.filters
            .entry(rule.into())
            .or_default()
            .insert(condition.into(), filter);
        self
    }

    pub fn with_taxonomy(mut self, taxonomy: TaxonomyConfig) -> Self {
        self.taxonomy = taxonomy;
        self
    }

    pub fn with_metadata_override(mut self, entry: MetadataOverride) -> Self {
        self.metadata_overrides.push(entry);
        self
    }

    pub fn with_batching(mut self, batching: BatchingConfig) -> Self {
        self.batching = batching;
        self
    }
}
