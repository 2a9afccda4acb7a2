//! Core data structures and types for GHG pre-processing.
//!
//! Defines interval records, metadata and statistics keys, configuration
//! groups, batches and run statistics used throughout the library.

use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::constants::{KEY_SEPARATOR, tables::TIMESTAMP_FORMAT};
use crate::error::{GhgError, Result};

/// Lifecycle state of one interval in the inventory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    /// Grid slot with no source file
    Gap,
    /// Discovered but not yet parsed
    Pending,
    Parsed,
    Failed,
    /// Timestamp off the interval grid; never parsed
    Incomplete,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::Gap => "gap",
            RecordStatus::Pending => "pending",
            RecordStatus::Parsed => "parsed",
            RecordStatus::Failed => "failed",
            RecordStatus::Incomplete => "incomplete",
        }
    }
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordStatus {
    type Err = GhgError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "gap" => Ok(RecordStatus::Gap),
            "pending" => Ok(RecordStatus::Pending),
            "parsed" => Ok(RecordStatus::Parsed),
            "failed" => Ok(RecordStatus::Failed),
            "incomplete" => Ok(RecordStatus::Incomplete),
            other => Err(GhgError::configuration(format!(
                "Unknown record status '{}'",
                other
            ))),
        }
    }
}

/// One canonical interval slot in the file inventory
#[derive(Debug, Clone, PartialEq)]
pub struct FileRecord {
    pub timestamp: NaiveDateTime,
    pub source: Option<PathBuf>,
    pub filename: Option<String>,
    pub file_prototype: Option<String>,
    pub status: RecordStatus,
    pub filter_flags: Vec<String>,
    pub group_id: Option<u32>,
}

impl FileRecord {
    /// An empty slot between observed intervals
    pub fn gap(timestamp: NaiveDateTime) -> Self {
        Self {
            timestamp,
            source: None,
            filename: None,
            file_prototype: None,
            status: RecordStatus::Gap,
            filter_flags: Vec::new(),
            group_id: None,
        }
    }

    pub fn is_gap(&self) -> bool {
        self.status == RecordStatus::Gap
    }

    /// Add a flag unless it is already present
    pub fn add_flag(&mut self, flag: impl Into<String>) {
        let flag = flag.into();
        if !self.filter_flags.contains(&flag) {
            self.filter_flags.push(flag);
        }
    }

    /// Flags joined for table output, empty when clean
    pub fn flags_joined(&self) -> String {
        self.filter_flags.join(crate::constants::flags::SEPARATOR)
    }
}

/// `(section, field)` key of a metadata value
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FieldKey {
    pub section: String,
    pub field: String,
}

impl FieldKey {
    pub fn new(section: impl Into<String>, field: impl Into<String>) -> Self {
        Self {
            section: section.into(),
            field: field.into(),
        }
    }

    /// Flattened table header, e.g. `Instruments|instr_1_model`
    pub fn flatten(&self) -> String {
        format!("{}{}{}", self.section, KEY_SEPARATOR, self.field)
    }

    pub fn unflatten(header: &str) -> Option<Self> {
        let (section, field) = header.split_once(KEY_SEPARATOR)?;
        Some(Self::new(section, field))
    }
}

impl fmt::Display for FieldKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.section, self.field)
    }
}

/// Per-interval metadata: `(section, field)` to raw string value
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetadataRecord {
    values: BTreeMap<FieldKey, String>,
}

impl MetadataRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, section: &str, field: &str) -> Option<&str> {
        self.values
            .get(&FieldKey::new(section, field))
            .map(String::as_str)
    }

    pub fn get_key(&self, key: &FieldKey) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn set(&mut self, section: &str, field: &str, value: impl Into<String>) {
        self.values
            .insert(FieldKey::new(section, field), value.into());
    }

    pub fn insert(&mut self, key: FieldKey, value: String) {
        self.values.insert(key, value);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&FieldKey, &str)> {
        self.values.iter().map(|(k, v)| (k, v.as_str()))
    }

    pub fn keys(&self) -> impl Iterator<Item = &FieldKey> {
        self.values.keys()
    }

    /// Fields of one section in key order
    pub fn section(&self, section: &str) -> impl Iterator<Item = (&str, &str)> {
        self.values
            .iter()
            .filter(move |(k, _)| k.section == section)
            .map(|(k, v)| (k.field.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Aggregate statistic computed over a data column
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Statistic {
    Mean,
    Max,
    Min,
    Std,
    Count,
}

impl Statistic {
    pub fn as_str(&self) -> &'static str {
        match self {
            Statistic::Mean => "mean",
            Statistic::Max => "max",
            Statistic::Min => "min",
            Statistic::Std => "std",
            Statistic::Count => "count",
        }
    }

    /// Compute over finite values; `None` when there is nothing to aggregate
    pub fn compute(&self, values: &[f64]) -> Option<f64> {
        if values.is_empty() {
            return match self {
                Statistic::Count => Some(0.0),
                _ => None,
            };
        }
        let n = values.len() as f64;
        match self {
            Statistic::Mean => Some(values.iter().sum::<f64>() / n),
            Statistic::Max => values.iter().copied().reduce(f64::max),
            Statistic::Min => values.iter().copied().reduce(f64::min),
            Statistic::Count => Some(n),
            Statistic::Std => {
                // Sample standard deviation (ddof = 1)
                if values.len() < 2 {
                    return None;
                }
                let mean = values.iter().sum::<f64>() / n;
                let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0);
                Some(var.sqrt())
            }
        }
    }
}

impl fmt::Display for Statistic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Statistic {
    type Err = GhgError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mean" => Ok(Statistic::Mean),
            "max" => Ok(Statistic::Max),
            "min" => Ok(Statistic::Min),
            "std" => Ok(Statistic::Std),
            "count" => Ok(Statistic::Count),
            other => Err(GhgError::configuration(format!(
                "Unknown statistic '{}'",
                other
            ))),
        }
    }
}

/// `(column, unit, statistic)` key of one raw statistics value
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StatKey {
    pub column: String,
    pub unit: String,
    pub statistic: Statistic,
}

impl StatKey {
    pub fn new(column: impl Into<String>, unit: impl Into<String>, statistic: Statistic) -> Self {
        Self {
            column: column.into(),
            unit: unit.into(),
            statistic,
        }
    }

    pub fn flatten(&self) -> String {
        format!(
            "{col}{sep}{unit}{sep}{stat}",
            col = self.column,
            unit = self.unit,
            stat = self.statistic,
            sep = KEY_SEPARATOR
        )
    }

    /// Split from the right so column names containing the separator survive
    pub fn unflatten(header: &str) -> Option<Self> {
        let (rest, stat) = header.rsplit_once(KEY_SEPARATOR)?;
        let (column, unit) = rest.rsplit_once(KEY_SEPARATOR)?;
        let statistic = stat.parse().ok()?;
        Some(Self::new(column, unit, statistic))
    }
}

/// Statistics row for one interval; absent keys are missing values
pub type IntervalStatistics = BTreeMap<StatKey, f64>;

/// Successful parse of one archive
#[derive(Debug, Clone, Default)]
pub struct ParsedInterval {
    pub statistics: IntervalStatistics,
    pub metadata: MetadataRecord,
}

/// Intervals sharing one normalized fingerprint
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigurationGroup {
    pub group_id: u32,
    /// Normalized grouping values in taxonomy order
    pub fingerprint: Vec<String>,
    /// First grouping value per field
    pub grouping: BTreeMap<FieldKey, String>,
    pub tracked: BTreeMap<FieldKey, BTreeMap<Statistic, f64>>,
    pub pass: BTreeMap<FieldKey, String>,
    pub member_count: usize,
    pub file_prototype: Option<String>,
    pub first_timestamp: NaiveDateTime,
    pub last_timestamp: NaiveDateTime,
}

impl ConfigurationGroup {
    /// Representative value: grouping or pass-through first value, else
    /// the tracked mean (or first available tracked statistic)
    pub fn representative(&self, key: &FieldKey) -> Option<String> {
        if let Some(value) = self.grouping.get(key).or_else(|| self.pass.get(key)) {
            return Some(value.clone());
        }
        let stats = self.tracked.get(key)?;
        stats
            .get(&Statistic::Mean)
            .or_else(|| stats.values().next())
            .map(|v| format_number(*v))
    }

    /// Every field with a representative value, grouped by section
    pub fn representative_values(&self) -> BTreeMap<String, BTreeMap<String, String>> {
        let mut out: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
        let keys = self
            .grouping
            .keys()
            .chain(self.pass.keys())
            .chain(self.tracked.keys());
        for key in keys {
            if let Some(value) = self.representative(key) {
                out.entry(key.section.clone())
                    .or_default()
                    .insert(key.field.clone(), value);
            }
        }
        out
    }
}

/// Render a float the way it is persisted: integers without a fraction
pub fn format_number(value: f64) -> String {
    if value.is_finite() && value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{}", value)
    }
}

/// Kind of batch produced for a group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchKind {
    /// Contiguous partition with a zero-based index
    Partition(usize),
    /// Whole eligible range of the group
    FullRange,
}

/// A bounded set of one group's intervals handed to one external run
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub group_id: u32,
    pub label: String,
    pub kind: BatchKind,
    pub start: NaiveDateTime,
    /// Last member plus one interval length
    pub end: NaiveDateTime,
    pub members: Vec<NaiveDateTime>,
    pub merge_dir: PathBuf,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn is_partition(&self) -> bool {
        matches!(self.kind, BatchKind::Partition(_))
    }
}

/// Inclusive bounds on interval timestamps
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DateRange {
    pub start: Option<NaiveDateTime>,
    pub end: Option<NaiveDateTime>,
}

impl DateRange {
    pub fn new(start: Option<NaiveDateTime>, end: Option<NaiveDateTime>) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, timestamp: &NaiveDateTime) -> bool {
        self.start.is_none_or(|s| *timestamp >= s) && self.end.is_none_or(|e| *timestamp <= e)
    }

    /// Parse a start bound; date-only values mean midnight
    pub fn parse_start(value: &str) -> Result<NaiveDateTime> {
        parse_bound(value, NaiveTime::MIN)
    }

    /// Parse an end bound; date-only values cover the whole day
    pub fn parse_end(value: &str) -> Result<NaiveDateTime> {
        let end_of_day = NaiveTime::from_hms_opt(23, 59, 59).unwrap_or(NaiveTime::MIN);
        parse_bound(value, end_of_day)
    }
}

fn parse_bound(value: &str, date_only_time: NaiveTime) -> Result<NaiveDateTime> {
    let value = value.trim();
    for format in [
        TIMESTAMP_FORMAT,
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%d %H:%M",
        "%Y-%m-%dT%H:%M",
    ] {
        if let Ok(ts) = NaiveDateTime::parse_from_str(value, format) {
            return Ok(ts);
        }
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .map(|d| d.and_time(date_only_time))
        .map_err(|_| GhgError::TimestampFormat {
            value: value.to_string(),
            format: TIMESTAMP_FORMAT.to_string(),
        })
}

/// Floor a timestamp to the interval grid anchored at midnight
pub fn floor_to_interval(timestamp: NaiveDateTime, interval: Duration) -> NaiveDateTime {
    let step = interval.num_seconds().max(1);
    let midnight = timestamp.date().and_time(NaiveTime::MIN);
    let offset = (timestamp - midnight).num_seconds();
    midnight + Duration::seconds(offset - offset.rem_euclid(step))
}

/// Processing statistics
#[derive(Debug, Default, Clone)]
pub struct ProcessingStats {
    pub files_discovered: usize,
    pub files_copied: usize,
    pub files_parsed: usize,
    pub files_failed: usize,
    pub groups: usize,
    pub intervals_flagged: usize,
    pub batches: usize,
    pub descriptors_written: usize,
    pub processing_time_ms: u128,
}
