//! Inventory store.
//!
//! Owns the file inventory, per-interval metadata and statistics and the
//! configuration-group table, and persists them as CSV tables with polars.
//! Only the orchestrator mutates the store; workers return data to it.

use chrono::{Duration, NaiveDateTime};
use polars::prelude::*;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::constants::flags::{INCOMPLETE_RECORD, PARSE_FAILURE, SEPARATOR};
use crate::constants::tables::{
    CONFIGURATION_GROUPS, FILE_INVENTORY, GROUP_ID_COLUMN, METADATA_VALUES, RAW_DATA_STATISTICS,
    TIMESTAMP_COLUMN, TIMESTAMP_FORMAT,
};
use crate::constants::{CUSTOM_SECTION, KEY_SEPARATOR};
use crate::error::{GhgError, Result};
use crate::filter::FlagSet;
use crate::grouping::GroupingOutcome;
use crate::inventory::DiscoveredFile;
use crate::inventory::timeline::{MergeOutcome, Timeline, merge_discovered};
use crate::models::{
    ConfigurationGroup, DateRange, FieldKey, FileRecord, IntervalStatistics, MetadataRecord,
    ParsedInterval, RecordStatus, StatKey, format_number,
};

const INVENTORY_COLUMNS: [&str; 7] = [
    TIMESTAMP_COLUMN,
    "source",
    "filename",
    "file_prototype",
    "status",
    "filter_flags",
    GROUP_ID_COLUMN,
];

/// Persistent tables for one site
#[derive(Debug, Default)]
pub struct InventoryStore {
    dir: PathBuf,
    records: Timeline,
    metadata: BTreeMap<NaiveDateTime, MetadataRecord>,
    statistics: BTreeMap<NaiveDateTime, IntervalStatistics>,
    /// Group labels on the metadata table; kept when a flag clears the
    /// inventory group so the original assignment stays auditable
    metadata_groups: BTreeMap<NaiveDateTime, u32>,
    groups: Vec<ConfigurationGroup>,
    /// Set once a grouping pass ran; the groups table is only rewritten then
    grouped: bool,
}

impl InventoryStore {
    /// Load the tables in `dir`, or start empty when there are none
    pub fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let mut store = Self {
            dir: dir.to_path_buf(),
            ..Self::default()
        };

        if let Some(df) = read_table(&store.table_path(FILE_INVENTORY))? {
            store.load_inventory(&df)?;
        }
        if let Some(df) = read_table(&store.table_path(METADATA_VALUES))? {
            store.load_metadata(&df)?;
        }
        if let Some(df) = read_table(&store.table_path(RAW_DATA_STATISTICS))? {
            store.load_statistics(&df)?;
        }

        debug!(
            "Opened inventory in {}: {} records, {} metadata rows",
            dir.display(),
            store.records.len(),
            store.metadata.len()
        );
        Ok(store)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn table_path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    pub fn records(&self) -> &Timeline {
        &self.records
    }

    pub fn metadata(&self) -> &BTreeMap<NaiveDateTime, MetadataRecord> {
        &self.metadata
    }

    pub fn statistics(&self) -> &BTreeMap<NaiveDateTime, IntervalStatistics> {
        &self.statistics
    }

    pub fn metadata_groups(&self) -> &BTreeMap<NaiveDateTime, u32> {
        &self.metadata_groups
    }

    pub fn groups(&self) -> &[ConfigurationGroup] {
        &self.groups
    }

    /// Source basenames and output filenames already on record
    pub fn known_names(&self) -> HashSet<String> {
        let mut names = HashSet::new();
        for record in self.records.values() {
            if let Some(name) = record
                .source
                .as_deref()
                .and_then(Path::file_name)
                .and_then(|n| n.to_str())
            {
                names.insert(name.to_string());
            }
            if let Some(filename) = &record.filename {
                names.insert(filename.clone());
            }
        }
        names
    }

    pub fn merge_discovered(
        &mut self,
        discovered: Vec<DiscoveredFile>,
        interval: Duration,
    ) -> MergeOutcome {
        merge_discovered(&mut self.records, discovered, interval)
    }

    /// Records awaiting a parse, oldest first
    pub fn pending(&self) -> Vec<(NaiveDateTime, PathBuf)> {
        self.records
            .values()
            .filter(|r| r.status == RecordStatus::Pending)
            .filter_map(|r| r.source.clone().map(|source| (r.timestamp, source)))
            .collect()
    }

    /// Fold one worker result into the tables
    pub fn record_parse(&mut self, timestamp: NaiveDateTime, result: Result<ParsedInterval>) {
        let Some(record) = self.records.get_mut(&timestamp) else {
            return;
        };
        match result {
            Ok(mut parsed) => {
                record.status = RecordStatus::Parsed;
                record.filter_flags.retain(|f| f != PARSE_FAILURE);
                if let Some(prototype) = &record.file_prototype {
                    parsed
                        .metadata
                        .set(CUSTOM_SECTION, "file_prototype", prototype.clone());
                }
                self.metadata.insert(timestamp, parsed.metadata);
                self.statistics.insert(timestamp, parsed.statistics);
            }
            Err(_) => {
                record.status = RecordStatus::Failed;
                record.add_flag(PARSE_FAILURE);
                self.metadata.remove(&timestamp);
                self.statistics.remove(&timestamp);
            }
        }
    }

    /// Replace every group assignment with the outcome of a grouping run
    pub fn apply_grouping(&mut self, outcome: &GroupingOutcome) {
        for record in self.records.values_mut() {
            record.group_id = outcome.assignments.get(&record.timestamp).copied();
        }
        self.metadata_groups = outcome.assignments.clone();
        self.groups = outcome.groups.clone();
        self.grouped = true;
    }

    /// Rebuild flags from record status plus `flags`; flagged intervals
    /// lose their inventory group. Returns the number of flagged records.
    pub fn apply_flags(&mut self, flags: &FlagSet) -> usize {
        let mut flagged = 0;
        for record in self.records.values_mut() {
            record.filter_flags.clear();
            match record.status {
                RecordStatus::Failed => record.add_flag(PARSE_FAILURE),
                RecordStatus::Incomplete => record.add_flag(INCOMPLETE_RECORD),
                _ => {}
            }
            if let Some(rule_flags) = flags.get(&record.timestamp) {
                for flag in rule_flags {
                    record.add_flag(flag.clone());
                }
            }
            if !record.filter_flags.is_empty() {
                record.group_id = None;
                flagged += 1;
            }
        }
        flagged
    }

    /// Eligible members of a group inside the range, ascending
    pub fn eligible(&self, group_id: u32, range: &DateRange) -> Vec<NaiveDateTime> {
        self.records
            .values()
            .filter(|r| r.group_id == Some(group_id) && r.filter_flags.is_empty())
            .filter(|r| range.contains(&r.timestamp))
            .map(|r| r.timestamp)
            .collect()
    }

    /// Write all tables
    pub fn save(&self) -> Result<()> {
        self.save_inventory()?;
        self.save_metadata()?;
        self.save_statistics()?;
        if self.grouped {
            self.save_groups()?;
        }
        info!("Saved inventory tables to {}", self.dir.display());
        Ok(())
    }

    fn save_inventory(&self) -> Result<()> {
        let records: Vec<&FileRecord> = self.records.values().collect();
        let columns = vec![
            record_column(&records, INVENTORY_COLUMNS[0], |r| {
                Some(format_timestamp(&r.timestamp))
            }),
            record_column(&records, INVENTORY_COLUMNS[1], |r| {
                r.source.as_ref().map(|p| p.display().to_string())
            }),
            record_column(&records, INVENTORY_COLUMNS[2], |r| r.filename.clone()),
            record_column(&records, INVENTORY_COLUMNS[3], |r| r.file_prototype.clone()),
            record_column(&records, INVENTORY_COLUMNS[4], |r| Some(r.status.to_string())),
            record_column(&records, INVENTORY_COLUMNS[5], |r| {
                Some(r.flags_joined()).filter(|f| !f.is_empty())
            }),
            record_column(&records, INVENTORY_COLUMNS[6], |r| {
                r.group_id.map(|g| g.to_string())
            }),
        ];
        write_table(&self.table_path(FILE_INVENTORY), columns)
    }

    fn index_columns(&self, timestamps: &[NaiveDateTime]) -> Vec<Column> {
        vec![
            string_column(
                TIMESTAMP_COLUMN,
                timestamps.iter().map(|t| Some(format_timestamp(t))).collect(),
            ),
            string_column(
                GROUP_ID_COLUMN,
                timestamps
                    .iter()
                    .map(|t| self.metadata_groups.get(t).map(|g| g.to_string()))
                    .collect(),
            ),
        ]
    }

    fn save_metadata(&self) -> Result<()> {
        let timestamps: Vec<NaiveDateTime> = self.metadata.keys().copied().collect();
        let keys: BTreeSet<&FieldKey> = self.metadata.values().flat_map(|m| m.keys()).collect();

        let mut columns = self.index_columns(&timestamps);
        for key in keys {
            let values = self
                .metadata
                .values()
                .map(|m| m.get_key(key).map(str::to_string))
                .collect();
            columns.push(string_column(&key.flatten(), values));
        }
        write_table(&self.table_path(METADATA_VALUES), columns)
    }

    fn save_statistics(&self) -> Result<()> {
        let timestamps: Vec<NaiveDateTime> = self.statistics.keys().copied().collect();
        let keys: BTreeSet<&StatKey> = self.statistics.values().flat_map(|s| s.keys()).collect();

        let mut columns = self.index_columns(&timestamps);
        for key in keys {
            let values: Vec<Option<f64>> = self
                .statistics
                .values()
                .map(|s| s.get(key).copied())
                .collect();
            columns.push(Series::new(key.flatten().into(), values).into());
        }
        write_table(&self.table_path(RAW_DATA_STATISTICS), columns)
    }

    fn save_groups(&self) -> Result<()> {
        let mut tables: BTreeMap<String, Vec<Option<String>>> = BTreeMap::new();
        let n = self.groups.len();
        let mut cell = |header: String, index: usize, value: String| {
            tables.entry(header).or_insert_with(|| vec![None; n])[index] = Some(value);
        };

        for (index, group) in self.groups.iter().enumerate() {
            let agg = |key: &FieldKey, name: &str| {
                format!("{}{}{}", key.flatten(), KEY_SEPARATOR, name)
            };
            for (key, value) in group.grouping.iter().chain(group.pass.iter()) {
                cell(agg(key, "first"), index, value.clone());
            }
            for key in group.grouping.keys() {
                cell(agg(key, "count"), index, group.member_count.to_string());
            }
            for (key, stats) in &group.tracked {
                for (statistic, value) in stats {
                    cell(agg(key, statistic.as_str()), index, format_number(*value));
                }
            }
            if let Some(prototype) = &group.file_prototype {
                let key = FieldKey::new(CUSTOM_SECTION, "file_prototype");
                cell(agg(&key, "first"), index, prototype.clone());
            }
        }

        let mut columns = vec![string_column(
            GROUP_ID_COLUMN,
            self.groups
                .iter()
                .map(|g| Some(g.group_id.to_string()))
                .collect(),
        )];
        for (header, values) in tables {
            columns.push(string_column(&header, values));
        }
        write_table(&self.table_path(CONFIGURATION_GROUPS), columns)
    }

    fn load_inventory(&mut self, df: &DataFrame) -> Result<()> {
        let path = self.table_path(FILE_INVENTORY);
        let columns = INVENTORY_COLUMNS
            .iter()
            .map(|name| string_values(df, name, &path))
            .collect::<Result<Vec<_>>>()?;

        for row in 0..df.height() {
            let value = |c: usize| columns[c][row].clone();
            let timestamp = parse_timestamp(value(0).as_deref(), &path)?;
            let status = match value(4) {
                Some(status) => status.parse()?,
                None => RecordStatus::Gap,
            };
            let group_id = value(6)
                .map(|g| {
                    g.parse::<u32>().map_err(|_| GhgError::MalformedTable {
                        path: path.clone(),
                        reason: format!("group_id '{}' is not an integer", g),
                    })
                })
                .transpose()?;
            let filter_flags = value(5)
                .map(|f| {
                    f.split(SEPARATOR)
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default();

            self.records.insert(
                timestamp,
                FileRecord {
                    timestamp,
                    source: value(1).map(PathBuf::from),
                    filename: value(2),
                    file_prototype: value(3),
                    status,
                    filter_flags,
                    group_id,
                },
            );
        }
        Ok(())
    }

    /// Timestamps and group labels of an interval table
    fn load_index(
        &mut self,
        df: &DataFrame,
        path: &Path,
    ) -> Result<Vec<NaiveDateTime>> {
        let timestamps = string_values(df, TIMESTAMP_COLUMN, path)?
            .iter()
            .map(|t| parse_timestamp(t.as_deref(), path))
            .collect::<Result<Vec<_>>>()?;
        let groups = string_values(df, GROUP_ID_COLUMN, path)?;
        for (timestamp, group) in timestamps.iter().zip(groups) {
            if let Some(group) = group.and_then(|g| g.parse().ok()) {
                self.metadata_groups.insert(*timestamp, group);
            }
        }
        Ok(timestamps)
    }

    fn load_metadata(&mut self, df: &DataFrame) -> Result<()> {
        let path = self.table_path(METADATA_VALUES);
        let timestamps = self.load_index(df, &path)?;
        let mut records = vec![MetadataRecord::new(); timestamps.len()];

        for column in df.get_columns() {
            let Some(key) = FieldKey::unflatten(column.name().as_str()) else {
                continue;
            };
            let values = column.as_materialized_series().str()?;
            for (record, value) in records.iter_mut().zip(values.into_iter()) {
                if let Some(value) = value {
                    record.insert(key.clone(), value.to_string());
                }
            }
        }
        self.metadata = timestamps.into_iter().zip(records).collect();
        Ok(())
    }

    fn load_statistics(&mut self, df: &DataFrame) -> Result<()> {
        let path = self.table_path(RAW_DATA_STATISTICS);
        let timestamps = self.load_index(df, &path)?;
        let mut rows = vec![IntervalStatistics::new(); timestamps.len()];

        for column in df.get_columns() {
            let Some(key) = StatKey::unflatten(column.name().as_str()) else {
                continue;
            };
            let values = column.as_materialized_series().str()?;
            for (row, value) in rows.iter_mut().zip(values.into_iter()) {
                if let Some(value) = value.and_then(|v| v.trim().parse::<f64>().ok()) {
                    row.insert(key.clone(), value);
                }
            }
        }
        self.statistics = timestamps.into_iter().zip(rows).collect();
        Ok(())
    }
}

pub fn format_timestamp(timestamp: &NaiveDateTime) -> String {
    timestamp.format(TIMESTAMP_FORMAT).to_string()
}

fn parse_timestamp(value: Option<&str>, path: &Path) -> Result<NaiveDateTime> {
    let value = value.ok_or_else(|| GhgError::MalformedTable {
        path: path.to_path_buf(),
        reason: "missing TIMESTAMP".to_string(),
    })?;
    NaiveDateTime::parse_from_str(value.trim(), TIMESTAMP_FORMAT).map_err(|_| {
        GhgError::TimestampFormat {
            value: value.to_string(),
            format: TIMESTAMP_FORMAT.to_string(),
        }
    })
}

fn string_column(name: &str, values: Vec<Option<String>>) -> Column {
    Series::new(name.into(), values).into()
}

fn record_column(
    records: &[&FileRecord],
    name: &str,
    value: impl Fn(&FileRecord) -> Option<String>,
) -> Column {
    string_column(name, records.iter().map(|r| value(r)).collect())
}

/// Values of a string column; a missing column is a malformed table
fn string_values(df: &DataFrame, name: &str, path: &Path) -> Result<Vec<Option<String>>> {
    let column = df.column(name).map_err(|_| GhgError::MalformedTable {
        path: path.to_path_buf(),
        reason: format!("missing column '{}'", name),
    })?;
    Ok(column
        .as_materialized_series()
        .str()?
        .into_iter()
        .map(|v| v.map(str::to_string))
        .collect())
}

/// Write columns as a CSV table with a header row
pub fn write_table(path: &Path, columns: Vec<Column>) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut df = DataFrame::new(columns)?;
    let mut file = File::create(path)?;
    CsvWriter::new(&mut file)
        .include_header(true)
        .finish(&mut df)?;
    Ok(())
}

/// Read a CSV table with every column as a string; `None` if absent
pub fn read_table(path: &Path) -> Result<Option<DataFrame>> {
    if !path.exists() {
        return Ok(None);
    }
    let df = CsvReadOptions::default()
        .with_has_header(true)
        .with_infer_schema_length(Some(0))
        .try_into_reader_with_file_path(Some(path.to_path_buf()))?
        .finish()?;
    Ok(Some(df))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Statistic;
    use tempfile::TempDir;

    fn ts(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, TIMESTAMP_FORMAT).unwrap()
    }

    fn discovered(timestamp: &str) -> DiscoveredFile {
        let stamp = ts(timestamp);
        let name = format!("{}_AIU.ghg", stamp.format("%Y-%m-%dT%H%M%S"));
        DiscoveredFile {
            timestamp: stamp,
            source: PathBuf::from("/raw").join(&name),
            filename: name,
            file_prototype: "yyyy-mm-ddTHHMMSS_AIU.ghg".to_string(),
            copied: false,
        }
    }

    fn parsed(co2: f64) -> ParsedInterval {
        let mut metadata = MetadataRecord::new();
        metadata.set("Instruments", "instr_1_model", "li7500");
        let mut statistics = IntervalStatistics::new();
        statistics.insert(StatKey::new("CO2", "mmol/m^3", Statistic::Mean), co2);
        ParsedInterval {
            statistics,
            metadata,
        }
    }

    #[test]
    fn test_round_trip_through_tables() {
        let temp_dir = TempDir::new().unwrap();
        let mut store = InventoryStore::open(temp_dir.path()).unwrap();
        store.merge_discovered(
            vec![
                discovered("2024-01-01 00:00:00"),
                discovered("2024-01-01 01:00:00"),
            ],
            Duration::minutes(30),
        );
        assert_eq!(store.pending().len(), 2);

        store.record_parse(ts("2024-01-01 00:00:00"), Ok(parsed(15.5)));
        store.record_parse(
            ts("2024-01-01 01:00:00"),
            Err(GhgError::invalid_archive("/raw/x.ghg", "corrupt")),
        );
        store.save().unwrap();

        let reopened = InventoryStore::open(temp_dir.path()).unwrap();
        let records: Vec<&FileRecord> = reopened.records().values().collect();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].status, RecordStatus::Parsed);
        assert_eq!(records[1].status, RecordStatus::Gap);
        assert_eq!(records[2].status, RecordStatus::Failed);
        assert_eq!(records[2].filter_flags, vec![PARSE_FAILURE]);
        assert!(reopened.pending().is_empty());

        let metadata = &reopened.metadata()[&ts("2024-01-01 00:00:00")];
        assert_eq!(metadata.get("Instruments", "instr_1_model"), Some("li7500"));
        assert_eq!(
            metadata.get("Custom", "file_prototype"),
            Some("yyyy-mm-ddTHHMMSS_AIU.ghg")
        );
        let stats = &reopened.statistics()[&ts("2024-01-01 00:00:00")];
        assert_eq!(
            stats[&StatKey::new("CO2", "mmol/m^3", Statistic::Mean)],
            15.5
        );
    }

    #[test]
    fn test_known_names_cover_source_and_output() {
        let temp_dir = TempDir::new().unwrap();
        let mut store = InventoryStore::open(temp_dir.path()).unwrap();
        let mut file = discovered("2024-01-01 00:00:00");
        file.source = PathBuf::from("/raw/original_name.ghg");
        store.merge_discovered(vec![file], Duration::minutes(30));

        let names = store.known_names();
        assert!(names.contains("original_name.ghg"));
        assert!(names.contains("2024-01-01T000000_AIU.ghg"));
    }

    #[test]
    fn test_flags_are_rederived_and_clear_groups() {
        let temp_dir = TempDir::new().unwrap();
        let mut store = InventoryStore::open(temp_dir.path()).unwrap();
        store.merge_discovered(
            vec![
                discovered("2024-01-01 00:00:00"),
                discovered("2024-01-01 00:30:00"),
            ],
            Duration::minutes(30),
        );
        store.record_parse(ts("2024-01-01 00:00:00"), Ok(parsed(1.0)));
        store.record_parse(ts("2024-01-01 00:30:00"), Ok(parsed(2.0)));

        let outcome = GroupingOutcome {
            assignments: BTreeMap::from([
                (ts("2024-01-01 00:00:00"), 1),
                (ts("2024-01-01 00:30:00"), 1),
            ]),
            groups: Vec::new(),
        };
        store.apply_grouping(&outcome);

        let flags = FlagSet::from([(
            ts("2024-01-01 00:30:00"),
            vec!["Signal: low".to_string()],
        )]);
        assert_eq!(store.apply_flags(&flags), 1);
        assert_eq!(store.apply_flags(&flags), 1, "re-applying must be idempotent");

        let flagged = &store.records()[&ts("2024-01-01 00:30:00")];
        assert_eq!(flagged.filter_flags, vec!["Signal: low"]);
        assert_eq!(flagged.group_id, None);
        assert_eq!(store.metadata_groups()[&ts("2024-01-01 00:30:00")], 1);
        assert_eq!(
            store.eligible(1, &DateRange::default()),
            vec![ts("2024-01-01 00:00:00")]
        );

        // Clearing rule flags restores nothing until grouping runs again
        assert_eq!(store.apply_flags(&FlagSet::new()), 0);
        assert_eq!(store.records()[&ts("2024-01-01 00:30:00")].group_id, None);
    }
}
