//! Configuration grouping.
//!
//! Fingerprints each interval from the grouping fields of its metadata,
//! assigns group identifiers in first-seen order and aggregates tracked
//! and pass-through fields per group.

use chrono::NaiveDateTime;
use glob::Pattern;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{debug, info};

use crate::config::{FieldPatterns, ProcessingConfig};
use crate::constants::{CUSTOM_SECTION, NAN_TAG, TIMING_SECTION};
use crate::error::Result;
use crate::models::{
    ConfigurationGroup, DateRange, FieldKey, MetadataRecord, Statistic, format_number,
};

/// Group assignments and the group table from one grouping run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GroupingOutcome {
    pub assignments: BTreeMap<NaiveDateTime, u32>,
    pub groups: Vec<ConfigurationGroup>,
}

impl GroupingOutcome {
    pub fn group(&self, group_id: u32) -> Option<&ConfigurationGroup> {
        self.groups.iter().find(|g| g.group_id == group_id)
    }
}

/// Taxonomy patterns compiled per section
#[derive(Debug, Clone, Default)]
struct FieldSelector {
    patterns: Vec<(String, Pattern)>,
}

impl FieldSelector {
    fn compile(fields: &FieldPatterns) -> Result<Self> {
        let mut patterns = Vec::new();
        for (section, globs) in fields {
            for glob in globs {
                patterns.push((section.clone(), Pattern::new(glob)?));
            }
        }
        Ok(Self { patterns })
    }

    fn matches(&self, key: &FieldKey) -> bool {
        self.patterns
            .iter()
            .any(|(section, pattern)| *section == key.section && pattern.matches(&key.field))
    }
}

#[derive(Debug, Clone)]
struct MetadataCorrection {
    range: DateRange,
    key: FieldKey,
    value: String,
}

/// Groups intervals by normalized fingerprint
#[derive(Debug, Clone)]
pub struct Grouper {
    group_by: FieldSelector,
    track: FieldSelector,
    pass: FieldSelector,
    statistics: Vec<Statistic>,
    corrections: Vec<MetadataCorrection>,
}

impl Grouper {
    pub fn new(config: &ProcessingConfig) -> Result<Self> {
        let corrections = config
            .metadata_overrides
            .iter()
            .map(|entry| {
                let start = DateRange::parse_start(&entry.start)?;
                let end = entry.end.as_deref().map(DateRange::parse_end).transpose()?;
                Ok(MetadataCorrection {
                    range: DateRange::new(Some(start), end),
                    key: FieldKey::new(&entry.section, &entry.field),
                    value: entry.value.clone(),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            group_by: FieldSelector::compile(&config.taxonomy.group_by)?,
            track: FieldSelector::compile(&config.taxonomy.track)?,
            pass: FieldSelector::compile(&config.taxonomy.pass)?,
            statistics: config.statistics.clone(),
            corrections,
        })
    }

    /// Working copy of one record with corrections and derived fields
    fn prepare(&self, timestamp: &NaiveDateTime, record: &MetadataRecord) -> MetadataRecord {
        let mut record = record.clone();
        for correction in &self.corrections {
            if correction.range.contains(timestamp) {
                record.insert(correction.key.clone(), correction.value.clone());
            }
        }

        let number = |field: &str| {
            record
                .get(TIMING_SECTION, field)
                .and_then(|v| v.trim().parse::<f64>().ok())
        };
        if let (Some(frequency), Some(duration)) =
            (number("acquisition_frequency"), number("file_duration"))
        {
            let expected = format_number(frequency * 60.0 * duration);
            record.set(TIMING_SECTION, "expected_samples", expected);
        }
        record
    }

    /// Assign every interval with metadata to a group
    pub fn group(&self, metadata: &BTreeMap<NaiveDateTime, MetadataRecord>) -> GroupingOutcome {
        let prepared: BTreeMap<NaiveDateTime, MetadataRecord> = metadata
            .iter()
            .map(|(ts, record)| (*ts, self.prepare(ts, record)))
            .collect();

        let observed: BTreeSet<&FieldKey> = prepared.values().flat_map(|m| m.keys()).collect();
        let grouping_fields: Vec<FieldKey> = observed
            .iter()
            .filter(|k| self.group_by.matches(k))
            .map(|k| (*k).clone())
            .collect();
        let tracked_fields: Vec<FieldKey> = observed
            .iter()
            .filter(|k| !self.group_by.matches(k) && self.track.matches(k))
            .map(|k| (*k).clone())
            .collect();
        let pass_fields: Vec<FieldKey> = observed
            .iter()
            .filter(|k| !self.group_by.matches(k) && !self.track.matches(k))
            .filter(|k| self.pass.matches(k))
            .map(|k| (*k).clone())
            .collect();

        debug!(
            "Grouping on {} fields, tracking {}, passing {}",
            grouping_fields.len(),
            tracked_fields.len(),
            pass_fields.len()
        );

        // First-seen order over ascending timestamps
        let mut ids: HashMap<Vec<String>, u32> = HashMap::new();
        let mut members: BTreeMap<u32, Vec<NaiveDateTime>> = BTreeMap::new();
        let mut fingerprints: BTreeMap<u32, Vec<String>> = BTreeMap::new();
        let mut assignments = BTreeMap::new();

        for (timestamp, record) in &prepared {
            let fingerprint: Vec<String> = grouping_fields
                .iter()
                .map(|key| normalize(record.get_key(key)))
                .collect();
            let next_id = ids.len() as u32 + 1;
            let group_id = *ids.entry(fingerprint.clone()).or_insert_with(|| {
                fingerprints.insert(next_id, fingerprint);
                next_id
            });
            members.entry(group_id).or_default().push(*timestamp);
            assignments.insert(*timestamp, group_id);
        }

        let groups: Vec<ConfigurationGroup> = members
            .into_iter()
            .map(|(group_id, timestamps)| {
                let fingerprint = fingerprints.remove(&group_id).unwrap_or_default();
                self.summarize(
                    group_id,
                    fingerprint,
                    &timestamps,
                    &prepared,
                    &grouping_fields,
                    &tracked_fields,
                    &pass_fields,
                )
            })
            .collect();

        info!(
            "Grouped {} intervals into {} configuration groups",
            assignments.len(),
            groups.len()
        );

        GroupingOutcome {
            assignments,
            groups,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn summarize(
        &self,
        group_id: u32,
        fingerprint: Vec<String>,
        timestamps: &[NaiveDateTime],
        prepared: &BTreeMap<NaiveDateTime, MetadataRecord>,
        grouping_fields: &[FieldKey],
        tracked_fields: &[FieldKey],
        pass_fields: &[FieldKey],
    ) -> ConfigurationGroup {
        let records: Vec<&MetadataRecord> =
            timestamps.iter().filter_map(|t| prepared.get(t)).collect();
        let first = records.first().copied();

        let grouping = grouping_fields
            .iter()
            .cloned()
            .zip(fingerprint.iter().cloned())
            .collect();

        let pass = pass_fields
            .iter()
            .map(|key| (key.clone(), normalize(first.and_then(|r| r.get_key(key)))))
            .collect();

        let mut tracked = BTreeMap::new();
        for key in tracked_fields {
            let values: Vec<f64> = records
                .iter()
                .filter_map(|r| r.get_key(key))
                .filter_map(|v| v.trim().parse::<f64>().ok())
                .filter(|v| v.is_finite())
                .collect();
            let stats: BTreeMap<Statistic, f64> = self
                .statistics
                .iter()
                .filter_map(|s| s.compute(&values).map(|v| (*s, v)))
                .collect();
            tracked.insert(key.clone(), stats);
        }

        ConfigurationGroup {
            group_id,
            fingerprint,
            grouping,
            tracked,
            pass,
            member_count: timestamps.len(),
            file_prototype: first
                .and_then(|r| r.get(CUSTOM_SECTION, "file_prototype"))
                .map(str::to_string),
            first_timestamp: timestamps.first().copied().unwrap_or_default(),
            last_timestamp: timestamps.last().copied().unwrap_or_default(),
        }
    }
}

/// Missing or empty values become the `NaN` category
fn normalize(value: Option<&str>) -> String {
    match value.map(str::trim) {
        Some(v) if !v.is_empty() => v.to_string(),
        _ => NAN_TAG.to_string(),
    }
}
