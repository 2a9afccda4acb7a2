//! Descriptor emission.
//!
//! Writes, per configuration group, a metadata descriptor and a column
//! map for the downstream flux processor, then one run file per batch and
//! a manifest listing every batch member.

use chrono::NaiveDateTime;
use polars::prelude::*;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::config::{ColumnDefinition, ProcessingConfig};
use crate::constants::tables::{BATCH_MANIFEST, TIMESTAMP_COLUMN};
use crate::constants::{
    CUSTOM_SECTION, FILE_DESCRIPTION_SECTION, METADATA_FILE_HEADER, NAN_TAG,
    PROCESSING_FILE_HEADER, PROJECT_SECTION,
};
use crate::error::Result;
use crate::ini::IniDocument;
use crate::inventory::timeline::Timeline;
use crate::models::{Batch, BatchKind, ConfigurationGroup};
use crate::store::{format_timestamp, write_table};

/// Files written for one group
#[derive(Debug, Clone, PartialEq)]
pub struct GroupDescriptors {
    pub group_id: u32,
    pub metadata_file: PathBuf,
    pub column_map_file: PathBuf,
    /// Logical column key to data column index, `"0"` when unresolved
    pub column_map: Vec<(String, String)>,
}

fn render_name(pattern: &str, site_id: &str, group_id: u32, label: &str) -> String {
    pattern
        .replace("{site_id}", site_id)
        .replace("{group_id}", &group_id.to_string())
        .replace("{label}", label)
}

fn blank_missing(value: &str) -> &str {
    if value == NAN_TAG { "" } else { value }
}

/// Highest `N` among fields named `{prefix}N` or `{prefix}N_*` that
/// carry a value
fn max_index<'a>(
    fields: impl Iterator<Item = (&'a String, &'a String)>,
    prefix: &str,
) -> u32 {
    fields
        .filter(|(_, value)| value.as_str() != NAN_TAG)
        .filter_map(|(field, _)| {
            let rest = field.strip_prefix(prefix)?;
            let digits = rest.split('_').next()?;
            digits.parse::<u32>().ok()
        })
        .max()
        .unwrap_or(0)
}

/// Data column index resolved for a logical column, `None` unless unique
pub fn resolve_column(
    description: &BTreeMap<String, String>,
    definition: &ColumnDefinition,
) -> Option<u32> {
    let column = |index: u32, attribute: &str| {
        description
            .get(&format!("col_{}_{}", index, attribute))
            .map(String::as_str)
    };
    let candidates: Vec<u32> = description
        .iter()
        .filter(|(field, value)| field.ends_with("_variable") && **value == definition.variable)
        .filter_map(|(field, _)| field.strip_prefix("col_")?.split('_').next()?.parse().ok())
        .collect();

    let matched: Vec<u32> = if definition.measure_types.is_empty() {
        candidates
    } else {
        let measure_type = definition.measure_types.iter().find(|m| {
            candidates
                .iter()
                .any(|i| column(*i, "measure_type") == Some(m.as_str()))
        })?;
        candidates
            .into_iter()
            .filter(|i| column(*i, "measure_type") == Some(measure_type.as_str()))
            .collect()
    };

    match matched.as_slice() {
        [index] => Some(*index),
        _ => None,
    }
}

#[derive(Debug, Clone)]
pub struct DescriptorEmitter {
    site_id: String,
    run_dir: PathBuf,
    data_dir: PathBuf,
    metadata_template: Option<IniDocument>,
    static_settings: Option<IniDocument>,
    user_settings: BTreeMap<String, BTreeMap<String, String>>,
    column_definitions: Vec<ColumnDefinition>,
    metadata_filename: String,
    column_map_filename: String,
    run_filename: String,
}

impl DescriptorEmitter {
    pub fn new(
        config: &ProcessingConfig,
        static_settings: Option<IniDocument>,
        run_dir: &Path,
    ) -> Result<Self> {
        let metadata_template = config
            .descriptors
            .metadata_template
            .as_deref()
            .map(IniDocument::read)
            .transpose()?;
        let data_dir = config
            .paths
            .destination_dir
            .clone()
            .or_else(|| config.paths.source_dirs.first().cloned())
            .unwrap_or_default();

        Ok(Self {
            site_id: config.site_id.clone(),
            run_dir: run_dir.to_path_buf(),
            data_dir,
            metadata_template,
            static_settings,
            user_settings: config.batching.user_settings.clone(),
            column_definitions: config.descriptors.column_definitions.clone(),
            metadata_filename: config.descriptors.metadata_filename.clone(),
            column_map_filename: config.descriptors.column_map_filename.clone(),
            run_filename: config.descriptors.run_filename.clone(),
        })
    }

    /// Metadata descriptor for a group.
    ///
    /// With a template, its layout is kept: keys containing `*` expand to
    /// every index up to the highest the group uses, and group values
    /// replace template values. Without one, the group's own values are
    /// written.
    pub fn metadata_descriptor(&self, group: &ConfigurationGroup) -> IniDocument {
        let values = group.representative_values();
        let mut document = IniDocument::new();

        let Some(template) = &self.metadata_template else {
            for (section, fields) in values.iter().filter(|(s, _)| *s != CUSTOM_SECTION) {
                for (field, value) in fields {
                    document.set(section, field.clone(), blank_missing(value));
                }
            }
            return document;
        };

        for section in template.sections() {
            let name = section.name();
            let group_fields = values.get(name);
            for (key, default) in section.entries() {
                let keys: Vec<String> = match key.split_once('*') {
                    Some((prefix, suffix)) => {
                        let highest = group_fields
                            .map(|fields| max_index(fields.iter(), prefix))
                            .unwrap_or(0);
                        (1..=highest)
                            .map(|i| format!("{}{}{}", prefix, i, suffix))
                            .collect()
                    }
                    None => vec![key.to_string()],
                };
                for key in keys {
                    let value = group_fields
                        .and_then(|fields| fields.get(&key))
                        .map(String::as_str)
                        .unwrap_or(default);
                    document.set(name, key, blank_missing(value));
                }
            }
        }
        document
    }

    /// Column indices for every configured logical column
    pub fn column_map(&self, group: &ConfigurationGroup) -> Vec<(String, String)> {
        let values = group.representative_values();
        let empty = BTreeMap::new();
        let description = values.get(FILE_DESCRIPTION_SECTION).unwrap_or(&empty);
        self.column_definitions
            .iter()
            .map(|definition| {
                let index = resolve_column(description, definition)
                    .map(|i| i.to_string())
                    .unwrap_or_else(|| "0".to_string());
                (definition.key.clone(), index)
            })
            .collect()
    }

    /// Write the metadata descriptor and column map of one group
    pub fn emit_group(&self, group: &ConfigurationGroup) -> Result<GroupDescriptors> {
        let metadata_file = self.run_dir.join(render_name(
            &self.metadata_filename,
            &self.site_id,
            group.group_id,
            "",
        ));
        self.metadata_descriptor(group)
            .write(&metadata_file, Some(METADATA_FILE_HEADER))?;

        let column_map = self.column_map(group);
        let mut document = IniDocument::new();
        for (key, index) in &column_map {
            document.set(PROJECT_SECTION, key.clone(), index.clone());
        }
        let column_map_file = self.run_dir.join(render_name(
            &self.column_map_filename,
            &self.site_id,
            group.group_id,
            "",
        ));
        document.write(&column_map_file, Some(PROCESSING_FILE_HEADER))?;

        debug!(
            "Group {} descriptors: {}, {}",
            group.group_id,
            metadata_file.display(),
            column_map_file.display()
        );
        Ok(GroupDescriptors {
            group_id: group.group_id,
            metadata_file,
            column_map_file,
            column_map,
        })
    }

    /// Settings for one batch run.
    ///
    /// Layers, in order: static template, column map, user settings; then
    /// placeholders in every value are substituted.
    pub fn run_settings(
        &self,
        group: &ConfigurationGroup,
        descriptors: &GroupDescriptors,
        batch: &Batch,
    ) -> IniDocument {
        let mut document = self.static_settings.clone().unwrap_or_default();
        for (key, index) in &descriptors.column_map {
            document.set(PROJECT_SECTION, key.clone(), index.clone());
        }
        for (section, entries) in &self.user_settings {
            for (key, value) in entries {
                document.set(section, key.clone(), value.clone());
            }
        }

        let output_dir = match batch.kind {
            BatchKind::Partition(_) => batch.merge_dir.join(&batch.label),
            BatchKind::FullRange => batch.merge_dir.clone(),
        };
        let placeholders = [
            ("{project_id}", batch.label.clone()),
            ("{group_id}", group.group_id.to_string()),
            ("{start_date}", batch.start.format("%Y-%m-%d").to_string()),
            ("{start_time}", batch.start.format("%H:%M").to_string()),
            ("{end_date}", batch.end.format("%Y-%m-%d").to_string()),
            ("{end_time}", batch.end.format("%H:%M").to_string()),
            (
                "{metadata_file}",
                descriptors.metadata_file.display().to_string(),
            ),
            (
                "{file_prototype}",
                group.file_prototype.clone().unwrap_or_default(),
            ),
            ("{data_dir}", self.data_dir.display().to_string()),
            ("{output_dir}", output_dir.display().to_string()),
        ];

        let entries: Vec<(String, String, String)> = document
            .flatten()
            .filter(|(_, _, value)| value.contains('{'))
            .map(|(s, k, v)| (s.to_string(), k.to_string(), v.to_string()))
            .collect();
        for (section, key, value) in entries {
            let value = placeholders
                .iter()
                .fold(value, |acc, (token, replacement)| acc.replace(token, replacement));
            document.set(&section, key, value);
        }
        document
    }

    /// Write one run file per batch of a group
    pub fn emit_batches(
        &self,
        group: &ConfigurationGroup,
        descriptors: &GroupDescriptors,
        batches: &[Batch],
    ) -> Result<Vec<PathBuf>> {
        batches
            .iter()
            .map(|batch| {
                let path = self.run_dir.join(render_name(
                    &self.run_filename,
                    &self.site_id,
                    group.group_id,
                    &batch.label,
                ));
                self.run_settings(group, descriptors, batch)
                    .write(&path, Some(PROCESSING_FILE_HEADER))?;
                Ok(path)
            })
            .collect()
    }

    /// One row per batch member, with the member's file name
    pub fn write_manifest(&self, batches: &[Batch], records: &Timeline) -> Result<PathBuf> {
        let rows: Vec<(&Batch, &NaiveDateTime)> = batches
            .iter()
            .flat_map(|batch| batch.members.iter().map(move |ts| (batch, ts)))
            .collect();

        let columns = vec![
            manifest_column("label", &rows, |b, _| Some(b.label.clone())),
            manifest_column("group_id", &rows, |b, _| Some(b.group_id.to_string())),
            manifest_column("kind", &rows, |b, _| {
                Some(match b.kind {
                    BatchKind::Partition(_) => "partition".to_string(),
                    BatchKind::FullRange => "full_range".to_string(),
                })
            }),
            manifest_column("start", &rows, |b, _| Some(format_timestamp(&b.start))),
            manifest_column("end", &rows, |b, _| Some(format_timestamp(&b.end))),
            manifest_column(TIMESTAMP_COLUMN, &rows, |_, ts| Some(format_timestamp(ts))),
            manifest_column("filename", &rows, |_, ts| {
                records.get(ts).and_then(|r| r.filename.clone())
            }),
        ];

        let path = self.run_dir.join(BATCH_MANIFEST);
        write_table(&path, columns)?;
        info!(
            "Wrote manifest of {} batches to {}",
            batches.len(),
            path.display()
        );
        Ok(path)
    }
}

fn manifest_column(
    name: &str,
    rows: &[(&Batch, &NaiveDateTime)],
    value: impl Fn(&Batch, &NaiveDateTime) -> Option<String>,
) -> Column {
    let values: Vec<Option<String>> = rows.iter().map(|(b, ts)| value(b, ts)).collect();
    Series::new(name.into(), values).into()
}
