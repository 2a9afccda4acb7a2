//! Quality filtering.
//!
//! Evaluates the configured threshold rules against each group's
//! per-interval statistics and collects exclusion flags per interval.

pub mod expression;

pub use expression::Threshold;

use chrono::NaiveDateTime;
use std::collections::BTreeMap;
use tracing::{debug, info};

use crate::config::{FilterCondition, FilterRules, ProcessingConfig};
use crate::constants::flags::DATA_NOT_AVAILABLE;
use crate::constants::{CUSTOM_SECTION, FILE_DESCRIPTION_SECTION};
use crate::models::{ConfigurationGroup, DateRange, FieldKey, IntervalStatistics};

/// Ordered, distinct flags per interval
pub type FlagSet = BTreeMap<NaiveDateTime, Vec<String>>;

fn add_flag(flags: &mut FlagSet, timestamp: NaiveDateTime, flag: &str) {
    let entry = flags.entry(timestamp).or_default();
    if !entry.iter().any(|f| f == flag) {
        entry.push(flag.to_string());
    }
}

/// Column index `N` of a `col_N_*` field name
fn column_index(field: &str) -> Option<u32> {
    field.strip_prefix("col_")?.split('_').next()?.parse().ok()
}

#[derive(Debug, Clone)]
pub struct FilterEngine {
    rules: FilterRules,
}

impl FilterEngine {
    pub fn new(config: &ProcessingConfig) -> Self {
        Self {
            rules: config.filters.clone(),
        }
    }

    pub fn rule_count(&self) -> usize {
        self.rules.values().map(|conditions| conditions.len()).sum()
    }

    /// Header names of the data columns a condition selects in a group.
    ///
    /// Every `col_N_*` field whose value is one of the variables or the
    /// measure type counts once for `N`; the best-matching indices win.
    pub fn resolve_columns(group: &ConfigurationGroup, condition: &FilterCondition) -> Vec<String> {
        let values = group.representative_values();
        let Some(description) = values.get(FILE_DESCRIPTION_SECTION) else {
            return Vec::new();
        };

        let mut counts: BTreeMap<u32, usize> = BTreeMap::new();
        for (field, value) in description {
            let Some(index) = column_index(field) else {
                continue;
            };
            let selected = condition.variables.iter().any(|v| v == value)
                || condition.measure_type.as_deref() == Some(value.as_str());
            if selected {
                *counts.entry(index).or_default() += 1;
            }
        }

        let Some(best) = counts.values().copied().max() else {
            return Vec::new();
        };
        counts
            .into_iter()
            .filter(|(_, count)| *count == best)
            .filter_map(|(index, _)| {
                group.representative(&FieldKey::new(
                    CUSTOM_SECTION,
                    format!("col_{}_header_name", index),
                ))
            })
            .collect()
    }

    /// Flag every interval whose statistics trip a rule.
    ///
    /// `assignments` are the grouping labels; only intervals inside
    /// `range` are tested against thresholds.
    pub fn apply(
        &self,
        groups: &[ConfigurationGroup],
        statistics: &BTreeMap<NaiveDateTime, IntervalStatistics>,
        assignments: &BTreeMap<NaiveDateTime, u32>,
        range: &DateRange,
    ) -> FlagSet {
        let mut flags = FlagSet::new();

        for (rule, conditions) in &self.rules {
            let mut flagged = 0;
            for (name, condition) in conditions {
                let label = format!("{}: {}", rule, name);
                let unavailable = format!("{}: {}", rule, DATA_NOT_AVAILABLE);

                for group in groups {
                    let members = assignments
                        .iter()
                        .filter(|(_, g)| **g == group.group_id)
                        .map(|(ts, _)| *ts);

                    let columns = Self::resolve_columns(group, condition);
                    if columns.is_empty() {
                        debug!(
                            "{} selects no column in group {}",
                            label, group.group_id
                        );
                        for timestamp in members {
                            add_flag(&mut flags, timestamp, &unavailable);
                            flagged += 1;
                        }
                        continue;
                    }

                    for timestamp in members.filter(|ts| range.contains(ts)) {
                        let Some(row) = statistics.get(&timestamp) else {
                            continue;
                        };
                        let tripped = condition.thresholds.iter().any(|(statistic, threshold)| {
                            row.iter().any(|(key, value)| {
                                key.statistic == *statistic
                                    && columns.contains(&key.column)
                                    && threshold.matches(*value)
                            })
                        });
                        if tripped {
                            add_flag(&mut flags, timestamp, &label);
                            flagged += 1;
                        }
                    }
                }
            }
            info!("Filter rule {}: {} intervals flagged", rule, flagged);
        }

        flags
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{StatKey, Statistic};

    fn ts(minutes: i64) -> NaiveDateTime {
        chrono::NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
            + chrono::Duration::minutes(minutes)
    }

    fn group(group_id: u32, with_co2: bool) -> ConfigurationGroup {
        let mut grouping = BTreeMap::new();
        let mut field = |section: &str, name: &str, value: &str| {
            grouping.insert(FieldKey::new(section, name), value.to_string());
        };
        field("FileDescription", "col_1_variable", "u");
        field("Custom", "col_1_header_name", "U (m/s)");
        if with_co2 {
            field("FileDescription", "col_2_variable", "co2");
            field("FileDescription", "col_2_measure_type", "molar_density");
            field("FileDescription", "col_3_variable", "h2o");
            field("FileDescription", "col_3_measure_type", "molar_density");
            field("Custom", "col_2_header_name", "CO2 (mmol/m^3)");
            field("Custom", "col_3_header_name", "H2O (mmol/m^3)");
        }
        ConfigurationGroup {
            group_id,
            fingerprint: Vec::new(),
            grouping,
            tracked: BTreeMap::new(),
            pass: BTreeMap::new(),
            member_count: 0,
            file_prototype: None,
            first_timestamp: ts(0),
            last_timestamp: ts(0),
        }
    }

    fn stats(co2_mean: f64) -> IntervalStatistics {
        IntervalStatistics::from([
            (
                StatKey::new("CO2 (mmol/m^3)", "mmol/m^3", Statistic::Mean),
                co2_mean,
            ),
            (StatKey::new("U (m/s)", "m/s", Statistic::Max), 3.0),
        ])
    }

    fn co2_condition(threshold: &str) -> FilterCondition {
        FilterCondition {
            variables: vec!["co2".to_string()],
            measure_type: Some("molar_density".to_string()),
            thresholds: BTreeMap::from([(Statistic::Mean, threshold.parse().unwrap())]),
        }
    }

    #[test]
    fn test_resolve_prefers_variable_and_measure_type() {
        let columns = FilterEngine::resolve_columns(&group(1, true), &co2_condition("> 0"));
        assert_eq!(columns, vec!["CO2 (mmol/m^3)"]);

        let by_type = FilterCondition {
            measure_type: Some("molar_density".to_string()),
            ..FilterCondition::default()
        };
        assert_eq!(
            FilterEngine::resolve_columns(&group(1, true), &by_type),
            vec!["CO2 (mmol/m^3)", "H2O (mmol/m^3)"]
        );
        assert!(FilterEngine::resolve_columns(&group(1, false), &by_type).is_empty());
    }

    #[test]
    fn test_flags_are_additive_and_missing_selectors_are_safe() {
        let config = ProcessingConfig::default()
            .with_filter("Range", "co2_high", co2_condition("> 20"))
            .with_filter("Spikes", "co2_negative", co2_condition("< 0"));
        let engine = FilterEngine::new(&config);

        let groups = vec![group(1, true), group(2, false)];
        let statistics = BTreeMap::from([
            (ts(0), stats(15.0)),
            (ts(30), stats(25.0)),
            (ts(60), stats(-1.0)),
            (ts(90), stats(15.0)),
        ]);
        let assignments =
            BTreeMap::from([(ts(0), 1), (ts(30), 1), (ts(60), 1), (ts(90), 2)]);

        let flags = engine.apply(&groups, &statistics, &assignments, &DateRange::default());

        assert!(!flags.contains_key(&ts(0)));
        assert_eq!(flags[&ts(30)], vec!["Range: co2_high"]);
        assert_eq!(flags[&ts(60)], vec!["Spikes: co2_negative"]);
        assert_eq!(
            flags[&ts(90)],
            vec!["Range: Data not available", "Spikes: Data not available"]
        );
    }

    #[test]
    fn test_no_rules_no_flags_and_range_limits_thresholds() {
        let groups = vec![group(1, true)];
        let statistics = BTreeMap::from([(ts(0), stats(99.0))]);
        let assignments = BTreeMap::from([(ts(0), 1)]);

        let engine = FilterEngine::new(&ProcessingConfig::default());
        assert_eq!(engine.rule_count(), 0);
        assert!(
            engine
                .apply(&groups, &statistics, &assignments, &DateRange::default())
                .is_empty()
        );

        let config =
            ProcessingConfig::default().with_filter("Range", "co2_high", co2_condition("> 20"));
        let range = DateRange::new(Some(ts(30)), None);
        let flags = FilterEngine::new(&config).apply(&groups, &statistics, &assignments, &range);
        assert!(flags.is_empty());
    }
}
