//! Batch partitioning.
//!
//! Splits each group's eligible intervals into contiguous, roughly equal
//! partitions sized for the worker pool, plus one full-range batch.

use chrono::{Duration, NaiveDateTime};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::config::{MinDataRequirement, ProcessingConfig};
use crate::ini::IniDocument;
use crate::models::{Batch, BatchKind};

/// Spreadsheet-style partition letter: A..Z, AA, AB, ...
fn partition_letter(mut index: usize) -> String {
    let mut letters = Vec::new();
    loop {
        letters.push(char::from(b'A' + (index % 26) as u8));
        if index < 26 {
            break;
        }
        index = index / 26 - 1;
    }
    letters.iter().rev().collect()
}

pub fn partition_label(group_id: u32, index: usize) -> String {
    format!("group_{}_rp_{}", group_id, partition_letter(index))
}

pub fn full_range_label(group_id: u32) -> String {
    format!("group_{}_fcc", group_id)
}

/// Smallest batch the downstream settings can work with.
///
/// For each requirement the user's setting is used when it names a known
/// value, else the static template's; unknown values require one interval.
pub fn minimum_viable_size(
    requirements: &[MinDataRequirement],
    user_settings: &BTreeMap<String, BTreeMap<String, String>>,
    static_settings: Option<&IniDocument>,
) -> usize {
    requirements
        .iter()
        .map(|req| {
            let user = user_settings
                .get(&req.section)
                .and_then(|s| s.get(&req.option))
                .and_then(|v| req.requirements.get(v.trim()));
            let template = static_settings
                .and_then(|doc| doc.get(&req.section, &req.option))
                .and_then(|v| req.requirements.get(v.trim()));
            user.or(template).copied().unwrap_or(1)
        })
        .fold(1, usize::max)
}

#[derive(Debug, Clone)]
pub struct BatchPartitioner {
    workers: usize,
    min_batch_size: usize,
    max_batch_size: usize,
    floor: usize,
    interval: Duration,
    output_dir: PathBuf,
}

impl BatchPartitioner {
    pub fn new(
        config: &ProcessingConfig,
        static_settings: Option<&IniDocument>,
        output_dir: &Path,
    ) -> Self {
        let floor = minimum_viable_size(
            &config.batching.min_data_requirements,
            &config.batching.user_settings,
            static_settings,
        );
        debug!("Minimum viable batch size: {}", floor);
        Self {
            workers: config.workers.max(1),
            min_batch_size: config.batching.min_batch_size.max(1),
            max_batch_size: config.batching.max_batch_size.max(1),
            floor,
            interval: config.interval(),
            output_dir: output_dir.to_path_buf(),
        }
    }

    /// Number of partitions for `n` eligible intervals
    pub fn partition_count(&self, n: usize, group_id: u32) -> usize {
        if n < self.floor {
            warn!(
                "Group {} has {} intervals, below the {} required by the selected settings; using one batch",
                group_id, n, self.floor
            );
            return 1;
        }
        let size = self.min_batch_size.max(self.floor).min(self.max_batch_size);
        (n / size).clamp(1, self.workers)
    }

    fn batch(&self, group_id: u32, label: String, kind: BatchKind, members: &[NaiveDateTime]) -> Batch {
        let start = members[0];
        let end = members[members.len() - 1] + self.interval;
        Batch {
            group_id,
            label,
            kind,
            start,
            end,
            members: members.to_vec(),
            merge_dir: self.output_dir.join(format!("group_{}", group_id)),
        }
    }

    /// Partitions followed by the full-range batch; empty input gives none
    pub fn partition(&self, group_id: u32, eligible: &[NaiveDateTime]) -> Vec<Batch> {
        let mut sorted = eligible.to_vec();
        sorted.sort();
        sorted.dedup();
        let n = sorted.len();
        if n == 0 {
            return Vec::new();
        }

        let k = self.partition_count(n, group_id);
        let mut batches: Vec<Batch> = (0..k)
            .map(|j| {
                let (from, to) = (j * n / k, (j + 1) * n / k);
                self.batch(
                    group_id,
                    partition_label(group_id, j),
                    BatchKind::Partition(j),
                    &sorted[from..to],
                )
            })
            .collect();
        batches.push(self.batch(
            group_id,
            full_range_label(group_id),
            BatchKind::FullRange,
            &sorted,
        ));

        debug!(
            "Group {}: {} intervals in {} partitions",
            group_id, n, k
        );
        batches
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BatchingConfig;
    use std::collections::HashSet;

    fn timestamps(n: i64) -> Vec<NaiveDateTime> {
        let start = chrono::NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        (0..n).map(|i| start + Duration::minutes(30 * i)).collect()
    }

    fn partitioner(workers: usize, batching: BatchingConfig) -> BatchPartitioner {
        let config = ProcessingConfig::default()
            .with_workers(workers)
            .with_batching(batching);
        BatchPartitioner::new(&config, None, Path::new("/out"))
    }

    #[test]
    fn test_partition_letters() {
        assert_eq!(partition_letter(0), "A");
        assert_eq!(partition_letter(25), "Z");
        assert_eq!(partition_letter(26), "AA");
        assert_eq!(partition_label(3, 1), "group_3_rp_B");
    }

    #[test]
    fn test_partitions_are_complete_and_disjoint() {
        let eligible = timestamps(47);
        let batches = partitioner(4, BatchingConfig::default()).partition(1, &eligible);

        assert_eq!(batches.len(), 5);
        let partitions: Vec<&Batch> = batches.iter().filter(|b| b.is_partition()).collect();
        assert_eq!(partitions.len(), 4);

        let sizes: Vec<usize> = partitions.iter().map(|b| b.len()).collect();
        assert_eq!(sizes.iter().sum::<usize>(), 47);
        assert!(sizes.iter().max().unwrap() - sizes.iter().min().unwrap() <= 1);

        let mut seen = HashSet::new();
        for batch in &partitions {
            for ts in &batch.members {
                assert!(seen.insert(*ts), "partitions overlap at {}", ts);
            }
        }
        assert_eq!(seen.len(), 47);

        let full = batches.last().unwrap();
        assert_eq!(full.label, "group_1_fcc");
        assert_eq!(full.kind, BatchKind::FullRange);
        assert_eq!(full.members, eligible);
        assert_eq!(full.end, eligible[46] + Duration::minutes(30));
        assert_eq!(full.merge_dir, PathBuf::from("/out/group_1"));
    }

    #[test]
    fn test_partition_count_bounds() {
        let batching = BatchingConfig {
            min_batch_size: 10,
            max_batch_size: 20,
            ..BatchingConfig::default()
        };
        let partitioner = partitioner(8, batching);
        assert_eq!(partitioner.partition_count(5, 1), 1);
        assert_eq!(partitioner.partition_count(35, 1), 3);
        assert_eq!(partitioner.partition_count(1000, 1), 8);
        assert!(partitioner.partition(1, &[]).is_empty());
    }

    #[test]
    fn test_minimum_viable_size_prefers_user_settings() {
        let requirements = vec![
            MinDataRequirement {
                section: "RawProcess_Settings".to_string(),
                option: "tlag_meth".to_string(),
                requirements: BTreeMap::from([("4".to_string(), 96)]),
            },
            MinDataRequirement {
                section: "RawProcess_TiltCorrection_Settings".to_string(),
                option: "pf_subset".to_string(),
                requirements: BTreeMap::from([("1".to_string(), 480)]),
            },
        ];
        let template = IniDocument::parse(
            "[RawProcess_Settings]\ntlag_meth=4\n[RawProcess_TiltCorrection_Settings]\npf_subset=1\n",
        )
        .unwrap();

        assert_eq!(
            minimum_viable_size(&requirements, &BTreeMap::new(), Some(&template)),
            480
        );

        let user = BTreeMap::from([(
            "RawProcess_TiltCorrection_Settings".to_string(),
            BTreeMap::from([("pf_subset".to_string(), "0".to_string())]),
        )]);
        assert_eq!(minimum_viable_size(&requirements, &user, Some(&template)), 480);

        let user = BTreeMap::from([(
            "RawProcess_Settings".to_string(),
            BTreeMap::from([("tlag_meth".to_string(), "2".to_string())]),
        )]);
        assert_eq!(minimum_viable_size(&requirements[..1], &user, None), 1);
        assert_eq!(minimum_viable_size(&[], &BTreeMap::new(), None), 1);
    }

    #[test]
    fn test_small_group_uses_one_batch() {
        let batching = BatchingConfig {
            min_data_requirements: vec![MinDataRequirement {
                section: "S".to_string(),
                option: "o".to_string(),
                requirements: BTreeMap::from([("1".to_string(), 100)]),
            }],
            user_settings: BTreeMap::from([(
                "S".to_string(),
                BTreeMap::from([("o".to_string(), "1".to_string())]),
            )]),
            ..BatchingConfig::default()
        };
        let batches = partitioner(4, batching).partition(2, &timestamps(10));
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].label, "group_2_rp_A");
        assert_eq!(batches[0].len(), 10);
    }
}
