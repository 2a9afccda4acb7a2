//! Canonical fixed-interval timeline.
//!
//! Every slot between the first and last observed interval holds exactly
//! one record: a discovered file, or an explicit gap.

use chrono::{Duration, NaiveDateTime};
use std::collections::BTreeMap;
use tracing::debug;

use super::DiscoveredFile;
use crate::constants::flags::INCOMPLETE_RECORD;
use crate::models::{FileRecord, RecordStatus, floor_to_interval};

/// Inventory keyed by slot start
pub type Timeline = BTreeMap<NaiveDateTime, FileRecord>;

/// Counts from one merge
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MergeOutcome {
    pub added: usize,
    pub incomplete: usize,
    /// Files whose slot was already occupied
    pub duplicates: usize,
    pub gaps: usize,
}

/// Place discovered files on the grid.
///
/// The earliest file per slot wins (ties broken by filename); an occupied
/// slot is never overwritten. A winner whose timestamp is not on the grid
/// is kept as `incomplete` so its slot is accounted for but never parsed.
pub fn merge_discovered(
    timeline: &mut Timeline,
    mut discovered: Vec<DiscoveredFile>,
    interval: Duration,
) -> MergeOutcome {
    let mut outcome = MergeOutcome::default();
    discovered.sort_by(|a, b| {
        a.timestamp
            .cmp(&b.timestamp)
            .then_with(|| a.filename.cmp(&b.filename))
    });

    for file in discovered {
        let slot = floor_to_interval(file.timestamp, interval);
        if timeline.get(&slot).is_some_and(|r| !r.is_gap()) {
            debug!("Slot {} already occupied, skipping {}", slot, file.filename);
            outcome.duplicates += 1;
            continue;
        }

        let mut record = FileRecord {
            timestamp: slot,
            source: Some(file.source),
            filename: Some(file.filename),
            file_prototype: Some(file.file_prototype),
            status: RecordStatus::Pending,
            filter_flags: Vec::new(),
            group_id: None,
        };
        if slot != file.timestamp {
            record.status = RecordStatus::Incomplete;
            record.add_flag(INCOMPLETE_RECORD);
            outcome.incomplete += 1;
        }
        timeline.insert(slot, record);
        outcome.added += 1;
    }

    outcome.gaps = fill_gaps(timeline, interval);
    outcome
}

/// Insert gap records for every empty slot between the first and last
fn fill_gaps(timeline: &mut Timeline, interval: Duration) -> usize {
    let (Some(first), Some(last)) = (
        timeline.keys().next().copied(),
        timeline.keys().next_back().copied(),
    ) else {
        return 0;
    };

    let mut inserted = 0;
    let mut slot = first;
    while slot < last {
        slot += interval;
        if !timeline.contains_key(&slot) {
            timeline.insert(slot, FileRecord::gap(slot));
            inserted += 1;
        }
    }
    inserted
}
