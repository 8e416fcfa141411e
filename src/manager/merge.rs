//! Merging persisted and live records.

use std::collections::{BTreeMap, HashSet};

use crate::models::DeploymentRecord;

/// Result of merging persisted records with the live view.
#[derive(Debug, Default)]
pub struct MergedRecords {
    pub records: Vec<DeploymentRecord>,
    /// Live records without a persisted counterpart, to be persisted.
    pub adopted: Vec<DeploymentRecord>,
}

/// Persisted records keep their order and come first, live-only records
/// follow sorted by id. A persisted record takes status and internal id from
/// its live counterpart, or is shown as stopped when there is none.
pub fn merge_records(
    persisted: Vec<DeploymentRecord>,
    live: Vec<DeploymentRecord>,
) -> MergedRecords {
    let mut live_by_id: BTreeMap<String, DeploymentRecord> =
        live.into_iter().map(|r| (r.id.clone(), r)).collect();
    let mut seen = HashSet::new();

    let mut records = Vec::with_capacity(persisted.len() + live_by_id.len());
    for mut record in persisted {
        if !seen.insert(record.id.clone()) {
            continue;
        }
        match live_by_id.remove(&record.id) {
            Some(live) => overlay(&mut record, &live),
            None => record.mark_stopped(),
        }
        records.push(record);
    }

    let adopted: Vec<DeploymentRecord> = live_by_id.into_values().collect();
    records.extend(adopted.iter().cloned());
    MergedRecords { records, adopted }
}

/// Copies the live-owned fields onto a persisted record.
pub fn overlay(record: &mut DeploymentRecord, live: &DeploymentRecord) {
    record.status = live.status;
    record.internal_id = live.internal_id.clone();
    if live.started_at.is_some() {
        record.started_at = live.started_at;
    }
    if live.stopped_at.is_some() {
        record.stopped_at = live.stopped_at;
    }
}
