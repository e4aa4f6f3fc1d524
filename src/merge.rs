// 🔗 Merge / Aggregate - Join glucose and sensitivity series, then bucket by hour
//
// The glucose series is the spine: the merged output always has exactly one row
// per glucose entry. Rows without a device-status sample at the same instant are
// zero-filled, which is a different policy from the device-status filter (drop
// on zero) and is kept separate on purpose.

use crate::model::{GlucoseEntry, HourlyAggregate, ReconciledRecord, SensitivitySample};
use crate::profile::LocalZone;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const HOURS_PER_DAY: usize = 24;

// ============================================================================
// MERGE
// ============================================================================

/// Join by exact timestamp equality; unmatched entries get zeroed sensitivity.
///
/// If several samples share an instant, the first one wins.
pub fn merge_series(
    entries: &[GlucoseEntry],
    samples: &[SensitivitySample],
) -> Vec<ReconciledRecord> {
    let mut by_instant: HashMap<DateTime<Utc>, &SensitivitySample> =
        HashMap::with_capacity(samples.len());
    for sample in samples {
        by_instant.entry(sample.timestamp).or_insert(sample);
    }

    entries
        .iter()
        .map(|entry| match by_instant.get(&entry.timestamp) {
            Some(sample) => ReconciledRecord {
                timestamp: entry.timestamp,
                bg: entry.value,
                isf_dynamic: sample.isf_dynamic,
                isf_profile: sample.isf_profile,
                deviation: sample.deviation,
            },
            None => ReconciledRecord::glucose_only(entry.timestamp, entry.value),
        })
        .collect()
}

// ============================================================================
// HOURLY AGGREGATION
// ============================================================================

#[derive(Default)]
struct Bucket {
    deviation: f64,
    isf_dynamic: f64,
    isf_profile: f64,
    count: usize,
}

impl Bucket {
    fn average(&self, sum: f64) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            sum / self.count as f64
        }
    }
}

/// 24 buckets by hour of day (date ignored), in `zone` local time.
///
/// Only rows carrying a device-status contribution are counted; gap-filled
/// rows would drag every average towards zero. Empty buckets report 0.
pub fn hourly_aggregates(records: &[ReconciledRecord], zone: LocalZone) -> Vec<HourlyAggregate> {
    let mut buckets: Vec<Bucket> = (0..HOURS_PER_DAY).map(|_| Bucket::default()).collect();

    for record in records.iter().filter(|r| r.has_sensitivity()) {
        let hour = zone.hour(record.timestamp) as usize;
        let bucket = &mut buckets[hour];
        bucket.deviation += record.deviation;
        bucket.isf_dynamic += record.isf_dynamic;
        bucket.isf_profile += record.isf_profile;
        bucket.count += 1;
    }

    buckets
        .iter()
        .enumerate()
        .map(|(hour, b)| HourlyAggregate {
            hour: hour as u32,
            avg_deviation: b.average(b.deviation),
            avg_isf_dynamic: b.average(b.isf_dynamic),
            avg_isf_profile: b.average(b.isf_profile),
            sample_count: b.count,
        })
        .collect()
}

// ============================================================================
// RECONCILED SERIES (columnar + row views)
// ============================================================================

/// Output handed to the presentation layer: parallel columns, the same rows as
/// a table, and the 24 hourly aggregates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconciledSeries {
    pub timestamps: Vec<DateTime<Utc>>,
    pub bgs: Vec<f64>,
    pub isf_dynamic: Vec<f64>,
    pub isf_profile: Vec<f64>,
    pub deviations: Vec<f64>,
    pub table_data: Vec<ReconciledRecord>,
    pub hourly_stats: Vec<HourlyAggregate>,
}

impl ReconciledSeries {
    pub fn build(records: Vec<ReconciledRecord>, zone: LocalZone) -> Self {
        let hourly_stats = hourly_aggregates(&records, zone);

        ReconciledSeries {
            timestamps: records.iter().map(|r| r.timestamp).collect(),
            bgs: records.iter().map(|r| r.bg).collect(),
            isf_dynamic: records.iter().map(|r| r.isf_dynamic).collect(),
            isf_profile: records.iter().map(|r| r.isf_profile).collect(),
            deviations: records.iter().map(|r| r.deviation).collect(),
            table_data: records,
            hourly_stats,
        }
    }

    pub fn len(&self) -> usize {
        self.table_data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table_data.is_empty()
    }

    /// Rows that carry a device-status contribution
    pub fn reconciled_count(&self) -> usize {
        self.table_data.iter().filter(|r| r.has_sensitivity()).count()
    }
}

// ============================================================================
// TESTS
// ============================================================================
