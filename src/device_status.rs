// 🧮 Device-Status Processor - Observed (dynamic) vs configured (profile) sensitivity
//
// For every status snapshot carrying a "suggested" block:
//   1. extract the dynamic sensitivity (strict field priority)
//   2. resolve the profile sensitivity at the snapshot's instant
//   3. keep the sample only if bg, dynamic and profile are all non-zero
//   4. deviation = (dynamic - profile) / profile * 100

use crate::chunked::{process_in_chunks, ProgressSink, Stage};
use crate::model::{
    deviation_percent, parse_instant, DeviceStatusRecord, RawDeviceStatus, RawSuggested,
    SensitivitySample,
};
use crate::profile::ProfileResolver;
use chrono::{DateTime, Utc};
use std::collections::HashMap;

/// Numerator for sensitivity derived from `sensitivityRatio`.
///
/// Fixed domain constant; changing it changes every derived value.
pub const SENSITIVITY_RATIO_NUMERATOR: f64 = 70.0;

/// A field counts as present only when it is set, non-zero and not NaN
fn present(value: Option<f64>) -> Option<f64> {
    value.filter(|v| *v != 0.0 && !v.is_nan())
}

/// Dynamic sensitivity from a "suggested" block.
///
/// Priority: `sens`, `sensitivities`, `variable_sens`, then
/// `70 / sensitivityRatio`. A zero in an earlier field falls through to the next.
pub fn extract_dynamic_sensitivity(suggested: &RawSuggested) -> Option<f64> {
    present(suggested.sens)
        .or_else(|| present(suggested.sensitivities))
        .or_else(|| present(suggested.variable_sens))
        .or_else(|| {
            present(suggested.sensitivity_ratio).map(|ratio| SENSITIVITY_RATIO_NUMERATOR / ratio)
        })
}

/// Snapshot → record, `None` without a "suggested" block or a parsable `created_at`
pub fn to_device_record(raw: &RawDeviceStatus) -> Option<DeviceStatusRecord> {
    let suggested = raw.openaps.as_ref()?.suggested.as_ref()?;
    let created_at = raw.created_at.as_deref().and_then(parse_instant)?;

    Some(DeviceStatusRecord {
        created_at,
        suggested_bg: suggested.bg,
        dynamic_sensitivity: extract_dynamic_sensitivity(suggested),
    })
}

/// Emission filter: all three inputs must be present and non-zero.
///
/// A legitimate zero reading is dropped too; this is kept on purpose and is
/// the reason output counts run well below raw counts.
pub fn is_usable_sample(
    bg: Option<f64>,
    isf_dynamic: Option<f64>,
    isf_profile: Option<f64>,
) -> Option<(f64, f64, f64)> {
    Some((present(bg)?, present(isf_dynamic)?, present(isf_profile)?))
}

/// Build the sample for one record, resolving the profile through `memo`
fn sample_for(
    record: &DeviceStatusRecord,
    resolver: &ProfileResolver,
    memo: &mut HashMap<DateTime<Utc>, Option<f64>>,
) -> Option<SensitivitySample> {
    let isf_profile = *memo
        .entry(record.created_at)
        .or_insert_with(|| resolver.resolve(record.created_at));

    let (bg, isf_dynamic, isf_profile) =
        is_usable_sample(record.suggested_bg, record.dynamic_sensitivity, isf_profile)?;
    let deviation = deviation_percent(isf_dynamic, isf_profile)?;

    Some(SensitivitySample {
        timestamp: record.created_at,
        bg,
        isf_dynamic,
        isf_profile,
        deviation,
    })
}

/// Process raw snapshots in chunks, sorted by `created_at` ascending.
pub async fn process_device_status(
    raw: &[RawDeviceStatus],
    resolver: &ProfileResolver,
    chunk_size: usize,
    progress: &dyn ProgressSink,
) -> Vec<SensitivitySample> {
    let mut records: Vec<DeviceStatusRecord> = raw.iter().filter_map(to_device_record).collect();
    records.sort_by_key(|r| r.created_at);

    let mut memo: HashMap<DateTime<Utc>, Option<f64>> = HashMap::new();

    let samples = process_in_chunks(&records, chunk_size, Stage::DeviceStatus, progress, |record| {
        sample_for(record, resolver, &mut memo)
    })
    .await;

    log::info!(
        "Device-status processor: {} raw, {} with suggestions, {} usable samples",
        raw.len(),
        records.len(),
        samples.len()
    );

    samples
}

// ============================================================================
// TESTS
// ============================================================================
