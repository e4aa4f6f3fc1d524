// 🩸 Entry Processor - Raw glucose readings → uniform {timestamp, bg} records

use crate::chunked::{process_in_chunks, ProgressSink, Stage};
use crate::model::{instant_from_millis, parse_instant, GlucoseEntry, RawEntry};

/// Normalize one raw entry.
///
/// Requires a parsable timestamp (`date` millis, else `dateString`) and a glucose
/// value (`sgv`, else `glucose`). NaN/infinite values are skipped.
pub fn normalize_entry(raw: &RawEntry) -> Option<GlucoseEntry> {
    let timestamp = raw
        .date
        .and_then(instant_from_millis)
        .or_else(|| raw.date_string.as_deref().and_then(parse_instant))?;

    let value = match raw.sgv {
        Some(sgv) if sgv != 0.0 => Some(sgv),
        _ => raw.glucose,
    }?;

    if !value.is_finite() {
        return None;
    }

    Some(GlucoseEntry { timestamp, value })
}

/// Normalize every raw entry, chunked with cooperative yields. Keeps upstream order.
pub async fn process_entries(
    raw: &[RawEntry],
    chunk_size: usize,
    progress: &dyn ProgressSink,
) -> Vec<GlucoseEntry> {
    let entries = process_in_chunks(raw, chunk_size, Stage::Entries, progress, normalize_entry).await;

    if entries.len() < raw.len() {
        log::debug!(
            "Entry processor kept {} of {} raw entries",
            entries.len(),
            raw.len()
        );
    }

    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunked::NoProgress;

    fn raw(date: Option<f64>, sgv: Option<f64>) -> RawEntry {
        RawEntry {
            date,
            sgv,
            ..Default::default()
        }
    }

    #[test]
    fn test_normalize_uses_sgv() {
        let entry = normalize_entry(&raw(Some(1_709_251_200_000.0), Some(123.0))).unwrap();
        assert_eq!(entry.value, 123.0);
        assert_eq!(entry.timestamp.to_rfc3339(), "2024-03-01T00:00:00+00:00");
    }

    #[test]
    fn test_normalize_falls_back_to_glucose_and_date_string() {
        let entry = normalize_entry(&RawEntry {
            date: None,
            date_string: Some("2024-03-01T00:05:00.000Z".to_string()),
            sgv: None,
            glucose: Some(98.0),
        })
        .unwrap();

        assert_eq!(entry.value, 98.0);
        assert_eq!(entry.timestamp.to_rfc3339(), "2024-03-01T00:05:00+00:00");
    }

    #[test]
    fn test_normalize_skips_invalid() {
        assert!(normalize_entry(&raw(None, Some(100.0))).is_none());
        assert!(normalize_entry(&raw(Some(1_709_251_200_000.0), None)).is_none());
        assert!(normalize_entry(&raw(Some(f64::NAN), Some(100.0))).is_none());
        assert!(normalize_entry(&raw(Some(1_709_251_200_000.0), Some(f64::NAN))).is_none());
    }

    #[tokio::test]
    async fn test_process_entries_keeps_order() {
        let raws = vec![
            raw(Some(1_709_251_500_000.0), Some(110.0)),
            raw(None, Some(999.0)),
            raw(Some(1_709_251_200_000.0), Some(100.0)),
        ];

        let entries = process_entries(&raws, 2, &NoProgress).await;

        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].value, 110.0);
        assert_eq!(entries[1].value, 100.0);
    }
}
