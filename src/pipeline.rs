// 🚰 Sensitivity Pipeline - fetch → process → merge → aggregate
//
// Three concurrent retrievals through the TTL cache:
//   - entries        mandatory  (failure or empty = fatal)
//   - device status  optional   (failure or empty = entries-only output)
//   - profiles       optional   (bounded wait; failure, timeout or empty =
//                                synthetic default profile)
//
// One fetch at a time per pipeline instance: a request arriving while another
// is running is rejected, never queued or merged.

use crate::cache::{cache_key, DatasetKind, TtlCache};
use crate::chunked::ProgressSink;
use crate::config::{SensorInterval, Settings};
use crate::device_status::process_device_status;
use crate::entries::process_entries;
use crate::error::{Degradation, PipelineError};
use crate::merge::{merge_series, ReconciledSeries};
use crate::model::{decode_array, ProfileVersion, RawDeviceStatus, RawEntry, RawProfile};
use crate::profile::ProfileResolver;
use crate::stats::SensitivityStats;
use crate::upstream::{FetchError, UpstreamQuery, UpstreamSource};
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

// ============================================================================
// DATE RANGE
// ============================================================================

/// Requested calendar range, both ends inclusive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RangeBounds")]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

/// Unvalidated wire form; deserialization goes through `DateRange::new`
#[derive(Deserialize)]
struct RangeBounds {
    start: NaiveDate,
    end: NaiveDate,
}

impl TryFrom<RangeBounds> for DateRange {
    type Error = PipelineError;

    fn try_from(bounds: RangeBounds) -> Result<Self, Self::Error> {
        DateRange::new(bounds.start, bounds.end)
    }
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self, PipelineError> {
        if start > end {
            return Err(PipelineError::Validation(format!(
                "Start date {} is after end date {}",
                start, end
            )));
        }
        if end.succ_opt().is_none() {
            return Err(PipelineError::Validation(format!("End date {} is out of range", end)));
        }
        Ok(DateRange { start, end })
    }

    /// Parse two `YYYY-MM-DD` dates
    pub fn parse(start: &str, end: &str) -> Result<Self, PipelineError> {
        let parse = |raw: &str| {
            NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d").map_err(|_| {
                PipelineError::Validation(format!("Invalid date {:?}, expected YYYY-MM-DD", raw))
            })
        };
        Self::new(parse(start)?, parse(end)?)
    }

    /// Exclusive upper bound sent upstream: one day past `end`
    pub fn query_end(&self) -> NaiveDate {
        self.end.succ_opt().unwrap_or(self.end)
    }

    /// Midnight UTC of `start`
    pub fn start_instant(&self) -> DateTime<Utc> {
        Utc.from_utc_datetime(&self.start.and_time(chrono::NaiveTime::MIN))
    }

    /// Upstream `count` hint: queried window in minutes / sensor interval, rounded up
    pub fn expected_points(&self, interval: SensorInterval) -> i64 {
        let minutes = (self.query_end() - self.start).num_minutes();
        let step = interval.minutes();
        (minutes + step - 1) / step
    }
}

// ============================================================================
// SINGLE-FLIGHT GUARD
// ============================================================================

/// In-flight marker owned by one pipeline instance
#[derive(Debug, Clone, Default)]
pub struct FlightGuard {
    in_flight: Arc<AtomicBool>,
}

/// Held for the duration of one fetch; releases the guard when dropped
#[derive(Debug)]
pub struct FlightToken {
    in_flight: Arc<AtomicBool>,
}

impl FlightGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the guard, `None` if a fetch is already running
    pub fn try_begin(&self) -> Option<FlightToken> {
        self.in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| FlightToken {
                in_flight: Arc::clone(&self.in_flight),
            })
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }
}

impl Drop for FlightToken {
    fn drop(&mut self) {
        self.in_flight.store(false, Ordering::Release);
    }
}

// ============================================================================
// REPORT
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ProfileSource {
    /// Versions came from the upstream source
    Upstream,
    /// Synthetic `00:00 -> 50` profile; profile values are approximate
    SyntheticDefault,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawCounts {
    pub entries: usize,
    pub device_status: usize,
    pub profiles: usize,
}

/// Everything one successful fetch produced
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SensitivityReport {
    pub run_id: Uuid,
    pub generated_at: DateTime<Utc>,
    pub range: DateRange,
    pub series: ReconciledSeries,
    pub degradations: Vec<Degradation>,
    pub profile_source: ProfileSource,
    /// Zone every time of day in this report was read in
    pub time_zone: String,
    pub stats: SensitivityStats,
    pub raw_counts: RawCounts,
}

impl SensitivityReport {
    pub fn is_exact(&self) -> bool {
        self.degradations.is_empty()
    }

    pub fn summary(&self) -> String {
        format!(
            "{} to {}: {} glucose rows, {} with sensitivity, profile {:?}, {} degradation(s)",
            self.range.start,
            self.range.end,
            self.series.len(),
            self.series.reconciled_count(),
            self.profile_source,
            self.degradations.len()
        )
    }
}

#[derive(Debug, Clone)]
pub enum FetchOutcome {
    Completed(Arc<SensitivityReport>),
    /// Another fetch was already running; nothing was done
    Rejected,
}

// ============================================================================
// STAGES
// ============================================================================

/// Run the processing stages over already-fetched raw documents.
///
/// Pure apart from the cooperative yields; the result does not depend on
/// `chunk_size`. Hours are bucketed in the resolver's zone.
pub async fn reconcile(
    entries: &[RawEntry],
    statuses: &[RawDeviceStatus],
    resolver: &ProfileResolver,
    chunk_size: usize,
    progress: &dyn ProgressSink,
) -> ReconciledSeries {
    let glucose = process_entries(entries, chunk_size, progress).await;
    let samples = process_device_status(statuses, resolver, chunk_size, progress).await;
    ReconciledSeries::build(merge_series(&glucose, &samples), resolver.zone())
}

/// Profile versions to resolve against, plus why a fallback was needed
fn profile_versions(
    fetched: Result<Result<Arc<Vec<u8>>, FetchError>, tokio::time::error::Elapsed>,
    settings: &Settings,
    range: &DateRange,
) -> (Vec<ProfileVersion>, Option<Degradation>) {
    let reason = match fetched {
        Err(_) => format!("timed out after {}s", settings.profile_timeout.as_secs()),
        Ok(Err(e)) => e.to_string(),
        Ok(Ok(payload)) => match decode_array::<RawProfile>(&payload) {
            Err(e) => format!("undecodable payload: {}", e),
            Ok(raw) => {
                let versions: Vec<ProfileVersion> = raw
                    .into_iter()
                    .filter_map(|p| match ProfileVersion::try_from(p) {
                        Ok(v) => Some(v),
                        Err(e) => {
                            log::warn!("Skipping profile version: {}", e);
                            None
                        }
                    })
                    .collect();

                if !versions.is_empty() {
                    return (versions, None);
                }
                "no profile versions in range".to_string()
            }
        },
    };

    log::warn!("Using synthetic default profile: {}", reason);
    (
        vec![ProfileVersion::synthetic_default(range.start_instant())],
        Some(Degradation::SyntheticProfile { reason }),
    )
}

/// Raw device-status documents, empty (with a degradation) when unavailable
fn device_statuses(
    fetched: Result<Arc<Vec<u8>>, FetchError>,
) -> (Vec<RawDeviceStatus>, Option<Degradation>) {
    let degradation = match fetched {
        Err(e) => Degradation::DeviceStatusUnavailable { reason: e.to_string() },
        Ok(payload) => match decode_array::<RawDeviceStatus>(&payload) {
            Ok(statuses) if !statuses.is_empty() => return (statuses, None),
            Ok(_) => Degradation::DeviceStatusEmpty,
            Err(e) => Degradation::DeviceStatusUnavailable {
                reason: format!("undecodable payload: {}", e),
            },
        },
    };

    log::warn!("{}", degradation.describe());
    (Vec::new(), Some(degradation))
}

// ============================================================================
// PIPELINE
// ============================================================================

pub struct SensitivityPipeline {
    source: Arc<dyn UpstreamSource>,
    settings: Settings,
    cache: TtlCache,
    guard: FlightGuard,
    latest: Mutex<Option<Arc<SensitivityReport>>>,
}

impl SensitivityPipeline {
    pub fn new(source: Arc<dyn UpstreamSource>, settings: Settings) -> Self {
        SensitivityPipeline {
            source,
            cache: TtlCache::new(settings.cache_ttl),
            settings,
            guard: FlightGuard::new(),
            latest: Mutex::new(None),
        }
    }

    /// Share a cache with other pipelines (e.g. one per connection).
    /// The shared cache keeps its own TTL.
    pub fn with_cache(mut self, cache: TtlCache) -> Self {
        self.cache = cache;
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn cache(&self) -> &TtlCache {
        &self.cache
    }

    pub fn is_fetching(&self) -> bool {
        self.guard.is_in_flight()
    }

    /// Last successful report; cleared by any fatal failure
    pub fn latest(&self) -> Option<Arc<SensitivityReport>> {
        self.latest.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn set_latest(&self, report: Option<Arc<SensitivityReport>>) {
        *self.latest.lock().unwrap_or_else(|e| e.into_inner()) = report;
    }

    fn query(&self, kind: DatasetKind, range: &DateRange, count: Option<i64>) -> UpstreamQuery {
        UpstreamQuery {
            kind,
            start: range.start,
            end: range.query_end(),
            count,
        }
    }

    async fn fetch_cached(&self, query: &UpstreamQuery) -> Result<Arc<Vec<u8>>, FetchError> {
        let key = cache_key(query.kind, query.start, query.end);
        self.cache
            .get_or_fetch(&key, || self.source.fetch(query))
            .await
    }

    /// Fetch, reconcile and aggregate `range`.
    ///
    /// Returns `FetchOutcome::Rejected` if a fetch is already running on this
    /// instance. Fatal errors clear the last report.
    pub async fn fetch(
        &self,
        range: DateRange,
        progress: &dyn ProgressSink,
    ) -> Result<FetchOutcome, PipelineError> {
        let _token = match self.guard.try_begin() {
            Some(token) => token,
            None => {
                log::warn!("Fetch for {} to {} rejected: already in progress", range.start, range.end);
                return Ok(FetchOutcome::Rejected);
            }
        };

        match self.run(range, progress).await {
            Ok(report) => {
                let report = Arc::new(report);
                self.set_latest(Some(Arc::clone(&report)));
                Ok(FetchOutcome::Completed(report))
            }
            Err(e) => {
                log::error!("Fetch failed: {}", e);
                self.set_latest(None);
                Err(e)
            }
        }
    }

    async fn run(
        &self,
        range: DateRange,
        progress: &dyn ProgressSink,
    ) -> Result<SensitivityReport, PipelineError> {
        let offset = self.settings.utc_offset().ok_or_else(|| {
            PipelineError::Config(format!(
                "UTC offset out of range: {} minutes",
                self.settings.utc_offset_minutes
            ))
        })?;

        let count = range.expected_points(self.settings.sensor_interval);
        log::info!(
            "Fetching {} to {} from {} (expecting ~{} points)",
            range.start,
            range.end,
            self.source.source_name(),
            count
        );

        let entries_query = self.query(DatasetKind::Entries, &range, Some(count));
        let status_query = self.query(DatasetKind::DeviceStatus, &range, Some(count));
        let profile_query = self.query(DatasetKind::Profiles, &range, None);

        let (entries, statuses, profiles) = tokio::join!(
            self.fetch_cached(&entries_query),
            self.fetch_cached(&status_query),
            tokio::time::timeout(self.settings.profile_timeout, self.fetch_cached(&profile_query)),
        );

        // Entries are mandatory
        let entries = entries.map_err(|e| PipelineError::Upstream(format!("Error fetching entries: {}", e)))?;
        let raw_entries: Vec<RawEntry> = decode_array(&entries)
            .map_err(|e| PipelineError::Upstream(format!("Undecodable entries payload: {}", e)))?;
        if raw_entries.is_empty() {
            return Err(PipelineError::Upstream(format!(
                "No glucose data between {} and {}",
                range.start, range.end
            )));
        }
        log::info!("Received {} entries (expected ~{})", raw_entries.len(), count);

        let mut degradations = Vec::new();

        let (raw_statuses, status_degradation) = device_statuses(statuses);
        degradations.extend(status_degradation);

        let (versions, profile_degradation) = profile_versions(profiles, &self.settings, &range);
        let profile_source = if profile_degradation.is_some() {
            ProfileSource::SyntheticDefault
        } else {
            ProfileSource::Upstream
        };
        degradations.extend(profile_degradation);

        let raw_counts = RawCounts {
            entries: raw_entries.len(),
            device_status: raw_statuses.len(),
            profiles: versions.len(),
        };

        let resolver = ProfileResolver::new(versions, offset);
        let zone = resolver.zone();
        log::debug!("Reading times of day in {}", zone);

        let series = reconcile(
            &raw_entries,
            &raw_statuses,
            &resolver,
            self.settings.chunk_size,
            progress,
        )
        .await;
        let stats = SensitivityStats::compute(&series, self.settings.glucose_range);

        let report = SensitivityReport {
            run_id: Uuid::new_v4(),
            generated_at: Utc::now(),
            range,
            series,
            degradations,
            profile_source,
            time_zone: zone.to_string(),
            stats,
            raw_counts,
        };

        log::info!("{}", report.summary());
        Ok(report)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunked::NoProgress;
    use crate::model::parse_instant;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, d).unwrap()
    }

    #[test]
    fn test_date_range_validation() {
        assert!(DateRange::new(day(1), day(1)).is_ok());
        assert!(matches!(
            DateRange::new(day(2), day(1)),
            Err(PipelineError::Validation(_))
        ));
        assert!(matches!(
            DateRange::parse("2024-03-01", "03/02/2024"),
            Err(PipelineError::Validation(_))
        ));
    }

    #[test]
    fn test_query_end_extends_one_day() {
        let range = DateRange::parse("2024-02-28", "2024-02-29").unwrap();
        assert_eq!(range.query_end(), day(1));
        assert_eq!(range.start_instant(), parse_instant("2024-02-28T00:00:00Z").unwrap());
    }

    #[test]
    fn test_expected_points() {
        let range = DateRange::new(day(1), day(1)).unwrap();
        assert_eq!(range.expected_points(SensorInterval::FiveMinutes), 288);
        assert_eq!(range.expected_points(SensorInterval::OneMinute), 1440);

        let range = DateRange::new(day(1), day(7)).unwrap();
        assert_eq!(range.expected_points(SensorInterval::FiveMinutes), 7 * 288);
    }

    #[test]
    fn test_flight_guard_single_flight() {
        let guard = FlightGuard::new();

        let token = guard.try_begin().unwrap();
        assert!(guard.is_in_flight());
        assert!(guard.try_begin().is_none());

        drop(token);
        assert!(!guard.is_in_flight());
        assert!(guard.try_begin().is_some());
    }

    #[test]
    fn test_profile_fallback_on_empty() {
        let range = DateRange::new(day(1), day(1)).unwrap();
        let (versions, degradation) =
            profile_versions(Ok(Ok(Arc::new(b"[]".to_vec()))), &Settings::new(), &range);

        assert_eq!(versions.len(), 1);
        assert_eq!(versions[0].effective_from, range.start_instant());
        assert!(matches!(degradation, Some(Degradation::SyntheticProfile { .. })));
    }

    #[test]
    fn test_profile_fallback_on_error() {
        let range = DateRange::new(day(1), day(1)).unwrap();
        let (versions, degradation) =
            profile_versions(Ok(Err(FetchError::Status(500))), &Settings::new(), &range);

        assert_eq!(versions.len(), 1);
        match degradation {
            Some(Degradation::SyntheticProfile { reason }) => assert!(reason.contains("500")),
            other => panic!("unexpected degradation: {:?}", other),
        }
    }

    #[test]
    fn test_device_status_degrades_on_error_and_empty() {
        let (statuses, degradation) = device_statuses(Err(FetchError::Timeout));
        assert!(statuses.is_empty());
        assert!(matches!(degradation, Some(Degradation::DeviceStatusUnavailable { .. })));

        let (_, degradation) = device_statuses(Ok(Arc::new(b"[]".to_vec())));
        assert_eq!(degradation, Some(Degradation::DeviceStatusEmpty));
    }

    fn example_inputs() -> (Vec<RawEntry>, Vec<RawDeviceStatus>, ProfileResolver) {
        let entries: Vec<RawEntry> = serde_json::from_str(
            r#"[
                {"dateString": "2024-03-01T00:00:00Z", "sgv": 100},
                {"dateString": "2024-03-01T00:05:00Z", "sgv": 110}
            ]"#,
        )
        .unwrap();
        let statuses: Vec<RawDeviceStatus> = serde_json::from_str(
            r#"[{"created_at": "2024-03-01T00:05:00Z", "openaps": {"suggested": {"bg": 110, "sens": 60}}}]"#,
        )
        .unwrap();
        let profiles: Vec<RawProfile> = serde_json::from_str(
            r#"[{"startDate": "2024-03-01T00:00:00Z", "defaultProfile": "Default",
                 "store": {"Default": {"sens": [{"time": "00:00", "value": 50}]}}}]"#,
        )
        .unwrap();

        let versions = profiles
            .into_iter()
            .map(|p| ProfileVersion::try_from(p).unwrap())
            .collect();

        (entries, statuses, ProfileResolver::utc(versions))
    }

    #[tokio::test]
    async fn test_reconcile_end_to_end_example() {
        let (entries, statuses, resolver) = example_inputs();

        let series = reconcile(&entries, &statuses, &resolver, 100, &NoProgress).await;

        assert_eq!(series.len(), 2);
        let first = series.table_data[0];
        assert_eq!((first.bg, first.isf_dynamic, first.isf_profile, first.deviation), (100.0, 0.0, 0.0, 0.0));
        let second = series.table_data[1];
        assert_eq!((second.bg, second.isf_dynamic, second.isf_profile, second.deviation), (110.0, 60.0, 50.0, 20.0));
        assert_eq!(series.hourly_stats[0].sample_count, 1);
    }

    #[tokio::test]
    async fn test_reconcile_independent_of_chunk_size() {
        let (entries, statuses, resolver) = example_inputs();

        let a = reconcile(&entries, &statuses, &resolver, 1, &NoProgress).await;
        let b = reconcile(&entries, &statuses, &resolver, 100, &NoProgress).await;
        let c = reconcile(&entries, &statuses, &resolver, entries.len(), &NoProgress).await;

        assert_eq!(a, b);
        assert_eq!(b, c);
    }

    /// Readings every 5 min from 2024-03-01 00:00Z; every third reading has a
    /// status snapshot, and every 25th snapshot is sent twice.
    fn large_inputs(n: i64) -> (Vec<RawEntry>, Vec<RawDeviceStatus>) {
        let base = parse_instant("2024-03-01T00:00:00Z").unwrap();
        let at = |i: i64| (base + chrono::Duration::minutes(5 * i)).to_rfc3339();

        let entries: Vec<RawEntry> = (0..n)
            .map(|i| RawEntry {
                date_string: Some(at(i)),
                sgv: Some(90.0 + (i % 60) as f64),
                ..Default::default()
            })
            .collect();

        let mut statuses = Vec::new();
        for i in (0..n).step_by(3) {
            let raw = serde_json::json!({
                "created_at": at(i),
                "openaps": {"suggested": {"bg": 90 + (i % 60), "sens": 35 + (i % 40)}}
            });
            let status: RawDeviceStatus = serde_json::from_value(raw).unwrap();
            if i % 25 == 0 {
                statuses.push(status.clone());
            }
            statuses.push(status);
        }

        (entries, statuses)
    }

    #[tokio::test]
    async fn test_reconcile_large_input_independent_of_chunk_size() {
        let (entries, statuses) = large_inputs(600);
        let profiles: Vec<RawProfile> = serde_json::from_str(
            r#"[
                {"startDate": "2024-03-01T00:00:00Z", "defaultProfile": "Default",
                 "store": {"Default": {"sens": [{"time": "00:00", "value": 50}, {"time": "12:00", "value": 45}]}}},
                {"startDate": "2024-03-02T00:00:00Z", "defaultProfile": "Default",
                 "store": {"Default": {"sens": [{"time": "06:00", "value": 40}, {"time": "18:00", "value": 55}]}}}
            ]"#,
        )
        .unwrap();
        let versions = profiles
            .into_iter()
            .map(|p| ProfileVersion::try_from(p).unwrap())
            .collect();
        let resolver = ProfileResolver::utc(versions);

        let one = reconcile(&entries, &statuses, &resolver, 1, &NoProgress).await;
        let hundred = reconcile(&entries, &statuses, &resolver, 100, &NoProgress).await;
        let whole = reconcile(&entries, &statuses, &resolver, entries.len(), &NoProgress).await;

        assert_eq!(one, hundred);
        assert_eq!(hundred, whole);

        assert_eq!(whole.len(), 600);
        assert_eq!(whole.reconciled_count(), 200);

        // Both versions and the schedule wrap are exercised
        let profile_values: std::collections::BTreeSet<u64> = whole
            .isf_profile
            .iter()
            .filter(|v| **v != 0.0)
            .map(|v| *v as u64)
            .collect();
        assert_eq!(profile_values.into_iter().collect::<Vec<_>>(), vec![40, 45, 50, 55]);
    }

    #[test]
    fn test_date_range_deserialize_validates() {
        let ok: DateRange = serde_json::from_str(r#"{"start": "2024-03-01", "end": "2024-03-02"}"#).unwrap();
        assert_eq!(ok, DateRange::new(day(1), day(2)).unwrap());

        let inverted = serde_json::from_str::<DateRange>(r#"{"start": "2024-03-05", "end": "2024-03-01"}"#);
        assert!(inverted.unwrap_err().to_string().contains("after end date"));
    }
}
