// 📈 Derived Statistics - Summaries computed over the reconciled series
//
// Deviation spread, day-period averages, tuning recommendations and time in
// range. Sensitivity statistics only look at rows carrying a device-status
// contribution; time in range looks at every glucose row.

use crate::config::GlucoseRange;
use crate::merge::ReconciledSeries;
use crate::model::{deviation_percent, HourlyAggregate, ReconciledRecord};
use serde::{Deserialize, Serialize};

/// |average deviation| above this (percent) triggers a warning
pub const SIGNIFICANT_DEVIATION_PERCENT: f64 = 20.0;

/// Dynamic above `profile * 1.2` suggests raising the profile sensitivity
pub const RAISE_RATIO: f64 = 1.2;

/// Dynamic below `profile * 0.8` suggests lowering it
pub const LOWER_RATIO: f64 = 0.8;

// ============================================================================
// DEVIATION SPREAD
// ============================================================================

/// Absolute gap between dynamic and profile sensitivity (mg/dL/U)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviationSpread {
    pub avg: f64,
    pub max: f64,
    pub min: f64,
    pub count: usize,
}

pub fn deviation_spread(records: &[ReconciledRecord]) -> Option<DeviationSpread> {
    let gaps: Vec<f64> = records
        .iter()
        .filter(|r| r.has_sensitivity())
        .map(|r| (r.isf_dynamic - r.isf_profile).abs())
        .collect();

    if gaps.is_empty() {
        return None;
    }

    Some(DeviationSpread {
        avg: gaps.iter().sum::<f64>() / gaps.len() as f64,
        max: gaps.iter().copied().fold(f64::MIN, f64::max),
        min: gaps.iter().copied().fold(f64::MAX, f64::min),
        count: gaps.len(),
    })
}

// ============================================================================
// DAY PERIODS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DayPeriod {
    Overnight,
    Morning,
    Afternoon,
    Evening,
}

impl DayPeriod {
    pub const ALL: [DayPeriod; 4] = [
        DayPeriod::Overnight,
        DayPeriod::Morning,
        DayPeriod::Afternoon,
        DayPeriod::Evening,
    ];

    /// Inclusive local hour range
    pub fn hours(&self) -> (u32, u32) {
        match self {
            DayPeriod::Overnight => (0, 5),
            DayPeriod::Morning => (6, 11),
            DayPeriod::Afternoon => (12, 17),
            DayPeriod::Evening => (18, 23),
        }
    }

    pub fn contains(&self, hour: u32) -> bool {
        let (start, end) = self.hours();
        (start..=end).contains(&hour)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeriodStats {
    pub period: DayPeriod,
    pub avg_isf_dynamic: f64,
    pub avg_isf_profile: f64,
    /// From the period averages, not an average of per-row deviations
    pub avg_deviation: f64,
    pub count: usize,
}

/// Four six-hour periods, folded from the hourly buckets. Empty periods are zero.
pub fn period_stats(hourly: &[HourlyAggregate]) -> Vec<PeriodStats> {
    DayPeriod::ALL
        .iter()
        .map(|period| {
            let (dynamic, profile, count) = hourly
                .iter()
                .filter(|h| period.contains(h.hour))
                .fold((0.0, 0.0, 0), |(d, p, n), h| {
                    let weight = h.sample_count as f64;
                    (d + h.avg_isf_dynamic * weight, p + h.avg_isf_profile * weight, n + h.sample_count)
                });

            let (avg_isf_dynamic, avg_isf_profile) = if count == 0 {
                (0.0, 0.0)
            } else {
                (dynamic / count as f64, profile / count as f64)
            };

            PeriodStats {
                period: *period,
                avg_isf_dynamic,
                avg_isf_profile,
                avg_deviation: deviation_percent(avg_isf_dynamic, avg_isf_profile).unwrap_or(0.0),
                count,
            }
        })
        .collect()
}

// ============================================================================
// RECOMMENDATIONS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Recommendation {
    /// Average deviation beyond the warning threshold
    SignificantDeviation { avg_deviation: f64 },
    /// Dynamic sensitivity consistently above the profile
    RaiseProfileSensitivity { avg_isf_dynamic: f64, avg_isf_profile: f64 },
    /// Dynamic sensitivity consistently below the profile
    LowerProfileSensitivity { avg_isf_dynamic: f64, avg_isf_profile: f64 },
}

impl Recommendation {
    pub fn is_warning(&self) -> bool {
        matches!(self, Recommendation::SignificantDeviation { .. })
    }

    pub fn message(&self) -> String {
        match self {
            Recommendation::SignificantDeviation { avg_deviation } => format!(
                "Significant average deviation of {:.0}%. Consider adjusting the profile sensitivity.",
                avg_deviation
            ),
            Recommendation::RaiseProfileSensitivity { .. } => {
                "Dynamic sensitivity is consistently above the profile. Consider raising the profile sensitivity.".to_string()
            }
            Recommendation::LowerProfileSensitivity { .. } => {
                "Dynamic sensitivity is consistently below the profile. Consider lowering the profile sensitivity.".to_string()
            }
        }
    }
}

pub fn recommendations(records: &[ReconciledRecord]) -> Vec<Recommendation> {
    let reconciled: Vec<&ReconciledRecord> = records.iter().filter(|r| r.has_sensitivity()).collect();
    if reconciled.is_empty() {
        return Vec::new();
    }

    let n = reconciled.len() as f64;
    let avg_deviation = reconciled.iter().map(|r| r.deviation).sum::<f64>() / n;
    let avg_isf_dynamic = reconciled.iter().map(|r| r.isf_dynamic).sum::<f64>() / n;
    let avg_isf_profile = reconciled.iter().map(|r| r.isf_profile).sum::<f64>() / n;

    let mut out = Vec::new();

    if avg_deviation.abs() > SIGNIFICANT_DEVIATION_PERCENT {
        out.push(Recommendation::SignificantDeviation { avg_deviation });
    }

    if avg_isf_dynamic > avg_isf_profile * RAISE_RATIO {
        out.push(Recommendation::RaiseProfileSensitivity { avg_isf_dynamic, avg_isf_profile });
    } else if avg_isf_dynamic < avg_isf_profile * LOWER_RATIO {
        out.push(Recommendation::LowerProfileSensitivity { avg_isf_dynamic, avg_isf_profile });
    }

    out
}

// ============================================================================
// TIME IN RANGE
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeInRange {
    pub below_percent: f64,
    pub in_range_percent: f64,
    pub above_percent: f64,
    pub total: usize,
}

/// Share of readings below `range.low`, above `range.high`, and in between
/// (bounds inclusive). All zero for no readings.
pub fn time_in_range(bgs: &[f64], range: GlucoseRange) -> TimeInRange {
    let total = bgs.len();
    if total == 0 {
        return TimeInRange::default();
    }

    let below = bgs.iter().filter(|v| **v < range.low).count();
    let above = bgs.iter().filter(|v| **v > range.high).count();
    let in_range = total - below - above;
    let pct = |n: usize| n as f64 / total as f64 * 100.0;

    TimeInRange {
        below_percent: pct(below),
        in_range_percent: pct(in_range),
        above_percent: pct(above),
        total,
    }
}

// ============================================================================
// SUMMARY
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SensitivityStats {
    pub deviation: Option<DeviationSpread>,
    pub periods: Vec<PeriodStats>,
    pub recommendations: Vec<Recommendation>,
    pub time_in_range: TimeInRange,
}

impl SensitivityStats {
    pub fn compute(series: &ReconciledSeries, range: GlucoseRange) -> Self {
        SensitivityStats {
            deviation: deviation_spread(&series.table_data),
            periods: period_stats(&series.hourly_stats),
            recommendations: recommendations(&series.table_data),
            time_in_range: time_in_range(&series.bgs, range),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merge::hourly_aggregates;
    use crate::model::parse_instant;
    use crate::profile::LocalZone;

    fn row(t: &str, dynamic: f64, profile: f64) -> ReconciledRecord {
        ReconciledRecord {
            timestamp: parse_instant(t).unwrap(),
            bg: 120.0,
            isf_dynamic: dynamic,
            isf_profile: profile,
            deviation: (dynamic - profile) / profile * 100.0,
        }
    }

    fn gap(t: &str) -> ReconciledRecord {
        ReconciledRecord::glucose_only(parse_instant(t).unwrap(), 120.0)
    }

    #[test]
    fn test_deviation_spread_ignores_gap_rows() {
        let records = vec![
            row("2024-03-01T01:00:00Z", 60.0, 50.0),
            gap("2024-03-01T01:05:00Z"),
            row("2024-03-01T01:10:00Z", 45.0, 50.0),
            row("2024-03-01T01:15:00Z", 80.0, 50.0),
        ];

        let spread = deviation_spread(&records).unwrap();
        assert_eq!(spread.count, 3);
        assert_eq!(spread.avg, 15.0);
        assert_eq!(spread.max, 30.0);
        assert_eq!(spread.min, 5.0);

        assert!(deviation_spread(&[gap("2024-03-01T01:05:00Z")]).is_none());
        assert!(deviation_spread(&[]).is_none());
    }

    #[test]
    fn test_period_boundaries() {
        assert!(DayPeriod::Overnight.contains(5));
        assert!(DayPeriod::Morning.contains(6));
        assert!(DayPeriod::Afternoon.contains(17));
        assert!(DayPeriod::Evening.contains(18));
        assert!(!DayPeriod::Evening.contains(5));
    }

    #[test]
    fn test_period_stats_from_period_averages() {
        let records = vec![
            row("2024-03-01T06:00:00Z", 60.0, 50.0),
            row("2024-03-02T11:00:00Z", 40.0, 30.0),
            row("2024-03-01T20:00:00Z", 50.0, 50.0),
        ];
        let periods = period_stats(&hourly_aggregates(&records, LocalZone::utc()));

        assert_eq!(periods.len(), 4);

        let morning = periods[1];
        assert_eq!(morning.period, DayPeriod::Morning);
        assert_eq!(morning.count, 2);
        assert_eq!(morning.avg_isf_dynamic, 50.0);
        assert_eq!(morning.avg_isf_profile, 40.0);
        // (50 - 40) / 40, not the mean of +20% and +33%
        assert_eq!(morning.avg_deviation, 25.0);

        let overnight = periods[0];
        assert_eq!(overnight.count, 0);
        assert_eq!(overnight.avg_isf_profile, 0.0);
        assert_eq!(overnight.avg_deviation, 0.0);

        assert_eq!(periods[3].count, 1);
        assert_eq!(periods[3].avg_deviation, 0.0);
    }

    #[test]
    fn test_recommendation_thresholds() {
        // +30%: warning and raise
        let recs = recommendations(&[row("2024-03-01T01:00:00Z", 65.0, 50.0)]);
        assert_eq!(recs.len(), 2);
        assert!(recs[0].is_warning());
        assert!(matches!(recs[1], Recommendation::RaiseProfileSensitivity { .. }));

        // +10%: nothing
        assert!(recommendations(&[row("2024-03-01T01:00:00Z", 55.0, 50.0)]).is_empty());

        // -30%: warning and lower
        let recs = recommendations(&[row("2024-03-01T01:00:00Z", 35.0, 50.0)]);
        assert!(matches!(recs[1], Recommendation::LowerProfileSensitivity { .. }));
        assert!(recs[0].message().contains("-30%"));

        // exactly 20% and exactly 1.2x: neither threshold is crossed
        assert!(recommendations(&[row("2024-03-01T01:00:00Z", 60.0, 50.0)]).is_empty());

        assert!(recommendations(&[gap("2024-03-01T01:00:00Z")]).is_empty());
    }

    #[test]
    fn test_time_in_range() {
        let range = GlucoseRange::default();
        let tir = time_in_range(&[60.0, 70.0, 120.0, 180.0, 181.0], range);

        assert_eq!(tir.total, 5);
        assert_eq!(tir.below_percent, 20.0);
        assert_eq!(tir.in_range_percent, 60.0);
        assert_eq!(tir.above_percent, 20.0);

        assert_eq!(time_in_range(&[], range), TimeInRange::default());
    }

    #[test]
    fn test_time_in_range_custom_bounds() {
        let tir = time_in_range(&[75.0, 150.0], GlucoseRange { low: 80.0, high: 140.0 });
        assert_eq!(tir.below_percent, 50.0);
        assert_eq!(tir.above_percent, 50.0);
        assert_eq!(tir.in_range_percent, 0.0);
    }
}
