// 📦 Data Model - Raw upstream documents + reconciled domain records
//
// Raw types mirror what the upstream source sends (loose, everything optional).
// Domain types are what the pipeline stages hand to each other (strict, immutable).

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ============================================================================
// RAW UPSTREAM DOCUMENTS
// ============================================================================

/// One glucose reading as stored upstream
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawEntry {
    /// Epoch milliseconds
    #[serde(default)]
    pub date: Option<f64>,

    #[serde(rename = "dateString", default)]
    pub date_string: Option<String>,

    /// Sensor glucose value
    #[serde(default)]
    pub sgv: Option<f64>,

    /// Older uploaders send `glucose` instead of `sgv`
    #[serde(default)]
    pub glucose: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawDeviceStatus {
    #[serde(default)]
    pub created_at: Option<String>,

    #[serde(default)]
    pub openaps: Option<RawOpenAps>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawOpenAps {
    #[serde(default)]
    pub suggested: Option<RawSuggested>,
}

/// The "suggested" block written by the closed-loop algorithm
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawSuggested {
    #[serde(default)]
    pub bg: Option<f64>,

    #[serde(default)]
    pub sens: Option<f64>,

    #[serde(default)]
    pub sensitivities: Option<f64>,

    #[serde(default)]
    pub variable_sens: Option<f64>,

    #[serde(rename = "sensitivityRatio", default)]
    pub sensitivity_ratio: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawProfile {
    #[serde(rename = "startDate", default)]
    pub start_date: Option<String>,

    #[serde(rename = "defaultProfile", default)]
    pub default_profile: Option<String>,

    #[serde(default)]
    pub store: HashMap<String, RawProfileStore>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawProfileStore {
    #[serde(default)]
    pub sens: Vec<RawTimeValue>,

    #[serde(default)]
    pub timezone: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawTimeValue {
    pub time: String,
    pub value: f64,
}

/// Decode a JSON array payload element by element.
///
/// Elements that do not fit `T` are skipped instead of failing the whole
/// payload; a payload that is not a JSON array is an error.
pub fn decode_array<T>(payload: &[u8]) -> Result<Vec<T>, serde_json::Error>
where
    T: for<'de> Deserialize<'de>,
{
    let values: Vec<serde_json::Value> = serde_json::from_slice(payload)?;
    let total = values.len();

    let decoded: Vec<T> = values
        .into_iter()
        .filter_map(|v| serde_json::from_value(v).ok())
        .collect();

    if decoded.len() < total {
        log::debug!("Skipped {} undecodable documents", total - decoded.len());
    }

    Ok(decoded)
}

/// Parse an upstream timestamp (RFC 3339, or ISO without offset treated as UTC)
pub fn parse_instant(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();

    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }

    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }

    None
}

/// Epoch milliseconds → instant, `None` for NaN or out-of-range values
pub fn instant_from_millis(millis: f64) -> Option<DateTime<Utc>> {
    if !millis.is_finite() {
        return None;
    }
    Utc.timestamp_millis_opt(millis as i64).single()
}

// ============================================================================
// DOMAIN RECORDS
// ============================================================================

/// Normalized glucose reading
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GlucoseEntry {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

/// Device status snapshot that carried a "suggested" block
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceStatusRecord {
    pub created_at: DateTime<Utc>,
    pub suggested_bg: Option<f64>,
    pub dynamic_sensitivity: Option<f64>,
}

/// One breakpoint of a sensitivity schedule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleEntry {
    /// "HH:MM"
    pub time_of_day: String,
    pub value: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProfileStore {
    /// Unordered; sorting by minutes-since-midnight partitions the day
    pub sensitivity: Vec<ScheduleEntry>,
}

/// Configuration in effect from `effective_from` until a later version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileVersion {
    pub effective_from: DateTime<Utc>,
    pub default_store_name: String,
    /// IANA zone of the default store, as sent upstream
    pub timezone: Option<String>,
    pub stores: HashMap<String, ProfileStore>,
}

impl ProfileVersion {
    pub fn default_store(&self) -> Option<&ProfileStore> {
        self.stores.get(&self.default_store_name)
    }

    /// Fallback used when no profile could be fetched: `00:00 -> 50` from `effective_from`
    pub fn synthetic_default(effective_from: DateTime<Utc>) -> Self {
        let mut stores = HashMap::new();
        stores.insert(
            "Default".to_string(),
            ProfileStore {
                sensitivity: vec![ScheduleEntry {
                    time_of_day: "00:00".to_string(),
                    value: SYNTHETIC_PROFILE_SENSITIVITY,
                }],
            },
        );

        ProfileVersion {
            effective_from,
            default_store_name: "Default".to_string(),
            timezone: None,
            stores,
        }
    }
}

/// Sensitivity of the synthetic fallback profile
pub const SYNTHETIC_PROFILE_SENSITIVITY: f64 = 50.0;

impl TryFrom<RawProfile> for ProfileVersion {
    type Error = String;

    fn try_from(raw: RawProfile) -> Result<Self, Self::Error> {
        let effective_from = raw
            .start_date
            .as_deref()
            .and_then(parse_instant)
            .ok_or_else(|| format!("unparsable startDate {:?}", raw.start_date))?;

        let default_store_name = raw
            .default_profile
            .ok_or_else(|| "missing defaultProfile".to_string())?;

        let timezone = raw
            .store
            .get(&default_store_name)
            .and_then(|store| store.timezone.clone());

        let stores = raw
            .store
            .into_iter()
            .map(|(name, store)| {
                let sensitivity = store
                    .sens
                    .into_iter()
                    .map(|tv| ScheduleEntry {
                        time_of_day: tv.time,
                        value: tv.value,
                    })
                    .collect();
                (name, ProfileStore { sensitivity })
            })
            .collect();

        Ok(ProfileVersion {
            effective_from,
            default_store_name,
            timezone,
            stores,
        })
    }
}

/// Device-status-derived sensitivity sample (output of the device-status stage)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SensitivitySample {
    pub timestamp: DateTime<Utc>,
    pub bg: f64,
    pub isf_dynamic: f64,
    pub isf_profile: f64,
    pub deviation: f64,
}

/// Unit of output: one glucose reading with its reconciled sensitivity
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconciledRecord {
    pub timestamp: DateTime<Utc>,
    pub bg: f64,
    pub isf_dynamic: f64,
    pub isf_profile: f64,
    pub deviation: f64,
}

impl ReconciledRecord {
    /// Gap-filled row: glucose only, sensitivity fields zero
    pub fn glucose_only(timestamp: DateTime<Utc>, bg: f64) -> Self {
        ReconciledRecord {
            timestamp,
            bg,
            isf_dynamic: 0.0,
            isf_profile: 0.0,
            deviation: 0.0,
        }
    }

    /// True when a device-status sample was matched to this row
    pub fn has_sensitivity(&self) -> bool {
        self.isf_profile != 0.0
    }
}

/// Averages for one hour-of-day bucket across the whole requested range
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HourlyAggregate {
    pub hour: u32,
    pub avg_deviation: f64,
    pub avg_isf_dynamic: f64,
    pub avg_isf_profile: f64,
    #[serde(rename = "count")]
    pub sample_count: usize,
}

/// `(dynamic - profile) / profile * 100`, `None` when the profile value is zero
pub fn deviation_percent(isf_dynamic: f64, isf_profile: f64) -> Option<f64> {
    if isf_profile == 0.0 {
        return None;
    }
    Some((isf_dynamic - isf_profile) / isf_profile * 100.0)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_instant_formats() {
        let a = parse_instant("2024-03-01T06:30:00Z").unwrap();
        let b = parse_instant("2024-03-01T03:30:00-03:00").unwrap();
        let c = parse_instant("2024-03-01T06:30:00.000").unwrap();

        assert_eq!(a, b);
        assert_eq!(a, c);
        assert!(parse_instant("yesterday").is_none());
    }

    #[test]
    fn test_instant_from_millis_rejects_nan() {
        assert!(instant_from_millis(f64::NAN).is_none());
        assert_eq!(
            instant_from_millis(1_709_274_600_000.0).unwrap(),
            parse_instant("2024-03-01T06:30:00Z").unwrap()
        );
    }

    #[test]
    fn test_decode_array_skips_bad_elements() {
        let payload = br#"[{"date": 1709274600000, "sgv": 120}, {"sgv": "high"}, {"date": 1709274900000}]"#;
        let entries: Vec<RawEntry> = decode_array(payload).unwrap();

        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].sgv, Some(120.0));

        assert!(decode_array::<RawEntry>(b"{\"error\": 1}").is_err());
    }

    #[test]
    fn test_profile_version_from_raw() {
        let raw: RawProfile = serde_json::from_str(
            r#"{
                "startDate": "2024-01-01T00:00:00.000Z",
                "defaultProfile": "Day",
                "store": {
                    "Day": {"timezone": "Europe/Lisbon", "sens": [{"time": "00:00", "value": 45}, {"time": "12:00", "value": 55}]},
                    "Night": {"timezone": "Asia/Tokyo", "sens": []}
                }
            }"#,
        )
        .unwrap();

        let version = ProfileVersion::try_from(raw).unwrap();
        assert_eq!(version.default_store_name, "Day");
        assert_eq!(version.timezone.as_deref(), Some("Europe/Lisbon"));
        assert_eq!(version.default_store().unwrap().sensitivity.len(), 2);
    }

    #[test]
    fn test_profile_version_requires_start_date() {
        let raw = RawProfile {
            start_date: None,
            default_profile: Some("Day".to_string()),
            store: HashMap::new(),
        };
        assert!(ProfileVersion::try_from(raw).is_err());
    }

    #[test]
    fn test_synthetic_default_profile() {
        let start = parse_instant("2024-03-01T00:00:00Z").unwrap();
        let version = ProfileVersion::synthetic_default(start);

        let store = version.default_store().unwrap();
        assert_eq!(store.sensitivity[0].time_of_day, "00:00");
        assert_eq!(store.sensitivity[0].value, 50.0);
        assert_eq!(version.effective_from, start);
        assert!(version.timezone.is_none());
    }

    #[test]
    fn test_deviation_percent_sign_and_zero() {
        assert_eq!(deviation_percent(60.0, 50.0), Some(20.0));
        assert_eq!(deviation_percent(50.0, 50.0), Some(0.0));
        assert!(deviation_percent(40.0, 50.0).unwrap() < 0.0);
        assert_eq!(deviation_percent(40.0, 0.0), None);
    }
}
