// ⚙️ Configuration - Upstream connection + pipeline settings
// Loaded from environment variables (optionally seeded from a .env file)

use crate::error::PipelineError;
use chrono::FixedOffset;
use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Minimum length the upstream accepts for an API secret
pub const MIN_API_SECRET_LEN: usize = 12;

// ============================================================================
// CONNECTION CONFIG
// ============================================================================

/// Where the upstream data source lives and how to authenticate against it.
///
/// Opaque to the fetch layer: only the upstream client looks inside.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    pub base_url: String,

    #[serde(skip_serializing)]
    pub api_secret: String,
}

impl ConnectionConfig {
    /// Build a validated config. Trailing slashes on the base URL are stripped.
    pub fn new(base_url: &str, api_secret: &str) -> Result<Self, PipelineError> {
        let base_url = base_url.trim().trim_end_matches('/').to_string();

        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(PipelineError::Validation(format!(
                "Invalid upstream URL: {}",
                base_url
            )));
        }

        if base_url.split("://").nth(1).map_or(true, |host| host.is_empty()) {
            return Err(PipelineError::Validation(
                "Upstream URL has no host".to_string(),
            ));
        }

        if api_secret.chars().count() < MIN_API_SECRET_LEN {
            return Err(PipelineError::Validation(format!(
                "API secret must have at least {} characters",
                MIN_API_SECRET_LEN
            )));
        }

        Ok(ConnectionConfig {
            base_url,
            api_secret: api_secret.to_string(),
        })
    }

    /// Load from `NIGHTSCOUT_URL` and `NIGHTSCOUT_API_SECRET`
    pub fn from_env() -> Result<Self, PipelineError> {
        let url = env::var("NIGHTSCOUT_URL").map_err(|_| {
            PipelineError::Config("NIGHTSCOUT_URL is not set".to_string())
        })?;
        let secret = env::var("NIGHTSCOUT_API_SECRET").map_err(|_| {
            PipelineError::Config("NIGHTSCOUT_API_SECRET is not set".to_string())
        })?;

        Self::new(&url, &secret)
    }
}

// ============================================================================
// SENSOR INTERVAL
// ============================================================================

/// Nominal sampling interval of the glucose sensor.
///
/// Only affects the expected point count sent upstream as a limit hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SensorInterval {
    OneMinute,
    FiveMinutes,
}

impl SensorInterval {
    pub fn minutes(&self) -> i64 {
        match self {
            SensorInterval::OneMinute => 1,
            SensorInterval::FiveMinutes => 5,
        }
    }

    pub fn from_minutes(minutes: i64) -> Result<Self, PipelineError> {
        match minutes {
            1 => Ok(SensorInterval::OneMinute),
            5 => Ok(SensorInterval::FiveMinutes),
            other => Err(PipelineError::Config(format!(
                "Sensor interval must be 1 or 5 minutes, got {}",
                other
            ))),
        }
    }
}

impl Default for SensorInterval {
    fn default() -> Self {
        SensorInterval::FiveMinutes
    }
}

// ============================================================================
// GLUCOSE RANGE
// ============================================================================

/// Target glucose range (mg/dL) used for time-in-range percentages
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GlucoseRange {
    pub low: f64,
    pub high: f64,
}

impl Default for GlucoseRange {
    fn default() -> Self {
        GlucoseRange { low: 70.0, high: 180.0 }
    }
}

// ============================================================================
// SETTINGS
// ============================================================================

#[derive(Debug, Clone)]
pub struct Settings {
    /// Sampling interval used for the expected-count hint
    pub sensor_interval: SensorInterval,

    /// How long a fetched payload stays reusable (default: 5 min)
    pub cache_ttl: Duration,

    /// Bounded wait for the optional profile retrieval (default: 10 s)
    pub profile_timeout: Duration,

    /// Per-request timeout applied to every upstream call (default: 30 s)
    pub request_timeout: Duration,

    /// Records processed between cooperative yields (default: 100)
    pub chunk_size: usize,

    /// Offset for time-of-day computations when the profile names no
    /// usable time zone (default: UTC)
    pub utc_offset_minutes: i32,

    /// Target range for time-in-range (default: 70-180 mg/dL)
    pub glucose_range: GlucoseRange,
}

impl Settings {
    pub fn new() -> Self {
        Settings {
            sensor_interval: SensorInterval::default(),
            cache_ttl: Duration::from_secs(300),
            profile_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            chunk_size: 100,
            utc_offset_minutes: 0,
            glucose_range: GlucoseRange::default(),
        }
    }

    /// Load settings from environment variables
    ///
    /// Environment variables:
    /// - `SENSOR_INTERVAL_MINUTES` (default: 5, allowed: 1 or 5)
    /// - `CACHE_TTL_SECS` (default: 300)
    /// - `PROFILE_TIMEOUT_SECS` (default: 10)
    /// - `REQUEST_TIMEOUT_SECS` (default: 30)
    /// - `CHUNK_SIZE` (default: 100)
    /// - `UTC_OFFSET_MINUTES` (default: 0)
    /// - `GLUCOSE_RANGE_LOW` / `GLUCOSE_RANGE_HIGH` (default: 70 / 180)
    ///
    /// A variable that is set but does not parse is an error.
    pub fn from_env() -> Result<Self, PipelineError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Same as `from_env`, reading variables through `lookup`
    pub fn from_lookup<F>(lookup: F) -> Result<Self, PipelineError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Settings::new();
        let secs = |name: &str, default: Duration| -> Result<Duration, PipelineError> {
            Ok(parse_var::<u64, _>(&lookup, name)?.map_or(default, Duration::from_secs))
        };

        let sensor_interval = match parse_var::<i64, _>(&lookup, "SENSOR_INTERVAL_MINUTES")? {
            Some(minutes) => SensorInterval::from_minutes(minutes)?,
            None => defaults.sensor_interval,
        };

        let settings = Settings {
            sensor_interval,
            cache_ttl: secs("CACHE_TTL_SECS", defaults.cache_ttl)?,
            profile_timeout: secs("PROFILE_TIMEOUT_SECS", defaults.profile_timeout)?,
            request_timeout: secs("REQUEST_TIMEOUT_SECS", defaults.request_timeout)?,
            chunk_size: parse_var(&lookup, "CHUNK_SIZE")?.unwrap_or(defaults.chunk_size),
            utc_offset_minutes: parse_var(&lookup, "UTC_OFFSET_MINUTES")?
                .unwrap_or(defaults.utc_offset_minutes),
            glucose_range: GlucoseRange {
                low: parse_var(&lookup, "GLUCOSE_RANGE_LOW")?.unwrap_or(defaults.glucose_range.low),
                high: parse_var(&lookup, "GLUCOSE_RANGE_HIGH")?.unwrap_or(defaults.glucose_range.high),
            },
        };

        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.chunk_size == 0 {
            return Err(PipelineError::Config("Chunk size must be at least 1".to_string()));
        }
        if self.utc_offset().is_none() {
            return Err(PipelineError::Config(format!(
                "UTC offset out of range: {} minutes",
                self.utc_offset_minutes
            )));
        }
        if !(self.glucose_range.low < self.glucose_range.high) {
            return Err(PipelineError::Config(format!(
                "Glucose range low ({}) must be below high ({})",
                self.glucose_range.low, self.glucose_range.high
            )));
        }
        Ok(())
    }

    /// Fallback offset for time-of-day computations, `None` if out of range (±24h)
    pub fn utc_offset(&self) -> Option<FixedOffset> {
        FixedOffset::east_opt(self.utc_offset_minutes * 60)
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self::new()
    }
}

/// `Ok(None)` when unset, `Err` when set but unparsable
fn parse_var<T, F>(lookup: &F, name: &str) -> Result<Option<T>, PipelineError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| PipelineError::Config(format!("Invalid {}: {:?}", name, raw))),
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_connection_config_strips_trailing_slash() {
        let config = ConnectionConfig::new("https://cgm.example.com//", "0123456789abcdef").unwrap();
        assert_eq!(config.base_url, "https://cgm.example.com");
    }

    #[test]
    fn test_connection_config_rejects_bad_url() {
        let err = ConnectionConfig::new("cgm.example.com", "0123456789abcdef").unwrap_err();
        assert!(matches!(err, PipelineError::Validation(_)));

        let err = ConnectionConfig::new("https://", "0123456789abcdef").unwrap_err();
        assert!(matches!(err, PipelineError::Validation(_)));
    }

    #[test]
    fn test_connection_config_rejects_short_secret() {
        let err = ConnectionConfig::new("https://cgm.example.com", "short").unwrap_err();
        assert!(err.to_string().contains("12"));
    }

    #[test]
    fn test_sensor_interval_parsing() {
        assert_eq!(SensorInterval::from_minutes(1).unwrap(), SensorInterval::OneMinute);
        assert_eq!(SensorInterval::from_minutes(5).unwrap().minutes(), 5);
        assert!(SensorInterval::from_minutes(3).is_err());
    }

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.chunk_size, 100);
        assert_eq!(settings.profile_timeout, Duration::from_secs(10));
        assert_eq!(settings.sensor_interval, SensorInterval::FiveMinutes);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_settings_validation() {
        let mut settings = Settings::new();
        settings.chunk_size = 0;
        assert!(settings.validate().is_err());

        let mut settings = Settings::new();
        settings.utc_offset_minutes = 25 * 60;
        assert!(settings.validate().is_err());

        settings.utc_offset_minutes = -180;
        assert_eq!(settings.utc_offset().unwrap().local_minus_utc(), -180 * 60);
    }

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_settings_from_lookup() {
        let settings = Settings::from_lookup(lookup(&[
            ("SENSOR_INTERVAL_MINUTES", "1"),
            ("CACHE_TTL_SECS", "60"),
            ("CHUNK_SIZE", " 250 "),
            ("UTC_OFFSET_MINUTES", "-180"),
            ("GLUCOSE_RANGE_LOW", "80"),
        ]))
        .unwrap();

        assert_eq!(settings.sensor_interval, SensorInterval::OneMinute);
        assert_eq!(settings.cache_ttl, Duration::from_secs(60));
        assert_eq!(settings.chunk_size, 250);
        assert_eq!(settings.utc_offset_minutes, -180);
        assert_eq!(settings.glucose_range, GlucoseRange { low: 80.0, high: 180.0 });
        assert_eq!(settings.request_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_unparsable_variables_are_errors() {
        for (name, value) in [
            ("CHUNK_SIZE", "lots"),
            ("UTC_OFFSET_MINUTES", "-3h"),
            ("CACHE_TTL_SECS", "5m"),
            ("PROFILE_TIMEOUT_SECS", "-1"),
            ("REQUEST_TIMEOUT_SECS", ""),
            ("GLUCOSE_RANGE_HIGH", "high"),
        ] {
            let err = Settings::from_lookup(lookup(&[(name, value)])).unwrap_err();
            assert!(matches!(err, PipelineError::Config(_)), "{} = {:?}", name, value);
            assert!(err.to_string().contains(name));
        }
    }

    #[test]
    fn test_inverted_glucose_range_rejected() {
        let err = Settings::from_lookup(lookup(&[
            ("GLUCOSE_RANGE_LOW", "200"),
            ("GLUCOSE_RANGE_HIGH", "180"),
        ]))
        .unwrap_err();
        assert!(matches!(err, PipelineError::Config(_)));
    }
}
