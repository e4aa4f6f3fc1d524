// Sensitivity Insight - Core Library
// Reconciles glucose readings, device-status snapshots and versioned profiles
// into one aligned record stream with dynamic-vs-profile sensitivity deviation.
// Exposes all modules for use in CLI, API server, and tests

pub mod config;
pub mod error;
pub mod model;
pub mod cache;          // TTL cache for upstream payloads
pub mod upstream;       // Upstream source trait + HTTP client
pub mod profile;        // Profile version selection + schedule lookup
pub mod chunked;        // Chunked processing with cooperative yields
pub mod entries;        // Entry Processor
pub mod device_status;  // Device-Status Processor
pub mod merge;          // Merge + hourly aggregation
pub mod stats;          // Derived statistics over the reconciled series
pub mod pipeline;       // Fetch layer + orchestration
pub mod export;         // CSV export

// Re-export commonly used types
pub use config::{ConnectionConfig, GlucoseRange, SensorInterval, Settings};
pub use error::{Degradation, PipelineError};
pub use model::{
    GlucoseEntry, DeviceStatusRecord, ProfileVersion, ProfileStore, ScheduleEntry,
    SensitivitySample, ReconciledRecord, HourlyAggregate,
    RawEntry, RawDeviceStatus, RawProfile,
};
pub use cache::{TtlCache, DatasetKind, cache_key};
pub use upstream::{UpstreamSource, UpstreamQuery, NightscoutClient, FetchError};
pub use profile::{LocalZone, ProfileResolver};
pub use chunked::{Progress, ProgressSink, NoProgress, Stage};
pub use device_status::{extract_dynamic_sensitivity, is_usable_sample, SENSITIVITY_RATIO_NUMERATOR};
pub use merge::{merge_series, hourly_aggregates, ReconciledSeries};
pub use stats::{DayPeriod, PeriodStats, Recommendation, SensitivityStats, TimeInRange};
pub use pipeline::{
    SensitivityPipeline, SensitivityReport, FetchOutcome, DateRange,
    FlightGuard, ProfileSource, reconcile,
};
pub use export::{write_csv, write_csv_file};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
