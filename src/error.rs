// 🚨 Pipeline errors + degradation flags

use serde::{Deserialize, Serialize};

// ============================================================================
// DEGRADATION
// ============================================================================

/// Non-fatal condition: the pipeline kept going with reduced accuracy.
///
/// Every degradation is logged and carried in the report so the output is
/// never presented as exact when it is not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Degradation {
    /// Device-status retrieval failed; output is entries-only
    DeviceStatusUnavailable { reason: String },

    /// Device-status retrieval returned nothing; output is entries-only
    DeviceStatusEmpty,

    /// Profiles failed, timed out or were empty; a synthetic default was used
    SyntheticProfile { reason: String },
}

impl Degradation {
    pub fn describe(&self) -> String {
        match self {
            Degradation::DeviceStatusUnavailable { reason } => {
                format!("device status unavailable ({}), showing glucose only", reason)
            }
            Degradation::DeviceStatusEmpty => {
                "no device status in range, showing glucose only".to_string()
            }
            Degradation::SyntheticProfile { reason } => {
                format!("profile unavailable ({}), using default sensitivity", reason)
            }
        }
    }
}

// ============================================================================
// PIPELINE ERROR
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum PipelineError {
    /// Malformed or inverted date range, invalid connection details.
    /// Raised before any network call.
    Validation(String),

    /// Entries retrieval failed or returned no data. Fatal.
    Upstream(String),

    /// Device-status or profile retrieval failed. Non-fatal.
    Degraded(Degradation),

    /// Settings could not be loaded
    Config(String),
}

impl PipelineError {
    pub fn is_fatal(&self) -> bool {
        !matches!(self, PipelineError::Degraded(_))
    }

    /// Message suitable for showing to an end user
    pub fn user_message(&self) -> String {
        match self {
            PipelineError::Validation(msg) => format!("Invalid request: {}", msg),
            PipelineError::Upstream(msg) => {
                format!("Error connecting to the data source. {}", msg)
            }
            PipelineError::Degraded(d) => d.describe(),
            PipelineError::Config(msg) => format!("Configuration error: {}", msg),
        }
    }
}

impl std::fmt::Display for PipelineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineError::Validation(msg) => write!(f, "validation error: {}", msg),
            PipelineError::Upstream(msg) => write!(f, "upstream error: {}", msg),
            PipelineError::Degraded(d) => write!(f, "degraded data: {}", d.describe()),
            PipelineError::Config(msg) => write!(f, "config error: {}", msg),
        }
    }
}

impl std::error::Error for PipelineError {}

impl From<Degradation> for PipelineError {
    fn from(d: Degradation) -> Self {
        PipelineError::Degraded(d)
    }
}
