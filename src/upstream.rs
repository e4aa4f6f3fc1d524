// 🌐 Upstream Source - Thin HTTP retrieval of entries, device status and profiles
//
// The pipeline only sees the `UpstreamSource` trait; `NightscoutClient` is the
// real implementation, tests plug in in-memory sources.

use crate::cache::DatasetKind;
use crate::config::ConnectionConfig;
use crate::error::PipelineError;
use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::StatusCode;
use std::time::Duration;

// ============================================================================
// QUERY
// ============================================================================

/// One upstream retrieval: dataset + calendar range (+ optional count hint)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamQuery {
    pub kind: DatasetKind,
    pub start: NaiveDate,
    /// Already extended by one day past the requested end
    pub end: NaiveDate,
    pub count: Option<i64>,
}

impl UpstreamQuery {
    /// Field the range filter applies to
    pub fn filter_field(&self) -> &'static str {
        match self.kind {
            DatasetKind::Entries => "dateString",
            DatasetKind::DeviceStatus => "created_at",
            DatasetKind::Profiles => "startDate",
        }
    }

    /// `/api/v1/<kind>?find[field][$gte]=..&find[field][$lte]=..[&count=N]`
    pub fn path_and_query(&self) -> String {
        let field = self.filter_field();
        let gte = format!("find[{}][$gte]", field);
        let lte = format!("find[{}][$lte]", field);

        let mut url = format!(
            "/api/v1/{}?{}={}&{}={}",
            self.kind.as_str(),
            urlencoding::encode(&gte),
            urlencoding::encode(&self.start.to_string()),
            urlencoding::encode(&lte),
            urlencoding::encode(&self.end.to_string()),
        );

        if let Some(count) = self.count {
            url.push_str(&format!("&count={}", count));
        }

        url
    }
}

// ============================================================================
// FETCH ERROR
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum FetchError {
    /// 401 from upstream
    Unauthorized(String),

    /// 404 from upstream
    NotFound(String),

    /// Any other non-success status
    Status(u16),

    /// Connection, TLS or body decoding failure
    Transport(String),

    /// Request did not finish within its deadline
    Timeout,
}

impl std::fmt::Display for FetchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FetchError::Unauthorized(details) => {
                write!(f, "Authentication error: check your API secret ({})", details)
            }
            FetchError::NotFound(url) => {
                write!(f, "URL not found, check the data source URL: {}", url)
            }
            FetchError::Status(code) => write!(f, "HTTP error! status: {}", code),
            FetchError::Transport(msg) => write!(f, "transport error: {}", msg),
            FetchError::Timeout => write!(f, "request timed out"),
        }
    }
}

impl std::error::Error for FetchError {}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            FetchError::Timeout
        } else {
            FetchError::Transport(e.to_string())
        }
    }
}

// ============================================================================
// UPSTREAM SOURCE TRAIT
// ============================================================================

#[async_trait]
pub trait UpstreamSource: Send + Sync {
    /// Raw JSON payload for `query`
    async fn fetch(&self, query: &UpstreamQuery) -> Result<Vec<u8>, FetchError>;

    /// Short name for logging
    fn source_name(&self) -> &str;
}

// ============================================================================
// NIGHTSCOUT CLIENT
// ============================================================================

pub struct NightscoutClient {
    config: ConnectionConfig,
    http: reqwest::Client,
}

impl NightscoutClient {
    /// `request_timeout` bounds every call made through this client
    pub fn new(config: ConnectionConfig, request_timeout: Duration) -> Result<Self, PipelineError> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| PipelineError::Config(format!("HTTP client: {}", e)))?;

        Ok(NightscoutClient { config, http })
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Absolute URL for a path, with duplicate slashes collapsed
    pub fn url_for(&self, path_and_query: &str) -> String {
        let joined = format!("{}/{}", self.config.base_url, path_and_query.trim_start_matches('/'));
        collapse_slashes(&joined)
    }

    async fn get(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        // The secret travels in a header, so the URL is safe to log
        log::info!("Requesting {}", url);

        let response = self
            .http
            .get(url)
            .header("Accept", "application/json")
            .header("Content-Type", "application/json")
            .header("API-SECRET", &self.config.api_secret)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            log::error!("Upstream responded {} for {}", status, url);

            return Err(match status {
                StatusCode::UNAUTHORIZED => {
                    let body = response.text().await.unwrap_or_default();
                    FetchError::Unauthorized(body)
                }
                StatusCode::NOT_FOUND => FetchError::NotFound(url.to_string()),
                other => FetchError::Status(other.as_u16()),
            });
        }

        Ok(response.bytes().await?.to_vec())
    }

    /// Check that the base URL and secret work by reading `status.json`
    pub async fn test_connection(&self) -> Result<serde_json::Value, FetchError> {
        let url = self.url_for("/api/v1/status.json");
        let body = self.get(&url).await?;

        serde_json::from_slice(&body)
            .map_err(|e| FetchError::Transport(format!("status.json is not valid JSON: {}", e)))
    }
}

#[async_trait]
impl UpstreamSource for NightscoutClient {
    async fn fetch(&self, query: &UpstreamQuery) -> Result<Vec<u8>, FetchError> {
        let url = self.url_for(&query.path_and_query());
        self.get(&url).await
    }

    fn source_name(&self) -> &str {
        &self.config.base_url
    }
}

/// Collapse runs of `/` after the scheme separator
fn collapse_slashes(url: &str) -> String {
    let (scheme, rest) = match url.find("://") {
        Some(idx) => url.split_at(idx + 3),
        None => ("", url),
    };

    let mut out = String::with_capacity(url.len());
    out.push_str(scheme);

    let mut previous_slash = false;
    for c in rest.chars() {
        if c == '/' && previous_slash {
            continue;
        }
        previous_slash = c == '/';
        out.push(c);
    }

    out
}

// ============================================================================
// TESTS
// ============================================================================
