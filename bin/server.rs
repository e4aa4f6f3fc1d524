// Sensitivity Insight - Web Server
// REST API over the sensitivity pipeline with Axum

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use sensitivity_insight::{
    ConnectionConfig, DateRange, FetchOutcome, NightscoutClient, NoProgress, PipelineError,
    SensitivityPipeline, Settings,
};

/// Shared application state
#[derive(Clone)]
struct AppState {
    pipeline: Arc<SensitivityPipeline>,
    client: Arc<NightscoutClient>,
}

/// API Response wrapper
#[derive(Serialize)]
struct ApiResponse<T> {
    success: bool,
    data: T,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T> ApiResponse<T> {
    fn ok(data: T) -> Self {
        Self {
            success: true,
            data,
            error: None,
        }
    }
}

impl ApiResponse<()> {
    fn failure(message: String) -> Self {
        Self {
            success: false,
            data: (),
            error: Some(message),
        }
    }
}

fn error_response(status: StatusCode, message: String) -> Response {
    (status, Json(ApiResponse::failure(message))).into_response()
}

fn status_for(error: &PipelineError) -> StatusCode {
    match error {
        PipelineError::Validation(_) => StatusCode::BAD_REQUEST,
        PipelineError::Upstream(_) => StatusCode::BAD_GATEWAY,
        PipelineError::Degraded(_) | PipelineError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

#[derive(Deserialize)]
struct RangeParams {
    start: String,
    end: String,
}

// ============================================================================
// API Handlers
// ============================================================================

/// GET /api/health - Health check
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let status = if state.pipeline.is_fetching() { "FETCHING" } else { "OK" };
    Json(ApiResponse::ok(status))
}

/// GET /api/sensitivity?start=YYYY-MM-DD&end=YYYY-MM-DD - Run the pipeline
async fn get_sensitivity(
    State(state): State<AppState>,
    Query(params): Query<RangeParams>,
) -> Response {
    let range = match DateRange::parse(&params.start, &params.end) {
        Ok(range) => range,
        Err(e) => return error_response(status_for(&e), e.user_message()),
    };

    match state.pipeline.fetch(range, &NoProgress).await {
        Ok(FetchOutcome::Completed(report)) => {
            (StatusCode::OK, Json(ApiResponse::ok(report.as_ref()))).into_response()
        }
        Ok(FetchOutcome::Rejected) => error_response(
            StatusCode::CONFLICT,
            "A fetch is already in progress".to_string(),
        ),
        Err(e) => {
            log::error!("Error computing sensitivity for {} to {}: {}", params.start, params.end, e);
            error_response(status_for(&e), e.user_message())
        }
    }
}

/// GET /api/sensitivity/latest - Last successful report
async fn get_latest(State(state): State<AppState>) -> Response {
    match state.pipeline.latest() {
        Some(report) => (StatusCode::OK, Json(ApiResponse::ok(report.as_ref()))).into_response(),
        None => error_response(StatusCode::NOT_FOUND, "No report available".to_string()),
    }
}

/// POST /api/test-connection - Check the upstream status endpoint
async fn test_connection(State(state): State<AppState>) -> Response {
    match state.client.test_connection().await {
        Ok(status) => (StatusCode::OK, Json(ApiResponse::ok(status))).into_response(),
        Err(e) => {
            log::warn!("Connection test failed: {}", e);
            error_response(StatusCode::BAD_GATEWAY, e.to_string())
        }
    }
}

// ============================================================================
// Main Server
// ============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    env_logger::init();

    println!("🌐 Sensitivity Insight - Web Server");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let settings = Settings::from_env()?;
    let config = ConnectionConfig::from_env()?;
    println!("✓ Upstream: {}", config.base_url);

    let client = Arc::new(NightscoutClient::new(config, settings.request_timeout)?);
    let pipeline = Arc::new(SensitivityPipeline::new(client.clone(), settings));

    // Create shared state
    let state = AppState { pipeline, client };

    // Build API routes
    let api_routes = Router::new()
        .route("/health", get(health_check))
        .route("/sensitivity", get(get_sensitivity))
        .route("/sensitivity/latest", get(get_latest))
        .route("/test-connection", post(test_connection))
        .with_state(state);

    let app = Router::new()
        .nest("/api", api_routes)
        .layer(ServiceBuilder::new().layer(CorsLayer::permissive()));

    // Start server
    let addr = std::env::var("SERVER_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".to_string());
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    println!("\n🚀 Server running on http://{}", addr);
    println!("   API: http://{}/api/sensitivity?start=2024-03-01&end=2024-03-07", addr);
    println!("\n   Press Ctrl+C to stop\n");

    axum::serve(listener, app).await?;
    Ok(())
}
