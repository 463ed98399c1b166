//! Stand-in analysis backend
//!
//! Serves the three routes the client uses, with injectable latency and
//! failures. Backs the `sap-stub-backend` binary and the integration tests.

use crate::pipeline::{AnalysisRequest, AnalyzeResponse, DisplayData};
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

/// How the stub answers
#[derive(Debug, Clone, Default)]
pub struct StubBehavior {
    /// Delay before `/api/analyze` answers
    pub latency: Duration,
    /// Answer `/api/analyze` with this status and `fail_body`
    pub fail_status: Option<u16>,
    pub fail_body: String,
    /// Fixed humanized text instead of the generated summary
    pub reply: Option<String>,
    /// Served from `/api/readme`
    pub readme: Option<String>,
}

/// Shared state for the stub routes
#[derive(Debug, Default)]
pub struct StubState {
    pub behavior: StubBehavior,
    analyze_calls: AtomicUsize,
    health_calls: AtomicUsize,
}

impl StubState {
    pub fn new(behavior: StubBehavior) -> Self {
        Self {
            behavior,
            ..Default::default()
        }
    }

    pub fn analyze_calls(&self) -> usize {
        self.analyze_calls.load(Ordering::SeqCst)
    }

    pub fn health_calls(&self) -> usize {
        self.health_calls.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Debug, Serialize)]
struct ReadmeResponse {
    readme_content: Option<String>,
}

/// Create the stub router
pub fn create_router(state: Arc<StubState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/analyze", post(analyze))
        .route("/api/readme", get(readme))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind `addr` and serve in the background. Returns the bound address,
/// which differs from `addr` when port 0 was requested.
pub async fn spawn(
    state: Arc<StubState>,
    addr: SocketAddr,
) -> std::io::Result<(SocketAddr, JoinHandle<std::io::Result<()>>)> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let local = listener.local_addr()?;
    let app = create_router(state);

    info!("Stub backend listening on {}", local);
    let handle = tokio::spawn(async move { axum::serve(listener, app).await });
    Ok((local, handle))
}

async fn health_check(State(state): State<Arc<StubState>>) -> Json<HealthResponse> {
    state.health_calls.fetch_add(1, Ordering::SeqCst);
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn readme(State(state): State<Arc<StubState>>) -> Json<ReadmeResponse> {
    Json(ReadmeResponse {
        readme_content: state.behavior.readme.clone(),
    })
}

async fn analyze(
    State(state): State<Arc<StubState>>,
    Json(request): Json<AnalysisRequest>,
) -> Response {
    state.analyze_calls.fetch_add(1, Ordering::SeqCst);
    let behavior = &state.behavior;

    if !behavior.latency.is_zero() {
        tokio::time::sleep(behavior.latency).await;
    }

    if let Some(status) = behavior.fail_status {
        let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        return (status, behavior.fail_body.clone()).into_response();
    }

    if request.text.trim().is_empty() {
        return (StatusCode::BAD_REQUEST, "text must not be empty").into_response();
    }

    let words = request.text.split_whitespace().count();
    let lines = request.text.lines().count();
    let characters = request.text.chars().count();

    let humanized_text = behavior.reply.clone().unwrap_or_else(|| {
        let mut summary = format!("The text has {words} words across {lines} lines.");
        if !request.question.is_empty() {
            summary.push_str(&format!(" You asked: {}", request.question));
        }
        summary
    });

    Json(AnalyzeResponse {
        display_data: DisplayData {
            humanized_text,
            technical_data: Some(json!({
                "characters": characters,
                "words": words,
                "lines": lines,
            })),
        },
    })
    .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_counters_start_at_zero() {
        let state = StubState::new(StubBehavior::default());
        assert_eq!(state.analyze_calls(), 0);
        assert_eq!(state.health_calls(), 0);
    }

    #[tokio::test]
    async fn test_spawn_binds_ephemeral_port() {
        let state = Arc::new(StubState::default());
        let (addr, handle) = spawn(state, SocketAddr::from(([127, 0, 0, 1], 0)))
            .await
            .unwrap();
        assert_ne!(addr.port(), 0);
        handle.abort();
    }
}
