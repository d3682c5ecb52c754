use axum::{
    extract::State,
    routing::get,
    Json, Router,
};
use chrono::Utc;
use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::models::{CheckResult, Endpoint, Measurement, MonitorState};

/// Last known results, kept for the local status API.
#[derive(Clone, Default)]
pub struct StatusBoard {
    state: Arc<Mutex<MonitorState>>,
}

impl StatusBoard {
    pub async fn record(&self, endpoint: &Endpoint, m: &Measurement) {
        let result = CheckResult {
            target: endpoint.to_string(),
            timestamp: Utc::now(),
            success: m.success,
            rtt_ms: m.rtt_ms,
            message: m.raw.lines().map(str::trim).find(|l| !l.is_empty()).unwrap_or_default().to_string(),
        };
        let mut state = self.state.lock().await;
        // A loop may finish one last probe after it was dropped.
        if state.monitored.contains(endpoint) {
            state.last_results.insert(endpoint.clone(), result);
        }
    }

    /// Replaces the monitored set and forgets results of dropped endpoints.
    pub async fn set_monitored(&self, monitored: BTreeSet<Endpoint>) {
        let mut state = self.state.lock().await;
        state.last_results.retain(|e, _| monitored.contains(e));
        state.monitored = monitored;
    }

    pub async fn monitored(&self) -> Vec<String> {
        let state = self.state.lock().await;
        state.monitored.iter().map(Endpoint::to_string).collect()
    }

    pub async fn results(&self) -> Vec<CheckResult> {
        let state = self.state.lock().await;
        let mut results: Vec<_> = state.last_results.values().cloned().collect();
        results.sort_by(|a, b| a.target.cmp(&b.target));
        results
    }
}

pub async fn get_targets(State(board): State<StatusBoard>) -> Json<Vec<String>> {
    Json(board.monitored().await)
}

pub async fn get_stats(State(board): State<StatusBoard>) -> Json<Vec<CheckResult>> {
    Json(board.results().await)
}

pub fn create_router(board: StatusBoard) -> Router {
    Router::new()
        .route("/api/targets", get(get_targets))
        .route("/api/stats", get(get_stats))
        .layer(TraceLayer::new_for_http())
        .with_state(board)
}

/// Serves the status API on localhost until `shutdown` fires.
pub async fn start_server(port: u16, board: StatusBoard, shutdown: CancellationToken) -> std::io::Result<()> {
    let app = create_router(board);
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Status API: http://localhost:{}", addr.port());
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}
