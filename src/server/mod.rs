//! HTTP server for the sync trigger and status API
//!
//! Provides:
//! - Health check (`/health`)
//! - Manual sync trigger (`POST /api/v1/sync`)
//! - Read-only views over runs, series, observations, gaps and checkpoints

pub mod handlers;
pub mod types;

use crate::config::ServerConfig;
use crate::error::{Result, SyncError};
use crate::state::AppState;
use axum::{
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

pub use types::ApiResponse;

/// Build the router with all routes
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/api/v1/sync", post(handlers::trigger_sync))
        .route("/api/v1/status", get(handlers::get_status))
        .route("/api/v1/runs", get(handlers::list_runs))
        .route("/api/v1/series", get(handlers::list_series))
        .route(
            "/api/v1/series/:id/observations",
            get(handlers::get_observations),
        )
        .route("/api/v1/series/:id/gaps", get(handlers::get_gaps))
        .route("/api/v1/checkpoints", get(handlers::list_checkpoints))
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

/// API server manager
pub struct ApiServer {
    state: Arc<AppState>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    local_addr: Option<SocketAddr>,
}

impl ApiServer {
    pub fn new(state: Arc<AppState>) -> Self {
        Self {
            state,
            shutdown_tx: None,
            local_addr: None,
        }
    }

    /// Bind and serve in a background task. The server also stops when the
    /// application shutdown token fires.
    pub async fn start(&mut self, config: &ServerConfig) -> Result<SocketAddr> {
        let addr: SocketAddr = format!("{}:{}", config.host, config.port)
            .parse()
            .map_err(|e| SyncError::Config(format!("Invalid server address: {}", e)))?;

        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let app = router(Arc::clone(&self.state));

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        self.shutdown_tx = Some(shutdown_tx);
        self.local_addr = Some(local_addr);

        let shutdown = self.state.shutdown.clone();
        tokio::spawn(async move {
            let server = axum::serve(listener, app).with_graceful_shutdown(async move {
                tokio::select! {
                    _ = shutdown_rx => {}
                    _ = shutdown.cancelled() => {}
                }
                info!("API server shutting down");
            });

            if let Err(e) = server.await {
                error!("API server error: {}", e);
            }
        });

        info!("Series sync API listening on http://{}", local_addr);
        info!("  GET  /health");
        info!("  POST /api/v1/sync");
        info!("  GET  /api/v1/status");
        info!("  GET  /api/v1/runs?limit=n");
        info!("  GET  /api/v1/series");
        info!("  GET  /api/v1/series/{{id}}/observations?from&to");
        info!("  GET  /api/v1/series/{{id}}/gaps?from&to");
        info!("  GET  /api/v1/checkpoints");

        Ok(local_addr)
    }

    /// Stop the server
    pub fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
            info!("API server stop signal sent");
        }
    }

    pub fn is_running(&self) -> bool {
        self.shutdown_tx.is_some()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }
}

impl Drop for ApiServer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use crate::db::memory::{MemoryCheckpointStore, MemoryObservationStore};
    use crate::types::{Frequency, Priority, RawObservation, SeriesSpec};
    use crate::upstream::{InjectedFailure, MemorySource};
    use chrono::{Duration, Utc};
    use serde_json::{json, Value};

    async fn spawn(source: Arc<MemorySource>) -> (ApiServer, String) {
        let mut config = SyncConfig::default();
        config.rate_limit.max_tokens = 100;
        config.sync.enable_auto_recovery = false;
        config.series = vec![
            SeriesSpec::new("DGS10", Frequency::Daily).with_priority(Priority::High),
            SeriesSpec::new("BAD", Frequency::Daily),
        ];
        let state = Arc::new(AppState::from_parts(
            config,
            source,
            Arc::new(MemoryObservationStore::new()),
            Arc::new(MemoryCheckpointStore::new()),
            None,
        ));

        let mut server = ApiServer::new(state);
        let server_config = ServerConfig {
            enabled: true,
            host: "127.0.0.1".into(),
            port: 0,
        };
        let addr = server.start(&server_config).await.unwrap();
        (server, format!("http://{}", addr))
    }

    fn rows(n: i64) -> Vec<RawObservation> {
        let today = Utc::now().date_naive();
        (1..=n)
            .map(|i| RawObservation::new((today - Duration::days(i)).to_string(), "4.25"))
            .collect()
    }

    #[tokio::test]
    async fn test_sync_then_query() {
        let source = Arc::new(MemorySource::new());
        source.insert_series("DGS10", rows(10));
        source.insert_series("BAD", rows(10));
        let (_server, base) = spawn(source).await;
        let client = reqwest::Client::new();

        let health: Value = client
            .get(format!("{}/health", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(health["status"], "success");

        let missing = client.get(format!("{}/api/v1/status", base)).send().await.unwrap();
        assert_eq!(missing.status().as_u16(), 404);

        let response = client
            .post(format!("{}/api/v1/sync", base))
            .json(&json!({ "mode": "full", "series_ids": ["DGS10"] }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 200);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["data"]["results"][0]["inserted"], 10);

        let observations: Value = client
            .get(format!(
                "{}/api/v1/series/DGS10/observations?from={}",
                base,
                Utc::now().date_naive() - Duration::days(3)
            ))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(observations["data"].as_array().unwrap().len(), 3);

        let status: Value = client
            .get(format!("{}/api/v1/status", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(status["data"]["phase"], "completed");

        let checkpoints: Value = client
            .get(format!("{}/api/v1/checkpoints", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(checkpoints["data"][0]["status"], "completed");
    }

    #[tokio::test]
    async fn test_sync_status_codes() {
        let source = Arc::new(MemorySource::new());
        source.insert_series("DGS10", rows(5));
        source.insert_series("BAD", rows(5));
        source.inject_failures("BAD", vec![InjectedFailure::Status(400)]);
        let (_server, base) = spawn(source).await;
        let client = reqwest::Client::new();

        let partial = client
            .post(format!("{}/api/v1/sync", base))
            .json(&json!({ "mode": "full" }))
            .send()
            .await
            .unwrap();
        assert_eq!(partial.status().as_u16(), 207);

        let not_started = client
            .post(format!("{}/api/v1/sync", base))
            .json(&json!({ "mode": "recovery" }))
            .send()
            .await
            .unwrap();
        assert_eq!(not_started.status().as_u16(), 422);

        let unknown = client
            .get(format!("{}/api/v1/series/NOPE/gaps", base))
            .send()
            .await
            .unwrap();
        assert_eq!(unknown.status().as_u16(), 404);

        let bad_mode = client
            .post(format!("{}/api/v1/sync", base))
            .json(&json!({ "mode": "sideways" }))
            .send()
            .await
            .unwrap();
        assert!(bad_mode.status().is_client_error());
    }
}
