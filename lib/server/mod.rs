pub mod monitoring;
use crate::state::AppState;
use prometheus_client::encoding::text::encode;

use axum::{extract::State, http::StatusCode, routing::get, Router};
use diesel_async::RunQueryDsl;
use monitoring::SYNC_METRICS;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::error;

/// Reports healthy only while the transactional store answers, followed by the last batch.
async fn health_handler(state: State<Arc<AppState>>) -> (StatusCode, String) {
    let mut conn = match state.pool.get().await {
        Ok(conn) => conn,
        Err(err) => {
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                format!("Unhealthy: {err}"),
            )
        }
    };
    match diesel::sql_query("SELECT 1").execute(&mut conn).await {
        Ok(_) => match state.last_batch_line().await {
            Some(line) => (StatusCode::OK, format!("Healthy\n{line}")),
            None => (StatusCode::OK, "Healthy".to_string()),
        },
        Err(err) => (
            StatusCode::SERVICE_UNAVAILABLE,
            format!("Unhealthy: {err}"),
        ),
    }
}

async fn expose_metrics(state: State<Arc<AppState>>) -> (StatusCode, String) {
    let mut buffer = String::new();
    let registry = state.registry.read().await;
    match encode(&mut buffer, &registry) {
        Ok(()) => (StatusCode::OK, buffer),
        Err(err) => {
            error!(event = "metrics_encode_failed", error = %err, "failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, String::new())
        }
    }
}

/// Registers metrics once, then serves `/health` and `/metrics` on `addr` until shutdown.
pub async fn setup_server_with_addr(
    state: Arc<AppState>,
    addr: SocketAddr,
) -> Result<tokio::task::JoinHandle<()>, std::io::Error> {
    {
        let mut registry = state.registry.write().await;

        SYNC_METRICS
            .get_or_init(|| async {
                monitoring::SyncMetrics::register(&mut registry, "segment_sync")
            })
            .await;

        monitoring::register_build_info_metric(&mut registry, "segment_sync");
    }

    let shutdown_token = state.shutdown_token.clone();
    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(expose_metrics))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let server_handle = tokio::spawn(async move {
        let served = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            shutdown_token.cancelled().await;
        })
        .await;
        if let Err(err) = served {
            error!(event = "metrics_server_failed", error = %err, "metrics server exited with error");
        }
    });

    Ok(server_handle)
}
