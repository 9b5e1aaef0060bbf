use chrono::{DateTime, Utc};
use diesel_async::{pg::AsyncPgConnection, pooled_connection::deadpool::Pool};
use prometheus_client::registry::Registry;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::sync_service::BatchSyncSummary;

/// Outcome of the daemon's most recent scheduled batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastBatch {
    pub finished_at: DateTime<Utc>,
    pub summary: BatchSyncSummary,
}

/// Sync engine state shared by the daemon loop and the health/metrics server.
///
/// `pool` is the store pool the engine syncs against; `/health` checks it and reports
/// `last_batch`, which the daemon replaces after every scheduled batch.
pub struct AppState {
    pub pool: Pool<AsyncPgConnection>,
    pub shutdown_token: CancellationToken,
    pub registry: RwLock<Registry>,
    pub last_batch: RwLock<Option<LastBatch>>,
}

impl AppState {
    pub fn new(pool: Pool<AsyncPgConnection>, shutdown_token: CancellationToken) -> Self {
        Self {
            pool,
            shutdown_token,
            registry: RwLock::new(<Registry>::default()),
            last_batch: RwLock::new(None),
        }
    }

    pub async fn record_batch(&self, summary: BatchSyncSummary, finished_at: DateTime<Utc>) {
        *self.last_batch.write().await = Some(LastBatch {
            finished_at,
            summary,
        });
    }

    /// One-line `/health` suffix describing the last batch, if any ran.
    pub async fn last_batch_line(&self) -> Option<String> {
        self.last_batch.read().await.as_ref().map(|batch| {
            format!(
                "last_batch={} synced={} failed={}",
                batch.finished_at.to_rfc3339(),
                batch.summary.synced,
                batch.summary.failed
            )
        })
    }
}
