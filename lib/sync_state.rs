//! Sync run and destination-mapping status transitions.
//!
//! Sync rows move `pending -> completed | failed`; a `failed` (or stale `pending`) row is
//! reused for the next attempt instead of creating another. `completed` is terminal. At most
//! one active (`pending`/`failed`) row may exist per definition.

use chrono::Utc;
use tracing::{info, warn};

use crate::error::SyncError;
use crate::repository::SegmentRepository;
use crate::types::{DispatchStats, SegmentSync, SyncStats};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncStatus {
    Pending,
    Completed,
    Failed,
}

impl SyncStatus {
    pub fn as_db_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn from_db_str(value: &str) -> Result<Self, SyncError> {
        match value {
            "pending" => Ok(Self::Pending),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(SyncError::InvalidData(format!(
                "invalid sync status in database: {other}"
            ))),
        }
    }

    pub fn is_active(self) -> bool {
        matches!(self, Self::Pending | Self::Failed)
    }

    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Completed)
                | (Self::Pending, Self::Failed)
                | (Self::Pending, Self::Pending)
                | (Self::Failed, Self::Pending)
        )
    }
}

pub fn ensure_transition(sync_id: i64, from: SyncStatus, to: SyncStatus) -> Result<(), SyncError> {
    if from.can_transition_to(to) {
        return Ok(());
    }
    Err(SyncError::StateViolation(format!(
        "sync {sync_id} cannot move from {} to {}",
        from.as_db_str(),
        to.as_db_str()
    )))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActiveSyncResolution {
    Create,
    Reuse(SegmentSync),
}

/// Decides whether the next attempt creates a row or reuses the single active one.
pub fn resolve_active_sync(
    definition_id: i64,
    mut active: Vec<SegmentSync>,
) -> Result<ActiveSyncResolution, SyncError> {
    match active.len() {
        0 => Ok(ActiveSyncResolution::Create),
        1 => {
            let row = active.remove(0);
            ensure_transition(row.id, row.status, SyncStatus::Pending)?;
            Ok(ActiveSyncResolution::Reuse(row))
        }
        n => Err(SyncError::StateViolation(format!(
            "definition {definition_id} has {n} active sync rows"
        ))),
    }
}

/// Opens a sync attempt for `definition_id` and returns the `pending` row.
pub async fn begin_sync(
    repo: &dyn SegmentRepository,
    definition_id: i64,
) -> Result<SegmentSync, SyncError> {
    let active = repo.active_syncs(definition_id).await?;
    match resolve_active_sync(definition_id, active)? {
        ActiveSyncResolution::Create => repo.create_sync(definition_id).await,
        ActiveSyncResolution::Reuse(row) => {
            info!(
                event = "sync_row_reused",
                definition_id,
                sync_id = row.id,
                previous_status = row.status.as_db_str(),
                "reusing active sync row"
            );
            repo.update_sync(row.id, SyncStatus::Pending, &SyncStats::default())
                .await
        }
    }
}

pub async fn complete_sync(
    repo: &dyn SegmentRepository,
    sync: &SegmentSync,
    stats: &SyncStats,
) -> Result<SegmentSync, SyncError> {
    ensure_transition(sync.id, sync.status, SyncStatus::Completed)?;
    repo.update_sync(sync.id, SyncStatus::Completed, stats).await
}

pub async fn fail_sync(
    repo: &dyn SegmentRepository,
    sync: &SegmentSync,
    stats: &SyncStats,
) -> Result<SegmentSync, SyncError> {
    ensure_transition(sync.id, sync.status, SyncStatus::Failed)?;
    warn!(
        event = "sync_failed",
        definition_id = sync.definition_id,
        sync_id = sync.id,
        members_added = stats.members_added,
        members_removed = stats.members_removed,
        error = stats.error.as_deref().unwrap_or(""),
        "marking sync as failed"
    );
    repo.update_sync(sync.id, SyncStatus::Failed, stats).await
}

/// Destination mappings keep a single status row that each attempt overwrites.
pub async fn record_destination_status(
    repo: &dyn SegmentRepository,
    mapping_id: i64,
    status: SyncStatus,
    stats: &DispatchStats,
) -> Result<(), SyncError> {
    repo.upsert_destination_sync(mapping_id, status, stats, Utc::now())
        .await
}
