use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::{debug, error};

use crate::config::{DEFAULT_CHUNK_CONCURRENCY, DEFAULT_CHUNK_SIZE};
use crate::error::SyncError;
use crate::repository::SegmentRepository;
use crate::types::MemberOperation;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Member ids per chunk transaction.
    pub chunk_size: usize,
    /// Maximum chunk tasks in flight for one pipeline invocation.
    pub max_in_flight: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_in_flight: DEFAULT_CHUNK_CONCURRENCY,
        }
    }
}

/// Result of one add or remove pipeline run.
#[derive(Debug, Default)]
pub struct ApplyOutcome {
    /// Ids in chunks that committed.
    pub success_count: usize,
    pub chunks_applied: usize,
    pub chunks_failed: usize,
    /// First chunk error observed. Later errors are logged only.
    pub error: Option<SyncError>,
}

/// Applies `member_ids` in disjoint chunks with at most `max_in_flight` chunk tasks running.
///
/// After the first failed chunk no new chunks are started, but chunks already running are
/// awaited so none is left half-applied. Committed chunks are not rolled back.
pub async fn apply_members(
    repo: Arc<dyn SegmentRepository>,
    config: PipelineConfig,
    definition_id: i64,
    sync_id: i64,
    operation: MemberOperation,
    member_ids: Vec<String>,
) -> ApplyOutcome {
    let chunk_size = config.chunk_size.max(1);
    let max_in_flight = config.max_in_flight.max(1);

    let mut outcome = ApplyOutcome::default();
    if member_ids.is_empty() {
        return outcome;
    }

    let mut pending_chunks = member_ids
        .chunks(chunk_size)
        .map(<[String]>::to_vec)
        .enumerate();
    let mut in_flight: JoinSet<(usize, usize, Result<usize, SyncError>)> = JoinSet::new();
    let mut stop_scheduling = false;

    loop {
        while !stop_scheduling && in_flight.len() < max_in_flight {
            let Some((chunk_index, chunk)) = pending_chunks.next() else {
                break;
            };
            let repo = repo.clone();
            in_flight.spawn(async move {
                let result = repo
                    .apply_chunk(definition_id, sync_id, operation, &chunk)
                    .await;
                (chunk_index, chunk.len(), result)
            });
        }

        let Some(joined) = in_flight.join_next().await else {
            break;
        };

        let (chunk_index, chunk_len, result) = match joined {
            Ok(done) => done,
            Err(join_err) => (usize::MAX, 0, Err(SyncError::from(join_err))),
        };

        match result {
            Ok(applied) => {
                outcome.success_count += applied;
                outcome.chunks_applied += 1;
                debug!(
                    event = "chunk_applied",
                    definition_id,
                    sync_id,
                    operation = operation.as_db_str(),
                    chunk_index,
                    members = applied,
                    "applied membership chunk"
                );
            }
            Err(err) => {
                outcome.chunks_failed += 1;
                stop_scheduling = true;
                error!(
                    event = "chunk_failed",
                    definition_id,
                    sync_id,
                    operation = operation.as_db_str(),
                    chunk_index,
                    members = chunk_len,
                    error = %err,
                    "membership chunk failed"
                );
                outcome.error.get_or_insert(err);
            }
        }
    }

    outcome
}
