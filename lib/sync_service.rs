//! Caller-facing operations: find due segments, run one segment's sync, push its latest
//! membership delta to every mapped destination, and run whole batches.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use crate::apply_pipeline::{apply_members, ApplyOutcome, PipelineConfig};
use crate::backend::BackendRouter;
use crate::destinations::{DestinationDispatcher, DispatchContext};
use crate::diff_engine::{compute_diff, runtime_parameters};
use crate::error::SyncError;
use crate::query_builder::render_query;
use crate::repository::{NewDefinition, NewProfile, SegmentRepository};
use crate::scheduler::{due_definition_ids, Schedule};
use crate::schema_introspector::{introspect, ProfileSchema};
use crate::server::monitoring::{SyncMetrics, SYNC_METRICS};
use crate::sync_state::{begin_sync, complete_sync, fail_sync, record_destination_status, SyncStatus};
use crate::types::{
    DestinationMapping, DispatchStats, MemberOperation, SegmentDefinition, SegmentProfile,
    SegmentSync, SyncStats,
};
use crate::validator::{validate_rule, RuleTerm};

fn with_metrics(update: impl FnOnce(&SyncMetrics)) {
    if let Some(metrics) = SYNC_METRICS.get() {
        update(metrics);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncSegmentOutcome {
    pub sync_id: i64,
    /// False when the run completed with an empty diff; no dispatch is needed then.
    pub changed: bool,
    pub stats: SyncStats,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingOutcome {
    pub mapping_id: i64,
    pub destination: String,
    pub status: SyncStatus,
    pub stats: DispatchStats,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchOutcome {
    /// True when at least one mapping completed.
    pub dispatched: bool,
    pub mappings: Vec<MappingOutcome>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchSyncSummary {
    pub requested: usize,
    pub synced: usize,
    pub unchanged: usize,
    pub failed: usize,
    pub dispatched: usize,
    pub failed_definition_ids: Vec<i64>,
}

/// Inputs for registering a profile. The schema is introspected, never supplied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileRequest {
    pub query: String,
    pub id_column: String,
    pub label: String,
    pub description: Option<String>,
}

pub struct SegmentSyncService {
    repo: Arc<dyn SegmentRepository>,
    router: BackendRouter,
    dispatcher: DestinationDispatcher,
    pipeline: PipelineConfig,
}

impl SegmentSyncService {
    pub fn new(
        repo: Arc<dyn SegmentRepository>,
        router: BackendRouter,
        dispatcher: DestinationDispatcher,
        pipeline: PipelineConfig,
    ) -> Self {
        Self {
            repo,
            router,
            dispatcher,
            pipeline,
        }
    }

    pub async fn get_due_segment_ids(&self, now: DateTime<Utc>) -> Result<Vec<i64>, SyncError> {
        let candidates = self.repo.list_schedule_candidates().await?;
        Ok(due_definition_ids(&candidates, now))
    }

    async fn load_segment(
        &self,
        definition_id: i64,
    ) -> Result<(SegmentDefinition, SegmentProfile), SyncError> {
        let definition = self.repo.get_definition(definition_id).await?;
        let profile = self.repo.get_profile(definition.profile_id).await?;
        Ok((definition, profile))
    }

    /// Recomputes membership for one definition and records the delta.
    ///
    /// The add pipeline runs to completion before the remove pipeline starts; both always run.
    /// If any chunk of either failed, the run is persisted as `failed` with the merged partial
    /// counts and the first error is returned.
    pub async fn sync_segment(&self, definition_id: i64) -> Result<SyncSegmentOutcome, SyncError> {
        let (definition, profile) = self.load_segment(definition_id).await?;
        let sync = begin_sync(self.repo.as_ref(), definition_id).await?;
        let params = runtime_parameters(definition_id, Utc::now().date_naive());

        let diff = match compute_diff(
            self.repo.as_ref(),
            &self.router,
            &profile,
            &definition,
            &params,
        )
        .await
        {
            Ok(diff) => diff,
            Err(err) => {
                let stats = SyncStats {
                    error: Some(err.to_string()),
                    ..SyncStats::default()
                };
                return Err(self.record_failure(&sync, &stats, err).await);
            }
        };

        if diff.is_empty() {
            let completed = complete_sync(self.repo.as_ref(), &sync, &SyncStats::default()).await?;
            with_metrics(|m| {
                m.syncs_completed_total.inc();
                m.syncs_unchanged_total.inc();
            });
            info!(
                event = "sync_unchanged",
                definition_id,
                sync_id = completed.id,
                "membership unchanged"
            );
            return Ok(SyncSegmentOutcome {
                sync_id: completed.id,
                changed: false,
                stats: completed.stats,
            });
        }

        let added = self.apply(&sync, MemberOperation::Add, diff.added).await;
        let removed = self.apply(&sync, MemberOperation::Remove, diff.removed).await;

        let mut stats = SyncStats {
            members_added: added.success_count,
            members_removed: removed.success_count,
            error: None,
        };
        if let Some(err) = added.error.or(removed.error) {
            stats.error = Some(err.to_string());
            return Err(self.record_failure(&sync, &stats, err).await);
        }

        let completed = complete_sync(self.repo.as_ref(), &sync, &stats).await?;
        with_metrics(|m| {
            m.syncs_completed_total.inc();
            m.members_added_total.inc_by(stats.members_added as u64);
            m.members_removed_total.inc_by(stats.members_removed as u64);
        });
        info!(
            event = "sync_completed",
            definition_id,
            sync_id = completed.id,
            members_added = stats.members_added,
            members_removed = stats.members_removed,
            "segment sync completed"
        );
        Ok(SyncSegmentOutcome {
            sync_id: completed.id,
            changed: true,
            stats: completed.stats,
        })
    }

    async fn apply(
        &self,
        sync: &SegmentSync,
        operation: MemberOperation,
        member_ids: Vec<String>,
    ) -> ApplyOutcome {
        let outcome = apply_members(
            self.repo.clone(),
            self.pipeline,
            sync.definition_id,
            sync.id,
            operation,
            member_ids,
        )
        .await;
        with_metrics(|m| {
            m.chunks_applied_total.inc_by(outcome.chunks_applied as u64);
            m.chunks_failed_total.inc_by(outcome.chunks_failed as u64);
        });
        outcome
    }

    /// Marks `sync` failed and hands back the error that caused it. If persisting the failure
    /// also fails, that is logged and the original error still wins.
    async fn record_failure(&self, sync: &SegmentSync, stats: &SyncStats, err: SyncError) -> SyncError {
        with_metrics(|m| {
            m.syncs_failed_total.inc();
        });
        if let Err(persist_err) = fail_sync(self.repo.as_ref(), sync, stats).await {
            error!(
                event = "sync_failure_not_persisted",
                definition_id = sync.definition_id,
                sync_id = sync.id,
                error = %persist_err,
                "could not mark sync as failed"
            );
        }
        err
    }

    /// Pushes the latest recorded delta to every mapping of the definition. Each mapping's
    /// outcome is recorded on its own status row; one failure does not stop the others.
    pub async fn sync_segment_destination(
        &self,
        definition_id: i64,
    ) -> Result<DispatchOutcome, SyncError> {
        let (definition, profile) = self.load_segment(definition_id).await?;
        let mappings = self.repo.destination_mappings(definition_id).await?;
        if mappings.is_empty() {
            return Ok(DispatchOutcome::default());
        }
        let delta = self.repo.latest_delta(definition_id).await?;
        let params = runtime_parameters(definition_id, Utc::now().date_naive());
        let ctx = DispatchContext {
            profile: &profile,
            definition: &definition,
            params: &params,
            delta: delta.as_ref(),
        };

        let mut outcome = DispatchOutcome::default();
        for mapping in &mappings {
            let (status, stats) = match self.dispatch_one(&ctx, mapping).await {
                Ok(stats) => (SyncStatus::Completed, stats),
                Err(err) => {
                    error!(
                        event = "destination_dispatch_failed",
                        definition_id,
                        mapping_id = mapping.id,
                        destination = %mapping.destination.destination,
                        error_kind = err.kind(),
                        error = %err,
                        "destination dispatch failed"
                    );
                    let stats = DispatchStats {
                        error: Some(err.to_string()),
                        ..DispatchStats::default()
                    };
                    (SyncStatus::Failed, stats)
                }
            };

            if let Err(err) =
                record_destination_status(self.repo.as_ref(), mapping.id, status, &stats).await
            {
                error!(
                    event = "destination_status_not_persisted",
                    definition_id,
                    mapping_id = mapping.id,
                    status = status.as_db_str(),
                    error = %err,
                    "could not record destination status"
                );
            }

            match status {
                SyncStatus::Completed => {
                    outcome.dispatched = true;
                    with_metrics(|m| {
                        m.destinations_completed_total.inc();
                    });
                }
                _ => with_metrics(|m| {
                    m.destinations_failed_total.inc();
                }),
            }
            outcome.mappings.push(MappingOutcome {
                mapping_id: mapping.id,
                destination: mapping.destination.destination.clone(),
                status,
                stats,
            });
        }

        info!(
            event = "destinations_dispatched",
            definition_id,
            mappings = outcome.mappings.len(),
            dispatched = outcome.dispatched,
            "destination dispatch finished"
        );
        Ok(outcome)
    }

    async fn dispatch_one(
        &self,
        ctx: &DispatchContext<'_>,
        mapping: &DestinationMapping,
    ) -> Result<DispatchStats, SyncError> {
        record_destination_status(
            self.repo.as_ref(),
            mapping.id,
            SyncStatus::Pending,
            &DispatchStats::default(),
        )
        .await?;
        self.dispatcher.dispatch_mapping(ctx, mapping).await
    }

    /// Syncs `definition_ids`, or every due definition when `None`, one at a time, and
    /// dispatches each one whose membership changed.
    pub async fn sync_all_segments(
        &self,
        definition_ids: Option<Vec<i64>>,
    ) -> Result<BatchSyncSummary, SyncError> {
        let definition_ids = match definition_ids {
            Some(ids) => ids,
            None => self.get_due_segment_ids(Utc::now()).await?,
        };

        let mut summary = BatchSyncSummary {
            requested: definition_ids.len(),
            ..BatchSyncSummary::default()
        };
        for definition_id in definition_ids {
            match self.sync_segment(definition_id).await {
                Ok(outcome) if !outcome.changed => summary.unchanged += 1,
                Ok(_) => {
                    summary.synced += 1;
                    match self.sync_segment_destination(definition_id).await {
                        Ok(dispatch) if dispatch.dispatched => summary.dispatched += 1,
                        Ok(_) => {}
                        Err(err) => warn!(
                            event = "segment_dispatch_failed",
                            definition_id,
                            error_kind = err.kind(),
                            error = %err,
                            "could not dispatch segment destinations"
                        ),
                    }
                }
                Err(err) => {
                    summary.failed += 1;
                    summary.failed_definition_ids.push(definition_id);
                    error!(
                        event = "segment_sync_failed",
                        definition_id,
                        error_kind = err.kind(),
                        error = %err,
                        "segment sync failed"
                    );
                }
            }
        }

        info!(
            event = "batch_sync_finished",
            requested = summary.requested,
            synced = summary.synced,
            unchanged = summary.unchanged,
            failed = summary.failed,
            dispatched = summary.dispatched,
            "batch sync finished"
        );
        Ok(summary)
    }

    /// Canonical schema of `query`. Runtime placeholders are rendered with stand-in values
    /// (`definition_id` = 0, `run_date` = today).
    pub async fn introspect_query(&self, query: &str) -> Result<ProfileSchema, SyncError> {
        let params = runtime_parameters(0, Utc::now().date_naive());
        let query = render_query(query, &params)?;
        introspect(&self.router, &query).await
    }

    pub async fn create_profile(&self, request: ProfileRequest) -> Result<SegmentProfile, SyncError> {
        let profile_schema = self.introspect_query(&request.query).await?;
        let profile = self
            .repo
            .create_profile(&NewProfile {
                query: request.query,
                id_column: request.id_column,
                profile_schema,
                label: request.label,
                description: request.description,
            })
            .await?;
        info!(
            event = "profile_created",
            profile_id = profile.id,
            columns = profile.profile_schema.len(),
            "segment profile created"
        );
        Ok(profile)
    }

    pub async fn refresh_profile_schema(&self, profile_id: i64) -> Result<ProfileSchema, SyncError> {
        let profile = self.repo.get_profile(profile_id).await?;
        let schema = self.introspect_query(&profile.query).await?;
        self.repo.update_profile_schema(profile_id, &schema).await?;
        Ok(schema)
    }

    /// Checks `rule` against the stored schema of `profile_id`.
    pub async fn validate_rule(&self, profile_id: i64, rule: &str) -> Result<Vec<RuleTerm>, SyncError> {
        let profile = self.repo.get_profile(profile_id).await?;
        validate_rule(rule, &profile.profile_schema)
    }

    pub async fn create_definition(
        &self,
        definition: NewDefinition,
    ) -> Result<SegmentDefinition, SyncError> {
        Schedule::parse(&definition.schedule)?;
        self.validate_rule(definition.profile_id, &definition.rule)
            .await?;
        self.repo.create_definition(&definition).await
    }

    pub async fn update_definition_rule(
        &self,
        definition_id: i64,
        rule: &str,
    ) -> Result<(), SyncError> {
        let definition = self.repo.get_definition(definition_id).await?;
        self.validate_rule(definition.profile_id, rule).await?;
        self.repo.update_definition_rule(definition_id, rule).await
    }
}
