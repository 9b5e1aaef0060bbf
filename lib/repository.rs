use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use diesel::dsl::max;
use diesel::insert_into;
use diesel::pg::upsert::excluded;
use diesel::prelude::*;
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use diesel_async::pooled_connection::deadpool::Pool;
use diesel_async::scoped_futures::ScopedFutureExt;
use diesel_async::{AsyncConnection, AsyncPgConnection, RunQueryDsl};
use futures::future::BoxFuture;

use crate::db::models::{
    DefinitionRow, DestinationDefinitionRow, DestinationMappingRow, DestinationSyncRow,
    MemberRow, NewDefinitionRow, NewHistoryRow, NewProfileRow, NewSyncRow, ProfileRow, SyncRow,
};
use crate::db::schema::{
    segment_definitions, segment_destination_definitions, segment_destination_mappings,
    segment_destination_syncs, segment_member_history, segment_members, segment_profiles,
    segment_syncs,
};
use crate::error::SyncError;
use crate::scheduler::ScheduleCandidate;
use crate::schema_introspector::ProfileSchema;
use crate::sync_state::SyncStatus;
use crate::types::{
    DestinationDefinition, DestinationMapping, DispatchStats, MemberOperation, MembershipDelta,
    SegmentDefinition, SegmentProfile, SegmentSync, SyncStats,
};

#[derive(Debug, Clone, PartialEq)]
pub struct NewProfile {
    pub query: String,
    pub id_column: String,
    pub profile_schema: ProfileSchema,
    pub label: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewDefinition {
    pub profile_id: i64,
    pub rule: String,
    pub label: String,
    pub schedule: String,
    pub description: Option<String>,
}

/// Persistence for profiles, definitions, sync runs, membership and destination state.
///
/// The engine only talks to storage through this trait so orchestration can be unit-tested
/// against an in-memory implementation.
pub trait SegmentRepository: Send + Sync {
    fn get_profile<'a>(&'a self, profile_id: i64) -> BoxFuture<'a, Result<SegmentProfile, SyncError>>;

    fn create_profile<'a>(
        &'a self,
        profile: &'a NewProfile,
    ) -> BoxFuture<'a, Result<SegmentProfile, SyncError>>;

    fn update_profile_schema<'a>(
        &'a self,
        profile_id: i64,
        schema: &'a ProfileSchema,
    ) -> BoxFuture<'a, Result<(), SyncError>>;

    fn get_definition<'a>(
        &'a self,
        definition_id: i64,
    ) -> BoxFuture<'a, Result<SegmentDefinition, SyncError>>;

    fn create_definition<'a>(
        &'a self,
        definition: &'a NewDefinition,
    ) -> BoxFuture<'a, Result<SegmentDefinition, SyncError>>;

    fn update_definition_rule<'a>(
        &'a self,
        definition_id: i64,
        rule: &'a str,
    ) -> BoxFuture<'a, Result<(), SyncError>>;

    /// Every definition's schedule and the creation time of its latest completed sync.
    fn list_schedule_candidates<'a>(
        &'a self,
    ) -> BoxFuture<'a, Result<Vec<ScheduleCandidate>, SyncError>>;

    /// `pending` and `failed` sync rows for a definition.
    fn active_syncs<'a>(
        &'a self,
        definition_id: i64,
    ) -> BoxFuture<'a, Result<Vec<SegmentSync>, SyncError>>;

    fn create_sync<'a>(&'a self, definition_id: i64) -> BoxFuture<'a, Result<SegmentSync, SyncError>>;

    /// Updates a non-completed sync row. Completed rows are never touched.
    fn update_sync<'a>(
        &'a self,
        sync_id: i64,
        status: SyncStatus,
        stats: &'a SyncStats,
    ) -> BoxFuture<'a, Result<SegmentSync, SyncError>>;

    fn current_members<'a>(
        &'a self,
        definition_id: i64,
    ) -> BoxFuture<'a, Result<HashSet<String>, SyncError>>;

    /// Applies one chunk atomically: membership rows plus matching history rows.
    fn apply_chunk<'a>(
        &'a self,
        definition_id: i64,
        sync_id: i64,
        operation: MemberOperation,
        member_ids: &'a [String],
    ) -> BoxFuture<'a, Result<usize, SyncError>>;

    /// History rows written by the most recent completed sync that changed membership.
    fn latest_delta<'a>(
        &'a self,
        definition_id: i64,
    ) -> BoxFuture<'a, Result<Option<MembershipDelta>, SyncError>>;

    fn destination_mappings<'a>(
        &'a self,
        definition_id: i64,
    ) -> BoxFuture<'a, Result<Vec<DestinationMapping>, SyncError>>;

    fn upsert_destination_sync<'a>(
        &'a self,
        mapping_id: i64,
        status: SyncStatus,
        stats: &'a DispatchStats,
        updated_at: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<(), SyncError>>;
}

fn profile_from_row(row: ProfileRow) -> Result<SegmentProfile, SyncError> {
    Ok(SegmentProfile {
        id: row.id,
        query: row.query,
        id_column: row.id_column,
        profile_schema: ProfileSchema::from_json(row.profile_schema)?,
        label: row.label,
        description: row.description,
    })
}

fn definition_from_row(row: DefinitionRow) -> SegmentDefinition {
    SegmentDefinition {
        id: row.id,
        profile_id: row.profile_id,
        rule: row.rule,
        label: row.label,
        schedule: row.schedule,
        description: row.description,
    }
}

fn sync_from_row(row: SyncRow) -> Result<SegmentSync, SyncError> {
    let stats = if row.stats.is_null() {
        SyncStats::default()
    } else {
        serde_json::from_value(row.stats)?
    };
    Ok(SegmentSync {
        id: row.id,
        definition_id: row.definition_id,
        status: SyncStatus::from_db_str(&row.status)?,
        stats,
        created_at: row.created_at,
    })
}

fn mapping_from_rows(
    mapping: DestinationMappingRow,
    destination: DestinationDefinitionRow,
) -> DestinationMapping {
    DestinationMapping {
        id: mapping.id,
        segment_definition_id: mapping.segment_definition_id,
        destination: DestinationDefinition {
            id: destination.id,
            destination: destination.destination,
            label: destination.label,
            description: destination.description,
            parameters: destination.destination_parameters,
        },
        config: mapping.destination_config,
    }
}

/// Unique violations on `segment_syncs` can only come from the one-active-row index.
fn map_sync_write_error(err: DieselError, definition_id: i64) -> SyncError {
    match err {
        DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, info) => {
            SyncError::StateViolation(format!(
                "definition {definition_id} already has an active sync row: {}",
                info.message()
            ))
        }
        other => SyncError::from(other),
    }
}

fn not_found_as(entity: &'static str, id: i64) -> impl FnOnce(SyncError) -> SyncError {
    move |err| match err {
        SyncError::NotFound { .. } => SyncError::not_found(entity, id),
        other => other,
    }
}

pub struct PgSegmentRepository {
    pool: Pool<AsyncPgConnection>,
}

impl PgSegmentRepository {
    pub fn new(pool: Pool<AsyncPgConnection>) -> Self {
        Self { pool }
    }
}

impl SegmentRepository for PgSegmentRepository {
    fn get_profile<'a>(&'a self, profile_id: i64) -> BoxFuture<'a, Result<SegmentProfile, SyncError>> {
        Box::pin(async move {
            let mut conn = self.pool.get().await?;
            let row = segment_profiles::table
                .find(profile_id)
                .select(ProfileRow::as_select())
                .first(&mut conn)
                .await
                .map_err(SyncError::from)
                .map_err(not_found_as("segment profile", profile_id))?;
            profile_from_row(row)
        })
    }

    fn create_profile<'a>(
        &'a self,
        profile: &'a NewProfile,
    ) -> BoxFuture<'a, Result<SegmentProfile, SyncError>> {
        Box::pin(async move {
            let new_row = NewProfileRow {
                query: &profile.query,
                id_column: &profile.id_column,
                profile_schema: profile.profile_schema.to_json()?,
                label: &profile.label,
                description: profile.description.as_deref(),
            };
            let mut conn = self.pool.get().await?;
            let row = insert_into(segment_profiles::table)
                .values(&new_row)
                .returning(ProfileRow::as_returning())
                .get_result(&mut conn)
                .await?;
            profile_from_row(row)
        })
    }

    fn update_profile_schema<'a>(
        &'a self,
        profile_id: i64,
        schema: &'a ProfileSchema,
    ) -> BoxFuture<'a, Result<(), SyncError>> {
        Box::pin(async move {
            let schema_json = schema.to_json()?;
            let mut conn = self.pool.get().await?;
            let updated = diesel::update(segment_profiles::table.find(profile_id))
                .set(segment_profiles::profile_schema.eq(schema_json))
                .execute(&mut conn)
                .await?;
            if updated == 0 {
                return Err(SyncError::not_found("segment profile", profile_id));
            }
            Ok(())
        })
    }

    fn get_definition<'a>(
        &'a self,
        definition_id: i64,
    ) -> BoxFuture<'a, Result<SegmentDefinition, SyncError>> {
        Box::pin(async move {
            let mut conn = self.pool.get().await?;
            let row = segment_definitions::table
                .find(definition_id)
                .select(DefinitionRow::as_select())
                .first(&mut conn)
                .await
                .map_err(SyncError::from)
                .map_err(not_found_as("segment definition", definition_id))?;
            Ok(definition_from_row(row))
        })
    }

    fn create_definition<'a>(
        &'a self,
        definition: &'a NewDefinition,
    ) -> BoxFuture<'a, Result<SegmentDefinition, SyncError>> {
        Box::pin(async move {
            let new_row = NewDefinitionRow {
                profile_id: definition.profile_id,
                rule: &definition.rule,
                label: &definition.label,
                schedule: &definition.schedule,
                description: definition.description.as_deref(),
            };
            let mut conn = self.pool.get().await?;
            let row = insert_into(segment_definitions::table)
                .values(&new_row)
                .returning(DefinitionRow::as_returning())
                .get_result(&mut conn)
                .await?;
            Ok(definition_from_row(row))
        })
    }

    fn update_definition_rule<'a>(
        &'a self,
        definition_id: i64,
        rule: &'a str,
    ) -> BoxFuture<'a, Result<(), SyncError>> {
        Box::pin(async move {
            let mut conn = self.pool.get().await?;
            let updated = diesel::update(segment_definitions::table.find(definition_id))
                .set(segment_definitions::rule.eq(rule))
                .execute(&mut conn)
                .await?;
            if updated == 0 {
                return Err(SyncError::not_found("segment definition", definition_id));
            }
            Ok(())
        })
    }

    fn list_schedule_candidates<'a>(
        &'a self,
    ) -> BoxFuture<'a, Result<Vec<ScheduleCandidate>, SyncError>> {
        Box::pin(async move {
            let mut conn = self.pool.get().await?;
            let definitions: Vec<(i64, String)> = segment_definitions::table
                .select((segment_definitions::id, segment_definitions::schedule))
                .order(segment_definitions::id.asc())
                .load(&mut conn)
                .await?;

            let last_completed: Vec<(i64, Option<DateTime<Utc>>)> = segment_syncs::table
                .filter(segment_syncs::status.eq(SyncStatus::Completed.as_db_str()))
                .group_by(segment_syncs::definition_id)
                .select((segment_syncs::definition_id, max(segment_syncs::created_at)))
                .load(&mut conn)
                .await?;
            let last_completed: HashMap<i64, DateTime<Utc>> = last_completed
                .into_iter()
                .filter_map(|(id, at)| at.map(|at| (id, at)))
                .collect();

            Ok(definitions
                .into_iter()
                .map(|(definition_id, schedule)| ScheduleCandidate {
                    definition_id,
                    schedule,
                    last_completed_at: last_completed.get(&definition_id).copied(),
                })
                .collect())
        })
    }

    fn active_syncs<'a>(
        &'a self,
        definition_id: i64,
    ) -> BoxFuture<'a, Result<Vec<SegmentSync>, SyncError>> {
        Box::pin(async move {
            let mut conn = self.pool.get().await?;
            let rows: Vec<SyncRow> = segment_syncs::table
                .filter(segment_syncs::definition_id.eq(definition_id))
                .filter(segment_syncs::status.eq_any([
                    SyncStatus::Pending.as_db_str(),
                    SyncStatus::Failed.as_db_str(),
                ]))
                .order(segment_syncs::id.asc())
                .select(SyncRow::as_select())
                .load(&mut conn)
                .await?;
            rows.into_iter().map(sync_from_row).collect()
        })
    }

    fn create_sync<'a>(&'a self, definition_id: i64) -> BoxFuture<'a, Result<SegmentSync, SyncError>> {
        Box::pin(async move {
            let new_row = NewSyncRow {
                definition_id,
                status: SyncStatus::Pending.as_db_str(),
                stats: serde_json::to_value(SyncStats::default())?,
            };
            let mut conn = self.pool.get().await?;
            let row = insert_into(segment_syncs::table)
                .values(&new_row)
                .returning(SyncRow::as_returning())
                .get_result(&mut conn)
                .await
                .map_err(|err| map_sync_write_error(err, definition_id))?;
            sync_from_row(row)
        })
    }

    fn update_sync<'a>(
        &'a self,
        sync_id: i64,
        status: SyncStatus,
        stats: &'a SyncStats,
    ) -> BoxFuture<'a, Result<SegmentSync, SyncError>> {
        Box::pin(async move {
            let stats_json = serde_json::to_value(stats)?;
            let mut conn = self.pool.get().await?;
            let row = diesel::update(
                segment_syncs::table
                    .filter(segment_syncs::id.eq(sync_id))
                    .filter(segment_syncs::status.ne(SyncStatus::Completed.as_db_str())),
            )
            .set((
                segment_syncs::status.eq(status.as_db_str()),
                segment_syncs::stats.eq(stats_json),
            ))
            .returning(SyncRow::as_returning())
            .get_result(&mut conn)
            .await
            .optional()?;

            match row {
                Some(row) => sync_from_row(row),
                None => Err(SyncError::StateViolation(format!(
                    "sync {sync_id} is missing or already completed"
                ))),
            }
        })
    }

    fn current_members<'a>(
        &'a self,
        definition_id: i64,
    ) -> BoxFuture<'a, Result<HashSet<String>, SyncError>> {
        Box::pin(async move {
            let mut conn = self.pool.get().await?;
            let members: Vec<String> = segment_members::table
                .filter(segment_members::definition_id.eq(definition_id))
                .select(segment_members::member_id)
                .load(&mut conn)
                .await?;
            Ok(members.into_iter().collect())
        })
    }

    fn apply_chunk<'a>(
        &'a self,
        definition_id: i64,
        sync_id: i64,
        operation: MemberOperation,
        member_ids: &'a [String],
    ) -> BoxFuture<'a, Result<usize, SyncError>> {
        Box::pin(async move {
            if member_ids.is_empty() {
                return Ok(0);
            }

            let history_rows: Vec<NewHistoryRow<'_>> = member_ids
                .iter()
                .map(|member_id| NewHistoryRow {
                    definition_id,
                    sync_id,
                    member_id,
                    operation: operation.as_db_str(),
                })
                .collect();
            let member_rows: Vec<MemberRow<'_>> = match operation {
                MemberOperation::Add => member_ids
                    .iter()
                    .map(|member_id| MemberRow {
                        definition_id,
                        sync_id,
                        member_id,
                    })
                    .collect(),
                MemberOperation::Remove => Vec::new(),
            };
            let history_rows = &history_rows;
            let member_rows = &member_rows;

            let mut conn = self.pool.get().await?;
            conn.transaction::<_, DieselError, _>(|conn| {
                async move {
                    match operation {
                        MemberOperation::Add => {
                            insert_into(segment_members::table)
                                .values(member_rows)
                                .on_conflict((
                                    segment_members::definition_id,
                                    segment_members::member_id,
                                ))
                                .do_update()
                                .set(segment_members::sync_id.eq(excluded(segment_members::sync_id)))
                                .execute(conn)
                                .await?;
                            insert_into(segment_member_history::table)
                                .values(history_rows)
                                .execute(conn)
                                .await?;
                        }
                        MemberOperation::Remove => {
                            insert_into(segment_member_history::table)
                                .values(history_rows)
                                .execute(conn)
                                .await?;
                            diesel::delete(
                                segment_members::table
                                    .filter(segment_members::definition_id.eq(definition_id))
                                    .filter(segment_members::member_id.eq_any(member_ids)),
                            )
                            .execute(conn)
                            .await?;
                        }
                    }
                    Ok(())
                }
                .scope_boxed()
            })
            .await?;

            Ok(member_ids.len())
        })
    }

    fn latest_delta<'a>(
        &'a self,
        definition_id: i64,
    ) -> BoxFuture<'a, Result<Option<MembershipDelta>, SyncError>> {
        Box::pin(async move {
            let mut conn = self.pool.get().await?;
            // Partial history of a pending or failed run is never handed to destinations.
            let latest_sync: Option<i64> = segment_syncs::table
                .filter(segment_syncs::definition_id.eq(definition_id))
                .filter(segment_syncs::status.eq(SyncStatus::Completed.as_db_str()))
                .filter(
                    segment_syncs::id.eq_any(
                        segment_member_history::table
                            .filter(segment_member_history::definition_id.eq(definition_id))
                            .select(segment_member_history::sync_id),
                    ),
                )
                .select(max(segment_syncs::id))
                .first(&mut conn)
                .await?;
            let Some(sync_id) = latest_sync else {
                return Ok(None);
            };

            let rows: Vec<(String, String)> = segment_member_history::table
                .filter(segment_member_history::definition_id.eq(definition_id))
                .filter(segment_member_history::sync_id.eq(sync_id))
                .order(segment_member_history::id.asc())
                .select((
                    segment_member_history::member_id,
                    segment_member_history::operation,
                ))
                .load(&mut conn)
                .await?;

            let mut delta = MembershipDelta {
                sync_id,
                ..MembershipDelta::default()
            };
            for (member_id, operation) in rows {
                match MemberOperation::from_db_str(&operation)? {
                    MemberOperation::Add => delta.added.push(member_id),
                    MemberOperation::Remove => delta.removed.push(member_id),
                }
            }
            Ok(Some(delta))
        })
    }

    fn destination_mappings<'a>(
        &'a self,
        definition_id: i64,
    ) -> BoxFuture<'a, Result<Vec<DestinationMapping>, SyncError>> {
        Box::pin(async move {
            let mut conn = self.pool.get().await?;
            let rows: Vec<(DestinationMappingRow, DestinationDefinitionRow)> =
                segment_destination_mappings::table
                    .inner_join(segment_destination_definitions::table)
                    .filter(segment_destination_mappings::segment_definition_id.eq(definition_id))
                    .order(segment_destination_mappings::id.asc())
                    .select((
                        DestinationMappingRow::as_select(),
                        DestinationDefinitionRow::as_select(),
                    ))
                    .load(&mut conn)
                    .await?;
            Ok(rows
                .into_iter()
                .map(|(mapping, destination)| mapping_from_rows(mapping, destination))
                .collect())
        })
    }

    fn upsert_destination_sync<'a>(
        &'a self,
        mapping_id: i64,
        status: SyncStatus,
        stats: &'a DispatchStats,
        updated_at: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<(), SyncError>> {
        Box::pin(async move {
            let row = DestinationSyncRow {
                mapping_id,
                status: status.as_db_str(),
                stats: serde_json::to_value(stats)?,
                updated_at,
            };
            let mut conn = self.pool.get().await?;
            insert_into(segment_destination_syncs::table)
                .values(&row)
                .on_conflict(segment_destination_syncs::mapping_id)
                .do_update()
                .set(&row)
                .execute(&mut conn)
                .await?;
            Ok(())
        })
    }
}
