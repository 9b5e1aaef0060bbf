use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde_json::Value;

use crate::backend::{BackendRouter, IdFilter, JsonRow, QueryBackend};
use crate::destinations::endpoint::EndpointCaller;
use crate::destinations::marketing_platform::{
    ExternalIdentifier, IdType, MarketingPlatform, RemoteSegment,
};
use crate::destinations::store_sink::RelationalSink;
use crate::error::SyncError;
use crate::query_builder::RenderedQuery;
use crate::repository::{NewDefinition, NewProfile, SegmentRepository};
use crate::scheduler::ScheduleCandidate;
use crate::schema_introspector::{ColumnDescriptor, ProfileSchema};
use crate::sync_state::SyncStatus;
use crate::types::{
    DestinationDefinition, DestinationMapping, DispatchStats, MemberOperation, MembershipDelta,
    SegmentDefinition, SegmentProfile, SegmentSync, SyncStats,
};

pub(crate) fn sample_profile(query: &str) -> SegmentProfile {
    SegmentProfile {
        id: 1,
        query: query.to_string(),
        id_column: "id".to_string(),
        profile_schema: ProfileSchema::new(),
        label: "users".to_string(),
        description: None,
    }
}

pub(crate) fn sample_definition(id: i64, rule: &str) -> SegmentDefinition {
    SegmentDefinition {
        id,
        profile_id: 1,
        rule: rule.to_string(),
        label: "active_users".to_string(),
        schedule: "rate(1 hour)".to_string(),
        description: None,
    }
}

/// A mapping of definition 9 to a destination of type `destination`.
pub(crate) fn sample_mapping(
    id: i64,
    destination: &str,
    parameters: Value,
    config: Value,
) -> DestinationMapping {
    DestinationMapping {
        id,
        segment_definition_id: 9,
        destination: DestinationDefinition {
            id: 100 + id,
            destination: destination.to_string(),
            label: format!("{destination}-{id}"),
            description: None,
            parameters,
        },
        config,
    }
}

/// Store backend plus optional warehouse, routed on the `warehouse.` marker.
pub(crate) fn router_with(
    store: Arc<ScriptedBackend>,
    warehouse: Option<Arc<ScriptedBackend>>,
) -> BackendRouter {
    BackendRouter::new(
        store,
        warehouse.map(|backend| backend as Arc<dyn QueryBackend>),
        "warehouse.",
    )
}

type HistoryRow = (i64, i64, MemberOperation, String);

#[derive(Default)]
struct RepoState {
    next_id: i64,
    profiles: BTreeMap<i64, SegmentProfile>,
    definitions: BTreeMap<i64, SegmentDefinition>,
    syncs: Vec<SegmentSync>,
    members: HashMap<i64, BTreeSet<String>>,
    history: Vec<HistoryRow>,
    mappings: Vec<DestinationMapping>,
    destination_syncs: HashMap<i64, (SyncStatus, DispatchStats)>,
}

impl RepoState {
    fn allocate_id(&mut self) -> i64 {
        self.next_id += 1;
        1000 + self.next_id
    }
}

/// Mirrors the Postgres repository's invariants in memory: one active sync row per
/// definition, completed rows are terminal, and each chunk applies atomically.
#[derive(Default)]
pub(crate) struct InMemoryRepository {
    state: Mutex<RepoState>,
    failing_member: Mutex<Option<String>>,
    chunk_yields: usize,
    chunk_sizes: Mutex<Vec<usize>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl InMemoryRepository {
    fn state(&self) -> std::sync::MutexGuard<'_, RepoState> {
        self.state.lock().expect("repository state mutex poisoned")
    }

    pub(crate) fn with_profile(self, profile: SegmentProfile) -> Self {
        self.state().profiles.insert(profile.id, profile);
        self
    }

    pub(crate) fn with_definition(self, definition: SegmentDefinition) -> Self {
        self.state().definitions.insert(definition.id, definition);
        self
    }

    pub(crate) fn with_mapping(self, mapping: DestinationMapping) -> Self {
        self.state().mappings.push(mapping);
        self
    }

    pub(crate) fn with_completed_sync(self, definition_id: i64, created_at: DateTime<Utc>) -> Self {
        {
            let mut state = self.state();
            let id = state.allocate_id();
            state.syncs.push(SegmentSync {
                id,
                definition_id,
                status: SyncStatus::Completed,
                stats: SyncStats::default(),
                created_at,
            });
        }
        self
    }

    /// Any chunk containing `member_id` fails before touching state.
    pub(crate) fn failing_on_member(self, member_id: &str) -> Self {
        *self
            .failing_member
            .lock()
            .expect("failing_member mutex poisoned") = Some(member_id.to_string());
        self
    }

    pub(crate) fn clear_failures(&self) {
        *self
            .failing_member
            .lock()
            .expect("failing_member mutex poisoned") = None;
    }

    /// Each chunk yields to the runtime `yields` times while counted as in flight.
    pub(crate) fn with_chunk_yields(mut self, yields: usize) -> Self {
        self.chunk_yields = yields;
        self
    }

    pub(crate) fn seed_members(&self, definition_id: i64, member_ids: &[&str]) {
        self.state()
            .members
            .entry(definition_id)
            .or_default()
            .extend(member_ids.iter().map(|id| id.to_string()));
    }

    /// Sorted current members.
    pub(crate) fn members(&self, definition_id: i64) -> Vec<String> {
        self.state()
            .members
            .get(&definition_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// `(sync_id, operation, member_id)` in write order.
    pub(crate) fn history(&self, definition_id: i64) -> Vec<(i64, MemberOperation, String)> {
        self.state()
            .history
            .iter()
            .filter(|row| row.0 == definition_id)
            .map(|(_, sync_id, operation, member_id)| (*sync_id, *operation, member_id.clone()))
            .collect()
    }

    pub(crate) fn sync_rows(&self, definition_id: i64) -> Vec<SegmentSync> {
        self.state()
            .syncs
            .iter()
            .filter(|row| row.definition_id == definition_id)
            .cloned()
            .collect()
    }

    pub(crate) fn destination_statuses(&self) -> HashMap<i64, (SyncStatus, DispatchStats)> {
        self.state().destination_syncs.clone()
    }

    /// Size of every chunk handed to `apply_chunk`, failed ones included.
    pub(crate) fn chunk_sizes(&self) -> Vec<usize> {
        self.chunk_sizes
            .lock()
            .expect("chunk_sizes mutex poisoned")
            .clone()
    }

    pub(crate) fn max_concurrent_chunks(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

impl SegmentRepository for InMemoryRepository {
    fn get_profile<'a>(&'a self, profile_id: i64) -> BoxFuture<'a, Result<SegmentProfile, SyncError>> {
        Box::pin(async move {
            self.state()
                .profiles
                .get(&profile_id)
                .cloned()
                .ok_or_else(|| SyncError::not_found("segment profile", profile_id))
        })
    }

    fn create_profile<'a>(
        &'a self,
        profile: &'a NewProfile,
    ) -> BoxFuture<'a, Result<SegmentProfile, SyncError>> {
        Box::pin(async move {
            let mut state = self.state();
            let created = SegmentProfile {
                id: state.allocate_id(),
                query: profile.query.clone(),
                id_column: profile.id_column.clone(),
                profile_schema: profile.profile_schema.clone(),
                label: profile.label.clone(),
                description: profile.description.clone(),
            };
            state.profiles.insert(created.id, created.clone());
            Ok(created)
        })
    }

    fn update_profile_schema<'a>(
        &'a self,
        profile_id: i64,
        schema: &'a ProfileSchema,
    ) -> BoxFuture<'a, Result<(), SyncError>> {
        Box::pin(async move {
            let mut state = self.state();
            let profile = state
                .profiles
                .get_mut(&profile_id)
                .ok_or_else(|| SyncError::not_found("segment profile", profile_id))?;
            profile.profile_schema = schema.clone();
            Ok(())
        })
    }

    fn get_definition<'a>(
        &'a self,
        definition_id: i64,
    ) -> BoxFuture<'a, Result<SegmentDefinition, SyncError>> {
        Box::pin(async move {
            self.state()
                .definitions
                .get(&definition_id)
                .cloned()
                .ok_or_else(|| SyncError::not_found("segment definition", definition_id))
        })
    }

    fn create_definition<'a>(
        &'a self,
        definition: &'a NewDefinition,
    ) -> BoxFuture<'a, Result<SegmentDefinition, SyncError>> {
        Box::pin(async move {
            let mut state = self.state();
            if !state.profiles.contains_key(&definition.profile_id) {
                return Err(SyncError::not_found("segment profile", definition.profile_id));
            }
            let created = SegmentDefinition {
                id: state.allocate_id(),
                profile_id: definition.profile_id,
                rule: definition.rule.clone(),
                label: definition.label.clone(),
                schedule: definition.schedule.clone(),
                description: definition.description.clone(),
            };
            state.definitions.insert(created.id, created.clone());
            Ok(created)
        })
    }

    fn update_definition_rule<'a>(
        &'a self,
        definition_id: i64,
        rule: &'a str,
    ) -> BoxFuture<'a, Result<(), SyncError>> {
        Box::pin(async move {
            let mut state = self.state();
            let definition = state
                .definitions
                .get_mut(&definition_id)
                .ok_or_else(|| SyncError::not_found("segment definition", definition_id))?;
            definition.rule = rule.to_string();
            Ok(())
        })
    }

    fn list_schedule_candidates<'a>(
        &'a self,
    ) -> BoxFuture<'a, Result<Vec<ScheduleCandidate>, SyncError>> {
        Box::pin(async move {
            let state = self.state();
            Ok(state
                .definitions
                .values()
                .map(|definition| ScheduleCandidate {
                    definition_id: definition.id,
                    schedule: definition.schedule.clone(),
                    last_completed_at: state
                        .syncs
                        .iter()
                        .filter(|row| {
                            row.definition_id == definition.id
                                && row.status == SyncStatus::Completed
                        })
                        .map(|row| row.created_at)
                        .max(),
                })
                .collect())
        })
    }

    fn active_syncs<'a>(
        &'a self,
        definition_id: i64,
    ) -> BoxFuture<'a, Result<Vec<SegmentSync>, SyncError>> {
        Box::pin(async move {
            Ok(self
                .state()
                .syncs
                .iter()
                .filter(|row| row.definition_id == definition_id && row.status.is_active())
                .cloned()
                .collect())
        })
    }

    fn create_sync<'a>(&'a self, definition_id: i64) -> BoxFuture<'a, Result<SegmentSync, SyncError>> {
        Box::pin(async move {
            let mut state = self.state();
            if state
                .syncs
                .iter()
                .any(|row| row.definition_id == definition_id && row.status.is_active())
            {
                return Err(SyncError::StateViolation(format!(
                    "definition {definition_id} already has an active sync row"
                )));
            }
            let created = SegmentSync {
                id: state.allocate_id(),
                definition_id,
                status: SyncStatus::Pending,
                stats: SyncStats::default(),
                created_at: Utc::now(),
            };
            state.syncs.push(created.clone());
            Ok(created)
        })
    }

    fn update_sync<'a>(
        &'a self,
        sync_id: i64,
        status: SyncStatus,
        stats: &'a SyncStats,
    ) -> BoxFuture<'a, Result<SegmentSync, SyncError>> {
        Box::pin(async move {
            let mut state = self.state();
            let row = state
                .syncs
                .iter_mut()
                .find(|row| row.id == sync_id && row.status != SyncStatus::Completed)
                .ok_or_else(|| {
                    SyncError::StateViolation(format!(
                        "sync {sync_id} is missing or already completed"
                    ))
                })?;
            row.status = status;
            row.stats = stats.clone();
            Ok(row.clone())
        })
    }

    fn current_members<'a>(
        &'a self,
        definition_id: i64,
    ) -> BoxFuture<'a, Result<HashSet<String>, SyncError>> {
        Box::pin(async move {
            Ok(self
                .state()
                .members
                .get(&definition_id)
                .map(|set| set.iter().cloned().collect())
                .unwrap_or_default())
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
            self.chunk_sizes
                .lock()
                .expect("chunk_sizes mutex poisoned")
                .push(member_ids.len());

            let failing = self
                .failing_member
                .lock()
                .expect("failing_member mutex poisoned")
                .clone();
            if let Some(failing) = failing {
                if member_ids.contains(&failing) {
                    return Err(SyncError::ServiceFailure(format!(
                        "scripted chunk failure on member {failing}"
                    )));
                }
            }

            let now_in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now_in_flight, Ordering::SeqCst);
            for _ in 0..self.chunk_yields {
                tokio::task::yield_now().await;
            }

            {
                let mut state = self.state();
                for member_id in member_ids {
                    state
                        .history
                        .push((definition_id, sync_id, operation, member_id.clone()));
                }
                let members = state.members.entry(definition_id).or_default();
                match operation {
                    MemberOperation::Add => members.extend(member_ids.iter().cloned()),
                    MemberOperation::Remove => {
                        for member_id in member_ids {
                            members.remove(member_id);
                        }
                    }
                }
            }

            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(member_ids.len())
        })
    }

    fn latest_delta<'a>(
        &'a self,
        definition_id: i64,
    ) -> BoxFuture<'a, Result<Option<MembershipDelta>, SyncError>> {
        Box::pin(async move {
            let state = self.state();
            let completed: HashSet<i64> = state
                .syncs
                .iter()
                .filter(|sync| sync.definition_id == definition_id)
                .filter(|sync| sync.status == SyncStatus::Completed)
                .map(|sync| sync.id)
                .collect();
            let rows: Vec<&HistoryRow> = state
                .history
                .iter()
                .filter(|row| row.0 == definition_id && completed.contains(&row.1))
                .collect();
            let Some(sync_id) = rows.iter().map(|row| row.1).max() else {
                return Ok(None);
            };

            let mut delta = MembershipDelta {
                sync_id,
                ..MembershipDelta::default()
            };
            for (_, _, operation, member_id) in rows.into_iter().filter(|row| row.1 == sync_id) {
                match operation {
                    MemberOperation::Add => delta.added.push(member_id.clone()),
                    MemberOperation::Remove => delta.removed.push(member_id.clone()),
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
            Ok(self
                .state()
                .mappings
                .iter()
                .filter(|mapping| mapping.segment_definition_id == definition_id)
                .cloned()
                .collect())
        })
    }

    fn upsert_destination_sync<'a>(
        &'a self,
        mapping_id: i64,
        status: SyncStatus,
        stats: &'a DispatchStats,
        _updated_at: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<(), SyncError>> {
        Box::pin(async move {
            self.state()
                .destination_syncs
                .insert(mapping_id, (status, stats.clone()));
            Ok(())
        })
    }
}

/// Query backend that answers from fixed data and records what it was asked.
#[derive(Default)]
pub(crate) struct ScriptedBackend {
    members: HashSet<String>,
    columns: Vec<ColumnDescriptor>,
    rows: Vec<JsonRow>,
    sql_log: Mutex<Vec<String>>,
    probe_calls: AtomicUsize,
    fetch_calls: AtomicUsize,
    last_filter_ids: Mutex<Option<Vec<String>>>,
    last_filter_column: Mutex<Option<String>>,
}

impl ScriptedBackend {
    pub(crate) fn with_members(mut self, members: &[&str]) -> Self {
        self.members = members.iter().map(|id| id.to_string()).collect();
        self
    }

    pub(crate) fn with_columns(mut self, columns: Vec<ColumnDescriptor>) -> Self {
        self.columns = columns;
        self
    }

    pub(crate) fn with_rows(mut self, rows: Vec<JsonRow>) -> Self {
        self.rows = rows;
        self
    }

    pub(crate) fn last_sql(&self) -> Option<String> {
        self.sql_log
            .lock()
            .expect("sql_log mutex poisoned")
            .last()
            .cloned()
    }

    pub(crate) fn probe_calls(&self) -> usize {
        self.probe_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    /// Ids passed to the latest `fetch_rows`; `None` when it was unfiltered.
    pub(crate) fn last_filter_ids(&self) -> Option<Vec<String>> {
        self.last_filter_ids
            .lock()
            .expect("last_filter_ids mutex poisoned")
            .clone()
    }

    pub(crate) fn last_filter_column(&self) -> Option<String> {
        self.last_filter_column
            .lock()
            .expect("last_filter_column mutex poisoned")
            .clone()
    }

    fn record_sql(&self, query: &RenderedQuery) {
        self.sql_log
            .lock()
            .expect("sql_log mutex poisoned")
            .push(query.sql.clone());
    }
}

fn cell_text(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

impl QueryBackend for ScriptedBackend {
    fn probe_columns<'a>(
        &'a self,
        query: &'a RenderedQuery,
    ) -> BoxFuture<'a, Result<Vec<ColumnDescriptor>, SyncError>> {
        Box::pin(async move {
            self.record_sql(query);
            self.probe_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.columns.clone())
        })
    }

    fn distinct_values<'a>(
        &'a self,
        query: &'a RenderedQuery,
        _column: &'a str,
    ) -> BoxFuture<'a, Result<HashSet<String>, SyncError>> {
        Box::pin(async move {
            self.record_sql(query);
            Ok(self.members.clone())
        })
    }

    fn fetch_rows<'a>(
        &'a self,
        query: &'a RenderedQuery,
        filter: Option<IdFilter<'a>>,
    ) -> BoxFuture<'a, Result<Vec<JsonRow>, SyncError>> {
        Box::pin(async move {
            self.record_sql(query);
            self.fetch_calls.fetch_add(1, Ordering::SeqCst);
            *self
                .last_filter_ids
                .lock()
                .expect("last_filter_ids mutex poisoned") = filter.map(|f| f.ids.to_vec());
            *self
                .last_filter_column
                .lock()
                .expect("last_filter_column mutex poisoned") = filter.map(|f| f.column.to_string());

            Ok(match filter {
                None => self.rows.clone(),
                Some(filter) => self
                    .rows
                    .iter()
                    .filter(|row| {
                        row.get(filter.column)
                            .and_then(cell_text)
                            .is_some_and(|id| filter.ids.contains(&id))
                    })
                    .cloned()
                    .collect(),
            })
        })
    }
}

pub(crate) struct RecordingEndpoint {
    body: String,
    calls: Mutex<Vec<(String, Vec<(String, String)>)>>,
}

impl RecordingEndpoint {
    pub(crate) fn responding(body: &str) -> Self {
        Self {
            body: body.to_string(),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn calls(&self) -> Vec<(String, Vec<(String, String)>)> {
        self.calls.lock().expect("calls mutex poisoned").clone()
    }
}

impl EndpointCaller for RecordingEndpoint {
    fn get<'a>(
        &'a self,
        url: &'a str,
        query: &'a [(String, String)],
    ) -> BoxFuture<'a, Result<String, SyncError>> {
        Box::pin(async move {
            self.calls
                .lock()
                .expect("calls mutex poisoned")
                .push((url.to_string(), query.to_vec()));
            Ok(self.body.clone())
        })
    }
}

#[derive(Default)]
pub(crate) struct RecordingSink {
    inserted: Mutex<Vec<JsonRow>>,
    closed: Mutex<Vec<String>>,
    deleted: Mutex<Vec<String>>,
    delete_columns: Mutex<Vec<String>>,
}

impl RecordingSink {
    pub(crate) fn inserted(&self) -> Vec<JsonRow> {
        self.inserted.lock().expect("inserted mutex poisoned").clone()
    }

    pub(crate) fn closed(&self) -> Vec<String> {
        self.closed.lock().expect("closed mutex poisoned").clone()
    }

    pub(crate) fn deleted(&self) -> Vec<String> {
        self.deleted.lock().expect("deleted mutex poisoned").clone()
    }

    /// `id_column` of each `delete_rows` call.
    pub(crate) fn delete_columns(&self) -> Vec<String> {
        self.delete_columns
            .lock()
            .expect("delete_columns mutex poisoned")
            .clone()
    }
}

impl RelationalSink for RecordingSink {
    fn insert_rows<'a>(
        &'a self,
        _table: &'a str,
        rows: &'a [JsonRow],
    ) -> BoxFuture<'a, Result<usize, SyncError>> {
        Box::pin(async move {
            self.inserted
                .lock()
                .expect("inserted mutex poisoned")
                .extend(rows.iter().cloned());
            Ok(rows.len())
        })
    }

    fn close_rows<'a>(
        &'a self,
        _table: &'a str,
        _id_column: &'a str,
        ids: &'a [String],
    ) -> BoxFuture<'a, Result<usize, SyncError>> {
        Box::pin(async move {
            self.closed
                .lock()
                .expect("closed mutex poisoned")
                .extend(ids.iter().cloned());
            Ok(ids.len())
        })
    }

    fn delete_rows<'a>(
        &'a self,
        _table: &'a str,
        id_column: &'a str,
        ids: &'a [String],
    ) -> BoxFuture<'a, Result<usize, SyncError>> {
        Box::pin(async move {
            self.delete_columns
                .lock()
                .expect("delete_columns mutex poisoned")
                .push(id_column.to_string());
            self.deleted
                .lock()
                .expect("deleted mutex poisoned")
                .extend(ids.iter().cloned());
            Ok(ids.len())
        })
    }
}

type MembershipBatch = (i64, IdType, Vec<String>);

/// Marketing platform double. Every known member resolves to an `id` identifier.
#[derive(Default)]
pub(crate) struct RecordingPlatform {
    segments: Mutex<Vec<RemoteSegment>>,
    unknown_members: HashSet<String>,
    created: Mutex<Vec<String>>,
    list_calls: AtomicUsize,
    resolve_calls: AtomicUsize,
    added: Mutex<Vec<MembershipBatch>>,
    removed: Mutex<Vec<MembershipBatch>>,
}

impl RecordingPlatform {
    pub(crate) fn with_segment(self, id: i64, name: &str) -> Self {
        self.segments
            .lock()
            .expect("segments mutex poisoned")
            .push(RemoteSegment {
                id,
                name: name.to_string(),
                description: None,
            });
        self
    }

    pub(crate) fn with_unknown_member(mut self, member_id: &str) -> Self {
        self.unknown_members.insert(member_id.to_string());
        self
    }

    pub(crate) fn created_segments(&self) -> Vec<String> {
        self.created.lock().expect("created mutex poisoned").clone()
    }

    pub(crate) fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn resolve_calls(&self) -> usize {
        self.resolve_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn added_batches(&self) -> Vec<MembershipBatch> {
        self.added.lock().expect("added mutex poisoned").clone()
    }

    pub(crate) fn removed_batches(&self) -> Vec<MembershipBatch> {
        self.removed.lock().expect("removed mutex poisoned").clone()
    }
}

impl MarketingPlatform for RecordingPlatform {
    fn list_segments<'a>(&'a self) -> BoxFuture<'a, Result<Vec<RemoteSegment>, SyncError>> {
        Box::pin(async move {
            self.list_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.segments.lock().expect("segments mutex poisoned").clone())
        })
    }

    fn create_segment<'a>(
        &'a self,
        name: &'a str,
        description: &'a str,
    ) -> BoxFuture<'a, Result<RemoteSegment, SyncError>> {
        Box::pin(async move {
            let mut segments = self.segments.lock().expect("segments mutex poisoned");
            let segment = RemoteSegment {
                id: 500 + segments.len() as i64,
                name: name.to_string(),
                description: Some(description.to_string()),
            };
            segments.push(segment.clone());
            self.created
                .lock()
                .expect("created mutex poisoned")
                .push(name.to_string());
            Ok(segment)
        })
    }

    fn resolve_identifier<'a>(
        &'a self,
        member_id: &'a str,
    ) -> BoxFuture<'a, Result<Option<ExternalIdentifier>, SyncError>> {
        Box::pin(async move {
            self.resolve_calls.fetch_add(1, Ordering::SeqCst);
            if self.unknown_members.contains(member_id) {
                return Ok(None);
            }
            Ok(Some(ExternalIdentifier::Id(member_id.to_string())))
        })
    }

    fn add_members<'a>(
        &'a self,
        segment_id: i64,
        id_type: IdType,
        ids: &'a [String],
    ) -> BoxFuture<'a, Result<(), SyncError>> {
        Box::pin(async move {
            self.added
                .lock()
                .expect("added mutex poisoned")
                .push((segment_id, id_type, ids.to_vec()));
            Ok(())
        })
    }

    fn remove_members<'a>(
        &'a self,
        segment_id: i64,
        id_type: IdType,
        ids: &'a [String],
    ) -> BoxFuture<'a, Result<(), SyncError>> {
        Box::pin(async move {
            self.removed
                .lock()
                .expect("removed mutex poisoned")
                .push((segment_id, id_type, ids.to_vec()));
            Ok(())
        })
    }
}
