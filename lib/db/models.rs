use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde_json::Value;

use super::schema::{
    segment_definitions, segment_destination_definitions, segment_destination_mappings,
    segment_destination_syncs, segment_member_history, segment_members, segment_profiles,
    segment_syncs,
};

#[derive(Queryable, Selectable, Identifiable, Debug, Clone)]
#[diesel(table_name = segment_profiles)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct ProfileRow {
    pub id: i64,
    pub query: String,
    pub id_column: String,
    pub profile_schema: Value,
    pub label: String,
    pub description: Option<String>,
}

#[derive(Insertable, Debug)]
#[diesel(table_name = segment_profiles)]
pub struct NewProfileRow<'a> {
    pub query: &'a str,
    pub id_column: &'a str,
    pub profile_schema: Value,
    pub label: &'a str,
    pub description: Option<&'a str>,
}

#[derive(Queryable, Selectable, Identifiable, Debug, Clone)]
#[diesel(table_name = segment_definitions)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct DefinitionRow {
    pub id: i64,
    pub profile_id: i64,
    pub rule: String,
    pub label: String,
    pub schedule: String,
    pub description: Option<String>,
}

#[derive(Insertable, Debug)]
#[diesel(table_name = segment_definitions)]
pub struct NewDefinitionRow<'a> {
    pub profile_id: i64,
    pub rule: &'a str,
    pub label: &'a str,
    pub schedule: &'a str,
    pub description: Option<&'a str>,
}

#[derive(Queryable, Selectable, Identifiable, Debug, Clone)]
#[diesel(table_name = segment_syncs)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct SyncRow {
    pub id: i64,
    pub definition_id: i64,
    pub status: String,
    pub stats: Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Insertable, Debug)]
#[diesel(table_name = segment_syncs)]
pub struct NewSyncRow<'a> {
    pub definition_id: i64,
    pub status: &'a str,
    pub stats: Value,
}

#[derive(Insertable, Debug)]
#[diesel(table_name = segment_members)]
pub struct MemberRow<'a> {
    pub definition_id: i64,
    pub sync_id: i64,
    pub member_id: &'a str,
}

#[derive(Insertable, Debug)]
#[diesel(table_name = segment_member_history)]
pub struct NewHistoryRow<'a> {
    pub definition_id: i64,
    pub sync_id: i64,
    pub member_id: &'a str,
    pub operation: &'a str,
}

#[derive(Queryable, Selectable, Identifiable, Debug, Clone)]
#[diesel(table_name = segment_destination_definitions)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct DestinationDefinitionRow {
    pub id: i64,
    pub destination: String,
    pub label: String,
    pub description: Option<String>,
    pub destination_parameters: Value,
}

#[derive(Queryable, Selectable, Identifiable, Debug, Clone)]
#[diesel(table_name = segment_destination_mappings)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct DestinationMappingRow {
    pub id: i64,
    pub segment_definition_id: i64,
    pub destination_definition_id: i64,
    pub destination_config: Value,
}

#[derive(Insertable, AsChangeset, Debug)]
#[diesel(table_name = segment_destination_syncs)]
pub struct DestinationSyncRow<'a> {
    pub mapping_id: i64,
    pub status: &'a str,
    pub stats: Value,
    pub updated_at: DateTime<Utc>,
}
