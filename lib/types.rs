use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SyncError;
use crate::schema_introspector::ProfileSchema;
use crate::sync_state::SyncStatus;

/// Base row-set a definition filters: a query template plus the column naming a member.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentProfile {
    pub id: i64,
    pub query: String,
    pub id_column: String,
    pub profile_schema: ProfileSchema,
    pub label: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentDefinition {
    pub id: i64,
    pub profile_id: i64,
    /// Boolean filter over the profile's output columns. Empty means "whole profile".
    pub rule: String,
    pub label: String,
    pub schedule: String,
    pub description: Option<String>,
}

/// Counts persisted on a `segment_syncs` row.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStats {
    pub members_added: usize,
    pub members_removed: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentSync {
    pub id: i64,
    pub definition_id: i64,
    pub status: SyncStatus,
    pub stats: SyncStats,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemberOperation {
    Add,
    Remove,
}

impl MemberOperation {
    pub fn as_db_str(self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Remove => "remove",
        }
    }

    pub fn from_db_str(value: &str) -> Result<Self, SyncError> {
        match value {
            "add" => Ok(Self::Add),
            "remove" => Ok(Self::Remove),
            other => Err(SyncError::InvalidData(format!(
                "invalid member history operation in database: {other}"
            ))),
        }
    }
}

/// Membership changes recorded by the most recent sync that wrote history.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MembershipDelta {
    pub sync_id: i64,
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

impl MembershipDelta {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DestinationDefinition {
    pub id: i64,
    /// Adapter type label: `endpoint`, `serviceOperation` or `store`.
    pub destination: String,
    pub label: String,
    pub description: Option<String>,
    pub parameters: Value,
}

/// A segment -> destination association, joined with its destination definition.
#[derive(Debug, Clone, PartialEq)]
pub struct DestinationMapping {
    pub id: i64,
    pub segment_definition_id: i64,
    pub destination: DestinationDefinition,
    /// Per-mapping overrides layered on top of the destination's parameters.
    pub config: Value,
}

/// Stats persisted on a `segment_destination_syncs` row.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchStats {
    pub members_added: usize,
    pub members_removed: usize,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub unresolved: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn is_zero(value: &usize) -> bool {
    *value == 0
}

#[cfg(test)]
mod tests {
    use super::{DispatchStats, SyncStats};

    #[test]
    fn sync_stats_serialize_camel_case_without_empty_error() {
        let stats = SyncStats {
            members_added: 2,
            members_removed: 1,
            error: None,
        };
        let json = serde_json::to_value(&stats).expect("stats serialize");
        assert_eq!(json, serde_json::json!({"membersAdded": 2, "membersRemoved": 1}));
    }

    #[test]
    fn dispatch_stats_tolerate_missing_optional_fields() {
        let stats: DispatchStats =
            serde_json::from_value(serde_json::json!({"membersAdded": 3, "membersRemoved": 0}))
                .expect("stats deserialize");
        assert_eq!(stats.members_added, 3);
        assert_eq!(stats.unresolved, 0);
        assert!(stats.error.is_none());
    }
}
