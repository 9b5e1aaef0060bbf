use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::backend::BackendRouter;
use crate::error::SyncError;
use crate::query_builder::RenderedQuery;

/// Column name plus the backend's native type identifier, as read from a probe query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDescriptor {
    pub name: String,
    pub type_oid: u32,
}

impl ColumnDescriptor {
    pub fn new(name: impl Into<String>, type_oid: u32) -> Self {
        Self {
            name: name.into(),
            type_oid,
        }
    }
}

/// Backend-independent type vocabulary used by rule validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CanonicalType {
    Boolean,
    Integer,
    Numeric,
    Text,
    FixedChar,
    Date,
    Timestamp,
    Time,
    Json,
    Uuid,
}

impl CanonicalType {
    /// Maps a Postgres type OID. `None` means the type has no canonical name and is left out of
    /// the profile schema.
    pub fn from_type_oid(oid: u32) -> Option<Self> {
        let canonical = match oid {
            16 => Self::Boolean,
            20 | 21 | 23 | 26 => Self::Integer,
            700 | 701 | 790 | 1700 => Self::Numeric,
            19 | 25 | 1043 => Self::Text,
            18 | 1042 => Self::FixedChar,
            1082 => Self::Date,
            1114 | 1184 => Self::Timestamp,
            1083 | 1266 => Self::Time,
            114 | 3802 => Self::Json,
            2950 => Self::Uuid,
            _ => return None,
        };
        Some(canonical)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Boolean => "boolean",
            Self::Integer => "integer",
            Self::Numeric => "numeric",
            Self::Text => "text",
            Self::FixedChar => "fixed-char",
            Self::Date => "date",
            Self::Timestamp => "timestamp",
            Self::Time => "time",
            Self::Json => "json",
            Self::Uuid => "uuid",
        }
    }

    /// Types whose comparison values must be numbers or ISO dates.
    pub fn is_ordered_scalar(self) -> bool {
        matches!(
            self,
            Self::Integer | Self::Numeric | Self::Date | Self::Timestamp
        )
    }
}

/// Column name -> canonical type for a profile's output columns.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProfileSchema(BTreeMap<String, CanonicalType>);

impl ProfileSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, column: impl Into<String>, column_type: CanonicalType) {
        self.0.insert(column.into(), column_type);
    }

    pub fn get(&self, column: &str) -> Option<CanonicalType> {
        self.0.get(column).copied()
    }

    pub fn contains(&self, column: &str) -> bool {
        self.0.contains_key(column)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn from_json(value: Value) -> Result<Self, SyncError> {
        if value.is_null() {
            return Ok(Self::default());
        }
        serde_json::from_value(value)
            .map_err(|err| SyncError::InvalidData(format!("stored profile schema is invalid: {err}")))
    }

    pub fn to_json(&self) -> Result<Value, SyncError> {
        Ok(serde_json::to_value(self)?)
    }
}

impl FromIterator<(String, CanonicalType)> for ProfileSchema {
    fn from_iter<I: IntoIterator<Item = (String, CanonicalType)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Maps probed columns to canonical types. Unmapped type identifiers are dropped.
pub fn canonicalize(columns: &[ColumnDescriptor]) -> ProfileSchema {
    columns
        .iter()
        .filter_map(|column| match CanonicalType::from_type_oid(column.type_oid) {
            Some(canonical) => Some((column.name.clone(), canonical)),
            None => {
                debug!(
                    event = "schema_column_unmapped",
                    column = %column.name,
                    type_oid = column.type_oid,
                    "omitting column with unmapped type"
                );
                None
            }
        })
        .collect()
}

/// Probes `query` on whichever backend its text routes to and returns the canonical schema.
pub async fn introspect(
    router: &BackendRouter,
    query: &RenderedQuery,
) -> Result<ProfileSchema, SyncError> {
    let (kind, backend) = router.route(&query.sql)?;
    let columns = backend.probe_columns(query).await?;
    let schema = canonicalize(&columns);
    debug!(
        event = "schema_introspected",
        backend = kind.as_str(),
        probed_columns = columns.len(),
        mapped_columns = schema.len(),
        "introspected query schema"
    );
    Ok(schema)
}
