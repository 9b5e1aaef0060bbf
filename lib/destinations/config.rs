//! Typed views over destination parameters and per-mapping config.
//!
//! Both are free-form JSON objects in storage. A mapping's config overrides keys of its
//! destination's parameters.

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::error::SyncError;

/// Shallow merge of destination parameters with mapping overrides.
pub fn merged_config(parameters: &Value, overrides: &Value) -> Result<Map<String, Value>, SyncError> {
    let mut merged = as_object(parameters, "destination parameters")?;
    merged.extend(as_object(overrides, "destination config")?);
    Ok(merged)
}

fn as_object(value: &Value, what: &str) -> Result<Map<String, Value>, SyncError> {
    match value {
        Value::Null => Ok(Map::new()),
        Value::Object(map) => Ok(map.clone()),
        other => Err(SyncError::InvalidData(format!(
            "{what} must be a JSON object, got {other}"
        ))),
    }
}

fn parse<T: for<'de> Deserialize<'de>>(merged: &Map<String, Value>, what: &str) -> Result<T, SyncError> {
    serde_json::from_value(Value::Object(merged.clone()))
        .map_err(|err| SyncError::InvalidData(format!("invalid {what} config: {err}")))
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointConfig {
    pub api_url: String,
    /// Names of required parameters sent as query-string pairs.
    #[serde(default)]
    pub parameters: Vec<String>,
}

impl EndpointConfig {
    pub fn from_merged(merged: &Map<String, Value>) -> Result<Self, SyncError> {
        parse(merged, "endpoint")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(try_from = "RawDeleteMode")]
pub enum DeleteMode {
    /// Leave removed members' rows alone.
    #[default]
    Keep,
    /// Soft-delete by setting `status = 'closed'`.
    Close,
    Hard,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawDeleteMode {
    Flag(bool),
    Mode(String),
}

impl TryFrom<RawDeleteMode> for DeleteMode {
    type Error = String;

    fn try_from(raw: RawDeleteMode) -> Result<Self, Self::Error> {
        match raw {
            RawDeleteMode::Flag(true) => Ok(Self::Hard),
            RawDeleteMode::Flag(false) => Ok(Self::Keep),
            RawDeleteMode::Mode(mode) if mode == "closed" => Ok(Self::Close),
            RawDeleteMode::Mode(mode) => Err(format!(
                "delete must be true, false or \"closed\", got \"{mode}\""
            )),
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreSinkConfig {
    pub table: String,
    pub id_column: String,
    /// Extra columns written on every inserted row.
    #[serde(default)]
    pub static_columns: Map<String, Value>,
    /// When false the whole profile result is copied, not just newly added members.
    #[serde(default = "default_true")]
    pub filter: bool,
    #[serde(default)]
    pub delete: DeleteMode,
    /// Whether fetching zero rows for a non-empty delta counts as success.
    #[serde(default)]
    pub allow_empty: bool,
}

impl StoreSinkConfig {
    pub fn from_merged(merged: &Map<String, Value>) -> Result<Self, SyncError> {
        parse(merged, "store")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceOperationConfig {
    pub operation: String,
    /// Remote segment name. Defaults to the definition label.
    #[serde(default)]
    pub segment_name: Option<String>,
}

impl ServiceOperationConfig {
    pub fn from_merged(merged: &Map<String, Value>) -> Result<Self, SyncError> {
        parse(merged, "service operation")
    }
}
