use diesel::result::Error as DieselError;
use diesel_async::pooled_connection::deadpool::PoolError;
use thiserror::Error;
use tokio::task::JoinError;

use crate::config::ConfigError;

/// Error taxonomy shared by every engine component.
///
/// Failures are isolated per definition and per destination mapping by the service layer; the
/// variant tells operators which side broke (bad input, backend, invariant, or a bug).
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("{entity} `{id}` was not found")]
    NotFound { entity: &'static str, id: String },

    #[error("invalid data: {0}")]
    InvalidData(String),

    #[error("service failure: {0}")]
    ServiceFailure(String),

    #[error("state violation: {0}")]
    StateViolation(String),

    #[error("unexpected error: {0}")]
    Exception(String),
}

impl SyncError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Short stable label used in logs and stats payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "not_found",
            Self::InvalidData(_) => "invalid_data",
            Self::ServiceFailure(_) => "service_failure",
            Self::StateViolation(_) => "state_violation",
            Self::Exception(_) => "exception",
        }
    }
}

impl From<DieselError> for SyncError {
    fn from(err: DieselError) -> Self {
        match err {
            DieselError::NotFound => Self::NotFound {
                entity: "row",
                id: "unknown".to_string(),
            },
            other => Self::ServiceFailure(format!("database error: {other}")),
        }
    }
}

impl From<PoolError> for SyncError {
    fn from(err: PoolError) -> Self {
        Self::ServiceFailure(format!("failed to acquire DB pool connection: {err}"))
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        Self::ServiceFailure(format!("http request failed: {err}"))
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidData(format!("json error: {err}"))
    }
}

impl From<JoinError> for SyncError {
    fn from(err: JoinError) -> Self {
        Self::Exception(format!("task join error: {err}"))
    }
}

impl From<ConfigError> for SyncError {
    fn from(err: ConfigError) -> Self {
        Self::InvalidData(err.to_string())
    }
}
