use std::sync::LazyLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use tracing::{debug, warn};

use crate::error::SyncError;

static RATE_RE: LazyLock<Result<Regex, regex::Error>> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*rate\s*\(\s*(\d+)\s+(minutes?|hours?|days?)\s*\)\s*$")
});

const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(60 * 60);
const DAY: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schedule {
    /// Runs until one sync completes, then never again.
    OneTime,
    /// Runs whenever this much time has passed since the last completed sync.
    Rate(Duration),
}

impl Schedule {
    pub fn parse(raw: &str) -> Result<Self, SyncError> {
        if normalize(raw) == "onetime" {
            return Ok(Self::OneTime);
        }

        let re = RATE_RE
            .as_ref()
            .map_err(|err| SyncError::Exception(format!("schedule pattern failed to compile: {err}")))?;
        let caps = re
            .captures(raw)
            .ok_or_else(|| SyncError::InvalidData(format!("malformed schedule `{raw}`")))?;

        let count: u32 = caps[1]
            .parse()
            .map_err(|_| SyncError::InvalidData(format!("schedule count out of range in `{raw}`")))?;
        if count == 0 {
            return Err(SyncError::InvalidData(format!(
                "schedule `{raw}` must use a positive count"
            )));
        }

        let unit = match caps[2].to_ascii_lowercase().trim_end_matches('s') {
            "minute" => MINUTE,
            "hour" => HOUR,
            _ => DAY,
        };
        Ok(Self::Rate(unit.saturating_mul(count)))
    }
}

/// Lowercases and drops everything but letters and digits, so `One-Time`, `one time` and
/// `ONE_TIME` all compare equal.
fn normalize(raw: &str) -> String {
    raw.chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

/// A definition's schedule together with when it last completed a sync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleCandidate {
    pub definition_id: i64,
    pub schedule: String,
    pub last_completed_at: Option<DateTime<Utc>>,
}

/// Decides whether one definition needs a sync at `now`.
///
/// A definition that never completed is always due, even when its schedule is malformed.
pub fn is_due(
    schedule: &str,
    last_completed_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Result<bool, SyncError> {
    let Some(last_completed_at) = last_completed_at else {
        return Ok(true);
    };

    match Schedule::parse(schedule)? {
        Schedule::OneTime => Ok(false),
        Schedule::Rate(interval) => {
            let Ok(elapsed) = (now - last_completed_at).to_std() else {
                return Ok(false);
            };
            Ok(elapsed >= interval)
        }
    }
}

/// Returns due definition ids in input order. Malformed schedules are logged and skipped.
pub fn due_definition_ids(candidates: &[ScheduleCandidate], now: DateTime<Utc>) -> Vec<i64> {
    let mut due = Vec::new();
    for candidate in candidates {
        match is_due(&candidate.schedule, candidate.last_completed_at, now) {
            Ok(true) => due.push(candidate.definition_id),
            Ok(false) => {}
            Err(err) => {
                warn!(
                    event = "schedule_invalid",
                    definition_id = candidate.definition_id,
                    schedule = %candidate.schedule,
                    error = %err,
                    "skipping definition with malformed schedule"
                );
            }
        }
    }
    debug!(
        event = "due_definitions_computed",
        candidates = candidates.len(),
        due = due.len(),
        "computed due definitions"
    );
    due
}
