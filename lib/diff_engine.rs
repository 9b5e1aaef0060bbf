use std::collections::{HashMap, HashSet};

use chrono::NaiveDate;
use tracing::info;

use crate::backend::BackendRouter;
use crate::error::SyncError;
use crate::query_builder::{render_query, RenderedQuery};
use crate::repository::SegmentRepository;
use crate::types::{SegmentDefinition, SegmentProfile};

/// Alias the profile query is wrapped under when a rule is applied.
pub const PROFILE_ALIAS: &str = "segment_profile";

/// Membership change between the recorded and the freshly computed member sets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MembershipDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

impl MembershipDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// `added = current - previous`, `removed = previous - current`. Output is sorted.
pub fn diff_members(previous: &HashSet<String>, current: &HashSet<String>) -> MembershipDiff {
    let mut added: Vec<String> = current.difference(previous).cloned().collect();
    let mut removed: Vec<String> = previous.difference(current).cloned().collect();
    added.sort_unstable();
    removed.sort_unstable();
    MembershipDiff { added, removed }
}

/// Values bound into profile query templates at run time.
pub fn runtime_parameters(definition_id: i64, run_date: NaiveDate) -> HashMap<String, String> {
    HashMap::from([
        ("definition_id".to_string(), definition_id.to_string()),
        ("run_date".to_string(), run_date.format("%Y-%m-%d").to_string()),
    ])
}

/// ANDs `rule` onto the profile query. The rule text is spliced in as-is; it was validated
/// against the profile's output columns when the definition was saved.
pub fn compose_segment_query(profile_query: &RenderedQuery, rule: &str) -> RenderedQuery {
    let rule = rule.trim();
    if rule.is_empty() {
        return profile_query.clone();
    }
    profile_query.map_sql(|sql| {
        format!("SELECT * FROM ({sql}) AS {PROFILE_ALIAS} WHERE ({rule})")
    })
}

/// Builds the executable member query for a definition.
pub fn segment_query(
    profile: &SegmentProfile,
    definition: &SegmentDefinition,
    params: &HashMap<String, String>,
) -> Result<RenderedQuery, SyncError> {
    let profile_query = render_query(&profile.query, params)?;
    Ok(compose_segment_query(&profile_query, &definition.rule))
}

/// Runs the definition's query on its backend and diffs the result against stored membership.
pub async fn compute_diff(
    repo: &dyn SegmentRepository,
    router: &BackendRouter,
    profile: &SegmentProfile,
    definition: &SegmentDefinition,
    params: &HashMap<String, String>,
) -> Result<MembershipDiff, SyncError> {
    let query = segment_query(profile, definition, params)?;
    let (kind, backend) = router.route(&query.sql)?;

    let current = backend.distinct_values(&query, &profile.id_column).await?;
    let previous = repo.current_members(definition.id).await?;
    let diff = diff_members(&previous, &current);

    info!(
        event = "membership_diff_computed",
        definition_id = definition.id,
        backend = kind.as_str(),
        current_members = current.len(),
        previous_members = previous.len(),
        added = diff.added.len(),
        removed = diff.removed.len(),
        "computed membership diff"
    );
    Ok(diff)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema_introspector::ProfileSchema;
    use crate::test_support::{router_with, InMemoryRepository, ScriptedBackend};
    use proptest::collection::hash_set;
    use proptest::prelude::*;
    use std::sync::Arc;

    fn set(values: &[&str]) -> HashSet<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    fn profile(query: &str) -> SegmentProfile {
        SegmentProfile {
            id: 1,
            query: query.to_string(),
            id_column: "id".to_string(),
            profile_schema: ProfileSchema::new(),
            label: "users".to_string(),
            description: None,
        }
    }

    fn definition(rule: &str) -> SegmentDefinition {
        SegmentDefinition {
            id: 9,
            profile_id: 1,
            rule: rule.to_string(),
            label: "active_users".to_string(),
            schedule: "rate(1 hour)".to_string(),
            description: None,
        }
    }

    #[test]
    fn diff_matches_worked_example() {
        let diff = diff_members(&set(&["1", "2", "3"]), &set(&["2", "3", "4"]));
        assert_eq!(diff.added, vec!["4".to_string()]);
        assert_eq!(diff.removed, vec!["1".to_string()]);
    }

    #[test]
    fn rule_is_wrapped_around_profile_query() {
        let composed = compose_segment_query(
            &RenderedQuery::raw("SELECT id, active FROM t"),
            "active = true",
        );
        assert_eq!(
            composed.sql,
            "SELECT * FROM (SELECT id, active FROM t) AS segment_profile WHERE (active = true)"
        );

        let bare = compose_segment_query(&RenderedQuery::raw("SELECT id FROM t"), "  ");
        assert_eq!(bare.sql, "SELECT id FROM t");
    }

    #[test]
    fn runtime_parameters_render_into_profile_templates() {
        let params = runtime_parameters(9, NaiveDate::from_ymd_opt(2026, 2, 3).unwrap());
        let query = segment_query(
            &profile("SELECT id FROM visits WHERE day <= '${run_date}' AND seg = ${definition_id}"),
            &definition(""),
            &params,
        )
        .unwrap();
        assert_eq!(
            query.sql,
            "SELECT id FROM visits WHERE day <= '2026-02-03' AND seg = '9'"
        );
    }

    #[tokio::test]
    async fn compute_diff_uses_stored_membership() {
        let repo = InMemoryRepository::default();
        repo.seed_members(9, &["1", "2", "3"]);
        let store = Arc::new(ScriptedBackend::default().with_members(&["2", "3", "4"]));
        let router = router_with(store.clone(), None);

        let diff = compute_diff(
            &repo,
            &router,
            &profile("SELECT id, active FROM t"),
            &definition("active = true"),
            &HashMap::new(),
        )
        .await
        .unwrap();

        assert_eq!(diff.added, vec!["4".to_string()]);
        assert_eq!(diff.removed, vec!["1".to_string()]);
        assert!(store
            .last_sql()
            .unwrap_or_default()
            .contains("WHERE (active = true)"));
    }

    #[tokio::test]
    async fn unchanged_data_yields_empty_diff() {
        let repo = InMemoryRepository::default();
        repo.seed_members(9, &["a", "b"]);
        let router = router_with(
            Arc::new(ScriptedBackend::default().with_members(&["a", "b"])),
            None,
        );

        let diff = compute_diff(&repo, &router, &profile("SELECT id FROM t"), &definition(""), &HashMap::new())
            .await
            .unwrap();
        assert!(diff.is_empty());
    }

    proptest! {
        #[test]
        fn diff_is_set_difference(
            previous in hash_set("[a-f0-9]{1,3}", 0..40),
            current in hash_set("[a-f0-9]{1,3}", 0..40),
        ) {
            let diff = diff_members(&previous, &current);
            let added: HashSet<String> = diff.added.iter().cloned().collect();
            let removed: HashSet<String> = diff.removed.iter().cloned().collect();

            prop_assert_eq!(&added, &current.difference(&previous).cloned().collect::<HashSet<_>>());
            prop_assert_eq!(&removed, &previous.difference(&current).cloned().collect::<HashSet<_>>());
            prop_assert!(added.is_disjoint(&removed));
            prop_assert_eq!(added.len(), diff.added.len());
        }

        #[test]
        fn applying_diff_reaches_current(
            previous in hash_set("[a-z]{1,2}", 0..30),
            current in hash_set("[a-z]{1,2}", 0..30),
        ) {
            let diff = diff_members(&previous, &current);
            let mut applied = previous.clone();
            applied.extend(diff.added.iter().cloned());
            for id in &diff.removed {
                applied.remove(id);
            }
            prop_assert_eq!(applied, current);
        }
    }
}
