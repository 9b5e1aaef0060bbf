use crate::build_info;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::{counter::Counter, gauge::Gauge};
use prometheus_client::registry::Registry;
use tokio::sync::OnceCell;

/// Registers immutable build metadata for `/metrics` scraping as a labeled gauge set to `1`.
pub fn register_build_info_metric(registry: &mut Registry, prefix: &str) {
    let build_info_metric = Family::<BuildInfoLabels, Gauge>::default();
    build_info_metric
        .get_or_create(&BuildInfoLabels {
            service: "segment_sync",
            version: build_info::VERSION,
            commit: build_info::short_commit_hash(),
        })
        .set(1);
    let sub_registry = registry.sub_registry_with_prefix(prefix);
    sub_registry.register(
        "build_info",
        "Build identity labels for this process",
        build_info_metric,
    );
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct BuildInfoLabels {
    service: &'static str,
    version: &'static str,
    commit: &'static str,
}

#[derive(Clone)]
pub struct SyncMetrics {
    /// Sync runs that reached `completed`, changed or not.
    pub syncs_completed_total: Counter,
    pub syncs_failed_total: Counter,
    /// Completed runs with an empty membership diff.
    pub syncs_unchanged_total: Counter,
    pub members_added_total: Counter,
    pub members_removed_total: Counter,
    pub chunks_applied_total: Counter,
    pub chunks_failed_total: Counter,
    pub destinations_completed_total: Counter,
    pub destinations_failed_total: Counter,
}

impl SyncMetrics {
    fn init() -> Self {
        Self {
            syncs_completed_total: Counter::default(),
            syncs_failed_total: Counter::default(),
            syncs_unchanged_total: Counter::default(),
            members_added_total: Counter::default(),
            members_removed_total: Counter::default(),
            chunks_applied_total: Counter::default(),
            chunks_failed_total: Counter::default(),
            destinations_completed_total: Counter::default(),
            destinations_failed_total: Counter::default(),
        }
    }

    pub fn register(registry: &mut Registry, prefix: &str) -> Self {
        let metrics = Self::init();
        let sub_registry = registry.sub_registry_with_prefix(prefix);
        sub_registry.register(
            "syncs_completed",
            "Total number of segment sync runs completed",
            metrics.syncs_completed_total.clone(),
        );
        sub_registry.register(
            "syncs_failed",
            "Total number of segment sync runs marked failed",
            metrics.syncs_failed_total.clone(),
        );
        sub_registry.register(
            "syncs_unchanged",
            "Total number of completed sync runs with no membership change",
            metrics.syncs_unchanged_total.clone(),
        );
        sub_registry.register(
            "members_added",
            "Total number of members added across all segments",
            metrics.members_added_total.clone(),
        );
        sub_registry.register(
            "members_removed",
            "Total number of members removed across all segments",
            metrics.members_removed_total.clone(),
        );
        sub_registry.register(
            "chunks_applied",
            "Total number of membership chunks committed",
            metrics.chunks_applied_total.clone(),
        );
        sub_registry.register(
            "chunks_failed",
            "Total number of membership chunks that failed",
            metrics.chunks_failed_total.clone(),
        );
        sub_registry.register(
            "destinations_completed",
            "Total number of destination mapping dispatches completed",
            metrics.destinations_completed_total.clone(),
        );
        sub_registry.register(
            "destinations_failed",
            "Total number of destination mapping dispatches failed",
            metrics.destinations_failed_total.clone(),
        );
        metrics
    }
}

/// Set once when the metrics server starts. Commands that run without the server skip metrics.
pub static SYNC_METRICS: OnceCell<SyncMetrics> = OnceCell::const_new();
