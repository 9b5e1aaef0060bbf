use crate::{
    apply_pipeline::PipelineConfig,
    backend::{BackendRouter, PgQueryBackend, QueryBackend},
    cli::{Cli, Command, GlobalArgs},
    config::{Config, ConfigError},
    db::{build_db_pool, run_pending_migrations},
    destinations::{
        endpoint::HttpEndpointCaller, marketing_platform::HttpMarketingPlatform,
        store_sink::PgRelationalSink, DestinationDispatcher,
    },
    error::SyncError,
    logging::{format_error_report, init_logging},
    repository::{NewDefinition, PgSegmentRepository},
    schema_introspector::ProfileSchema,
    server::setup_server_with_addr,
    state::AppState,
    sync_service::{ProfileRequest, SegmentSyncService},
};
use chrono::Utc;
use diesel_async::{pooled_connection::deadpool::Pool, AsyncPgConnection};
use dotenv::dotenv;
use std::env;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Resolves configuration from the environment, letting `--database-url` win.
pub fn resolve_config(global: &GlobalArgs) -> Result<Config, ConfigError> {
    match global.database_url {
        None => Config::from_env(),
        Some(_) => resolve_config_with(global, |name| env::var(name).ok()),
    }
}

fn resolve_config_with<F>(global: &GlobalArgs, lookup: F) -> Result<Config, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    Config::from_lookup(|name| match (name, &global.database_url) {
        ("DATABASE_URL", Some(url)) => Some(url.clone()),
        _ => lookup(name),
    })
}

pub fn validate_args(cli: &Cli) -> Result<(), String> {
    cli.global
        .metrics_bind
        .parse::<SocketAddr>()
        .map_err(|err| {
            format!(
                "invalid --metrics-bind address `{}`: {err}",
                cli.global.metrics_bind
            )
        })?;
    match &cli.command {
        Command::Run {
            interval_secs: Some(0),
        } => Err("--interval-secs must be > 0".to_string()),
        Command::Introspect { query } | Command::CreateProfile { query, .. }
            if query.trim().is_empty() =>
        {
            Err("--query must not be empty".to_string())
        }
        Command::CreateProfile { label, .. } | Command::CreateDefinition { label, .. }
            if label.trim().is_empty() =>
        {
            Err("--label must not be empty".to_string())
        }
        _ => Ok(()),
    }
}

/// Store pool plus the fully wired service.
pub struct Engine {
    pub pool: Pool<AsyncPgConnection>,
    pub service: SegmentSyncService,
}

pub async fn build_engine(config: &Config) -> Result<Engine, SyncError> {
    let pool = build_db_pool(&config.db_url, config.db_pool_size)
        .await
        .map_err(|err| SyncError::ServiceFailure(format!("failed to build db pool: {err}")))?;

    let warehouse: Option<Arc<dyn QueryBackend>> = match &config.warehouse_url {
        Some(url) => {
            let warehouse_pool = build_db_pool(url, config.db_pool_size)
                .await
                .map_err(|err| {
                    SyncError::ServiceFailure(format!("failed to build warehouse pool: {err}"))
                })?;
            Some(Arc::new(PgQueryBackend::new(warehouse_pool)))
        }
        None => None,
    };
    let router = BackendRouter::new(
        Arc::new(PgQueryBackend::new(pool.clone())),
        warehouse,
        config.warehouse_marker.clone(),
    );

    let client = reqwest::Client::builder().timeout(HTTP_TIMEOUT).build()?;
    let mut dispatcher = DestinationDispatcher::new(
        Arc::new(HttpEndpointCaller::new(client.clone())),
        Arc::new(PgRelationalSink::new(pool.clone())),
        router.clone(),
    );
    if let Some(marketing) = &config.marketing {
        dispatcher = dispatcher.with_marketing_platform(
            Arc::new(HttpMarketingPlatform::new(client, marketing.clone())),
            marketing.batch_size,
        );
    }

    let service = SegmentSyncService::new(
        Arc::new(PgSegmentRepository::new(pool.clone())),
        router,
        dispatcher,
        PipelineConfig {
            chunk_size: config.chunk_size,
            max_in_flight: config.chunk_concurrency,
        },
    );
    Ok(Engine { pool, service })
}

fn report_failure(event: &'static str, context: &str, err: &SyncError) -> i32 {
    let error_report = format_error_report(err);
    error!(
        event,
        error_kind = err.kind(),
        error = %err,
        error_report = %error_report,
        "{context}"
    );
    eprintln!("{context}: {err}");
    1
}

/// Runs one CLI invocation and returns the process exit code.
///
/// 0 is success, 1 a runtime failure, 2 invalid arguments or configuration.
pub async fn run_cli(cli: Cli, shutdown_token: CancellationToken) -> i32 {
    dotenv().ok();

    let mode = cli.command.mode();
    let logging_context = init_logging("segment_sync", mode, &cli.global.log_level);
    let run_span = logging_context.run_span();
    let _run_guard = run_span.enter();

    if let Err(err) = validate_args(&cli) {
        eprintln!("{err}");
        return 2;
    }
    let config = match resolve_config(&cli.global) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{err}");
            return 2;
        }
    };

    if let Err(err) = run_pending_migrations(&config.db_url).await {
        return report_failure("migrations_failed", "failed to run migrations", &err);
    }
    let engine = match build_engine(&config).await {
        Ok(engine) => engine,
        Err(err) => return report_failure("engine_build_failed", "failed to start engine", &err),
    };

    match cli.command {
        Command::Run { interval_secs } => {
            let interval = Duration::from_secs(interval_secs.unwrap_or(config.sync_interval_secs));
            run_daemon(engine, &cli.global.metrics_bind, interval, shutdown_token).await
        }
        Command::SyncAll { definition_ids } => {
            let ids = (!definition_ids.is_empty()).then_some(definition_ids);
            match engine.service.sync_all_segments(ids).await {
                Ok(summary) => {
                    println!(
                        "requested={} synced={} unchanged={} failed={} dispatched={}",
                        summary.requested,
                        summary.synced,
                        summary.unchanged,
                        summary.failed,
                        summary.dispatched
                    );
                    if summary.failed > 0 {
                        eprintln!("failed definitions: {:?}", summary.failed_definition_ids);
                        1
                    } else {
                        0
                    }
                }
                Err(err) => report_failure("batch_sync_failed", "batch sync failed", &err),
            }
        }
        Command::Sync { definition_id } => {
            let outcome = match engine.service.sync_segment(definition_id).await {
                Ok(outcome) => outcome,
                Err(err) => return report_failure("segment_sync_failed", "segment sync failed", &err),
            };
            println!(
                "sync_id={} changed={} members_added={} members_removed={}",
                outcome.sync_id,
                outcome.changed,
                outcome.stats.members_added,
                outcome.stats.members_removed
            );
            if !outcome.changed {
                return 0;
            }
            dispatch_and_print(&engine.service, definition_id).await
        }
        Command::Dispatch { definition_id } => {
            dispatch_and_print(&engine.service, definition_id).await
        }
        Command::Due => match engine.service.get_due_segment_ids(Utc::now()).await {
            Ok(ids) => {
                for id in ids {
                    println!("{id}");
                }
                0
            }
            Err(err) => report_failure("due_lookup_failed", "failed to list due segments", &err),
        },
        Command::Introspect { query } => {
            match engine.service.introspect_query(&query).await.and_then(|schema| print_schema(&schema)) {
                Ok(()) => 0,
                Err(err) => report_failure("introspect_failed", "introspection failed", &err),
            }
        }
        Command::Validate { profile_id, rule } => {
            match engine.service.validate_rule(profile_id, &rule).await {
                Ok(terms) => {
                    println!("rule is valid ({} terms)", terms.len());
                    0
                }
                Err(err) => report_failure("rule_invalid", "rule rejected", &err),
            }
        }
        Command::CreateProfile {
            query,
            id_column,
            label,
            description,
        } => {
            let request = ProfileRequest {
                query,
                id_column,
                label,
                description,
            };
            match engine.service.create_profile(request).await {
                Ok(profile) => {
                    println!(
                        "profile_id={} columns={}",
                        profile.id,
                        profile.profile_schema.len()
                    );
                    0
                }
                Err(err) => report_failure("profile_create_failed", "could not create profile", &err),
            }
        }
        Command::RefreshSchema { profile_id } => {
            match engine
                .service
                .refresh_profile_schema(profile_id)
                .await
                .and_then(|schema| print_schema(&schema))
            {
                Ok(()) => 0,
                Err(err) => report_failure("schema_refresh_failed", "could not refresh schema", &err),
            }
        }
        Command::CreateDefinition {
            profile_id,
            rule,
            label,
            schedule,
            description,
        } => {
            let definition = NewDefinition {
                profile_id,
                rule,
                label,
                schedule,
                description,
            };
            match engine.service.create_definition(definition).await {
                Ok(definition) => {
                    println!("definition_id={}", definition.id);
                    0
                }
                Err(err) => {
                    report_failure("definition_create_failed", "could not create definition", &err)
                }
            }
        }
        Command::UpdateRule {
            definition_id,
            rule,
        } => match engine.service.update_definition_rule(definition_id, &rule).await {
            Ok(()) => {
                println!("definition_id={definition_id} rule updated");
                0
            }
            Err(err) => report_failure("rule_update_failed", "could not update rule", &err),
        },
    }
}

fn print_schema(schema: &ProfileSchema) -> Result<(), SyncError> {
    let text = serde_json::to_string_pretty(&schema.to_json()?)?;
    println!("{text}");
    Ok(())
}

async fn dispatch_and_print(service: &SegmentSyncService, definition_id: i64) -> i32 {
    match service.sync_segment_destination(definition_id).await {
        Ok(outcome) => {
            for mapping in &outcome.mappings {
                println!(
                    "mapping={} destination={} status={}{}",
                    mapping.mapping_id,
                    mapping.destination,
                    mapping.status.as_db_str(),
                    mapping
                        .stats
                        .error
                        .as_deref()
                        .map(|err| format!(" error={err}"))
                        .unwrap_or_default()
                );
            }
            println!("dispatched={}", outcome.dispatched);
            0
        }
        Err(err) => report_failure("dispatch_failed", "destination dispatch failed", &err),
    }
}

/// Serves metrics and runs `sync_all_segments(None)` every `interval` until shutdown.
async fn run_daemon(
    engine: Engine,
    metrics_bind: &str,
    interval: Duration,
    shutdown_token: CancellationToken,
) -> i32 {
    let metrics_addr = match metrics_bind.parse::<SocketAddr>() {
        Ok(addr) => addr,
        Err(err) => {
            eprintln!("invalid --metrics-bind address `{metrics_bind}`: {err}");
            return 2;
        }
    };
    let app_state = Arc::new(AppState::new(engine.pool.clone(), shutdown_token.clone()));
    let server_handle = match setup_server_with_addr(app_state.clone(), metrics_addr).await {
        Ok(handle) => handle,
        Err(err) => {
            let error_report = format_error_report(&err);
            error!(
                event = "metrics_server_start_failed",
                bind = %metrics_addr,
                error = %err,
                error_report = %error_report,
                "failed to start metrics endpoint"
            );
            eprintln!("failed to start metrics endpoint on {metrics_addr}: {err}");
            return 1;
        }
    };

    info!(
        event = "daemon_started",
        interval_secs = interval.as_secs(),
        bind = %metrics_addr,
        "segment sync daemon started"
    );
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown_token.cancelled() => break,
            _ = ticker.tick() => {
                match engine.service.sync_all_segments(None).await {
                    Ok(summary) => app_state.record_batch(summary, Utc::now()).await,
                    Err(err) => warn!(
                        event = "scheduled_batch_failed",
                        error_kind = err.kind(),
                        error = %err,
                        "scheduled batch sync failed"
                    ),
                }
            }
        }
    }

    info!(event = "daemon_stopping", "shutdown requested, stopping daemon");
    if let Err(err) = server_handle.await {
        warn!(event = "metrics_server_join_failed", error = %err, "metrics server task failed");
    }
    0
}
