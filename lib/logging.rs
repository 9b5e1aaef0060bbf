use crate::build_info;
use std::error::Error as StdError;
use std::process;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::Span;
use tracing_log::LogTracer;
use tracing_subscriber::{
    layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Text,
}

impl LogFormat {
    /// `text` selects human-readable output; anything else (or nothing) is JSON.
    fn parse(raw: Option<&str>) -> Self {
        match raw.map(|value| value.trim().to_ascii_lowercase()) {
            Some(value) if value == "text" => Self::Text,
            _ => Self::Json,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Text => "text",
        }
    }
}

/// Fields stamped on every event of one CLI invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingContext {
    pub service: String,
    pub mode: String,
    pub environment: String,
    pub run_id: String,
    pub build_version: String,
    pub build_commit: String,
    pub format: LogFormat,
}

impl LoggingContext {
    fn from_lookup<F>(service: &str, mode: &str, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        Self {
            service: service.to_string(),
            mode: mode.to_string(),
            environment: lookup("APP_ENV")
                .or_else(|| lookup("ENVIRONMENT"))
                .unwrap_or_else(|| "dev".to_string()),
            run_id: build_run_id(service),
            build_version: build_info::VERSION.to_string(),
            build_commit: build_info::short_commit_hash().to_string(),
            format: LogFormat::parse(lookup("LOG_FORMAT").as_deref()),
        }
    }

    /// Root span for a command run; sync, dispatch and chunk events nest under it.
    pub fn run_span(&self) -> Span {
        tracing::info_span!(
            "segment_sync_run",
            service = %self.service,
            environment = %self.environment,
            mode = %self.mode,
            run_id = %self.run_id,
            build_version = %self.build_version,
            build_commit = %self.build_commit
        )
    }
}

/// Installs the global subscriber (stderr, JSON unless `LOG_FORMAT=text`) and logs one
/// `logging_initialized` event.
///
/// stdout stays free for command output such as due ids or introspected schemas. `RUST_LOG`
/// overrides `default_level`, and `log` records from dependencies are bridged in.
pub fn init_logging(service: &str, mode: &str, default_level: &str) -> LoggingContext {
    let context = LoggingContext::from_lookup(service, mode, |name| std::env::var(name).ok());
    install_subscriber(context.format, default_level);

    tracing::info!(
        event = "logging_initialized",
        service = %context.service,
        environment = %context.environment,
        mode = %context.mode,
        run_id = %context.run_id,
        build_version = %context.build_version,
        build_commit = %context.build_commit,
        log_format = context.format.as_str(),
        "initialized logging"
    );
    context
}

fn install_subscriber(format: LogFormat, default_level: &str) {
    let _ = LogTracer::init();

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true);
    let output: Box<dyn Layer<Registry> + Send + Sync> = match format {
        LogFormat::Json => fmt_layer
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .flatten_event(true)
            .boxed(),
        LogFormat::Text => fmt_layer.boxed(),
    };

    // A second init (tests, repeated runs in one process) keeps the first subscriber.
    let _ = tracing_subscriber::registry()
        .with(output)
        .with(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .try_init();
}

fn build_run_id(service: &str) -> String {
    let epoch_millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis())
        .unwrap_or_default();
    format!("{service}-{}-{epoch_millis}", process::id())
}

/// `error: <top>` followed by one `caused by (n): <source>` line per link of the source chain.
///
/// Command exit paths log this next to `%err`, which would otherwise hide the driver or
/// socket error a pool or diesel error wraps.
pub fn format_error_report(err: &(dyn StdError + 'static)) -> String {
    std::iter::successors(err.source(), |source| (*source).source())
        .enumerate()
        .fold(format!("error: {err}"), |mut report, (index, source)| {
            report.push_str(&format!("\ncaused by ({}): {source}", index + 1));
            report
        })
}
