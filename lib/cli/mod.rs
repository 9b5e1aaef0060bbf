use crate::build_info;
use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    about = "Segment membership sync engine",
    version = build_info::VERSION_WITH_COMMIT,
    long_version = build_info::VERSION_WITH_COMMIT
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Args, Debug, Clone)]
pub struct GlobalArgs {
    /// Overrides `DATABASE_URL`.
    #[arg(long = "database-url", global = true)]
    pub database_url: Option<String>,

    #[arg(long = "log-level", default_value = "info", global = true)]
    pub log_level: String,

    #[arg(long = "metrics-bind", default_value = "0.0.0.0:3000", global = true)]
    pub metrics_bind: String,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Sync due segments every interval until SIGINT/SIGTERM, serving /health and /metrics
    Run {
        /// Overrides `SYNC_INTERVAL_SECS`.
        #[arg(long = "interval-secs")]
        interval_secs: Option<u64>,
    },
    /// Run one batch: the given definitions, or every due one
    SyncAll {
        #[arg(long = "definition-id")]
        definition_ids: Vec<i64>,
    },
    /// Sync one definition, then dispatch it if membership changed
    Sync {
        #[arg(long = "definition-id")]
        definition_id: i64,
    },
    /// Push a definition's latest delta to its destinations
    Dispatch {
        #[arg(long = "definition-id")]
        definition_id: i64,
    },
    /// Print the ids of definitions due for a sync
    Due,
    /// Print the canonical column types of a query
    Introspect {
        #[arg(long)]
        query: String,
    },
    /// Check a rule against a stored profile's schema
    Validate {
        #[arg(long = "profile-id")]
        profile_id: i64,
        #[arg(long)]
        rule: String,
    },
    /// Register a profile query; its schema is introspected and stored
    CreateProfile {
        #[arg(long)]
        query: String,
        #[arg(long = "id-column")]
        id_column: String,
        #[arg(long)]
        label: String,
        #[arg(long)]
        description: Option<String>,
    },
    /// Re-introspect a stored profile's query and replace its schema
    RefreshSchema {
        #[arg(long = "profile-id")]
        profile_id: i64,
    },
    /// Create a segment definition after validating its rule and schedule
    CreateDefinition {
        #[arg(long = "profile-id")]
        profile_id: i64,
        #[arg(long)]
        rule: String,
        #[arg(long)]
        label: String,
        /// `rate(<n> <unit>)` or `one time`
        #[arg(long)]
        schedule: String,
        #[arg(long)]
        description: Option<String>,
    },
    /// Replace a definition's rule after validating it
    UpdateRule {
        #[arg(long = "definition-id")]
        definition_id: i64,
        #[arg(long)]
        rule: String,
    },
}

impl Command {
    pub fn mode(&self) -> &'static str {
        match self {
            Self::Run { .. } => "run",
            Self::SyncAll { .. } => "sync_all",
            Self::Sync { .. } => "sync",
            Self::Dispatch { .. } => "dispatch",
            Self::Due => "due",
            Self::Introspect { .. } => "introspect",
            Self::Validate { .. } => "validate",
            Self::CreateProfile { .. } => "create_profile",
            Self::RefreshSchema { .. } => "refresh_schema",
            Self::CreateDefinition { .. } => "create_definition",
            Self::UpdateRule { .. } => "update_rule",
        }
    }
}

pub fn parse_args() -> Cli {
    Cli::parse()
}
