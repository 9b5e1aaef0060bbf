pub mod models;
pub mod schema;

use diesel::{pg::PgConnection, Connection};
use diesel_async::{
    pg::AsyncPgConnection,
    pooled_connection::{
        deadpool::{BuildError, Pool},
        AsyncDieselConnectionManager,
    },
};
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use tracing::info;

use crate::error::SyncError;

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!();

/// Builds an async Postgres pool for the transactional store or the warehouse.
///
/// The same pool backs every chunk task of a sync run, so `max_size` should be at least the
/// chunk concurrency.
pub async fn build_db_pool(
    db_url: &str,
    max_size: usize,
) -> Result<Pool<AsyncPgConnection>, BuildError> {
    let pool_config = AsyncDieselConnectionManager::<AsyncPgConnection>::new(db_url);
    Pool::builder(pool_config).max_size(max_size.max(1)).build()
}

/// Applies any pending embedded migrations over a short-lived blocking connection.
pub async fn run_pending_migrations(db_url: &str) -> Result<(), SyncError> {
    let db_url = db_url.to_string();
    let applied = tokio::task::spawn_blocking(move || -> Result<usize, SyncError> {
        let mut connection = PgConnection::establish(&db_url).map_err(|err| {
            SyncError::ServiceFailure(format!("failed to connect for migrations: {err}"))
        })?;
        let versions = connection
            .run_pending_migrations(MIGRATIONS)
            .map_err(|err| SyncError::ServiceFailure(format!("migration failed: {err}")))?;
        Ok(versions.len())
    })
    .await??;

    info!(event = "migrations_applied", applied, "database migrations up to date");
    Ok(())
}
