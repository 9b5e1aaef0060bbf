use std::collections::{BTreeSet, HashMap};

use diesel::sql_types::{Array, Text};
use diesel_async::pooled_connection::deadpool::Pool;
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use futures::future::BoxFuture;
use tracing::info;

use super::config::{DeleteMode, StoreSinkConfig};
use crate::backend::{quote_identifier, quote_qualified_identifier, BackendRouter, IdFilter, JsonRow};
use crate::diff_engine::segment_query;
use crate::error::SyncError;
use crate::types::{DispatchStats, MembershipDelta, SegmentDefinition, SegmentProfile};

/// Writes segment rows into a table of the transactional store.
pub trait RelationalSink: Send + Sync {
    fn insert_rows<'a>(
        &'a self,
        table: &'a str,
        rows: &'a [JsonRow],
    ) -> BoxFuture<'a, Result<usize, SyncError>>;

    /// Sets `status = 'closed'` on rows whose `id_column` matches.
    fn close_rows<'a>(
        &'a self,
        table: &'a str,
        id_column: &'a str,
        ids: &'a [String],
    ) -> BoxFuture<'a, Result<usize, SyncError>>;

    fn delete_rows<'a>(
        &'a self,
        table: &'a str,
        id_column: &'a str,
        ids: &'a [String],
    ) -> BoxFuture<'a, Result<usize, SyncError>>;
}

pub struct PgRelationalSink {
    pool: Pool<AsyncPgConnection>,
}

impl PgRelationalSink {
    pub fn new(pool: Pool<AsyncPgConnection>) -> Self {
        Self { pool }
    }
}

impl RelationalSink for PgRelationalSink {
    fn insert_rows<'a>(
        &'a self,
        table: &'a str,
        rows: &'a [JsonRow],
    ) -> BoxFuture<'a, Result<usize, SyncError>> {
        Box::pin(async move {
            if rows.is_empty() {
                return Ok(0);
            }
            let table = quote_qualified_identifier(table)?;
            // Only columns present in the rows are listed so table defaults still apply.
            let columns = rows
                .iter()
                .flat_map(|row| row.keys())
                .collect::<BTreeSet<_>>()
                .into_iter()
                .map(|column| quote_identifier(column))
                .collect::<Result<Vec<_>, _>>()?
                .join(", ");
            let payload = serde_json::to_string(rows)?;

            let sql = format!(
                "INSERT INTO {table} ({columns}) \
                 SELECT {columns} FROM json_populate_recordset(NULL::{table}, $1::json)"
            );
            let mut conn = self.pool.get().await?;
            let inserted = diesel::sql_query(sql)
                .bind::<Text, _>(payload)
                .execute(&mut conn)
                .await?;
            Ok(inserted)
        })
    }

    fn close_rows<'a>(
        &'a self,
        table: &'a str,
        id_column: &'a str,
        ids: &'a [String],
    ) -> BoxFuture<'a, Result<usize, SyncError>> {
        Box::pin(async move {
            if ids.is_empty() {
                return Ok(0);
            }
            let sql = format!(
                "UPDATE {} SET status = 'closed' WHERE ({})::text = ANY($1)",
                quote_qualified_identifier(table)?,
                quote_identifier(id_column)?
            );
            let mut conn = self.pool.get().await?;
            Ok(diesel::sql_query(sql)
                .bind::<Array<Text>, _>(ids.to_vec())
                .execute(&mut conn)
                .await?)
        })
    }

    fn delete_rows<'a>(
        &'a self,
        table: &'a str,
        id_column: &'a str,
        ids: &'a [String],
    ) -> BoxFuture<'a, Result<usize, SyncError>> {
        Box::pin(async move {
            if ids.is_empty() {
                return Ok(0);
            }
            let sql = format!(
                "DELETE FROM {} WHERE ({})::text = ANY($1)",
                quote_qualified_identifier(table)?,
                quote_identifier(id_column)?
            );
            let mut conn = self.pool.get().await?;
            Ok(diesel::sql_query(sql)
                .bind::<Array<Text>, _>(ids.to_vec())
                .execute(&mut conn)
                .await?)
        })
    }
}

/// Inputs a store dispatch needs besides its config.
pub struct StoreDispatch<'a> {
    pub profile: &'a SegmentProfile,
    pub definition: &'a SegmentDefinition,
    pub params: &'a HashMap<String, String>,
    pub delta: &'a MembershipDelta,
}

/// Moves the profile's id value under the sink's id column so inserted rows are keyed the
/// same way removals are matched.
fn project_id_column(row: &mut JsonRow, profile_id_column: &str, sink_id_column: &str) {
    if profile_id_column == sink_id_column {
        return;
    }
    if let Some(id) = row.remove(profile_id_column) {
        row.insert(sink_id_column.to_string(), id);
    }
}

/// Copies newly added members' profile rows into the sink table and applies the configured
/// removal policy to removed members. Rows are written with the profile id under
/// `config.id_column`, the same column close and delete match on.
pub async fn dispatch_store(
    sink: &dyn RelationalSink,
    router: &BackendRouter,
    config: &StoreSinkConfig,
    input: StoreDispatch<'_>,
) -> Result<DispatchStats, SyncError> {
    let mut stats = DispatchStats::default();

    let needs_fetch = !config.filter || !input.delta.added.is_empty();
    if needs_fetch {
        let query = segment_query(input.profile, input.definition, input.params)?;
        let (_, backend) = router.route(&query.sql)?;
        let filter = config.filter.then(|| IdFilter {
            column: &input.profile.id_column,
            ids: &input.delta.added,
        });
        let mut rows = backend.fetch_rows(&query, filter).await?;

        if rows.is_empty() && !config.allow_empty {
            return Err(SyncError::ServiceFailure(format!(
                "no rows fetched for store destination `{}`",
                config.table
            )));
        }

        for row in &mut rows {
            project_id_column(row, &input.profile.id_column, &config.id_column);
            for (column, value) in &config.static_columns {
                row.insert(column.clone(), value.clone());
            }
        }
        stats.members_added = sink.insert_rows(&config.table, &rows).await?;
    }

    if !input.delta.removed.is_empty() {
        stats.members_removed = match config.delete {
            DeleteMode::Keep => 0,
            DeleteMode::Close => {
                sink.close_rows(&config.table, &config.id_column, &input.delta.removed)
                    .await?
            }
            DeleteMode::Hard => {
                sink.delete_rows(&config.table, &config.id_column, &input.delta.removed)
                    .await?
            }
        };
    }

    info!(
        event = "store_dispatched",
        definition_id = input.definition.id,
        table = %config.table,
        rows_inserted = stats.members_added,
        rows_removed = stats.members_removed,
        "store destination written"
    );
    Ok(stats)
}
