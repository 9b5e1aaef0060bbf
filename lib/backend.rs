use std::collections::HashSet;
use std::sync::{Arc, LazyLock};

use diesel::sql_types::{Array, Oid, Text};
use diesel::QueryableByName;
use diesel_async::pooled_connection::deadpool::Pool;
use diesel_async::scoped_futures::ScopedFutureExt;
use diesel_async::{AsyncConnection, AsyncPgConnection, RunQueryDsl};
use futures::future::BoxFuture;
use regex::Regex;
use serde_json::{Map, Value};

use crate::error::SyncError;
use crate::query_builder::RenderedQuery;
use crate::schema_introspector::ColumnDescriptor;

/// One result row, keyed by column name.
pub type JsonRow = Map<String, Value>;

/// Restricts a row fetch to rows whose `column` (compared as text) is one of `ids`.
#[derive(Debug, Clone, Copy)]
pub struct IdFilter<'a> {
    pub column: &'a str,
    pub ids: &'a [String],
}

/// Read-only query execution against one analytical backend.
///
/// Kept behind a trait so the diff engine and the store sink can be tested without a live
/// database.
pub trait QueryBackend: Send + Sync {
    /// Column names and native type ids of `query`'s result, read from a one-row probe.
    fn probe_columns<'a>(
        &'a self,
        query: &'a RenderedQuery,
    ) -> BoxFuture<'a, Result<Vec<ColumnDescriptor>, SyncError>>;

    /// Distinct non-null values of `column` across all rows of `query`, as text.
    fn distinct_values<'a>(
        &'a self,
        query: &'a RenderedQuery,
        column: &'a str,
    ) -> BoxFuture<'a, Result<HashSet<String>, SyncError>>;

    fn fetch_rows<'a>(
        &'a self,
        query: &'a RenderedQuery,
        filter: Option<IdFilter<'a>>,
    ) -> BoxFuture<'a, Result<Vec<JsonRow>, SyncError>>;
}

impl<T> QueryBackend for Arc<T>
where
    T: QueryBackend + ?Sized,
{
    fn probe_columns<'a>(
        &'a self,
        query: &'a RenderedQuery,
    ) -> BoxFuture<'a, Result<Vec<ColumnDescriptor>, SyncError>> {
        (**self).probe_columns(query)
    }

    fn distinct_values<'a>(
        &'a self,
        query: &'a RenderedQuery,
        column: &'a str,
    ) -> BoxFuture<'a, Result<HashSet<String>, SyncError>> {
        (**self).distinct_values(query, column)
    }

    fn fetch_rows<'a>(
        &'a self,
        query: &'a RenderedQuery,
        filter: Option<IdFilter<'a>>,
    ) -> BoxFuture<'a, Result<Vec<JsonRow>, SyncError>> {
        (**self).fetch_rows(query, filter)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Store,
    Warehouse,
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Store => "store",
            Self::Warehouse => "warehouse",
        }
    }
}

/// Picks the transactional store or the warehouse for a query by looking for a marker
/// substring in its text.
#[derive(Clone)]
pub struct BackendRouter {
    store: Arc<dyn QueryBackend>,
    warehouse: Option<Arc<dyn QueryBackend>>,
    marker: String,
}

impl BackendRouter {
    pub fn new(
        store: Arc<dyn QueryBackend>,
        warehouse: Option<Arc<dyn QueryBackend>>,
        marker: impl Into<String>,
    ) -> Self {
        Self {
            store,
            warehouse,
            marker: marker.into(),
        }
    }

    pub fn kind_for(&self, sql: &str) -> BackendKind {
        if !self.marker.is_empty() && sql.contains(&self.marker) {
            BackendKind::Warehouse
        } else {
            BackendKind::Store
        }
    }

    pub fn route(&self, sql: &str) -> Result<(BackendKind, Arc<dyn QueryBackend>), SyncError> {
        match self.kind_for(sql) {
            BackendKind::Store => Ok((BackendKind::Store, self.store.clone())),
            BackendKind::Warehouse => self
                .warehouse
                .clone()
                .map(|backend| (BackendKind::Warehouse, backend))
                .ok_or_else(|| {
                    SyncError::ServiceFailure(format!(
                        "query references `{}` but no warehouse backend is configured",
                        self.marker
                    ))
                }),
        }
    }
}

static IDENTIFIER_RE: LazyLock<Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$"));

/// Double-quotes a single SQL identifier after checking it is a plain name.
pub fn quote_identifier(name: &str) -> Result<String, SyncError> {
    let re = IDENTIFIER_RE
        .as_ref()
        .map_err(|err| SyncError::Exception(format!("identifier pattern failed to compile: {err}")))?;
    if !re.is_match(name) {
        return Err(SyncError::InvalidData(format!(
            "`{name}` is not a valid SQL identifier"
        )));
    }
    Ok(format!("\"{name}\""))
}

/// Quotes `schema.table` (or a bare `table`) part by part.
pub fn quote_qualified_identifier(name: &str) -> Result<String, SyncError> {
    let parts = name
        .split('.')
        .map(quote_identifier)
        .collect::<Result<Vec<_>, _>>()?;
    if parts.len() > 2 {
        return Err(SyncError::InvalidData(format!(
            "`{name}` has too many qualifiers"
        )));
    }
    Ok(parts.join("."))
}

#[derive(QueryableByName)]
struct ProbeColumnRow {
    #[diesel(sql_type = Text)]
    name: String,
    #[diesel(sql_type = Oid)]
    type_oid: u32,
}

#[derive(QueryableByName)]
struct MemberIdRow {
    #[diesel(sql_type = Text)]
    member_id: String,
}

#[derive(QueryableByName)]
struct JsonTextRow {
    #[diesel(sql_type = Text)]
    row_json: String,
}

/// Postgres-wire backend over a diesel-async pool. Used for both the store and the warehouse.
pub struct PgQueryBackend {
    pool: Pool<AsyncPgConnection>,
}

impl PgQueryBackend {
    pub fn new(pool: Pool<AsyncPgConnection>) -> Self {
        Self { pool }
    }
}

impl QueryBackend for PgQueryBackend {
    fn probe_columns<'a>(
        &'a self,
        query: &'a RenderedQuery,
    ) -> BoxFuture<'a, Result<Vec<ColumnDescriptor>, SyncError>> {
        Box::pin(async move {
            let mut conn = self.pool.get().await?;
            // Materialize the probe row into a transaction-scoped temp table so pg_attribute
            // can report the result's column types.
            let create = diesel::sql_query(format!(
                "CREATE TEMP TABLE segment_probe ON COMMIT DROP AS \
                 SELECT * FROM ({}) AS probe LIMIT 1",
                query.sql
            ));

            let rows = conn
                .transaction::<Vec<ProbeColumnRow>, diesel::result::Error, _>(|conn| {
                    async move {
                        create.execute(conn).await?;
                        diesel::sql_query(
                            "SELECT attname::text AS name, atttypid AS type_oid \
                             FROM pg_attribute \
                             WHERE attrelid = 'segment_probe'::regclass \
                               AND attnum > 0 AND NOT attisdropped \
                             ORDER BY attnum",
                        )
                        .load(conn)
                        .await
                    }
                    .scope_boxed()
                })
                .await?;

            Ok(rows
                .into_iter()
                .map(|row| ColumnDescriptor::new(row.name, row.type_oid))
                .collect())
        })
    }

    fn distinct_values<'a>(
        &'a self,
        query: &'a RenderedQuery,
        column: &'a str,
    ) -> BoxFuture<'a, Result<HashSet<String>, SyncError>> {
        Box::pin(async move {
            let column = quote_identifier(column)?;
            let sql = format!(
                "SELECT DISTINCT (m.{column})::text AS member_id FROM ({}) AS m \
                 WHERE m.{column} IS NOT NULL",
                query.sql
            );

            let mut conn = self.pool.get().await?;
            let rows: Vec<MemberIdRow> = diesel::sql_query(sql).load(&mut conn).await?;
            Ok(rows.into_iter().map(|row| row.member_id).collect())
        })
    }

    fn fetch_rows<'a>(
        &'a self,
        query: &'a RenderedQuery,
        filter: Option<IdFilter<'a>>,
    ) -> BoxFuture<'a, Result<Vec<JsonRow>, SyncError>> {
        Box::pin(async move {
            let mut conn = self.pool.get().await?;
            let rows: Vec<JsonTextRow> = match filter {
                Some(filter) => {
                    let column = quote_identifier(filter.column)?;
                    let sql = format!(
                        "SELECT row_to_json(m)::text AS row_json FROM ({}) AS m \
                         WHERE (m.{column})::text = ANY($1)",
                        query.sql
                    );
                    diesel::sql_query(sql)
                        .bind::<Array<Text>, _>(filter.ids.to_vec())
                        .load(&mut conn)
                        .await?
                }
                None => {
                    let sql = format!(
                        "SELECT row_to_json(m)::text AS row_json FROM ({}) AS m",
                        query.sql
                    );
                    diesel::sql_query(sql).load(&mut conn).await?
                }
            };

            rows.into_iter()
                .map(|row| match serde_json::from_str::<Value>(&row.row_json)? {
                    Value::Object(map) => Ok(map),
                    other => Err(SyncError::InvalidData(format!(
                        "expected a JSON object row, got {other}"
                    ))),
                })
                .collect()
        })
    }
}
