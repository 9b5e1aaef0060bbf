//! `${name}` placeholder handling for stored query templates.
//!
//! Two entry points exist:
//! - [`interpolate`] substitutes values straight into the text. It performs no escaping and is
//!   only used where the output is not SQL (endpoint URL templates).
//! - [`render_query`] writes each value as an escaped, untyped SQL string literal. Postgres
//!   resolves an untyped literal from context, so `cohort = ${definition_id}` compares as
//!   bigint and `joined <= '${run_date}'` as a date. Profile queries go through this path.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::{Captures, Regex};

use crate::error::SyncError;

static PLACEHOLDER_RE: LazyLock<Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}"));

fn placeholder_re() -> Result<&'static Regex, SyncError> {
    PLACEHOLDER_RE
        .as_ref()
        .map_err(|err| SyncError::Exception(format!("placeholder pattern failed to compile: {err}")))
}

/// Replaces every `${name}` whose name is in `values`. Unknown placeholders are left untouched.
pub fn interpolate(
    template: &str,
    values: Option<&HashMap<String, String>>,
) -> Result<String, SyncError> {
    let Some(values) = values else {
        return Ok(template.to_string());
    };
    if values.is_empty() {
        return Ok(template.to_string());
    }

    let re = placeholder_re()?;
    Ok(re
        .replace_all(template, |caps: &Captures| match values.get(&caps[1]) {
            Some(value) => value.clone(),
            None => caps[0].to_string(),
        })
        .into_owned())
}

/// Executable SQL produced from a profile template.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RenderedQuery {
    pub sql: String,
}

impl RenderedQuery {
    pub fn raw(sql: impl Into<String>) -> Self {
        Self { sql: sql.into() }
    }

    pub fn map_sql<F>(&self, wrap: F) -> Self
    where
        F: FnOnce(&str) -> String,
    {
        Self {
            sql: wrap(&self.sql),
        }
    }
}

/// Body of a standard-conforming string literal: quotes doubled, nothing else touched.
///
/// Backslashes and NUL are rejected so the result means the same thing whatever
/// `standard_conforming_strings` is set to.
fn literal_body(name: &str, value: &str) -> Result<String, SyncError> {
    if value.contains('\\') || value.contains('\0') {
        return Err(SyncError::InvalidData(format!(
            "value for parameter `{name}` contains a backslash or NUL"
        )));
    }
    Ok(value.replace('\'', "''"))
}

/// Replaces every `${name}` with its value as an SQL string literal.
///
/// A placeholder already inside a quoted literal (`'${run_date}'`) gets only the escaped body;
/// anywhere else it becomes a complete `'...'` literal. Quote state is tracked by the parity of
/// `'` before the placeholder, which holds because an escaped quote inside a literal is `''`.
/// Every placeholder must have a value; a missing one is `InvalidData`.
pub fn render_query(
    template: &str,
    values: &HashMap<String, String>,
) -> Result<RenderedQuery, SyncError> {
    let re = placeholder_re()?;

    let mut sql = String::with_capacity(template.len());
    let mut last = 0;
    for caps in re.captures_iter(template) {
        let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let value = values.get(name.as_str()).ok_or_else(|| {
            SyncError::InvalidData(format!(
                "query template references unknown parameter `{}`",
                name.as_str()
            ))
        })?;
        let body = literal_body(name.as_str(), value)?;

        let preceding = &template[last..whole.start()];
        sql.push_str(preceding);
        let inside_literal = template[..whole.start()].matches('\'').count() % 2 == 1;
        if inside_literal {
            sql.push_str(&body);
        } else {
            sql.push('\'');
            sql.push_str(&body);
            sql.push('\'');
        }
        last = whole.end();
    }
    sql.push_str(&template[last..]);

    Ok(RenderedQuery { sql })
}
