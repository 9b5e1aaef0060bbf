//! Rule validation for segment definitions.
//!
//! A rule is a boolean filter made of `column operator value` comparisons joined with
//! `and`/`or` and optional parentheses. Anything the tokenizer does not recognize is rejected,
//! so a rule either validates completely or not at all.

use std::sync::LazyLock;

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use regex::Regex;

use crate::error::SyncError;
use crate::schema_introspector::{CanonicalType, ProfileSchema};

static TERM_RE: LazyLock<Result<Regex, regex::Error>> = LazyLock::new(|| {
    Regex::new(
        r"(?ix)
        (?P<column>[A-Za-z_][A-Za-z0-9_]*)
        \s*
        (?P<op><=|>=|!=|=|<|>|\bilike\b|\blike\b)
        \s*
        (?P<value>'(?:[^']|'')*'|[^\s()']+)
        ",
    )
});

const FORBIDDEN_SEQUENCES: [&str; 3] = [";", "--", "/*"];
const FIXED_CHAR_MAX_LEN: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleOperator {
    Eq,
    NotEq,
    Gt,
    Lt,
    Gte,
    Lte,
    Like,
    ILike,
}

impl RuleOperator {
    fn parse(raw: &str) -> Option<Self> {
        let op = match raw.to_ascii_lowercase().as_str() {
            "=" => Self::Eq,
            "!=" => Self::NotEq,
            ">" => Self::Gt,
            "<" => Self::Lt,
            ">=" => Self::Gte,
            "<=" => Self::Lte,
            "like" => Self::Like,
            "ilike" => Self::ILike,
            _ => return None,
        };
        Some(op)
    }

    pub fn is_pattern(self) -> bool {
        matches!(self, Self::Like | Self::ILike)
    }
}

/// One `column operator value` comparison. `value` has its SQL quotes removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleTerm {
    pub column: String,
    pub operator: RuleOperator,
    pub value: String,
}

/// Splits a rule into comparison terms without checking them against a schema.
pub fn tokenize_rule(rule: &str) -> Result<Vec<RuleTerm>, SyncError> {
    let re = TERM_RE
        .as_ref()
        .map_err(|err| SyncError::Exception(format!("rule pattern failed to compile: {err}")))?;

    if let Some(seq) = FORBIDDEN_SEQUENCES.iter().find(|seq| rule.contains(**seq)) {
        return Err(SyncError::InvalidData(format!(
            "rule contains forbidden sequence `{seq}`"
        )));
    }

    let mut terms = Vec::new();
    let mut leftover = String::with_capacity(rule.len());
    let mut cursor = 0;

    for caps in re.captures_iter(rule) {
        let Some(whole) = caps.get(0) else { continue };
        leftover.push_str(&rule[cursor..whole.start()]);
        leftover.push(' ');
        cursor = whole.end();

        let operator = RuleOperator::parse(&caps["op"]).ok_or_else(|| {
            SyncError::InvalidData(format!("unsupported rule operator `{}`", &caps["op"]))
        })?;
        terms.push(RuleTerm {
            column: caps["column"].to_string(),
            operator,
            value: unquote(&caps["value"]),
        });
    }
    leftover.push_str(&rule[cursor..]);

    if let Some(fragment) = leftover
        .replace(['(', ')'], " ")
        .split_whitespace()
        .find(|token| !token.eq_ignore_ascii_case("and") && !token.eq_ignore_ascii_case("or"))
    {
        return Err(SyncError::InvalidData(format!(
            "rule contains unrecognized fragment `{fragment}`"
        )));
    }

    Ok(terms)
}

/// Validates `rule` against `schema`. An empty rule selects the whole profile and is accepted.
pub fn validate_rule(rule: &str, schema: &ProfileSchema) -> Result<Vec<RuleTerm>, SyncError> {
    if rule.trim().is_empty() {
        return Ok(Vec::new());
    }

    let terms = tokenize_rule(rule)?;
    if terms.is_empty() {
        return Err(SyncError::InvalidData(
            "rule does not contain any comparisons".to_string(),
        ));
    }

    for term in &terms {
        check_term(term, schema)?;
    }
    Ok(terms)
}

fn check_term(term: &RuleTerm, schema: &ProfileSchema) -> Result<(), SyncError> {
    let column_type = schema.get(&term.column).ok_or_else(|| {
        SyncError::InvalidData(format!("rule references unknown column `{}`", term.column))
    })?;

    if term.operator.is_pattern() {
        if column_type != CanonicalType::Text {
            return Err(SyncError::InvalidData(format!(
                "pattern operator on `{}` requires a text column, found {}",
                term.column,
                column_type.as_str()
            )));
        }
        return Ok(());
    }

    if column_type.is_ordered_scalar() && !is_number(&term.value) && !is_iso_date(&term.value) {
        return Err(SyncError::InvalidData(format!(
            "`{}` is {} and needs a number or YYYY-MM-DD date, got `{}`",
            term.column,
            column_type.as_str(),
            term.value
        )));
    }

    if column_type == CanonicalType::FixedChar && term.value.chars().count() > FIXED_CHAR_MAX_LEN {
        return Err(SyncError::InvalidData(format!(
            "`{}` holds codes of at most {FIXED_CHAR_MAX_LEN} characters, got `{}`",
            term.column, term.value
        )));
    }

    Ok(())
}

fn unquote(raw: &str) -> String {
    match raw
        .strip_prefix('\'')
        .and_then(|inner| inner.strip_suffix('\''))
    {
        Some(inner) => inner.replace("''", "'"),
        None => raw.to_string(),
    }
}

fn is_number(value: &str) -> bool {
    value.parse::<f64>().is_ok_and(f64::is_finite)
}

fn is_iso_date(value: &str) -> bool {
    NaiveDate::parse_from_str(value, "%Y-%m-%d").is_ok()
        || NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S").is_ok()
        || DateTime::parse_from_rfc3339(value).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> ProfileSchema {
        let mut schema = ProfileSchema::new();
        schema.insert("age", CanonicalType::Integer);
        schema.insert("state", CanonicalType::FixedChar);
        schema.insert("name", CanonicalType::Text);
        schema.insert("signed_up", CanonicalType::Timestamp);
        schema.insert("active", CanonicalType::Boolean);
        schema
    }

    #[test]
    fn integer_comparison_passes() {
        let terms = validate_rule("age > 21", &schema()).unwrap();
        assert_eq!(
            terms,
            vec![RuleTerm {
                column: "age".to_string(),
                operator: RuleOperator::Gt,
                value: "21".to_string(),
            }]
        );
    }

    #[test]
    fn fixed_char_rejects_long_values() {
        let err = validate_rule("state = 'California'", &schema()).unwrap_err();
        assert_eq!(err.kind(), "invalid_data");
        assert!(validate_rule("state = 'CA'", &schema()).is_ok());
    }

    #[test]
    fn like_is_only_valid_on_text() {
        assert!(validate_rule("name like 5", &schema()).is_ok());
        assert!(validate_rule("name ILIKE '%smith%'", &schema()).is_ok());

        let err = validate_rule("age like 5", &schema()).unwrap_err();
        assert!(err.to_string().contains("text column"));
    }

    #[test]
    fn ordered_columns_need_numbers_or_dates() {
        assert!(validate_rule("signed_up >= '2024-01-31'", &schema()).is_ok());
        assert!(validate_rule("age <= 65.5", &schema()).is_ok());
        assert!(validate_rule("age > 'lots'", &schema()).is_err());
        assert!(validate_rule("signed_up < 'yesterday'", &schema()).is_err());
    }

    #[test]
    fn unknown_columns_fail_closed() {
        let err = validate_rule("age > 21 and zip = '02139'", &schema()).unwrap_err();
        assert!(err.to_string().contains("zip"));
    }

    #[test]
    fn conjunctions_and_parentheses_are_accepted() {
        let terms = validate_rule(
            "(age >= 18 AND state = 'NY') or (name like 'A%' and active = true)",
            &schema(),
        )
        .unwrap();
        assert_eq!(terms.len(), 4);
        assert_eq!(terms[3].value, "true");
    }

    #[test]
    fn unrecognized_fragments_are_rejected() {
        let err = validate_rule("age > 21 union select 1", &schema()).unwrap_err();
        assert!(err.to_string().contains("unrecognized fragment"));

        assert!(validate_rule("age > 21 not", &schema()).is_err());
    }

    #[test]
    fn statement_terminators_and_comments_are_rejected() {
        for rule in ["age > 21; drop table t", "age > 21 -- x", "age > 21 /* x */"] {
            let err = validate_rule(rule, &schema()).unwrap_err();
            assert!(err.to_string().contains("forbidden"), "{rule}");
        }
    }

    #[test]
    fn empty_rule_selects_everything() {
        assert!(validate_rule("   ", &schema()).unwrap().is_empty());
    }

    #[test]
    fn quoted_values_are_unescaped() {
        let terms = validate_rule("name = 'O''Brien'", &schema()).unwrap();
        assert_eq!(terms[0].value, "O'Brien");
    }
}
