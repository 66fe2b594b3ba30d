//! Metadata and time filtering
//!
//! Filters are evaluated against passage metadata before graph search.
//! [`FilterPlan`] materializes the allowed-node bitset in one pass over the
//! store and measures selectivity, which decides between graph search with
//! a predicate and brute force over the allowed set.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{EngineError, Result};

use super::passages::PassageStore;

/// Filter operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
    NotIn,
    Contains,
    StartsWith,
    EndsWith,
    Exists,
}

/// A single field condition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterCondition {
    pub field: String,
    pub op: FilterOp,
    pub value: Value,
}

/// Filter tree with AND/OR combinators
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataFilter {
    Condition(FilterCondition),
    And { and: Vec<MetadataFilter> },
    Or { or: Vec<MetadataFilter> },
}

impl MetadataFilter {
    /// Parse a filter expression.
    ///
    /// Supported forms: `field=value`, `field!=value`, `field>value` (and
    /// `>=`, `<`, `<=`), `field~substr`, `field^prefix`, `field$suffix`,
    /// `field?`, `field in [a,b]`, `field not_in [a,b]`, glob shorthands
    /// (`field:*.rs`), comma or ` AND ` conjunction, ` OR ` disjunction.
    pub fn parse(expr: &str) -> Result<Self> {
        parse_expr(expr.trim())
            .ok_or_else(|| EngineError::InvalidInput(format!("invalid filter syntax: '{expr}'")))
    }

    /// Evaluate against one passage's metadata
    pub fn matches(&self, metadata: &Value) -> bool {
        match self {
            MetadataFilter::Condition(cond) => cond.matches(metadata),
            MetadataFilter::And { and } => and.iter().all(|f| f.matches(metadata)),
            MetadataFilter::Or { or } => or.iter().any(|f| f.matches(metadata)),
        }
    }
}

fn parse_expr(expr: &str) -> Option<MetadataFilter> {
    // OR binds loosest
    if expr.contains(" OR ") {
        let parts: Vec<MetadataFilter> = expr
            .split(" OR ")
            .map(|p| parse_conjunction(p.trim()))
            .collect::<Option<_>>()?;
        return Some(match parts.len() {
            1 => parts.into_iter().next().unwrap(),
            _ => MetadataFilter::Or { or: parts },
        });
    }
    parse_conjunction(expr)
}

fn parse_conjunction(expr: &str) -> Option<MetadataFilter> {
    let pieces = split_top_level(expr);
    let parts: Vec<MetadataFilter> = pieces
        .iter()
        .map(|p| parse_condition(p.trim()))
        .collect::<Option<_>>()?;
    Some(match parts.len() {
        0 => return None,
        1 => parts.into_iter().next().unwrap(),
        _ => MetadataFilter::And { and: parts },
    })
}

/// Split on ` AND ` and on commas that sit outside `[...]` lists
fn split_top_level(expr: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut depth = 0usize;
    let mut rest = expr;

    while !rest.is_empty() {
        if depth == 0 && rest.starts_with(" AND ") {
            parts.push(std::mem::take(&mut current));
            rest = &rest[5..];
            continue;
        }
        let c = rest.chars().next().unwrap();
        match c {
            '[' => depth += 1,
            ']' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                parts.push(std::mem::take(&mut current));
                rest = &rest[1..];
                continue;
            }
            _ => {}
        }
        current.push(c);
        rest = &rest[c.len_utf8()..];
    }
    if !current.trim().is_empty() {
        parts.push(current);
    }
    parts
}

fn parse_condition(expr: &str) -> Option<MetadataFilter> {
    let cond = |field: &str, op: FilterOp, value: Value| {
        Some(MetadataFilter::Condition(FilterCondition {
            field: field.trim().to_string(),
            op,
            value,
        }))
    };

    // field?
    if let Some(field) = expr.strip_suffix('?') {
        return cond(field, FilterOp::Exists, Value::Null);
    }

    // field in [a,b] / field not_in [a,b]
    for (needle, op) in [(" not_in [", FilterOp::NotIn), (" in [", FilterOp::In)] {
        if let Some(at) = expr.find(needle) {
            let rest = &expr[at + needle.len()..];
            let end = rest.find(']')?;
            let values: Vec<Value> =
                rest[..end].split(',').map(|v| parse_value(v.trim())).collect();
            return cond(&expr[..at], op, Value::Array(values));
        }
    }

    // Two-character comparators first so '>' does not shadow '>='
    for (sep, op) in [
        ("!=", FilterOp::Ne),
        (">=", FilterOp::Gte),
        ("<=", FilterOp::Lte),
    ] {
        if let Some((field, value)) = expr.split_once(sep) {
            return cond(field, op, parse_value(value.trim()));
        }
    }
    for (sep, op) in [
        ('>', FilterOp::Gt),
        ('<', FilterOp::Lt),
        ('~', FilterOp::Contains),
        ('^', FilterOp::StartsWith),
        ('$', FilterOp::EndsWith),
    ] {
        if let Some((field, value)) = expr.split_once(sep) {
            let value = value.trim();
            let v = match op {
                FilterOp::Contains | FilterOp::StartsWith | FilterOp::EndsWith => {
                    Value::String(value.to_string())
                }
                _ => parse_value(value),
            };
            return cond(field, op, v);
        }
    }

    // field=value or field:value, with glob shorthands on the value
    let (field, value) = expr.split_once('=').or_else(|| expr.split_once(':'))?;
    let value = value.trim();
    if value.len() > 1 && value.starts_with('*') && value.ends_with('*') {
        return cond(
            field,
            FilterOp::Contains,
            Value::String(value[1..value.len() - 1].to_string()),
        );
    }
    if let Some(suffix) = value.strip_prefix('*') {
        return cond(field, FilterOp::EndsWith, Value::String(suffix.to_string()));
    }
    if let Some(prefix) = value.strip_suffix('*') {
        return cond(field, FilterOp::StartsWith, Value::String(prefix.to_string()));
    }
    cond(field, FilterOp::Eq, parse_value(value))
}

fn parse_value(s: &str) -> Value {
    if let Ok(n) = s.parse::<i64>() {
        return Value::Number(n.into());
    }
    if let Ok(f) = s.parse::<f64>() {
        if let Some(n) = serde_json::Number::from_f64(f) {
            return Value::Number(n);
        }
    }
    match s {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        _ => Value::String(s.to_string()),
    }
}

impl FilterCondition {
    fn matches(&self, metadata: &Value) -> bool {
        let field = lookup(metadata, &self.field);
        match self.op {
            FilterOp::Exists => field.is_some(),
            FilterOp::Eq => field.is_some_and(|v| values_equal(v, &self.value)),
            FilterOp::Ne => !field.is_some_and(|v| values_equal(v, &self.value)),
            FilterOp::Gt => compare(field, &self.value).is_some_and(|o| o.is_gt()),
            FilterOp::Gte => compare(field, &self.value).is_some_and(|o| o.is_ge()),
            FilterOp::Lt => compare(field, &self.value).is_some_and(|o| o.is_lt()),
            FilterOp::Lte => compare(field, &self.value).is_some_and(|o| o.is_le()),
            FilterOp::In => self.value.as_array().is_some_and(|arr| {
                field.is_some_and(|v| arr.iter().any(|item| values_equal(v, item)))
            }),
            FilterOp::NotIn => !self.value.as_array().is_some_and(|arr| {
                field.is_some_and(|v| arr.iter().any(|item| values_equal(v, item)))
            }),
            FilterOp::Contains => str_test(field, &self.value, |s, p| s.contains(p)),
            FilterOp::StartsWith => str_test(field, &self.value, |s, p| s.starts_with(p)),
            FilterOp::EndsWith => str_test(field, &self.value, |s, p| s.ends_with(p)),
        }
    }
}

fn lookup<'a>(metadata: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(metadata, |v, key| v.get(key))
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x
            .as_f64()
            .zip(y.as_f64())
            .is_some_and(|(x, y)| (x - y).abs() < f64::EPSILON),
        _ => a == b,
    }
}

fn compare(field: Option<&Value>, target: &Value) -> Option<std::cmp::Ordering> {
    let field = field?;
    if let (Some(a), Some(b)) = (field.as_f64(), target.as_f64()) {
        return a.partial_cmp(&b);
    }
    match (field.as_str(), target.as_str()) {
        (Some(a), Some(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

fn str_test(field: Option<&Value>, pattern: &Value, test: impl Fn(&str, &str) -> bool) -> bool {
    match (field.and_then(|v| v.as_str()), pattern.as_str()) {
        (Some(s), Some(p)) => test(s, p),
        _ => false,
    }
}

/// Inclusive timestamp window over `metadata.timestamp` (ISO-8601)
#[derive(Debug, Clone, Default)]
pub struct TimeRange {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

impl TimeRange {
    pub fn is_empty_filter(&self) -> bool {
        self.from.is_none() && self.to.is_none()
    }

    /// An inverted window matches nothing (and is not an error)
    pub fn is_inverted(&self) -> bool {
        matches!((self.from, self.to), (Some(f), Some(t)) if f > t)
    }

    pub fn matches(&self, metadata: &Value) -> bool {
        if self.is_empty_filter() {
            return true;
        }
        let Some(ts) = parse_timestamp(metadata) else {
            // Passages without a timestamp fail any time filter
            return false;
        };
        if let Some(from) = self.from {
            if ts < from {
                return false;
            }
        }
        if let Some(to) = self.to {
            if ts > to {
                return false;
            }
        }
        true
    }
}

/// Timestamp of a passage, if its metadata carries a parseable one
pub fn parse_timestamp(metadata: &Value) -> Option<DateTime<Utc>> {
    let raw = metadata.get("timestamp")?.as_str()?;
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Materialized allowed-node set plus its selectivity
pub struct FilterPlan {
    bits: Vec<u64>,
    allowed: u64,
    total: u64,
}

impl FilterPlan {
    /// Scan passage metadata once and mark every node passing both the
    /// metadata filter and the time window.
    pub fn build(
        store: &PassageStore,
        filter: Option<&MetadataFilter>,
        time: &TimeRange,
    ) -> Result<Self> {
        let n = store.len();
        let mut plan = Self {
            bits: vec![0u64; n.div_ceil(64)],
            allowed: 0,
            total: n as u64,
        };

        if time.is_inverted() {
            return Ok(plan);
        }

        for (node, passage) in store.iter()?.enumerate() {
            let passage = passage?;
            let pass = filter.is_none_or(|f| f.matches(&passage.metadata))
                && time.matches(&passage.metadata);
            if pass {
                plan.bits[node / 64] |= 1u64 << (node % 64);
                plan.allowed += 1;
            }
        }
        Ok(plan)
    }

    pub fn allows(&self, node: u32) -> bool {
        let i = node as usize;
        self.bits
            .get(i / 64)
            .is_some_and(|w| w & (1u64 << (i % 64)) != 0)
    }

    pub fn allowed_count(&self) -> u64 {
        self.allowed
    }

    /// Fraction of nodes passing the filter
    pub fn selectivity(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.allowed as f64 / self.total as f64
        }
    }

    /// Allowed node indices in ascending order
    pub fn allowed_nodes(&self) -> Vec<u32> {
        let mut out = Vec::with_capacity(self.allowed as usize);
        for node in 0..self.total as u32 {
            if self.allows(node) {
                out.push(node);
            }
        }
        out
    }
}
