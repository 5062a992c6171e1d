// src/condition/mod.rs

//! Trigger conditions for conditional edges.
//!
//! A condition is a typed expression tree evaluated against a
//! [`StoreSnapshot`]. Definitions spell it as a TOML/JSON table tagged by
//! `op`:
//!
//! ```toml
//! [[node.Justification.conditional]]
//! on = "Strategy"
//! when = { op = "compare", field = "Strategy.competition_strategy", cmp = "ne", value = "Full and Open" }
//! ```
//!
//! Any comparison against a field that is absent from the snapshot is false.

use std::cmp::Ordering;
use std::collections::BTreeSet;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::store::{FieldRef, StoreSnapshot};

/// Comparison operator used by [`Predicate::Compare`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Predicate {
    Compare {
        field: FieldRef,
        cmp: CompareOp,
        value: Value,
    },
    In {
        field: FieldRef,
        values: Vec<Value>,
    },
    NotIn {
        field: FieldRef,
        values: Vec<Value>,
    },
    /// Field is present and non-empty.
    Exists { field: FieldRef },
    /// String field matches a regular expression.
    Matches { field: FieldRef, pattern: String },
    And { all: Vec<Predicate> },
    Or { any: Vec<Predicate> },
    Not { not: Box<Predicate> },
}

impl Predicate {
    pub fn compare(field: FieldRef, cmp: CompareOp, value: impl Into<Value>) -> Self {
        Predicate::Compare {
            field,
            cmp,
            value: value.into(),
        }
    }

    pub fn equals(field: FieldRef, value: impl Into<Value>) -> Self {
        Self::compare(field, CompareOp::Eq, value)
    }

    pub fn not_equals(field: FieldRef, value: impl Into<Value>) -> Self {
        Self::compare(field, CompareOp::Ne, value)
    }

    pub fn evaluate(&self, snapshot: &StoreSnapshot) -> bool {
        match self {
            Predicate::Compare { field, cmp, value } => match snapshot.get_ref(field) {
                Some(actual) => compare(actual, *cmp, value),
                None => false,
            },
            Predicate::In { field, values } => match snapshot.get_ref(field) {
                Some(actual) => values.iter().any(|v| values_equal(actual, v)),
                None => false,
            },
            Predicate::NotIn { field, values } => match snapshot.get_ref(field) {
                Some(actual) => !values.iter().any(|v| values_equal(actual, v)),
                None => false,
            },
            Predicate::Exists { field } => snapshot
                .get_ref(field)
                .is_some_and(crate::store::is_non_empty),
            Predicate::Matches { field, pattern } => {
                let Some(text) = snapshot.get_ref(field).and_then(Value::as_str) else {
                    return false;
                };
                match Regex::new(pattern) {
                    Ok(re) => re.is_match(text),
                    Err(e) => {
                        warn!(%field, pattern = %pattern, error = %e, "invalid condition regex");
                        false
                    }
                }
            }
            Predicate::And { all } => all.iter().all(|p| p.evaluate(snapshot)),
            Predicate::Or { any } => any.iter().any(|p| p.evaluate(snapshot)),
            Predicate::Not { not } => !not.evaluate(snapshot),
        }
    }

    /// Every field this predicate reads.
    pub fn fields(&self) -> BTreeSet<FieldRef> {
        let mut out = BTreeSet::new();
        self.collect_fields(&mut out);
        out
    }

    fn collect_fields(&self, out: &mut BTreeSet<FieldRef>) {
        match self {
            Predicate::Compare { field, .. }
            | Predicate::In { field, .. }
            | Predicate::NotIn { field, .. }
            | Predicate::Exists { field }
            | Predicate::Matches { field, .. } => {
                out.insert(field.clone());
            }
            Predicate::And { all } => all.iter().for_each(|p| p.collect_fields(out)),
            Predicate::Or { any } => any.iter().for_each(|p| p.collect_fields(out)),
            Predicate::Not { not } => not.collect_fields(out),
        }
    }

    /// Static checks run when a definition is loaded.
    pub fn check(&self) -> Result<(), String> {
        match self {
            Predicate::Matches { pattern, .. } => Regex::new(pattern)
                .map(|_| ())
                .map_err(|e| format!("invalid regex '{pattern}': {e}")),
            Predicate::And { all } => all.iter().try_for_each(Predicate::check),
            Predicate::Or { any } => any.iter().try_for_each(Predicate::check),
            Predicate::Not { not } => not.check(),
            _ => Ok(()),
        }
    }
}

/// Equality that treats `1` and `1.0` as the same number.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

fn ordering(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn compare(actual: &Value, cmp: CompareOp, expected: &Value) -> bool {
    match cmp {
        CompareOp::Eq => values_equal(actual, expected),
        CompareOp::Ne => !values_equal(actual, expected),
        CompareOp::Gt => ordering(actual, expected) == Some(Ordering::Greater),
        CompareOp::Ge => matches!(
            ordering(actual, expected),
            Some(Ordering::Greater | Ordering::Equal)
        ),
        CompareOp::Lt => ordering(actual, expected) == Some(Ordering::Less),
        CompareOp::Le => matches!(
            ordering(actual, expected),
            Some(Ordering::Less | Ordering::Equal)
        ),
    }
}
