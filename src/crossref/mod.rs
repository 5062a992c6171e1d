// src/crossref/mod.rs

//! Cross-reference validation.
//!
//! Rules are declared as data (`[[rule]]` in the pipeline file) and
//! evaluated as a pure function of a [`StoreSnapshot`]:
//!
//! - `exact_match`: two fields must be identical.
//! - `consistency`: a controlled-vocabulary field must carry the same value
//!   everywhere it appears.
//! - `conditional_existence`: if a predicate holds, a node's output must
//!   exist and be non-empty.
//! - `mathematical`: a field must equal a formula over other fields within a
//!   numeric tolerance.
//!
//! The [`validator`] module holds the evaluation logic.

pub mod validator;

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::condition::Predicate;
use crate::store::{DocumentId, FieldRef, StoreSnapshot};
use crate::types::Severity;

pub use validator::Validator;

/// A declarative validation rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub id: String,
    #[serde(default)]
    pub severity: Severity,
    /// Optional human-readable description prefixed to finding messages.
    #[serde(default)]
    pub description: Option<String>,
    #[serde(flatten)]
    pub kind: RuleKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RuleKind {
    ExactMatch {
        left: FieldRef,
        right: FieldRef,
    },
    Consistency {
        fields: Vec<FieldRef>,
    },
    ConditionalExistence {
        when: Predicate,
        node: String,
        /// Specific field that must be non-empty; any field when unset.
        #[serde(default)]
        field: Option<String>,
    },
    Mathematical {
        target: FieldRef,
        formula: Formula,
        #[serde(default)]
        tolerance: f64,
    },
}

impl Rule {
    pub fn new(id: impl Into<String>, severity: Severity, kind: RuleKind) -> Self {
        Self {
            id: id.into(),
            severity,
            description: None,
            kind,
        }
    }

    /// Fields whose value this rule reads.
    pub fn referenced_fields(&self) -> BTreeSet<FieldRef> {
        match &self.kind {
            RuleKind::ExactMatch { left, right } => [left.clone(), right.clone()].into(),
            RuleKind::Consistency { fields } => fields.iter().cloned().collect(),
            RuleKind::ConditionalExistence { when, node, field } => {
                let mut out = when.fields();
                if let Some(f) = field {
                    out.insert(FieldRef::new(node.clone(), f.clone()));
                }
                out
            }
            RuleKind::Mathematical {
                target, formula, ..
            } => {
                let mut out = formula.fields();
                out.insert(target.clone());
                out
            }
        }
    }

    /// Whether a write to `written` can change this rule's result.
    pub fn touches(&self, written: &FieldRef) -> bool {
        if let RuleKind::ConditionalExistence {
            node, field: None, ..
        } = &self.kind
        {
            if written.document == *node {
                return true;
            }
        }
        self.referenced_fields().contains(written)
    }

    pub fn check(&self) -> Result<(), String> {
        match &self.kind {
            RuleKind::ConditionalExistence { when, .. } => when.check(),
            RuleKind::Mathematical { tolerance, .. } if *tolerance < 0.0 => {
                Err(format!("rule '{}' has a negative tolerance", self.id))
            }
            RuleKind::Consistency { fields } if fields.len() < 2 => Err(format!(
                "rule '{}' needs at least two fields to compare",
                self.id
            )),
            _ => Ok(()),
        }
    }
}

/// Arithmetic over store fields, used by `mathematical` rules.
///
/// ```toml
/// formula = { sum = ["CostEstimate.labor", "CostEstimate.materials"] }
/// formula = { mul = [{ field = "Quote.quantity" }, { field = "Quote.unit_price" }] }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Formula {
    Field(FieldRef),
    Const(f64),
    Sum(Vec<FieldRef>),
    Add(Vec<Formula>),
    Sub(Box<Formula>, Box<Formula>),
    Mul(Vec<Formula>),
    Div(Box<Formula>, Box<Formula>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum FormulaError {
    /// An operand is absent; the rule does not apply yet.
    Missing(FieldRef),
    NotNumeric(FieldRef),
    DivideByZero,
}

impl Formula {
    pub fn evaluate(&self, snapshot: &StoreSnapshot) -> Result<f64, FormulaError> {
        match self {
            Formula::Field(f) => field_number(snapshot, f),
            Formula::Const(c) => Ok(*c),
            Formula::Sum(fields) => fields
                .iter()
                .try_fold(0.0, |acc, f| Ok(acc + field_number(snapshot, f)?)),
            Formula::Add(terms) => terms
                .iter()
                .try_fold(0.0, |acc, t| Ok(acc + t.evaluate(snapshot)?)),
            Formula::Sub(a, b) => Ok(a.evaluate(snapshot)? - b.evaluate(snapshot)?),
            Formula::Mul(terms) => terms
                .iter()
                .try_fold(1.0, |acc, t| Ok(acc * t.evaluate(snapshot)?)),
            Formula::Div(a, b) => {
                let numerator = a.evaluate(snapshot)?;
                let denominator = b.evaluate(snapshot)?;
                if denominator == 0.0 {
                    return Err(FormulaError::DivideByZero);
                }
                Ok(numerator / denominator)
            }
        }
    }

    pub fn fields(&self) -> BTreeSet<FieldRef> {
        let mut out = BTreeSet::new();
        self.collect_fields(&mut out);
        out
    }

    fn collect_fields(&self, out: &mut BTreeSet<FieldRef>) {
        match self {
            Formula::Field(f) => {
                out.insert(f.clone());
            }
            Formula::Const(_) => {}
            Formula::Sum(fields) => out.extend(fields.iter().cloned()),
            Formula::Add(terms) | Formula::Mul(terms) => {
                terms.iter().for_each(|t| t.collect_fields(out))
            }
            Formula::Sub(a, b) | Formula::Div(a, b) => {
                a.collect_fields(out);
                b.collect_fields(out);
            }
        }
    }
}

fn field_number(snapshot: &StoreSnapshot, field: &FieldRef) -> Result<f64, FormulaError> {
    let value = snapshot
        .get_ref(field)
        .ok_or_else(|| FormulaError::Missing(field.clone()))?;
    as_number(value).ok_or_else(|| FormulaError::NotNumeric(field.clone()))
}

/// Numeric reading of a value. Accepts currency-style strings such as
/// `"$1,250.00"`.
pub fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => {
            let cleaned: String = s
                .chars()
                .filter(|c| !matches!(c, '$' | ',' | ' '))
                .collect();
            cleaned.parse().ok()
        }
        _ => None,
    }
}

/// One rule violation.
///
/// Findings are recomputed from snapshots and never mutated.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Finding {
    pub rule_id: String,
    pub severity: Severity,
    pub message: String,
    /// Offending documents, sorted and de-duplicated.
    pub documents: Vec<DocumentId>,
}

impl Finding {
    pub fn new(
        rule: &Rule,
        message: impl Into<String>,
        documents: impl IntoIterator<Item = DocumentId>,
    ) -> Self {
        let documents: BTreeSet<DocumentId> = documents.into_iter().collect();
        let message = match &rule.description {
            Some(d) => format!("{d}: {}", message.into()),
            None => message.into(),
        };
        Self {
            rule_id: rule.id.clone(),
            severity: rule.severity,
            message,
            documents: documents.into_iter().collect(),
        }
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

/// Current findings, keyed by rule id.
///
/// Incremental validation replaces the entry of each re-evaluated rule
/// wholesale, so stale findings disappear once a rule passes again.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FindingSet {
    by_rule: BTreeMap<String, Vec<Finding>>,
}

impl FindingSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn replace(&mut self, rule_id: &str, mut findings: Vec<Finding>) {
        findings.sort();
        if findings.is_empty() {
            self.by_rule.remove(rule_id);
        } else {
            self.by_rule.insert(rule_id.to_string(), findings);
        }
    }

    pub fn all(&self) -> Vec<Finding> {
        self.by_rule.values().flatten().cloned().collect()
    }

    pub fn errors(&self) -> Vec<Finding> {
        self.by_rule
            .values()
            .flatten()
            .filter(|f| f.is_error())
            .cloned()
            .collect()
    }

    pub fn has_errors(&self) -> bool {
        self.by_rule.values().flatten().any(Finding::is_error)
    }
}
