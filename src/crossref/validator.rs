// src/crossref/validator.rs

use std::collections::BTreeSet;

use serde_json::Value;
use tracing::debug;

use super::{Finding, FormulaError, Rule, RuleKind, as_number};
use crate::condition::Predicate;
use crate::store::{FieldRef, StoreSnapshot, is_non_empty};

/// Relative slack added to every numeric comparison so that a tolerance of
/// zero survives float rounding in sums.
const FLOAT_EPSILON: f64 = 1e-9;

/// Result of validating only the rules touched by a write.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IncrementalOutcome {
    /// Ids of the rules that were re-evaluated, in declaration order.
    pub evaluated: Vec<String>,
    pub findings: Vec<Finding>,
}

/// Evaluates a fixed rule set against store snapshots.
///
/// Evaluation is a pure function of `(rules, snapshot)`: the same snapshot
/// always yields byte-identical findings in the same order.
#[derive(Debug, Clone, Default)]
pub struct Validator {
    rules: Vec<Rule>,
}

impl Validator {
    pub fn new(rules: Vec<Rule>) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// Full sweep over every rule.
    pub fn validate(&self, snapshot: &StoreSnapshot) -> Vec<Finding> {
        let mut findings: Vec<Finding> = self
            .rules
            .iter()
            .flat_map(|rule| evaluate_rule(rule, snapshot))
            .collect();
        findings.sort();
        findings
    }

    /// Rules whose result may change after writes to `written`.
    pub fn rules_touching<'a>(&'a self, written: &[FieldRef]) -> Vec<&'a Rule> {
        self.rules
            .iter()
            .filter(|rule| written.iter().any(|w| rule.touches(w)))
            .collect()
    }

    /// Re-evaluate only the rules that reference a written field.
    pub fn validate_incremental(
        &self,
        snapshot: &StoreSnapshot,
        written: &[FieldRef],
    ) -> IncrementalOutcome {
        let mut outcome = IncrementalOutcome::default();
        for rule in self.rules_touching(written) {
            outcome.evaluated.push(rule.id.clone());
            outcome.findings.extend(evaluate_rule(rule, snapshot));
        }
        outcome.findings.sort();

        debug!(
            written = written.len(),
            evaluated = outcome.evaluated.len(),
            findings = outcome.findings.len(),
            "incremental validation"
        );
        outcome
    }
}

/// Evaluate one rule. Rules whose inputs are absent do not fire.
pub fn evaluate_rule(rule: &Rule, snapshot: &StoreSnapshot) -> Vec<Finding> {
    match &rule.kind {
        RuleKind::ExactMatch { left, right } => exact_match(rule, snapshot, left, right),
        RuleKind::Consistency { fields } => consistency(rule, snapshot, fields),
        RuleKind::ConditionalExistence { when, node, field } => {
            conditional_existence(rule, snapshot, when, node, field.as_deref())
        }
        RuleKind::Mathematical {
            target,
            formula,
            tolerance,
        } => {
            let Some(actual) = snapshot.get_ref(target) else {
                return Vec::new();
            };
            let mut documents: BTreeSet<String> = formula
                .fields()
                .into_iter()
                .map(|f| f.document)
                .collect();
            documents.insert(target.document.clone());

            let Some(actual) = as_number(actual) else {
                return vec![Finding::new(
                    rule,
                    format!("{target} is not numeric: {}", render(actual)),
                    [target.document.clone()],
                )];
            };

            match formula.evaluate(snapshot) {
                Ok(expected) => {
                    let delta = (actual - expected).abs();
                    let slack = FLOAT_EPSILON * actual.abs().max(expected.abs()).max(1.0);
                    if delta > tolerance + slack {
                        vec![Finding::new(
                            rule,
                            format!(
                                "{target} is {actual} but the formula gives {expected} \
                                 (difference {delta}, tolerance {tolerance})"
                            ),
                            documents,
                        )]
                    } else {
                        Vec::new()
                    }
                }
                Err(FormulaError::Missing(_)) => Vec::new(),
                Err(FormulaError::NotNumeric(field)) => vec![Finding::new(
                    rule,
                    format!("{field} is not numeric"),
                    documents,
                )],
                Err(FormulaError::DivideByZero) => vec![Finding::new(
                    rule,
                    format!("formula for {target} divides by zero"),
                    documents,
                )],
            }
        }
    }
}

fn exact_match(
    rule: &Rule,
    snapshot: &StoreSnapshot,
    left: &FieldRef,
    right: &FieldRef,
) -> Vec<Finding> {
    let (Some(l), Some(r)) = (snapshot.get_ref(left), snapshot.get_ref(right)) else {
        return Vec::new();
    };
    if l == r {
        return Vec::new();
    }
    vec![Finding::new(
        rule,
        format!("{left} = {} but {right} = {}", render(l), render(r)),
        [left.document.clone(), right.document.clone()],
    )]
}

fn consistency(rule: &Rule, snapshot: &StoreSnapshot, fields: &[FieldRef]) -> Vec<Finding> {
    let present: Vec<(&FieldRef, &Value)> = fields
        .iter()
        .filter_map(|f| snapshot.get_ref(f).map(|v| (f, v)))
        .collect();

    let Some((_, first)) = present.first() else {
        return Vec::new();
    };
    if present.iter().all(|(_, v)| v == first) {
        return Vec::new();
    }

    let listing = present
        .iter()
        .map(|(f, v)| format!("{f} = {}", render(v)))
        .collect::<Vec<_>>()
        .join(", ");
    vec![Finding::new(
        rule,
        format!("inconsistent values: {listing}"),
        present.iter().map(|(f, _)| f.document.clone()),
    )]
}

fn conditional_existence(
    rule: &Rule,
    snapshot: &StoreSnapshot,
    when: &Predicate,
    node: &str,
    field: Option<&str>,
) -> Vec<Finding> {
    if !when.evaluate(snapshot) {
        return Vec::new();
    }

    let satisfied = match field {
        Some(f) => snapshot.get(node, f).is_some_and(is_non_empty),
        None => snapshot
            .document(node)
            .is_some_and(|doc| doc.values().any(is_non_empty)),
    };
    if satisfied {
        return Vec::new();
    }

    let what = match field {
        Some(f) => format!("{node}.{f}"),
        None => format!("output of {node}"),
    };
    let mut documents: BTreeSet<String> = when.fields().into_iter().map(|f| f.document).collect();
    documents.insert(node.to_string());
    vec![Finding::new(
        rule,
        format!("{what} is required but missing or empty"),
        documents,
    )]
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => format!("{s:?}"),
        other => other.to_string(),
    }
}
