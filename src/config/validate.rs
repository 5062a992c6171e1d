// src/config/validate.rs

use std::collections::BTreeSet;

use crate::config::model::{PipelineFile, RawPipelineFile};
use crate::crossref::RuleKind;
use crate::dag::PipelineGraph;
use crate::errors::{DocdagError, Result};

impl TryFrom<RawPipelineFile> for PipelineFile {
    type Error = crate::errors::DocdagError;

    fn try_from(raw: RawPipelineFile) -> std::result::Result<Self, Self::Error> {
        validate_raw_pipeline(&raw)?;
        Ok(PipelineFile::new_unchecked(raw))
    }
}

fn validate_raw_pipeline(cfg: &RawPipelineFile) -> Result<()> {
    ensure_has_nodes(cfg)?;
    validate_global_config(cfg)?;
    validate_inputs(cfg)?;
    validate_node_dependencies(cfg)?;
    validate_node_settings(cfg)?;
    // Cycles are reported before any check that walks ancestors.
    let graph = PipelineGraph::build(&cfg.node)?;
    validate_data_sources(cfg, &graph)?;
    validate_condition_scope(cfg, &graph)?;
    validate_rules(cfg)?;
    Ok(())
}

fn config_error(message: String) -> DocdagError {
    DocdagError::Config(message)
}

fn is_known_document(cfg: &RawPipelineFile, document: &str) -> bool {
    cfg.node.contains_key(document) || cfg.config.inputs.iter().any(|d| d == document)
}

fn ensure_has_nodes(cfg: &RawPipelineFile) -> Result<()> {
    if cfg.node.is_empty() {
        return Err(config_error(
            "pipeline must contain at least one [node.<id>] section".to_string(),
        ));
    }
    Ok(())
}

fn validate_global_config(cfg: &RawPipelineFile) -> Result<()> {
    let c = &cfg.config;
    if c.workers == 0 {
        return Err(config_error(
            "[config].workers must be >= 1 (got 0)".to_string(),
        ));
    }
    if c.retry.max_attempts == 0 {
        return Err(config_error(
            "[config.retry].max_attempts must be >= 1 (got 0)".to_string(),
        ));
    }
    if c.retry.initial_backoff_ms > c.retry.max_backoff_ms {
        return Err(config_error(format!(
            "[config.retry].initial_backoff_ms ({}) exceeds max_backoff_ms ({})",
            c.retry.initial_backoff_ms, c.retry.max_backoff_ms
        )));
    }
    if c.refinement.max_iterations == 0 {
        return Err(config_error(
            "[config.refinement].max_iterations must be >= 1 (got 0)".to_string(),
        ));
    }
    if c.refinement.target_score > 100 {
        return Err(config_error(format!(
            "[config.refinement].target_score must be <= 100 (got {})",
            c.refinement.target_score
        )));
    }
    Ok(())
}

fn validate_inputs(cfg: &RawPipelineFile) -> Result<()> {
    let mut seen = BTreeSet::new();
    for input in &cfg.config.inputs {
        if !seen.insert(input.as_str()) {
            return Err(config_error(format!(
                "input document '{input}' is declared twice in [config].inputs"
            )));
        }
        if cfg.node.contains_key(input) {
            return Err(config_error(format!(
                "input document '{input}' has the same id as a node"
            )));
        }
    }
    Ok(())
}

fn validate_node_dependencies(cfg: &RawPipelineFile) -> Result<()> {
    for (name, node) in cfg.node.iter() {
        for dep in node.all_dependencies() {
            if !cfg.node.contains_key(&dep) {
                return Err(config_error(format!(
                    "node '{name}' has unknown dependency '{dep}'"
                )));
            }
        }

        for cond in &node.conditional {
            cond.when.check().map_err(|e| {
                config_error(format!(
                    "node '{name}': invalid condition on '{}': {e}",
                    cond.on
                ))
            })?;
            for field in cond.when.fields() {
                if !is_known_document(cfg, &field.document) {
                    return Err(config_error(format!(
                        "node '{name}': condition reads unknown document '{}'",
                        field.document
                    )));
                }
            }
        }
    }
    Ok(())
}

fn validate_node_settings(cfg: &RawPipelineFile) -> Result<()> {
    let mut any_refine = false;
    for (name, node) in cfg.node.iter() {
        let timeout = node
            .gate_timeout()
            .map_err(|e| config_error(format!("node '{name}': human_gate_timeout: {e}")))?;
        if timeout.is_some() && !node.requires_human_input {
            return Err(config_error(format!(
                "node '{name}' sets human_gate_timeout without requires_human_input"
            )));
        }
        if node.refine && node.requires_human_input {
            return Err(config_error(format!(
                "node '{name}' cannot both refine and require human input"
            )));
        }
        any_refine |= node.refine;
    }

    if any_refine && cfg.collaborator.generate.is_some() && cfg.collaborator.assess.is_none() {
        return Err(config_error(
            "nodes set `refine = true` but [collaborator].assess is not configured".to_string(),
        ));
    }
    Ok(())
}

fn validate_data_sources(cfg: &RawPipelineFile, graph: &PipelineGraph) -> Result<()> {
    for (name, node) in cfg.node.iter() {
        let ancestors = graph.ancestors_of(name);
        for (alias, source) in &node.data_sources {
            let is_input = cfg.config.inputs.iter().any(|d| *d == source.node);
            if is_input {
                continue;
            }
            if !cfg.node.contains_key(&source.node) {
                return Err(config_error(format!(
                    "node '{name}': data source '{alias}' reads unknown document '{}'",
                    source.node
                )));
            }
            if !ancestors.contains(&source.node) {
                return Err(config_error(format!(
                    "node '{name}': data source '{alias}' reads '{}', which is not upstream of it",
                    source.node
                )));
            }
        }
    }
    Ok(())
}

/// A condition is evaluated once, when the node's dependencies resolve, so it
/// may only read documents that are guaranteed to be written by then.
fn validate_condition_scope(cfg: &RawPipelineFile, graph: &PipelineGraph) -> Result<()> {
    for (name, node) in cfg.node.iter() {
        let ancestors = graph.ancestors_of(name);
        for cond in &node.conditional {
            for field in cond.when.fields() {
                let is_input = cfg.config.inputs.iter().any(|d| *d == field.document);
                if !is_input && !ancestors.contains(&field.document) {
                    return Err(config_error(format!(
                        "node '{name}': condition on '{}' reads '{}', which is not upstream of it",
                        cond.on, field.document
                    )));
                }
            }
        }
    }
    Ok(())
}

fn validate_rules(cfg: &RawPipelineFile) -> Result<()> {
    let mut ids = BTreeSet::new();
    for rule in &cfg.rule {
        if !ids.insert(rule.id.as_str()) {
            return Err(config_error(format!("duplicate rule id '{}'", rule.id)));
        }
        rule.check()
            .map_err(|e| config_error(format!("rule '{}': {e}", rule.id)))?;
        let mut documents: BTreeSet<String> = rule
            .referenced_fields()
            .into_iter()
            .map(|f| f.document)
            .collect();
        if let RuleKind::ConditionalExistence { node, .. } = &rule.kind {
            documents.insert(node.clone());
        }
        for document in documents {
            if !is_known_document(cfg, &document) {
                return Err(config_error(format!(
                    "rule '{}' references unknown document '{document}'",
                    rule.id
                )));
            }
        }
    }
    Ok(())
}
