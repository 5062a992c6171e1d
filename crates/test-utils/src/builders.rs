#![allow(dead_code)]

use std::path::PathBuf;

use docdag::condition::Predicate;
use docdag::config::model::{
    ConditionalDependency, DataSource, NodeConfig, RefinementSection, RetrySection,
};
use docdag::config::{PipelineFile, RawPipelineFile};
use docdag::crossref::Rule;
use docdag::errors::Result;
use docdag::types::RefinementPolicy;

/// Builder for `PipelineFile` to simplify test setup.
pub struct PipelineBuilder {
    raw: RawPipelineFile,
}

impl PipelineBuilder {
    pub fn new() -> Self {
        let mut raw = RawPipelineFile::default();
        // Tests should not sleep between collaborator retries.
        raw.config.retry = RetrySection {
            max_attempts: 3,
            initial_backoff_ms: 1,
            max_backoff_ms: 2,
        };
        Self { raw }
    }

    pub fn node(mut self, id: &str, node: NodeConfig) -> Self {
        self.raw.node.insert(id.to_string(), node);
        self
    }

    pub fn input(mut self, document: &str) -> Self {
        self.raw.config.inputs.push(document.to_string());
        self
    }

    pub fn rule(mut self, rule: Rule) -> Self {
        self.raw.rule.push(rule);
        self
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.raw.config.workers = workers;
        self
    }

    pub fn node_retries(mut self, retries: u32) -> Self {
        self.raw.config.node_retries = retries;
        self
    }

    pub fn halt_on_error(mut self, halt: bool) -> Self {
        self.raw.config.halt_on_error = halt;
        self
    }

    pub fn retry_attempts(mut self, max_attempts: u32) -> Self {
        self.raw.config.retry.max_attempts = max_attempts;
        self
    }

    pub fn refinement(
        mut self,
        target_score: u8,
        max_iterations: u32,
        min_improvement: i32,
        policy: RefinementPolicy,
    ) -> Self {
        self.raw.config.refinement = RefinementSection {
            target_score,
            max_iterations,
            min_improvement,
            policy,
        };
        self
    }

    pub fn state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.raw.config.state_dir = Some(dir.into());
        self
    }

    pub fn raw(self) -> RawPipelineFile {
        self.raw
    }

    pub fn try_build(self) -> Result<PipelineFile> {
        PipelineFile::try_from(self.raw)
    }

    pub fn build(self) -> PipelineFile {
        self.try_build()
            .expect("Failed to build valid pipeline from builder")
    }
}

impl Default for PipelineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for `NodeConfig`.
#[derive(Default)]
pub struct NodeBuilder {
    node: NodeConfig,
}

impl NodeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn after(mut self, dep: &str) -> Self {
        self.node.after.push(dep.to_string());
        self
    }

    /// Conditional dependency on `on`, taken only when `when` holds.
    pub fn when(mut self, on: &str, when: Predicate) -> Self {
        self.node.conditional.push(ConditionalDependency {
            on: on.to_string(),
            when,
        });
        self
    }

    pub fn human(mut self) -> Self {
        self.node.requires_human_input = true;
        self
    }

    pub fn gate_timeout(mut self, timeout: &str) -> Self {
        self.node.requires_human_input = true;
        self.node.human_gate_timeout = Some(timeout.to_string());
        self
    }

    pub fn outputs(mut self, fields: &[&str]) -> Self {
        self.node
            .output_fields
            .extend(fields.iter().map(|f| f.to_string()));
        self
    }

    pub fn refine(mut self) -> Self {
        self.node.refine = true;
        self
    }

    /// Required input: `fields` of `node` (all fields when empty).
    pub fn source(mut self, alias: &str, node: &str, fields: &[&str]) -> Self {
        self.node.data_sources.insert(
            alias.to_string(),
            DataSource {
                node: node.to_string(),
                fields: fields.iter().map(|f| f.to_string()).collect(),
                required: true,
            },
        );
        self
    }

    pub fn optional_source(mut self, alias: &str, node: &str, fields: &[&str]) -> Self {
        self = self.source(alias, node, fields);
        if let Some(source) = self.node.data_sources.get_mut(alias) {
            source.required = false;
        }
        self
    }

    pub fn build(self) -> NodeConfig {
        self.node
    }
}
