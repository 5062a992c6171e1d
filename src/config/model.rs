// src/config/model.rs

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::condition::Predicate;
use crate::crossref::Rule;
use crate::types::{RefinementPolicy, parse_duration};

/// Pipeline definition as read from a TOML file, before validation.
///
/// ```toml
/// [config]
/// workers = 4
/// inputs = ["Program"]
///
/// [config.refinement]
/// target_score = 85
/// policy = "keep_last"
///
/// [collaborator]
/// generate = "./draft.sh"
/// assess = "./assess.sh"
///
/// [node.Requirements]
/// output_fields = ["summary"]
///
/// [node.Requirements.data_sources.program]
/// node = "Program"
///
/// [node.MarketResearch]
/// after = ["Requirements"]
/// refine = true
///
/// [[rule]]
/// id = "cost-matches"
/// kind = "exact_match"
/// left = "CostEstimate.total_cost"
/// right = "Strategy.total_estimated_cost"
/// ```
///
/// All sections are optional and have reasonable defaults.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RawPipelineFile {
    #[serde(default)]
    pub config: ConfigSection,

    #[serde(default)]
    pub collaborator: CollaboratorSection,

    /// All nodes from `[node.<id>]`. Keys are node ids, which double as the
    /// document ids their output is stored under.
    #[serde(default)]
    pub node: BTreeMap<String, NodeConfig>,

    /// Declarative cross-reference rules from `[[rule]]`.
    #[serde(default)]
    pub rule: Vec<Rule>,
}

/// Validated pipeline definition.
///
/// Only obtainable through `TryFrom<RawPipelineFile>`, which rejects unknown
/// references and cycles.
#[derive(Debug, Clone)]
pub struct PipelineFile {
    pub config: ConfigSection,
    pub collaborator: CollaboratorSection,
    pub node: BTreeMap<String, NodeConfig>,
    pub rule: Vec<Rule>,
}

impl PipelineFile {
    pub(crate) fn new_unchecked(raw: RawPipelineFile) -> Self {
        Self {
            config: raw.config,
            collaborator: raw.collaborator,
            node: raw.node,
            rule: raw.rule,
        }
    }

    /// Whether `document` names a declared initial-input document.
    pub fn is_input_document(&self, document: &str) -> bool {
        self.config.inputs.iter().any(|d| d == document)
    }
}

/// `[config]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigSection {
    /// Size of the worker pool bounding concurrent generation calls.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// How many times a Failed node may go back to Ready.
    #[serde(default)]
    pub node_retries: u32,

    /// Stop dispatching new nodes once an `error` finding is reported.
    #[serde(default)]
    pub halt_on_error: bool,

    /// Directory for durable run checkpoints. No persistence when unset.
    #[serde(default)]
    pub state_dir: Option<PathBuf>,

    /// Documents supplied as initial inputs at run start.
    #[serde(default)]
    pub inputs: Vec<String>,

    #[serde(default)]
    pub retry: RetrySection,

    #[serde(default)]
    pub refinement: RefinementSection,
}

fn default_workers() -> usize {
    4
}

impl Default for ConfigSection {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            node_retries: 0,
            halt_on_error: false,
            state_dir: None,
            inputs: Vec::new(),
            retry: RetrySection::default(),
            refinement: RefinementSection::default(),
        }
    }
}

/// `[config.retry]`: collaborator retry budget and backoff.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct RetrySection {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    200
}

fn default_max_backoff_ms() -> u64 {
    5_000
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

/// `[config.refinement]`: stop conditions and acceptance policy.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct RefinementSection {
    #[serde(default = "default_target_score")]
    pub target_score: u8,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    /// Stop when the last score delta is at or below this value.
    #[serde(default = "default_min_improvement")]
    pub min_improvement: i32,
    #[serde(default)]
    pub policy: RefinementPolicy,
}

fn default_target_score() -> u8 {
    85
}

fn default_max_iterations() -> u32 {
    3
}

fn default_min_improvement() -> i32 {
    1
}

impl Default for RefinementSection {
    fn default() -> Self {
        Self {
            target_score: default_target_score(),
            max_iterations: default_max_iterations(),
            min_improvement: default_min_improvement(),
            policy: RefinementPolicy::default(),
        }
    }
}

/// `[collaborator]`: shell commands behind the process-backed collaborators.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct CollaboratorSection {
    #[serde(default)]
    pub generate: Option<String>,
    #[serde(default)]
    pub assess: Option<String>,
}

/// `[node.<id>]` section.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct NodeConfig {
    /// Unconditional dependencies.
    #[serde(default)]
    pub after: Vec<String>,

    /// Conditional dependencies; the node is Skipped if any predicate is false.
    #[serde(default)]
    pub conditional: Vec<ConditionalDependency>,

    /// The node's output is authored by a person and supplied via resume.
    #[serde(default)]
    pub requires_human_input: bool,

    /// Fields the node is expected to produce.
    #[serde(default)]
    pub output_fields: Vec<String>,

    /// Run the refinement loop after the first successful draft.
    #[serde(default)]
    pub refine: bool,

    /// Auto-fail the gate after this long in AwaitingHuman (e.g. `"48h"`).
    #[serde(default)]
    pub human_gate_timeout: Option<String>,

    /// Input projection: alias -> producing document and fields.
    #[serde(default)]
    pub data_sources: BTreeMap<String, DataSource>,
}

impl NodeConfig {
    /// All dependencies, conditional or not, without duplicates.
    pub fn all_dependencies(&self) -> Vec<String> {
        let mut deps = self.after.clone();
        for c in &self.conditional {
            if !deps.contains(&c.on) {
                deps.push(c.on.clone());
            }
        }
        deps
    }

    pub fn gate_timeout(&self) -> Result<Option<Duration>, String> {
        self.human_gate_timeout
            .as_deref()
            .map(parse_duration)
            .transpose()
    }
}

/// `[[node.<id>.conditional]]` entry.
#[derive(Debug, Clone, Deserialize)]
pub struct ConditionalDependency {
    /// Upstream node the edge comes from.
    pub on: String,
    /// Predicate evaluated once every dependency of the node is resolved.
    pub when: Predicate,
}

/// `[node.<id>.data_sources.<alias>]` entry.
#[derive(Debug, Clone, Deserialize)]
pub struct DataSource {
    /// Producing node (or initial-input document).
    pub node: String,
    /// Fields to project; empty means the whole document.
    #[serde(default)]
    pub fields: Vec<String>,
    /// Missing required input fails the node with `MissingInputError`.
    #[serde(default = "default_required")]
    pub required: bool,
}

fn default_required() -> bool {
    true
}
