use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use docdag::errors::GenerationError;
use docdag::generation::{
    Assessment, BoxFuture, GenerationCollaborator, GenerationOutput, InputContext,
    QualityAssessor,
};
use docdag::types::HallucinationRisk;

#[derive(Debug, Default)]
struct CollaboratorState {
    /// One-shot results, consumed before falling back to `outputs`.
    queued: HashMap<String, VecDeque<Result<GenerationOutput, GenerationError>>>,
    outputs: HashMap<String, GenerationOutput>,
    calls: Vec<InputContext>,
}

/// A generation collaborator that:
/// - records every input context it is called with
/// - replays queued results per node, then a fixed output per node
/// - otherwise drafts `"<node> draft <n>"` with no extracted fields.
#[derive(Debug, Clone, Default)]
pub struct ScriptedCollaborator {
    state: Arc<Mutex<CollaboratorState>>,
}

impl ScriptedCollaborator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Output returned for `node` whenever nothing is queued.
    pub fn with_output(self, node: &str, output: GenerationOutput) -> Self {
        self.state
            .lock()
            .unwrap()
            .outputs
            .insert(node.to_string(), output);
        self
    }

    /// Shorthand for an output with only extracted fields.
    pub fn with_fields(self, node: &str, fields: &[(&str, serde_json::Value)]) -> Self {
        let mut output = GenerationOutput::new(format!("{node} draft"));
        for (name, value) in fields {
            output = output.with_field(*name, value.clone());
        }
        self.with_output(node, output)
    }

    /// Queue a one-shot result for the next call for `node`.
    pub fn push_result(self, node: &str, result: Result<GenerationOutput, GenerationError>) -> Self {
        self.state
            .lock()
            .unwrap()
            .queued
            .entry(node.to_string())
            .or_default()
            .push_back(result);
        self
    }

    pub fn calls(&self) -> Vec<InputContext> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn calls_for(&self, node: &str) -> Vec<InputContext> {
        self.calls()
            .into_iter()
            .filter(|c| c.node_id == node)
            .collect()
    }

    pub fn call_count(&self, node: &str) -> usize {
        self.calls_for(node).len()
    }
}

impl GenerationCollaborator for ScriptedCollaborator {
    fn invoke<'a>(
        &'a self,
        node_id: &'a str,
        context: &'a InputContext,
    ) -> BoxFuture<'a, Result<GenerationOutput, GenerationError>> {
        let result = {
            let mut state = self.state.lock().unwrap();
            state.calls.push(context.clone());
            let n = state.calls.iter().filter(|c| c.node_id == node_id).count();

            match state.queued.get_mut(node_id).and_then(VecDeque::pop_front) {
                Some(result) => result,
                None => Ok(state
                    .outputs
                    .get(node_id)
                    .cloned()
                    .unwrap_or_else(|| GenerationOutput::new(format!("{node_id} draft {n}")))),
            }
        };
        Box::pin(async move { result })
    }
}

#[derive(Debug, Default)]
struct AssessorState {
    scores: VecDeque<u8>,
    last: Option<u8>,
    assessed: Vec<(String, String)>,
}

/// A quality assessor that returns a fixed sequence of scores, repeating
/// the last one once the sequence runs out.
#[derive(Debug, Clone, Default)]
pub struct ScriptedAssessor {
    state: Arc<Mutex<AssessorState>>,
}

impl ScriptedAssessor {
    pub fn new(scores: impl IntoIterator<Item = u8>) -> Self {
        let state = AssessorState {
            scores: scores.into_iter().collect(),
            ..Default::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// `(node, content)` for every assessment made.
    pub fn assessed(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().assessed.clone()
    }

    pub fn assessments(&self) -> usize {
        self.state.lock().unwrap().assessed.len()
    }

    /// Assessment counts keyed by node.
    pub fn assessments_by_node(&self) -> BTreeMap<String, usize> {
        let mut out = BTreeMap::new();
        for (node, _) in self.assessed() {
            *out.entry(node).or_insert(0) += 1;
        }
        out
    }
}

impl QualityAssessor for ScriptedAssessor {
    fn assess<'a>(
        &'a self,
        content: &'a str,
        context: &'a InputContext,
    ) -> BoxFuture<'a, Result<Assessment, GenerationError>> {
        let score = {
            let mut state = self.state.lock().unwrap();
            state
                .assessed
                .push((context.node_id.clone(), content.to_string()));
            let score = state.scores.pop_front().or(state.last).unwrap_or(100);
            state.last = Some(score);
            score
        };
        let assessment = Assessment::new(score, HallucinationRisk::Low)
            .with_issue("clarity", format!("score {score}"));
        Box::pin(async move { Ok(assessment) })
    }
}
