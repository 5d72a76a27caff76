use crate::error::EvalError;
use crate::evaluators::{
    AiCritiqueEvaluator, CustomCodeEvaluator, CustomCodeExecutor, ExactMatchEvaluator,
    NoSandbox, RegexEvaluator, SimilarityEvaluator, WebhookEvaluator,
};
use crate::models::{EvalResult, EvaluatorKind, ScenarioInput};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

/// Everything an evaluator may look at when scoring one scenario
pub struct ScoreContext<'a> {
    pub inputs: &'a [ScenarioInput],
    pub output: &'a str,
    pub correct_answer: Option<&'a HashMap<String, String>>,
    pub settings: &'a serde_json::Value,
}

/// A scoring strategy. Implementations must never propagate execution
/// failures: anything that goes wrong becomes an [`EvalResult::Error`].
#[async_trait]
pub trait Evaluator: Send + Sync {
    fn kind(&self) -> EvaluatorKind;

    async fn score(&self, ctx: &ScoreContext<'_>) -> EvalResult;
}

impl std::fmt::Debug for dyn Evaluator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Evaluator")
            .field("kind", &self.kind())
            .finish()
    }
}

/// Fixed table of evaluator kinds, each backed by one [`Evaluator`].
/// Built once at startup; `register` allows replacing or extending entries.
pub struct EvaluatorRegistry {
    evaluators: HashMap<EvaluatorKind, Arc<dyn Evaluator>>,
}

impl EvaluatorRegistry {
    /// An empty registry, for callers assembling their own table
    pub fn new() -> Self {
        Self {
            evaluators: HashMap::new(),
        }
    }

    /// The built-in table with all six kinds registered. Custom code
    /// execution goes through the supplied executor.
    pub fn builtin(custom_code: Arc<dyn CustomCodeExecutor>) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(ExactMatchEvaluator));
        registry.register(Arc::new(SimilarityEvaluator));
        registry.register(Arc::new(RegexEvaluator));
        registry.register(Arc::new(WebhookEvaluator::new()));
        registry.register(Arc::new(AiCritiqueEvaluator::new()));
        registry.register(Arc::new(CustomCodeEvaluator::new(custom_code)));
        registry
    }

    pub fn register(&mut self, evaluator: Arc<dyn Evaluator>) {
        self.evaluators.insert(evaluator.kind(), evaluator);
    }

    pub fn get(&self, kind: EvaluatorKind) -> Result<Arc<dyn Evaluator>, EvalError> {
        self.evaluators
            .get(&kind)
            .cloned()
            .ok_or_else(|| EvalError::UnsupportedEvaluator(kind.to_string()))
    }
}

impl Default for EvaluatorRegistry {
    fn default() -> Self {
        Self::builtin(Arc::new(NoSandbox))
    }
}
