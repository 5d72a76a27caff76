use crate::error::EvalError;
use crate::models::{
    ErrorDetail, EvalResult, Evaluation, EvaluationScenario, EvaluatorConfig, RateLimitConfig,
    ScenarioInput, ScenarioResult, TestsetRow,
};
use crate::registry::{EvaluatorRegistry, ScoreContext};
use crate::store::EvaluationStore;
use crate::variant::VariantInvoker;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::debug;
use uuid::Uuid;

/// Concurrency caps shared by all scenarios of one job: one gate for calls
/// to the evaluated variant, one for evaluators that go over the network
pub struct CallLimits {
    variant: Semaphore,
    external: Semaphore,
}

impl CallLimits {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            variant: Semaphore::new(config.max_variant_calls.max(1)),
            external: Semaphore::new(config.max_external_calls.max(1)),
        }
    }
}

/// Processes one (evaluation, testset-row) pair: invoke the variant, run
/// every configured evaluator, persist exactly one scenario record.
pub struct ScenarioRunner {
    registry: Arc<EvaluatorRegistry>,
    store: Arc<dyn EvaluationStore>,
}

impl ScenarioRunner {
    pub fn new(registry: Arc<EvaluatorRegistry>, store: Arc<dyn EvaluationStore>) -> Self {
        Self { registry, store }
    }

    /// Run the pair and upsert its scenario. Idempotent: a re-run for the
    /// same (evaluation, row index) overwrites the previous record.
    ///
    /// Returns false when the scenario write was dropped because the
    /// evaluation had been deleted mid-run.
    pub async fn run_scenario(
        &self,
        evaluation: &Evaluation,
        row_index: usize,
        row: &TestsetRow,
        configs: &[EvaluatorConfig],
        invoker: &dyn VariantInvoker,
        limits: &CallLimits,
    ) -> Result<bool, EvalError> {
        let inputs = format_inputs(row);

        let invocation = {
            let _permit = limits.variant.acquire().await.ok();
            invoker.invoke(&inputs).await
        };

        let scenario = match invocation {
            Ok(variant_output) => {
                let mut results = Vec::with_capacity(configs.len());
                for config in configs {
                    let result = self
                        .score_with_config(config, &inputs, &variant_output.output, row, limits)
                        .await;
                    results.push(ScenarioResult {
                        evaluator_config_id: config.id,
                        result,
                    });
                }
                EvaluationScenario {
                    id: Uuid::new_v4(),
                    evaluation_id: evaluation.id,
                    row_index,
                    inputs,
                    output: Some(variant_output.output),
                    correct_answer: row.correct_answer.clone(),
                    results,
                    cost: variant_output.cost,
                    latency: variant_output.latency,
                }
            }
            // Partial-failure semantics: a failed invocation still yields a
            // scenario, with every evaluator slot carrying the fault
            Err(e) => {
                debug!(
                    evaluation_id = %evaluation.id,
                    row_index, "variant invocation failed: {e:#}"
                );
                let detail =
                    ErrorDetail::with_trace("variant invocation failed", format!("{e:#}"));
                let results = configs
                    .iter()
                    .map(|config| ScenarioResult {
                        evaluator_config_id: config.id,
                        result: EvalResult::error(detail.clone()),
                    })
                    .collect();
                EvaluationScenario {
                    id: Uuid::new_v4(),
                    evaluation_id: evaluation.id,
                    row_index,
                    inputs,
                    output: None,
                    correct_answer: row.correct_answer.clone(),
                    results,
                    cost: None,
                    latency: None,
                }
            }
        };

        self.store.upsert_scenario(scenario).await
    }

    /// One evaluator's result for one row. Faults are isolated here: an
    /// unsupported kind or a scoring failure never blocks the other
    /// evaluators of the scenario.
    async fn score_with_config(
        &self,
        config: &EvaluatorConfig,
        inputs: &[ScenarioInput],
        output: &str,
        row: &TestsetRow,
        limits: &CallLimits,
    ) -> EvalResult {
        let evaluator = match self.registry.get(config.kind) {
            Ok(evaluator) => evaluator,
            Err(e) => return EvalResult::error(ErrorDetail::new(e.to_string())),
        };

        let ctx = ScoreContext {
            inputs,
            output,
            correct_answer: row.correct_answer.as_ref(),
            settings: &config.settings,
        };

        if config.kind.needs_network() {
            let _permit = limits.external.acquire().await.ok();
            evaluator.score(&ctx).await
        } else {
            evaluator.score(&ctx).await
        }
    }
}

/// Name-sorted formatted inputs for one row
fn format_inputs(row: &TestsetRow) -> Vec<ScenarioInput> {
    row.inputs
        .iter()
        .collect::<BTreeMap<_, _>>()
        .into_iter()
        .map(|(name, value)| ScenarioInput {
            name: name.clone(),
            value: value.clone(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EvaluatorKind, VariantOutput};
    use crate::store::InMemoryStore;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::HashMap;

    struct MockVariant {
        output: Option<String>,
    }

    #[async_trait]
    impl VariantInvoker for MockVariant {
        async fn invoke(&self, _inputs: &[ScenarioInput]) -> anyhow::Result<VariantOutput> {
            match &self.output {
                Some(output) => Ok(VariantOutput {
                    output: output.clone(),
                    cost: Some(0.001),
                    latency: Some(0.1),
                }),
                None => Err(anyhow!("variant exploded")),
            }
        }
    }

    fn exact_match_config() -> EvaluatorConfig {
        EvaluatorConfig {
            id: Uuid::new_v4(),
            app_id: Uuid::new_v4(),
            name: "exact".to_string(),
            kind: EvaluatorKind::ExactMatch,
            settings: json!({}),
        }
    }

    fn broken_regex_config() -> EvaluatorConfig {
        EvaluatorConfig {
            id: Uuid::new_v4(),
            app_id: Uuid::new_v4(),
            name: "broken".to_string(),
            kind: EvaluatorKind::Regex,
            settings: json!({"regex_pattern": "(unclosed"}),
        }
    }

    fn row(country: &str, capital: &str) -> TestsetRow {
        TestsetRow {
            inputs: HashMap::from([("country".to_string(), country.to_string())]),
            correct_answer: Some(HashMap::from([(
                "correct_answer".to_string(),
                capital.to_string(),
            )])),
        }
    }

    async fn runner_with_store() -> (ScenarioRunner, Arc<InMemoryStore>, Evaluation) {
        let store = Arc::new(InMemoryStore::new());
        let evaluation = Evaluation::new(Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), vec![]);
        store.create_evaluation(evaluation.clone()).await.unwrap();
        let runner = ScenarioRunner::new(Arc::new(EvaluatorRegistry::default()), store.clone());
        (runner, store, evaluation)
    }

    #[tokio::test]
    async fn test_scenario_records_all_evaluator_results() {
        let (runner, store, evaluation) = runner_with_store().await;
        let configs = vec![exact_match_config(), broken_regex_config()];
        let limits = CallLimits::new(&RateLimitConfig::default());
        let invoker = MockVariant {
            output: Some("Paris".to_string()),
        };

        let written = runner
            .run_scenario(&evaluation, 0, &row("France", "Paris"), &configs, &invoker, &limits)
            .await
            .unwrap();
        assert!(written);

        let scenarios = store.list_scenarios(evaluation.id).await.unwrap();
        assert_eq!(scenarios.len(), 1);
        let scenario = &scenarios[0];
        assert_eq!(scenario.output.as_deref(), Some("Paris"));
        assert_eq!(scenario.results.len(), 2);
        // Exact match passes even though the regex evaluator errored
        assert_eq!(scenario.results[0].result, EvalResult::bool(true));
        assert!(scenario.results[1].result.is_error());
        assert_eq!(scenario.cost, Some(0.001));
    }

    #[tokio::test]
    async fn test_variant_failure_fills_every_slot_with_errors() {
        let (runner, store, evaluation) = runner_with_store().await;
        let configs = vec![exact_match_config(), exact_match_config()];
        let limits = CallLimits::new(&RateLimitConfig::default());
        let invoker = MockVariant { output: None };

        let written = runner
            .run_scenario(&evaluation, 1, &row("France", "Paris"), &configs, &invoker, &limits)
            .await
            .unwrap();
        assert!(written);

        let scenarios = store.list_scenarios(evaluation.id).await.unwrap();
        assert_eq!(scenarios.len(), 1);
        let scenario = &scenarios[0];
        assert!(scenario.output.is_none());
        assert_eq!(scenario.results.len(), 2);
        assert!(scenario.results.iter().all(|r| r.result.is_error()));
    }

    #[tokio::test]
    async fn test_rerun_overwrites_instead_of_duplicating() {
        let (runner, store, evaluation) = runner_with_store().await;
        let configs = vec![exact_match_config()];
        let limits = CallLimits::new(&RateLimitConfig::default());

        let wrong = MockVariant {
            output: Some("Lyon".to_string()),
        };
        runner
            .run_scenario(&evaluation, 0, &row("France", "Paris"), &configs, &wrong, &limits)
            .await
            .unwrap();

        let right = MockVariant {
            output: Some("Paris".to_string()),
        };
        runner
            .run_scenario(&evaluation, 0, &row("France", "Paris"), &configs, &right, &limits)
            .await
            .unwrap();

        let scenarios = store.list_scenarios(evaluation.id).await.unwrap();
        assert_eq!(scenarios.len(), 1);
        assert_eq!(scenarios[0].results[0].result, EvalResult::bool(true));
    }

    #[tokio::test]
    async fn test_write_to_deleted_evaluation_is_dropped() {
        let (runner, store, evaluation) = runner_with_store().await;
        store.delete_evaluation(evaluation.id).await.unwrap();

        let limits = CallLimits::new(&RateLimitConfig::default());
        let invoker = MockVariant {
            output: Some("Paris".to_string()),
        };
        let written = runner
            .run_scenario(
                &evaluation,
                0,
                &row("France", "Paris"),
                &[exact_match_config()],
                &invoker,
                &limits,
            )
            .await
            .unwrap();

        assert!(!written);
        assert!(store.list_scenarios(evaluation.id).await.unwrap().is_empty());
    }

    #[test]
    fn test_format_inputs_sorted_by_name() {
        let row = TestsetRow {
            inputs: HashMap::from([
                ("b".to_string(), "2".to_string()),
                ("a".to_string(), "1".to_string()),
            ]),
            correct_answer: None,
        };
        let inputs = format_inputs(&row);
        assert_eq!(inputs[0].name, "a");
        assert_eq!(inputs[1].name, "b");
    }
}
