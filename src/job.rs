use crate::aggregation::aggregate_results;
use crate::error::EvalError;
use crate::models::{
    ErrorDetail, EvaluationId, EvaluationStatus, EvaluatorConfig, RateLimitConfig,
};
use crate::registry::EvaluatorRegistry;
use crate::scenario::{CallLimits, ScenarioRunner};
use crate::store::EvaluationStore;
use crate::variant::VariantResolver;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Descriptor handed to the Task Dispatcher for one enqueued evaluation
#[derive(Debug, Clone)]
pub struct JobRequest {
    pub evaluation_id: EvaluationId,
    pub rate_limit: RateLimitConfig,
}

/// Runs one evaluation end to end: claim, scenario fan-out, aggregation,
/// terminal transition. Owned by the dispatcher's workers.
pub struct JobRunner {
    store: Arc<dyn EvaluationStore>,
    registry: Arc<EvaluatorRegistry>,
    resolver: Arc<dyn VariantResolver>,
}

impl JobRunner {
    pub fn new(
        store: Arc<dyn EvaluationStore>,
        registry: Arc<EvaluatorRegistry>,
        resolver: Arc<dyn VariantResolver>,
    ) -> Self {
        Self {
            store,
            registry,
            resolver,
        }
    }

    /// Atomically claim the job. False means another worker got there
    /// first, the job is already terminal, or the record is gone; the
    /// caller skips in every one of those cases.
    pub async fn claim(&self, id: EvaluationId) -> Result<bool, EvalError> {
        self.store
            .transition_status(id, EvaluationStatus::Pending, EvaluationStatus::Running)
            .await
    }

    /// Record a job-level fault. Best effort: a record deleted in the
    /// meantime stays deleted.
    pub async fn record_failure(&self, id: EvaluationId, error: &EvalError) {
        let detail = ErrorDetail::new(error.to_string());
        match self.store.fail_evaluation(id, detail).await {
            Ok(true) => warn!(evaluation_id = %id, "evaluation failed: {error}"),
            Ok(false) => debug!(evaluation_id = %id, "failure not recorded, record gone or terminal"),
            Err(e) => warn!(evaluation_id = %id, "could not record failure: {e}"),
        }
    }

    /// Run an already-claimed evaluation. Scenario work is idempotent, so
    /// the dispatcher may safely re-invoke this after a retriable error.
    pub async fn run_claimed(&self, request: &JobRequest) -> Result<(), EvalError> {
        let id = request.evaluation_id;

        let Some(evaluation) = self.store.get_evaluation(id).await? else {
            // Deleted between claim and setup; nothing to resurrect
            debug!(evaluation_id = %id, "evaluation vanished after claim");
            return Ok(());
        };

        // Snapshot the testset; concurrent edits cannot reach this run
        let Some(testset) = self.store.get_testset(evaluation.testset_id).await? else {
            let fault = EvalError::not_found("testset", evaluation.testset_id);
            self.record_failure(id, &fault).await;
            return Ok(());
        };

        let mut configs: Vec<EvaluatorConfig> =
            Vec::with_capacity(evaluation.evaluator_config_ids.len());
        for config_id in &evaluation.evaluator_config_ids {
            match self.store.get_evaluator_config(*config_id).await? {
                Some(config) => configs.push(config),
                None => {
                    let fault = EvalError::not_found("evaluator config", config_id);
                    self.record_failure(id, &fault).await;
                    return Ok(());
                }
            }
        }

        let invoker = match self
            .resolver
            .resolve(evaluation.app_id, evaluation.variant_id)
            .await
        {
            Ok(invoker) => invoker,
            Err(e) => {
                let fault = EvalError::Dispatch(format!(
                    "variant {} unreachable: {e:#}",
                    evaluation.variant_id
                ));
                self.record_failure(id, &fault).await;
                return Ok(());
            }
        };

        info!(
            evaluation_id = %id,
            rows = testset.rows.len(),
            evaluators = configs.len(),
            "evaluation running"
        );

        let runner = Arc::new(ScenarioRunner::new(self.registry.clone(), self.store.clone()));
        let limits = Arc::new(CallLimits::new(&request.rate_limit));
        let configs = Arc::new(configs);
        let evaluation = Arc::new(evaluation);
        let pool = Arc::new(Semaphore::new(request.rate_limit.max_parallel_scenarios.max(1)));

        let mut join_set = JoinSet::new();
        for (row_index, row) in testset.rows.iter().cloned().enumerate() {
            let permit = pool
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| EvalError::Dispatch(format!("scenario pool closed: {e}")))?;
            let runner = runner.clone();
            let store = self.store.clone();
            let evaluation = evaluation.clone();
            let configs = configs.clone();
            let invoker = invoker.clone();
            let limits = limits.clone();
            join_set.spawn(async move {
                let _permit = permit;
                // A delete observed here stops the row before any variant
                // or evaluator call is made
                if store.get_evaluation(evaluation.id).await?.is_none() {
                    return Ok(false);
                }
                runner
                    .run_scenario(&evaluation, row_index, &row, &configs, invoker.as_ref(), &limits)
                    .await
            });
        }

        let mut cancelled = false;
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(Ok(true)) => {}
                Ok(Ok(false)) => cancelled = true,
                Ok(Err(e)) => return Err(e),
                Err(e) => return Err(EvalError::Dispatch(format!("scenario task failed: {e}"))),
            }
        }

        if cancelled {
            debug!(evaluation_id = %id, "evaluation deleted mid-run, dropping remaining work");
            return Ok(());
        }

        let scenarios = self.store.list_scenarios(id).await?;
        let aggregates = aggregate_results(&evaluation.evaluator_config_ids, &scenarios);
        if self.store.complete_evaluation(id, aggregates).await? {
            info!(evaluation_id = %id, scenarios = scenarios.len(), "evaluation completed");
        } else {
            debug!(evaluation_id = %id, "completion skipped, record gone or not running");
        }
        Ok(())
    }
}
