use crate::dispatcher::TaskDispatcher;
use crate::error::EvalError;
use crate::job::JobRequest;
use crate::models::{
    AggregatedResult, AppId, ComparisonEntry, ComparisonRow, Evaluation, EvaluationId,
    EvaluationScenario, EvaluationStatus, EvaluatorConfigId, RateLimitConfig, TestsetId,
    VariantId,
};
use crate::store::EvaluationStore;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use tracing::info;

/// The caller on whose behalf an operation runs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Principal {
    pub user_id: String,
}

impl Principal {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Read,
    Write,
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Read => "read",
            Self::Write => "write",
        })
    }
}

/// Access-control gate consulted before every entry point. The core does
/// not implement policy; the web layer supplies it.
#[async_trait]
pub trait AccessControl: Send + Sync {
    async fn can(&self, principal: &Principal, app_id: AppId, action: Action) -> bool;
}

/// Gate that admits everything; for the CLI and tests
pub struct AllowAll;

#[async_trait]
impl AccessControl for AllowAll {
    async fn can(&self, _principal: &Principal, _app_id: AppId, _action: Action) -> bool {
        true
    }
}

/// Parameters of one submission; fans out to one evaluation per variant
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub app_id: AppId,
    pub variant_ids: Vec<VariantId>,
    pub testset_id: TestsetId,
    pub evaluator_config_ids: Vec<EvaluatorConfigId>,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

/// Aggregates of one evaluation; empty until the job completes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultsResponse {
    pub evaluation_id: EvaluationId,
    pub results: Vec<AggregatedResult>,
}

/// Facade over the orchestration core: the operations an HTTP router maps
/// to `POST /evaluation`, `GET .../status`, `GET .../results`,
/// `GET .../evaluation_scenarios`, `GET /evaluation/comparison` and
/// `DELETE /evaluation`.
pub struct EvaluationService {
    store: Arc<dyn EvaluationStore>,
    dispatcher: TaskDispatcher,
    gate: Arc<dyn AccessControl>,
}

impl EvaluationService {
    pub fn new(
        store: Arc<dyn EvaluationStore>,
        dispatcher: TaskDispatcher,
        gate: Arc<dyn AccessControl>,
    ) -> Self {
        Self {
            store,
            dispatcher,
            gate,
        }
    }

    /// Close the dispatcher queue and drain in-flight jobs
    pub async fn shutdown(self) {
        self.dispatcher.shutdown().await;
    }

    async fn authorize(
        &self,
        principal: &Principal,
        app_id: AppId,
        action: Action,
    ) -> Result<(), EvalError> {
        if self.gate.can(principal, app_id, action).await {
            Ok(())
        } else {
            Err(EvalError::PermissionDenied {
                action: action.to_string(),
                app_id,
            })
        }
    }

    async fn fetch(&self, id: EvaluationId) -> Result<Evaluation, EvalError> {
        self.store
            .get_evaluation(id)
            .await?
            .ok_or_else(|| EvalError::not_found("evaluation", id))
    }

    /// Create one pending evaluation per variant and enqueue them all.
    /// Returns immediately; the records advance in the background.
    pub async fn submit(
        &self,
        principal: &Principal,
        request: SubmitRequest,
    ) -> Result<Vec<Evaluation>, EvalError> {
        self.authorize(principal, request.app_id, Action::Write)
            .await?;

        if request.variant_ids.is_empty() {
            return Err(EvalError::Validation(
                "at least one variant id is required".to_string(),
            ));
        }

        let testset = self
            .store
            .get_testset(request.testset_id)
            .await?
            .ok_or_else(|| EvalError::not_found("testset", request.testset_id))?;
        if testset.app_id != request.app_id {
            return Err(EvalError::Validation(format!(
                "testset {} does not belong to app {}",
                testset.id, request.app_id
            )));
        }
        validate_columns(&testset.rows.iter().collect::<Vec<_>>())?;

        for config_id in &request.evaluator_config_ids {
            if self.store.get_evaluator_config(*config_id).await?.is_none() {
                return Err(EvalError::not_found("evaluator config", config_id));
            }
        }

        let mut evaluations = Vec::with_capacity(request.variant_ids.len());
        for variant_id in &request.variant_ids {
            let evaluation = Evaluation::new(
                request.app_id,
                *variant_id,
                request.testset_id,
                request.evaluator_config_ids.clone(),
            );
            self.store.create_evaluation(evaluation.clone()).await?;

            if let Err(e) = self
                .dispatcher
                .enqueue(JobRequest {
                    evaluation_id: evaluation.id,
                    rate_limit: request.rate_limit.clone(),
                })
                .await
            {
                // The record exists but will never run; say so on it
                let detail = crate::models::ErrorDetail::new(e.to_string());
                let _ = self.store.fail_evaluation(evaluation.id, detail).await;
                return Err(e);
            }
            evaluations.push(evaluation);
        }

        info!(
            app_id = %request.app_id,
            count = evaluations.len(),
            "evaluations submitted"
        );
        Ok(evaluations)
    }

    /// Non-blocking read of the current state
    pub async fn status(
        &self,
        principal: &Principal,
        id: EvaluationId,
    ) -> Result<EvaluationStatus, EvalError> {
        let evaluation = self.fetch(id).await?;
        self.authorize(principal, evaluation.app_id, Action::Read)
            .await?;
        Ok(evaluation.status)
    }

    /// Fetch one evaluation record
    pub async fn get(
        &self,
        principal: &Principal,
        id: EvaluationId,
    ) -> Result<Evaluation, EvalError> {
        let evaluation = self.fetch(id).await?;
        self.authorize(principal, evaluation.app_id, Action::Read)
            .await?;
        Ok(evaluation)
    }

    /// All evaluations of one app, oldest first
    pub async fn list(
        &self,
        principal: &Principal,
        app_id: AppId,
    ) -> Result<Vec<Evaluation>, EvalError> {
        self.authorize(principal, app_id, Action::Read).await?;
        self.store.list_evaluations(app_id).await
    }

    /// Aggregated results. Empty until the job completes; never an error
    /// for a job in a non-terminal state.
    pub async fn results(
        &self,
        principal: &Principal,
        id: EvaluationId,
    ) -> Result<ResultsResponse, EvalError> {
        let evaluation = self.fetch(id).await?;
        self.authorize(principal, evaluation.app_id, Action::Read)
            .await?;
        Ok(ResultsResponse {
            evaluation_id: id,
            results: evaluation.aggregated_results,
        })
    }

    /// Scenarios recorded so far, ordered by row index
    pub async fn scenarios(
        &self,
        principal: &Principal,
        id: EvaluationId,
    ) -> Result<Vec<EvaluationScenario>, EvalError> {
        let evaluation = self.fetch(id).await?;
        self.authorize(principal, evaluation.app_id, Action::Read)
            .await?;
        self.store.list_scenarios(id).await
    }

    /// Scenario-aligned comparison across evaluations of one testset
    pub async fn compare(
        &self,
        principal: &Principal,
        ids: &[EvaluationId],
    ) -> Result<Vec<ComparisonRow>, EvalError> {
        if ids.is_empty() {
            return Err(EvalError::Validation(
                "at least one evaluation id is required".to_string(),
            ));
        }

        let mut evaluations = Vec::with_capacity(ids.len());
        for &id in ids {
            evaluations.push(self.fetch(id).await?);
        }

        let testset_ids: HashSet<TestsetId> =
            evaluations.iter().map(|e| e.testset_id).collect();
        if testset_ids.len() > 1 {
            return Err(EvalError::Validation(
                "evaluations under comparison must share a testset".to_string(),
            ));
        }
        for app_id in evaluations.iter().map(|e| e.app_id).collect::<HashSet<_>>() {
            self.authorize(principal, app_id, Action::Read).await?;
        }

        let mut by_evaluation: Vec<(EvaluationId, VariantId, BTreeMap<usize, EvaluationScenario>)> =
            Vec::with_capacity(evaluations.len());
        let mut row_indices = BTreeSet::new();
        for evaluation in &evaluations {
            let scenarios = self.store.list_scenarios(evaluation.id).await?;
            let rows: BTreeMap<usize, EvaluationScenario> = scenarios
                .into_iter()
                .map(|scenario| (scenario.row_index, scenario))
                .collect();
            row_indices.extend(rows.keys().copied());
            by_evaluation.push((evaluation.id, evaluation.variant_id, rows));
        }

        let comparison = row_indices
            .into_iter()
            .map(|row_index| {
                let inputs = by_evaluation
                    .iter()
                    .find_map(|(_, _, rows)| rows.get(&row_index))
                    .map(|scenario| scenario.inputs.clone())
                    .unwrap_or_default();
                let entries = by_evaluation
                    .iter()
                    .filter_map(|(evaluation_id, variant_id, rows)| {
                        rows.get(&row_index).map(|scenario| ComparisonEntry {
                            evaluation_id: *evaluation_id,
                            variant_id: *variant_id,
                            output: scenario.output.clone(),
                            results: scenario.results.clone(),
                        })
                    })
                    .collect();
                ComparisonRow {
                    row_index,
                    inputs,
                    entries,
                }
            })
            .collect();
        Ok(comparison)
    }

    /// Delete evaluations and cascade to their scenarios. Every id is
    /// validated before anything is removed, so a single unknown id fails
    /// the whole call and nothing is half-deleted.
    pub async fn delete(
        &self,
        principal: &Principal,
        ids: &[EvaluationId],
    ) -> Result<Vec<EvaluationId>, EvalError> {
        let mut evaluations = Vec::with_capacity(ids.len());
        for &id in ids {
            evaluations.push(self.fetch(id).await?);
        }
        for app_id in evaluations.iter().map(|e| e.app_id).collect::<HashSet<_>>() {
            self.authorize(principal, app_id, Action::Write).await?;
        }

        let mut deleted = Vec::with_capacity(ids.len());
        for evaluation in &evaluations {
            if self.store.delete_evaluation(evaluation.id).await? {
                deleted.push(evaluation.id);
            }
        }
        info!(count = deleted.len(), "evaluations deleted");
        Ok(deleted)
    }
}

/// Every row of a testset must expose the same input columns; a ragged
/// testset would feed some scenarios inputs the variant never declared
fn validate_columns(rows: &[&crate::models::TestsetRow]) -> Result<(), EvalError> {
    let Some(first) = rows.first() else {
        return Ok(());
    };
    let reference: BTreeSet<&String> = first.inputs.keys().collect();
    for (row_index, row) in rows.iter().enumerate().skip(1) {
        let columns: BTreeSet<&String> = row.inputs.keys().collect();
        if columns != reference {
            return Err(EvalError::Validation(format!(
                "columns in the testset should match the names of the inputs in the variant (row {row_index} differs)"
            )));
        }
    }
    Ok(())
}
