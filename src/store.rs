use crate::error::EvalError;
use crate::models::{
    AggregatedResult, AppId, ErrorDetail, Evaluation, EvaluationId, EvaluationScenario,
    EvaluationStatus, EvaluatorConfig, EvaluatorConfigId, Testset, TestsetId,
};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

/// Persistence contract consumed by the orchestration core.
///
/// The handle is passed explicitly into every component that needs it; the
/// core never reaches for a global connection. A document-store-backed
/// implementation is the web layer's concern; [`InMemoryStore`] ships for
/// the CLI and tests.
#[async_trait]
pub trait EvaluationStore: Send + Sync {
    async fn create_evaluation(&self, evaluation: Evaluation) -> Result<(), EvalError>;

    async fn get_evaluation(&self, id: EvaluationId) -> Result<Option<Evaluation>, EvalError>;

    async fn list_evaluations(&self, app_id: AppId) -> Result<Vec<Evaluation>, EvalError>;

    /// Atomic compare-and-set on status. Returns false when the record is
    /// missing, already terminal, or not currently in `from`. This is the
    /// claim primitive that keeps two workers off the same job.
    async fn transition_status(
        &self,
        id: EvaluationId,
        from: EvaluationStatus,
        to: EvaluationStatus,
    ) -> Result<bool, EvalError>;

    /// Transition `running -> completed` and attach aggregates in one
    /// commit. Returns false when the record is missing or not running.
    async fn complete_evaluation(
        &self,
        id: EvaluationId,
        aggregates: Vec<AggregatedResult>,
    ) -> Result<bool, EvalError>;

    /// Transition any non-terminal state to `failed`, recording the fault.
    /// Returns false when the record is missing or already terminal.
    async fn fail_evaluation(&self, id: EvaluationId, error: ErrorDetail)
        -> Result<bool, EvalError>;

    /// Write one scenario keyed by (evaluation id, row index), overwriting
    /// any previous record for that pair. Returns false when the owning
    /// evaluation no longer exists: writes to a deleted evaluation are
    /// dropped, never resurrected.
    async fn upsert_scenario(&self, scenario: EvaluationScenario) -> Result<bool, EvalError>;

    /// Scenarios of one evaluation, ordered by row index
    async fn list_scenarios(
        &self,
        evaluation_id: EvaluationId,
    ) -> Result<Vec<EvaluationScenario>, EvalError>;

    /// Remove the evaluation and cascade to its scenarios.
    /// Returns false for an unknown id.
    async fn delete_evaluation(&self, id: EvaluationId) -> Result<bool, EvalError>;

    async fn get_testset(&self, id: TestsetId) -> Result<Option<Testset>, EvalError>;

    async fn get_evaluator_config(
        &self,
        id: EvaluatorConfigId,
    ) -> Result<Option<EvaluatorConfig>, EvalError>;
}

#[derive(Default)]
struct Inner {
    evaluations: HashMap<EvaluationId, Evaluation>,
    scenarios: HashMap<EvaluationId, BTreeMap<usize, EvaluationScenario>>,
    testsets: HashMap<TestsetId, Testset>,
    configs: HashMap<EvaluatorConfigId, EvaluatorConfig>,
}

/// Lock-guarded in-memory store
#[derive(Default)]
pub struct InMemoryStore {
    inner: RwLock<Inner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_testset(&self, testset: Testset) {
        self.inner.write().await.testsets.insert(testset.id, testset);
    }

    pub async fn insert_evaluator_config(&self, config: EvaluatorConfig) {
        self.inner.write().await.configs.insert(config.id, config);
    }
}

#[async_trait]
impl EvaluationStore for InMemoryStore {
    async fn create_evaluation(&self, evaluation: Evaluation) -> Result<(), EvalError> {
        self.inner
            .write()
            .await
            .evaluations
            .insert(evaluation.id, evaluation);
        Ok(())
    }

    async fn get_evaluation(&self, id: EvaluationId) -> Result<Option<Evaluation>, EvalError> {
        Ok(self.inner.read().await.evaluations.get(&id).cloned())
    }

    async fn list_evaluations(&self, app_id: AppId) -> Result<Vec<Evaluation>, EvalError> {
        let inner = self.inner.read().await;
        let mut evaluations: Vec<Evaluation> = inner
            .evaluations
            .values()
            .filter(|evaluation| evaluation.app_id == app_id)
            .cloned()
            .collect();
        evaluations.sort_by_key(|evaluation| evaluation.created_at);
        Ok(evaluations)
    }

    async fn transition_status(
        &self,
        id: EvaluationId,
        from: EvaluationStatus,
        to: EvaluationStatus,
    ) -> Result<bool, EvalError> {
        let mut inner = self.inner.write().await;
        let Some(evaluation) = inner.evaluations.get_mut(&id) else {
            return Ok(false);
        };
        if evaluation.status.is_terminal() || evaluation.status != from {
            return Ok(false);
        }
        evaluation.status = to;
        evaluation.updated_at = Utc::now();
        Ok(true)
    }

    async fn complete_evaluation(
        &self,
        id: EvaluationId,
        aggregates: Vec<AggregatedResult>,
    ) -> Result<bool, EvalError> {
        let mut inner = self.inner.write().await;
        let Some(evaluation) = inner.evaluations.get_mut(&id) else {
            return Ok(false);
        };
        if evaluation.status != EvaluationStatus::Running {
            return Ok(false);
        }
        evaluation.status = EvaluationStatus::Completed;
        evaluation.aggregated_results = aggregates;
        evaluation.updated_at = Utc::now();
        Ok(true)
    }

    async fn fail_evaluation(
        &self,
        id: EvaluationId,
        error: ErrorDetail,
    ) -> Result<bool, EvalError> {
        let mut inner = self.inner.write().await;
        let Some(evaluation) = inner.evaluations.get_mut(&id) else {
            return Ok(false);
        };
        if evaluation.status.is_terminal() {
            return Ok(false);
        }
        evaluation.status = EvaluationStatus::Failed;
        evaluation.error = Some(error);
        evaluation.updated_at = Utc::now();
        Ok(true)
    }

    async fn upsert_scenario(&self, mut scenario: EvaluationScenario) -> Result<bool, EvalError> {
        let mut inner = self.inner.write().await;
        if !inner.evaluations.contains_key(&scenario.evaluation_id) {
            return Ok(false);
        }
        let rows = inner.scenarios.entry(scenario.evaluation_id).or_default();
        if let Some(existing) = rows.get(&scenario.row_index) {
            scenario.id = existing.id;
        }
        rows.insert(scenario.row_index, scenario);
        Ok(true)
    }

    async fn list_scenarios(
        &self,
        evaluation_id: EvaluationId,
    ) -> Result<Vec<EvaluationScenario>, EvalError> {
        let inner = self.inner.read().await;
        Ok(inner
            .scenarios
            .get(&evaluation_id)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn delete_evaluation(&self, id: EvaluationId) -> Result<bool, EvalError> {
        let mut inner = self.inner.write().await;
        let removed = inner.evaluations.remove(&id).is_some();
        inner.scenarios.remove(&id);
        Ok(removed)
    }

    async fn get_testset(&self, id: TestsetId) -> Result<Option<Testset>, EvalError> {
        Ok(self.inner.read().await.testsets.get(&id).cloned())
    }

    async fn get_evaluator_config(
        &self,
        id: EvaluatorConfigId,
    ) -> Result<Option<EvaluatorConfig>, EvalError> {
        Ok(self.inner.read().await.configs.get(&id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn evaluation() -> Evaluation {
        Evaluation::new(Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), vec![])
    }

    fn scenario(evaluation_id: EvaluationId, row_index: usize) -> EvaluationScenario {
        EvaluationScenario {
            id: Uuid::new_v4(),
            evaluation_id,
            row_index,
            inputs: vec![],
            output: Some("out".to_string()),
            correct_answer: None,
            results: vec![],
            cost: None,
            latency: None,
        }
    }

    #[tokio::test]
    async fn test_transition_claims_exactly_once() {
        let store = InMemoryStore::new();
        let record = evaluation();
        let id = record.id;
        store.create_evaluation(record).await.unwrap();

        let first = store
            .transition_status(id, EvaluationStatus::Pending, EvaluationStatus::Running)
            .await
            .unwrap();
        let second = store
            .transition_status(id, EvaluationStatus::Pending, EvaluationStatus::Running)
            .await
            .unwrap();

        assert!(first);
        assert!(!second);
    }

    #[tokio::test]
    async fn test_terminal_state_never_transitions() {
        let store = InMemoryStore::new();
        let record = evaluation();
        let id = record.id;
        store.create_evaluation(record).await.unwrap();

        store
            .transition_status(id, EvaluationStatus::Pending, EvaluationStatus::Running)
            .await
            .unwrap();
        assert!(store.complete_evaluation(id, vec![]).await.unwrap());

        assert!(
            !store
                .transition_status(id, EvaluationStatus::Completed, EvaluationStatus::Running)
                .await
                .unwrap()
        );
        assert!(
            !store
                .fail_evaluation(id, ErrorDetail::new("late fault"))
                .await
                .unwrap()
        );
        let fetched = store.get_evaluation(id).await.unwrap().unwrap();
        assert_eq!(fetched.status, EvaluationStatus::Completed);
    }

    #[tokio::test]
    async fn test_fail_records_fault() {
        let store = InMemoryStore::new();
        let record = evaluation();
        let id = record.id;
        store.create_evaluation(record).await.unwrap();

        assert!(
            store
                .fail_evaluation(id, ErrorDetail::new("testset gone"))
                .await
                .unwrap()
        );
        let fetched = store.get_evaluation(id).await.unwrap().unwrap();
        assert_eq!(fetched.status, EvaluationStatus::Failed);
        assert_eq!(fetched.error.unwrap().message, "testset gone");
    }

    #[tokio::test]
    async fn test_upsert_overwrites_and_keeps_identity() {
        let store = InMemoryStore::new();
        let record = evaluation();
        let id = record.id;
        store.create_evaluation(record).await.unwrap();

        assert!(store.upsert_scenario(scenario(id, 0)).await.unwrap());
        let first_id = store.list_scenarios(id).await.unwrap()[0].id;

        let mut replacement = scenario(id, 0);
        replacement.output = Some("new out".to_string());
        assert!(store.upsert_scenario(replacement).await.unwrap());

        let scenarios = store.list_scenarios(id).await.unwrap();
        assert_eq!(scenarios.len(), 1);
        assert_eq!(scenarios[0].id, first_id);
        assert_eq!(scenarios[0].output.as_deref(), Some("new out"));
    }

    #[tokio::test]
    async fn test_scenarios_ordered_by_row_index() {
        let store = InMemoryStore::new();
        let record = evaluation();
        let id = record.id;
        store.create_evaluation(record).await.unwrap();

        for row_index in [2, 0, 1] {
            store.upsert_scenario(scenario(id, row_index)).await.unwrap();
        }
        let rows: Vec<usize> = store
            .list_scenarios(id)
            .await
            .unwrap()
            .iter()
            .map(|s| s.row_index)
            .collect();
        assert_eq!(rows, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_delete_cascades_and_drops_late_writes() {
        let store = InMemoryStore::new();
        let record = evaluation();
        let id = record.id;
        store.create_evaluation(record).await.unwrap();
        store.upsert_scenario(scenario(id, 0)).await.unwrap();

        assert!(store.delete_evaluation(id).await.unwrap());
        assert!(store.get_evaluation(id).await.unwrap().is_none());
        assert!(store.list_scenarios(id).await.unwrap().is_empty());

        // A write that lands after the delete must be dropped
        assert!(!store.upsert_scenario(scenario(id, 1)).await.unwrap());
        assert!(store.list_scenarios(id).await.unwrap().is_empty());

        assert!(!store.delete_evaluation(id).await.unwrap());
    }

    #[tokio::test]
    async fn test_list_evaluations_filters_by_app() {
        let store = InMemoryStore::new();
        let mine = evaluation();
        let app_id = mine.app_id;
        store.create_evaluation(mine).await.unwrap();
        store.create_evaluation(evaluation()).await.unwrap();

        let listed = store.list_evaluations(app_id).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].app_id, app_id);
    }
}
