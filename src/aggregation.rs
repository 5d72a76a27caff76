use crate::models::{AggregatedResult, EvalResult, EvaluationScenario, EvaluatorConfigId};

/// Fold all scenarios of an evaluation into one [`AggregatedResult`] per
/// evaluator config: mean over numeric results, pass rate over boolean
/// results, success and error tallies. Error results are excluded from the
/// numeric fields but counted.
///
/// Pure and idempotent; safe to re-run for audit.
pub fn aggregate_results(
    config_ids: &[EvaluatorConfigId],
    scenarios: &[EvaluationScenario],
) -> Vec<AggregatedResult> {
    config_ids
        .iter()
        .map(|&config_id| aggregate_for_config(config_id, scenarios))
        .collect()
}

fn aggregate_for_config(
    config_id: EvaluatorConfigId,
    scenarios: &[EvaluationScenario],
) -> AggregatedResult {
    let mut numeric_scores = Vec::new();
    let mut bool_passes = 0usize;
    let mut bool_total = 0usize;
    let mut success_count = 0usize;
    let mut error_count = 0usize;

    let results = scenarios.iter().flat_map(|scenario| {
        scenario
            .results
            .iter()
            .filter(|r| r.evaluator_config_id == config_id)
    });

    for scenario_result in results {
        match &scenario_result.result {
            EvalResult::Number { value } => {
                numeric_scores.push(*value);
                success_count += 1;
            }
            EvalResult::Bool { value } => {
                bool_total += 1;
                bool_passes += usize::from(*value);
                success_count += 1;
            }
            EvalResult::String { .. } => success_count += 1,
            EvalResult::Error { .. } => error_count += 1,
        }
    }

    AggregatedResult {
        evaluator_config_id: config_id,
        mean_score: mean(&numeric_scores),
        pass_rate: (bool_total > 0).then(|| bool_passes as f64 / bool_total as f64),
        success_count,
        error_count,
    }
}

fn mean(scores: &[f64]) -> Option<f64> {
    if scores.is_empty() {
        return None;
    }
    Some(scores.iter().sum::<f64>() / scores.len() as f64)
}
