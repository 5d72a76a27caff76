use crate::models::{EvalResult, Evaluation, EvaluationScenario, EvaluatorConfig};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

/// Output format options
#[derive(Debug, Clone, ValueEnum, Serialize, Deserialize)]
pub enum OutputFormat {
    Plain,
    Json,
}

/// Everything the CLI prints about one finished evaluation
#[derive(Debug, Serialize)]
pub struct EvaluationReport {
    pub evaluation: Evaluation,
    pub evaluators: Vec<EvaluatorConfig>,
    pub scenarios: Vec<EvaluationScenario>,
}

/// Print an evaluation report in the specified format
pub fn print_report(report: &EvaluationReport, format: OutputFormat) {
    match format {
        OutputFormat::Plain => print_plain(report),
        OutputFormat::Json => print_json(report),
    }
}

fn print_plain(report: &EvaluationReport) {
    println!(
        "=== Evaluation {} ({}) ===",
        report.evaluation.id, report.evaluation.status
    );
    if let Some(error) = &report.evaluation.error {
        println!("Error: {}", error.message);
    }
    println!();

    println!("AGGREGATES");
    println!(
        "{:<20} {:<10} {:<10} {:<10} {:<8}",
        "Evaluator", "Mean", "Pass rate", "Successes", "Errors"
    );
    println!("{}", "-".repeat(62));
    for aggregate in &report.evaluation.aggregated_results {
        let name = evaluator_name(report, aggregate.evaluator_config_id);
        println!(
            "{:<20} {:<10} {:<10} {:<10} {:<8}",
            name,
            format_optional(aggregate.mean_score),
            format_optional(aggregate.pass_rate),
            aggregate.success_count,
            aggregate.error_count
        );
    }
    println!();

    println!("SCENARIOS");
    println!("{}", "-".repeat(62));
    for scenario in &report.scenarios {
        println!("Row #{}", scenario.row_index + 1);
        for input in &scenario.inputs {
            println!("  {} = {}", input.name, input.value);
        }
        match &scenario.output {
            Some(output) => println!("  Output: {}", output),
            None => println!("  Output: (variant invocation failed)"),
        }
        for result in &scenario.results {
            let name = evaluator_name(report, result.evaluator_config_id);
            println!("  {}: {}", name, describe_result(&result.result));
        }
        println!();
    }
}

fn evaluator_name(report: &EvaluationReport, id: uuid::Uuid) -> String {
    report
        .evaluators
        .iter()
        .find(|config| config.id == id)
        .map(|config| config.name.clone())
        .unwrap_or_else(|| id.to_string())
}

fn format_optional(value: Option<f64>) -> String {
    match value {
        Some(value) => format!("{value:.3}"),
        None => "-".to_string(),
    }
}

fn describe_result(result: &EvalResult) -> String {
    match result {
        EvalResult::Number { value } => format!("{value:.3}"),
        EvalResult::String { value } => value.clone(),
        EvalResult::Bool { value } => {
            if *value {
                "pass".to_string()
            } else {
                "fail".to_string()
            }
        }
        EvalResult::Error { error } => format!("error: {}", error.message),
    }
}

fn print_json(report: &EvaluationReport) {
    match serde_json::to_string_pretty(report) {
        Ok(json) => println!("{}", json),
        Err(e) => eprintln!("Error serializing report to JSON: {}", e),
    }
}
