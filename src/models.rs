use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

pub type AppId = Uuid;
pub type VariantId = Uuid;
pub type TestsetId = Uuid;
pub type EvaluationId = Uuid;
pub type EvaluatorConfigId = Uuid;

/// Error payload carried inside an [`EvalResult`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDetail {
    /// Human-readable description of what went wrong
    pub message: String,
    /// Optional diagnostic trace from the failing component
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stacktrace: Option<String>,
}

impl ErrorDetail {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stacktrace: None,
        }
    }

    pub fn with_trace(message: impl Into<String>, stacktrace: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stacktrace: Some(stacktrace.into()),
        }
    }
}

/// Outcome of a single evaluator or variant call: a typed success value
/// or an error, never both
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EvalResult {
    Number { value: f64 },
    String { value: String },
    Bool { value: bool },
    Error { error: ErrorDetail },
}

impl EvalResult {
    pub fn number(value: f64) -> Self {
        Self::Number { value }
    }

    pub fn string(value: impl Into<String>) -> Self {
        Self::String {
            value: value.into(),
        }
    }

    pub fn bool(value: bool) -> Self {
        Self::Bool { value }
    }

    pub fn error(detail: ErrorDetail) -> Self {
        Self::Error { error: detail }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }

    /// Numeric payload, if this is a successful numeric result
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number { value } => Some(*value),
            _ => None,
        }
    }

    /// Boolean payload, if this is a successful boolean result
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool { value } => Some(*value),
            _ => None,
        }
    }
}

/// Lifecycle state of an [`Evaluation`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluationStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl EvaluationStatus {
    /// Terminal states admit no further transitions
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for EvaluationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// The scoring strategies an [`EvaluatorConfig`] can select
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluatorKind {
    ExactMatch,
    Similarity,
    Regex,
    Webhook,
    AiCritique,
    CustomCode,
}

impl EvaluatorKind {
    /// Kinds that perform outbound network calls and therefore count
    /// against the external-call concurrency cap
    pub fn needs_network(&self) -> bool {
        matches!(self, Self::Webhook | Self::AiCritique)
    }
}

impl std::fmt::Display for EvaluatorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::ExactMatch => "exact_match",
            Self::Similarity => "similarity",
            Self::Regex => "regex",
            Self::Webhook => "webhook",
            Self::AiCritique => "ai_critique",
            Self::CustomCode => "custom_code",
        };
        f.write_str(s)
    }
}

/// A configured scoring strategy: kind plus a settings mapping
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluatorConfig {
    pub id: EvaluatorConfigId,
    pub app_id: AppId,
    pub name: String,
    pub kind: EvaluatorKind,
    /// Kind-specific settings (threshold, pattern, webhook url, ...)
    #[serde(default)]
    pub settings: serde_json::Value,
}

/// One row of a testset: named inputs plus an optional expected answer mapping
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TestsetRow {
    pub inputs: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correct_answer: Option<HashMap<String, String>>,
}

/// The fixed collection of rows evaluations run against.
/// Jobs snapshot the testset at claim time, so a concurrent edit never
/// affects in-flight work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Testset {
    pub id: TestsetId,
    pub app_id: AppId,
    pub name: String,
    pub rows: Vec<TestsetRow>,
}

/// One formatted input handed to the variant for a scenario
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioInput {
    pub name: String,
    pub value: String,
}

/// Result of one evaluator config within a scenario
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioResult {
    pub evaluator_config_id: EvaluatorConfigId,
    pub result: EvalResult,
}

/// Per-row outcome record within one evaluation run.
/// Exactly one exists per (evaluation, row index) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationScenario {
    pub id: Uuid,
    pub evaluation_id: EvaluationId,
    pub row_index: usize,
    pub inputs: Vec<ScenarioInput>,
    /// The variant's produced output; absent when invocation failed
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correct_answer: Option<HashMap<String, String>>,
    pub results: Vec<ScenarioResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
    /// Variant invocation latency in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency: Option<f64>,
}

/// Summary statistics for one evaluator config over all scenarios of an
/// evaluation. Error results are excluded from the numeric fields and
/// reported through `error_count`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedResult {
    pub evaluator_config_id: EvaluatorConfigId,
    /// Mean over numeric results, when any were produced
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mean_score: Option<f64>,
    /// Pass rate over boolean results, when any were produced
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pass_rate: Option<f64>,
    pub success_count: usize,
    pub error_count: usize,
}

/// Top-level evaluation run record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Evaluation {
    pub id: EvaluationId,
    pub app_id: AppId,
    pub variant_id: VariantId,
    pub testset_id: TestsetId,
    pub evaluator_config_ids: Vec<EvaluatorConfigId>,
    pub status: EvaluationStatus,
    /// Populated only when the job reached `failed`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,
    /// Populated only when the job reached `completed`
    #[serde(default)]
    pub aggregated_results: Vec<AggregatedResult>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Evaluation {
    /// A fresh record in `pending`, ready to be persisted and enqueued
    pub fn new(
        app_id: AppId,
        variant_id: VariantId,
        testset_id: TestsetId,
        evaluator_config_ids: Vec<EvaluatorConfigId>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            app_id,
            variant_id,
            testset_id,
            evaluator_config_ids,
            status: EvaluationStatus::Pending,
            error: None,
            aggregated_results: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Output of one variant invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariantOutput {
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
    /// Seconds, as reported by the variant or measured by the caller
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency: Option<f64>,
}

/// Caps applied to one evaluation job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Upper bound on scenarios processed concurrently within a job
    #[serde(default = "default_parallel_scenarios")]
    pub max_parallel_scenarios: usize,
    /// Upper bound on concurrent calls to the evaluated variant
    #[serde(default = "default_variant_calls")]
    pub max_variant_calls: usize,
    /// Upper bound on concurrent webhook / AI-critique calls
    #[serde(default = "default_external_calls")]
    pub max_external_calls: usize,
    /// Dispatch-level retries before a job is marked failed
    #[serde(default = "default_dispatch_retries")]
    pub max_dispatch_retries: u32,
}

fn default_parallel_scenarios() -> usize {
    4
}

fn default_variant_calls() -> usize {
    4
}

fn default_external_calls() -> usize {
    4
}

fn default_dispatch_retries() -> u32 {
    2
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_parallel_scenarios: default_parallel_scenarios(),
            max_variant_calls: default_variant_calls(),
            max_external_calls: default_external_calls(),
            max_dispatch_retries: default_dispatch_retries(),
        }
    }
}

/// One evaluation's cell within a [`ComparisonRow`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComparisonEntry {
    pub evaluation_id: EvaluationId,
    pub variant_id: VariantId,
    pub output: Option<String>,
    pub results: Vec<ScenarioResult>,
}

/// Scenario-aligned comparison of several evaluations over one testset row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComparisonRow {
    pub row_index: usize,
    pub inputs: Vec<ScenarioInput>,
    pub entries: Vec<ComparisonEntry>,
}
