use crate::models::{
    AppId, EvaluatorConfig, EvaluatorKind, RateLimitConfig, Testset, TestsetRow,
};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use uuid::Uuid;

/// Dispatcher sizing for a local run
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServiceSettings {
    /// Number of background workers pulling jobs
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Bound on the job queue
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
}

fn default_workers() -> usize {
    2
}

fn default_queue_depth() -> usize {
    32
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_depth: default_queue_depth(),
        }
    }
}

/// Where the evaluated variant is deployed
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct VariantSettings {
    /// Base URL of the variant; `/generate` is appended
    pub base_url: String,
    /// Per-call timeout for variant invocations
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    30
}

/// One testset row in the run file
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RowSpec {
    pub inputs: HashMap<String, String>,
    #[serde(default)]
    pub correct_answer: Option<HashMap<String, String>>,
}

/// The testset in the run file
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TestsetSpec {
    #[serde(default = "default_testset_name")]
    pub name: String,
    pub rows: Vec<RowSpec>,
}

fn default_testset_name() -> String {
    "testset".to_string()
}

impl TestsetSpec {
    pub fn to_testset(&self, app_id: AppId) -> Testset {
        Testset {
            id: Uuid::new_v4(),
            app_id,
            name: self.name.clone(),
            rows: self
                .rows
                .iter()
                .map(|row| TestsetRow {
                    inputs: row.inputs.clone(),
                    correct_answer: row.correct_answer.clone(),
                })
                .collect(),
        }
    }
}

/// One evaluator config in the run file
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EvaluatorSpec {
    pub name: String,
    pub kind: EvaluatorKind,
    #[serde(default = "empty_settings")]
    pub settings: serde_json::Value,
}

fn empty_settings() -> serde_json::Value {
    serde_json::json!({})
}

impl EvaluatorSpec {
    pub fn to_config(&self, app_id: AppId) -> EvaluatorConfig {
        EvaluatorConfig {
            id: Uuid::new_v4(),
            app_id,
            name: self.name.clone(),
            kind: self.kind,
            settings: self.settings.clone(),
        }
    }
}

/// A complete local evaluation run, loaded from a TOML file
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RunConfig {
    #[serde(default)]
    pub service: ServiceSettings,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    pub variant: VariantSettings,
    pub testset: TestsetSpec,
    pub evaluators: Vec<EvaluatorSpec>,
}

impl RunConfig {
    /// Load a run configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read run file: {}", path.display()))?;

        toml::from_str(&content)
            .with_context(|| format!("Failed to parse TOML run file: {}", path.display()))
    }
}
