use crate::models::{AppId, ScenarioInput, VariantId, VariantOutput};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// The evaluated variant as an opaque callable. The orchestrator does not
/// own the variant; it only hands it formatted inputs and takes back an
/// output with optional cost/latency.
#[async_trait]
pub trait VariantInvoker: Send + Sync {
    async fn invoke(&self, inputs: &[ScenarioInput]) -> Result<VariantOutput>;
}

/// Maps (app, variant) to the callable that reaches it. Resolution failure
/// at dispatch time is a job-level fault.
#[async_trait]
pub trait VariantResolver: Send + Sync {
    async fn resolve(
        &self,
        app_id: AppId,
        variant_id: VariantId,
    ) -> Result<Arc<dyn VariantInvoker>>;
}

/// Calls a deployed variant over HTTP: POST `{base_url}/generate` with the
/// formatted inputs, reading back `{"output": ..., "cost": ..., "latency": ...}`.
pub struct HttpVariantInvoker {
    base_url: String,
    client: reqwest::Client,
}

impl HttpVariantInvoker {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            base_url: base_url.into(),
            client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_default(),
        }
    }
}

#[async_trait]
impl VariantInvoker for HttpVariantInvoker {
    async fn invoke(&self, inputs: &[ScenarioInput]) -> Result<VariantOutput> {
        let url = format!("{}/generate", self.base_url.trim_end_matches('/'));
        let payload: HashMap<&str, &str> = inputs
            .iter()
            .map(|input| (input.name.as_str(), input.value.as_str()))
            .collect();

        let started = Instant::now();
        let response = self
            .client
            .post(&url)
            .json(&payload)
            .send()
            .await
            .with_context(|| format!("variant call to {url} failed"))?
            .error_for_status()
            .with_context(|| format!("variant at {url} rejected the request"))?;

        let body: Value = response
            .json()
            .await
            .context("variant response was not valid JSON")?;
        let output = body
            .get("output")
            .and_then(|v| v.as_str())
            .context("variant response is missing an output field")?
            .to_string();

        Ok(VariantOutput {
            output,
            cost: body.get("cost").and_then(|v| v.as_f64()),
            latency: body
                .get("latency")
                .and_then(|v| v.as_f64())
                .or_else(|| Some(started.elapsed().as_secs_f64())),
        })
    }
}

/// Resolves every variant id to the same invoker. Used by the CLI, where a
/// single deployed variant is evaluated, and by tests.
pub struct StaticResolver {
    invoker: Arc<dyn VariantInvoker>,
}

impl StaticResolver {
    pub fn new(invoker: Arc<dyn VariantInvoker>) -> Self {
        Self { invoker }
    }
}

#[async_trait]
impl VariantResolver for StaticResolver {
    async fn resolve(
        &self,
        _app_id: AppId,
        _variant_id: VariantId,
    ) -> Result<Arc<dyn VariantInvoker>> {
        Ok(self.invoker.clone())
    }
}
