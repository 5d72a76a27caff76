use crate::models::{ErrorDetail, EvalResult, EvaluatorKind, ScenarioInput};
use crate::registry::{Evaluator, ScoreContext};
use async_openai::{Client, config::OpenAIConfig, types::CreateChatCompletionRequestArgs};
use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_CORRECT_ANSWER_KEY: &str = "correct_answer";
const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(30);

fn setting_str<'a>(settings: &'a Value, key: &str) -> Option<&'a str> {
    settings.get(key).and_then(|v| v.as_str())
}

fn setting_f64(settings: &Value, key: &str) -> Option<f64> {
    settings.get(key).and_then(|v| v.as_f64())
}

fn setting_bool(settings: &Value, key: &str) -> Option<bool> {
    settings.get(key).and_then(|v| v.as_bool())
}

/// Resolve the expected answer for a scenario, honoring the config's
/// `correct_answer_key` override
fn expected_answer<'a>(ctx: &'a ScoreContext<'_>) -> Option<&'a str> {
    let key = setting_str(ctx.settings, "correct_answer_key").unwrap_or(DEFAULT_CORRECT_ANSWER_KEY);
    ctx.correct_answer
        .and_then(|answers| answers.get(key))
        .map(|s| s.as_str())
}

fn missing_answer_error() -> EvalResult {
    EvalResult::error(ErrorDetail::new(
        "no correct answer available for this scenario",
    ))
}

/// Exact string equality against the expected answer
pub struct ExactMatchEvaluator;

#[async_trait]
impl Evaluator for ExactMatchEvaluator {
    fn kind(&self) -> EvaluatorKind {
        EvaluatorKind::ExactMatch
    }

    async fn score(&self, ctx: &ScoreContext<'_>) -> EvalResult {
        match expected_answer(ctx) {
            Some(expected) => EvalResult::bool(ctx.output == expected),
            None => missing_answer_error(),
        }
    }
}

/// Normalized similarity ratio against the expected answer.
///
/// With a `similarity_threshold` setting the result is a boolean pass/fail;
/// without one, the raw ratio is returned as a numeric score.
pub struct SimilarityEvaluator;

#[async_trait]
impl Evaluator for SimilarityEvaluator {
    fn kind(&self) -> EvaluatorKind {
        EvaluatorKind::Similarity
    }

    async fn score(&self, ctx: &ScoreContext<'_>) -> EvalResult {
        let Some(expected) = expected_answer(ctx) else {
            return missing_answer_error();
        };
        let ratio = similarity_ratio(ctx.output, expected);
        match setting_f64(ctx.settings, "similarity_threshold") {
            Some(threshold) => EvalResult::bool(ratio >= threshold),
            None => EvalResult::number(ratio),
        }
    }
}

/// Levenshtein-based similarity in [0, 1]; 1.0 means identical
pub fn similarity_ratio(a: &str, b: &str) -> f64 {
    let longest = a.chars().count().max(b.chars().count());
    if longest == 0 {
        return 1.0;
    }
    1.0 - levenshtein(a, b) as f64 / longest as f64
}

fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut current = vec![0; b.len() + 1];

    for (i, &ca) in a.iter().enumerate() {
        current[0] = i + 1;
        for (j, &cb) in b.iter().enumerate() {
            let substitution = prev[j] + usize::from(ca != cb);
            current[j + 1] = substitution.min(prev[j + 1] + 1).min(current[j] + 1);
        }
        std::mem::swap(&mut prev, &mut current);
    }
    prev[b.len()]
}

/// Matches the variant output against a configured pattern.
/// `regex_should_match = false` inverts the expectation.
pub struct RegexEvaluator;

#[async_trait]
impl Evaluator for RegexEvaluator {
    fn kind(&self) -> EvaluatorKind {
        EvaluatorKind::Regex
    }

    async fn score(&self, ctx: &ScoreContext<'_>) -> EvalResult {
        let Some(pattern) = setting_str(ctx.settings, "regex_pattern") else {
            return EvalResult::error(ErrorDetail::new("regex_pattern setting is missing"));
        };
        let regex = match Regex::new(pattern) {
            Ok(regex) => regex,
            Err(e) => {
                return EvalResult::error(ErrorDetail::with_trace(
                    format!("invalid regex pattern: {pattern}"),
                    e.to_string(),
                ));
            }
        };
        let should_match = setting_bool(ctx.settings, "regex_should_match").unwrap_or(true);
        EvalResult::bool(regex.is_match(ctx.output) == should_match)
    }
}

/// Posts the scenario to an external service and reads back
/// `{"score": <float>}`. Remote failures become error results.
pub struct WebhookEvaluator {
    client: reqwest::Client,
}

impl WebhookEvaluator {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(WEBHOOK_TIMEOUT)
                .build()
                .unwrap_or_default(),
        }
    }

    fn payload(ctx: &ScoreContext<'_>) -> Value {
        let inputs: HashMap<&str, &str> = ctx
            .inputs
            .iter()
            .map(|input| (input.name.as_str(), input.value.as_str()))
            .collect();
        serde_json::json!({
            "inputs": inputs,
            "output": ctx.output,
            "correct_answer": ctx.correct_answer,
        })
    }
}

impl Default for WebhookEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Evaluator for WebhookEvaluator {
    fn kind(&self) -> EvaluatorKind {
        EvaluatorKind::Webhook
    }

    async fn score(&self, ctx: &ScoreContext<'_>) -> EvalResult {
        let Some(url) = setting_str(ctx.settings, "webhook_url") else {
            return EvalResult::error(ErrorDetail::new("webhook_url setting is missing"));
        };

        let response = match self
            .client
            .post(url)
            .json(&Self::payload(ctx))
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                return EvalResult::error(ErrorDetail::with_trace(
                    format!("webhook call to {url} failed"),
                    e.to_string(),
                ));
            }
        };

        if !response.status().is_success() {
            return EvalResult::error(ErrorDetail::new(format!(
                "webhook returned status {}",
                response.status()
            )));
        }

        let body: Value = match response.json().await {
            Ok(body) => body,
            Err(e) => {
                return EvalResult::error(ErrorDetail::with_trace(
                    "webhook response was not valid JSON",
                    e.to_string(),
                ));
            }
        };

        match body.get("score").and_then(|v| v.as_f64()) {
            Some(score) => EvalResult::number(score),
            None => EvalResult::error(ErrorDetail::new(
                "webhook response is missing a numeric score field",
            )),
        }
    }
}

/// Asks an OpenAI-compatible model to grade the output. The critique prompt
/// comes from the config; the model is instructed to answer with a JSON
/// score which is parsed out of the reply even when wrapped in prose.
pub struct AiCritiqueEvaluator;

impl AiCritiqueEvaluator {
    pub fn new() -> Self {
        Self
    }

    fn build_client(settings: &Value) -> Result<Client<OpenAIConfig>, ErrorDetail> {
        let env_var = setting_str(settings, "env_var_api_key").unwrap_or("OPENAI_API_KEY");
        let api_key = std::env::var(env_var)
            .map_err(|_| ErrorDetail::new(format!("environment variable {env_var} not found")))?;

        let mut config = OpenAIConfig::new().with_api_key(api_key);
        if let Some(endpoint) = setting_str(settings, "api_endpoint") {
            config = config.with_api_base(endpoint);
        }
        Ok(Client::with_config(config))
    }

    fn build_prompt(ctx: &ScoreContext<'_>) -> String {
        let template = setting_str(ctx.settings, "prompt_template")
            .unwrap_or("Grade the output of an LLM app on a 0 to 1 scale.");
        let inputs = ctx
            .inputs
            .iter()
            .map(|input| format!("{}: {}", input.name, input.value))
            .collect::<Vec<_>>()
            .join("\n");
        let correct_answer = expected_answer(ctx).unwrap_or("(not provided)");

        format!(
            "{template}\n\nInputs:\n{inputs}\n\nExpected answer: {correct_answer}\nOutput to grade: {}\n\nReturn JSON with a single \"score\" field between 0.0 and 1.0.",
            ctx.output
        )
    }

    /// Pull a score out of the model reply, tolerating JSON embedded in text
    fn parse_score(reply: &str) -> Result<f64, ErrorDetail> {
        let parsed: Value = match serde_json::from_str(reply) {
            Ok(parsed) => parsed,
            Err(_) => {
                let start = reply
                    .find('{')
                    .ok_or_else(|| ErrorDetail::new("no JSON found in critique reply"))?;
                let end = reply
                    .rfind('}')
                    .ok_or_else(|| ErrorDetail::new("unterminated JSON in critique reply"))?;
                serde_json::from_str(&reply[start..=end]).map_err(|e| {
                    ErrorDetail::with_trace("failed to parse critique reply", e.to_string())
                })?
            }
        };

        parsed
            .get("score")
            .and_then(|v| v.as_f64())
            .map(|score| score.clamp(0.0, 1.0))
            .ok_or_else(|| ErrorDetail::new("critique reply is missing a numeric score"))
    }
}

impl Default for AiCritiqueEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Evaluator for AiCritiqueEvaluator {
    fn kind(&self) -> EvaluatorKind {
        EvaluatorKind::AiCritique
    }

    async fn score(&self, ctx: &ScoreContext<'_>) -> EvalResult {
        let client = match Self::build_client(ctx.settings) {
            Ok(client) => client,
            Err(detail) => return EvalResult::error(detail),
        };
        let model = setting_str(ctx.settings, "model").unwrap_or("gpt-3.5-turbo");

        let message: async_openai::types::ChatCompletionRequestMessage =
            match async_openai::types::ChatCompletionRequestUserMessageArgs::default()
                .content(Self::build_prompt(ctx))
                .build()
            {
                Ok(message) => message.into(),
                Err(e) => {
                    return EvalResult::error(ErrorDetail::with_trace(
                        "failed to build critique message",
                        e.to_string(),
                    ));
                }
            };

        let request = match CreateChatCompletionRequestArgs::default()
            .model(model)
            .messages([message])
            .temperature(0.1)
            .build()
        {
            Ok(request) => request,
            Err(e) => {
                return EvalResult::error(ErrorDetail::with_trace(
                    "failed to build critique request",
                    e.to_string(),
                ));
            }
        };

        let response = match client.chat().create(request).await {
            Ok(response) => response,
            Err(e) => {
                return EvalResult::error(ErrorDetail::with_trace(
                    "critique model call failed",
                    e.to_string(),
                ));
            }
        };

        let reply = response
            .choices
            .first()
            .and_then(|choice| choice.message.content.clone())
            .unwrap_or_default();

        match Self::parse_score(&reply) {
            Ok(score) => EvalResult::number(score),
            Err(detail) => EvalResult::error(detail),
        }
    }
}

/// Executes caller-supplied scoring code in an isolated context.
///
/// The crate takes no position on the isolation mechanism; integrators
/// supply one. Only the scenario's inputs, output and expected answer are
/// exposed to the code.
#[async_trait]
pub trait CustomCodeExecutor: Send + Sync {
    async fn execute(
        &self,
        code: &str,
        inputs: &[ScenarioInput],
        output: &str,
        correct_answer: Option<&HashMap<String, String>>,
    ) -> Result<f64, String>;
}

/// Default executor: refuses every request. Custom code only runs when the
/// integrator installs a real sandbox.
pub struct NoSandbox;

#[async_trait]
impl CustomCodeExecutor for NoSandbox {
    async fn execute(
        &self,
        _code: &str,
        _inputs: &[ScenarioInput],
        _output: &str,
        _correct_answer: Option<&HashMap<String, String>>,
    ) -> Result<f64, String> {
        Err("no custom code sandbox is configured".to_string())
    }
}

/// Delegates scoring to the installed [`CustomCodeExecutor`]; every executor
/// failure becomes an error result, never a panic or propagated error
pub struct CustomCodeEvaluator {
    executor: Arc<dyn CustomCodeExecutor>,
}

impl CustomCodeEvaluator {
    pub fn new(executor: Arc<dyn CustomCodeExecutor>) -> Self {
        Self { executor }
    }
}

#[async_trait]
impl Evaluator for CustomCodeEvaluator {
    fn kind(&self) -> EvaluatorKind {
        EvaluatorKind::CustomCode
    }

    async fn score(&self, ctx: &ScoreContext<'_>) -> EvalResult {
        let Some(code) = setting_str(ctx.settings, "code") else {
            return EvalResult::error(ErrorDetail::new("code setting is missing"));
        };
        match self
            .executor
            .execute(code, ctx.inputs, ctx.output, ctx.correct_answer)
            .await
        {
            Ok(score) => EvalResult::number(score),
            Err(message) => EvalResult::error(ErrorDetail::new(message)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn context<'a>(
        output: &'a str,
        correct_answer: Option<&'a HashMap<String, String>>,
        settings: &'a Value,
    ) -> ScoreContext<'a> {
        ScoreContext {
            inputs: &[],
            output,
            correct_answer,
            settings,
        }
    }

    fn answer(value: &str) -> HashMap<String, String> {
        HashMap::from([(DEFAULT_CORRECT_ANSWER_KEY.to_string(), value.to_string())])
    }

    #[tokio::test]
    async fn test_exact_match_pass_and_fail() {
        let settings = json!({});
        let answers = answer("Paris");

        let result = ExactMatchEvaluator
            .score(&context("Paris", Some(&answers), &settings))
            .await;
        assert_eq!(result, EvalResult::bool(true));

        let result = ExactMatchEvaluator
            .score(&context("Lyon", Some(&answers), &settings))
            .await;
        assert_eq!(result, EvalResult::bool(false));
    }

    #[tokio::test]
    async fn test_exact_match_missing_answer_is_error_result() {
        let settings = json!({});
        let result = ExactMatchEvaluator
            .score(&context("Paris", None, &settings))
            .await;
        assert!(result.is_error());
    }

    #[tokio::test]
    async fn test_exact_match_honors_answer_key_override() {
        let settings = json!({"correct_answer_key": "capital"});
        let answers = HashMap::from([("capital".to_string(), "Paris".to_string())]);

        let result = ExactMatchEvaluator
            .score(&context("Paris", Some(&answers), &settings))
            .await;
        assert_eq!(result, EvalResult::bool(true));
    }

    #[test]
    fn test_similarity_ratio_bounds() {
        assert_eq!(similarity_ratio("abc", "abc"), 1.0);
        assert_eq!(similarity_ratio("", ""), 1.0);
        assert_eq!(similarity_ratio("abc", "xyz"), 0.0);
        let ratio = similarity_ratio("kitten", "sitting");
        assert!(ratio > 0.5 && ratio < 0.6, "unexpected ratio {ratio}");
    }

    #[tokio::test]
    async fn test_similarity_with_threshold_is_boolean() {
        let settings = json!({"similarity_threshold": 0.5});
        let answers = answer("the quick brown fox");

        let result = SimilarityEvaluator
            .score(&context("the quick brown fox", Some(&answers), &settings))
            .await;
        assert_eq!(result, EvalResult::bool(true));

        let result = SimilarityEvaluator
            .score(&context("zzzz", Some(&answers), &settings))
            .await;
        assert_eq!(result, EvalResult::bool(false));
    }

    #[tokio::test]
    async fn test_similarity_without_threshold_returns_ratio() {
        let settings = json!({});
        let answers = answer("abcd");

        let result = SimilarityEvaluator
            .score(&context("abcd", Some(&answers), &settings))
            .await;
        assert_eq!(result, EvalResult::number(1.0));
    }

    #[tokio::test]
    async fn test_regex_match_and_invert() {
        let settings = json!({"regex_pattern": "^[A-Z][a-z]+$"});
        let result = RegexEvaluator.score(&context("Paris", None, &settings)).await;
        assert_eq!(result, EvalResult::bool(true));

        let settings = json!({"regex_pattern": "^[0-9]+$", "regex_should_match": false});
        let result = RegexEvaluator.score(&context("Paris", None, &settings)).await;
        assert_eq!(result, EvalResult::bool(true));
    }

    #[tokio::test]
    async fn test_regex_invalid_pattern_is_error_result() {
        let settings = json!({"regex_pattern": "(unclosed"});
        let result = RegexEvaluator.score(&context("x", None, &settings)).await;
        assert!(result.is_error());
    }

    #[tokio::test]
    async fn test_regex_missing_pattern_is_error_result() {
        let settings = json!({});
        let result = RegexEvaluator.score(&context("x", None, &settings)).await;
        assert!(result.is_error());
    }

    #[tokio::test]
    async fn test_webhook_success() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/score")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"score": 0.75}"#)
            .create_async()
            .await;

        let settings = json!({"webhook_url": format!("{}/score", server.url())});
        let result = WebhookEvaluator::new()
            .score(&context("output", None, &settings))
            .await;

        mock.assert_async().await;
        assert_eq!(result, EvalResult::number(0.75));
    }

    #[tokio::test]
    async fn test_webhook_server_error_is_error_result() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/score")
            .with_status(500)
            .create_async()
            .await;

        let settings = json!({"webhook_url": format!("{}/score", server.url())});
        let result = WebhookEvaluator::new()
            .score(&context("output", None, &settings))
            .await;
        assert!(result.is_error());
    }

    #[tokio::test]
    async fn test_webhook_missing_score_field_is_error_result() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/score")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"verdict": "fine"}"#)
            .create_async()
            .await;

        let settings = json!({"webhook_url": format!("{}/score", server.url())});
        let result = WebhookEvaluator::new()
            .score(&context("output", None, &settings))
            .await;
        assert!(result.is_error());
    }

    #[tokio::test]
    async fn test_webhook_unreachable_is_error_result() {
        let settings = json!({"webhook_url": "http://127.0.0.1:1/score"});
        let result = WebhookEvaluator::new()
            .score(&context("output", None, &settings))
            .await;
        assert!(result.is_error());
    }

    #[test]
    fn test_parse_score_plain_json() {
        assert_eq!(
            AiCritiqueEvaluator::parse_score(r#"{"score": 0.8}"#).unwrap(),
            0.8
        );
    }

    #[test]
    fn test_parse_score_embedded_json() {
        let reply = r#"The grade is as follows: {"score": 0.6} Hope that helps."#;
        assert_eq!(AiCritiqueEvaluator::parse_score(reply).unwrap(), 0.6);
    }

    #[test]
    fn test_parse_score_clamps_out_of_range() {
        assert_eq!(
            AiCritiqueEvaluator::parse_score(r#"{"score": 1.7}"#).unwrap(),
            1.0
        );
    }

    #[test]
    fn test_parse_score_rejects_scoreless_reply() {
        assert!(AiCritiqueEvaluator::parse_score("no json here").is_err());
        assert!(AiCritiqueEvaluator::parse_score(r#"{"feedback": "fine"}"#).is_err());
    }

    #[tokio::test]
    async fn test_ai_critique_missing_env_var_is_error_result() {
        let settings = json!({"env_var_api_key": "EVAL_SERVICE_TEST_MISSING_KEY"});
        unsafe {
            std::env::remove_var("EVAL_SERVICE_TEST_MISSING_KEY");
        }
        let result = AiCritiqueEvaluator::new()
            .score(&context("output", None, &settings))
            .await;
        assert!(result.is_error());
    }

    #[tokio::test]
    async fn test_custom_code_without_sandbox_is_error_result() {
        let evaluator = CustomCodeEvaluator::new(Arc::new(NoSandbox));
        let settings = json!({"code": "return 1.0"});
        let result = evaluator.score(&context("output", None, &settings)).await;
        assert!(result.is_error());
    }

    #[tokio::test]
    async fn test_custom_code_with_executor() {
        struct FixedScore;

        #[async_trait]
        impl CustomCodeExecutor for FixedScore {
            async fn execute(
                &self,
                _code: &str,
                _inputs: &[ScenarioInput],
                _output: &str,
                _correct_answer: Option<&HashMap<String, String>>,
            ) -> Result<f64, String> {
                Ok(0.9)
            }
        }

        let evaluator = CustomCodeEvaluator::new(Arc::new(FixedScore));
        let settings = json!({"code": "return 0.9"});
        let result = evaluator.score(&context("output", None, &settings)).await;
        assert_eq!(result, EvalResult::number(0.9));
    }
}
