use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use uuid::Uuid;

use llm_eval_service::config::RunConfig;
use llm_eval_service::dispatcher::TaskDispatcher;
use llm_eval_service::job::JobRunner;
use llm_eval_service::output::{self, EvaluationReport, OutputFormat};
use llm_eval_service::registry::EvaluatorRegistry;
use llm_eval_service::service::{AllowAll, EvaluationService, Principal, SubmitRequest};
use llm_eval_service::store::InMemoryStore;
use llm_eval_service::variant::{HttpVariantInvoker, StaticResolver};

/// Run an evaluation of a deployed variant against a testset and print the
/// per-evaluator results
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the TOML run file
    run_file: PathBuf,

    /// Output format: plain or json
    #[arg(short, long, default_value = "plain")]
    output: OutputFormat,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    let config = RunConfig::from_file(&args.run_file)?;

    let store = Arc::new(InMemoryStore::new());
    let app_id = Uuid::new_v4();
    let variant_id = Uuid::new_v4();

    let testset = config.testset.to_testset(app_id);
    let testset_id = testset.id;
    store.insert_testset(testset).await;

    let evaluators: Vec<_> = config
        .evaluators
        .iter()
        .map(|spec| spec.to_config(app_id))
        .collect();
    for evaluator in &evaluators {
        store.insert_evaluator_config(evaluator.clone()).await;
    }

    let invoker = HttpVariantInvoker::new(
        &config.variant.base_url,
        Duration::from_secs(config.variant.timeout_secs),
    );
    let runner = Arc::new(JobRunner::new(
        store.clone(),
        Arc::new(EvaluatorRegistry::default()),
        Arc::new(StaticResolver::new(Arc::new(invoker))),
    ));
    let dispatcher =
        TaskDispatcher::start(runner, config.service.workers, config.service.queue_depth);
    let service = EvaluationService::new(store, dispatcher, Arc::new(AllowAll));
    let principal = Principal::new("local");

    let submitted = service
        .submit(
            &principal,
            SubmitRequest {
                app_id,
                variant_ids: vec![variant_id],
                testset_id,
                evaluator_config_ids: evaluators.iter().map(|e| e.id).collect(),
                rate_limit: config.rate_limit.clone(),
            },
        )
        .await?;
    let evaluation_id = submitted[0].id;

    loop {
        let status = service.status(&principal, evaluation_id).await?;
        if status.is_terminal() {
            break;
        }
        sleep(Duration::from_millis(200)).await;
    }

    let evaluation = service.get(&principal, evaluation_id).await?;
    let scenarios = service.scenarios(&principal, evaluation_id).await?;
    output::print_report(
        &EvaluationReport {
            evaluation,
            evaluators,
            scenarios,
        },
        args.output,
    );

    service.shutdown().await;
    Ok(())
}
