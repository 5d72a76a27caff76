use crate::models::AppId;
use thiserror::Error;

/// Faults surfaced by the orchestration core.
///
/// Evaluator execution and variant invocation failures are deliberately NOT
/// represented here: they are captured as error results inside the owning
/// scenario and never propagate out of the scenario runner.
#[derive(Debug, Error)]
pub enum EvalError {
    /// Malformed request; surfaced to the caller, never retried
    #[error("validation error: {0}")]
    Validation(String),

    /// Unknown app / variant / testset / evaluation id
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    /// The access-control gate rejected the request
    #[error("permission denied for {action} on app {app_id}")]
    PermissionDenied { action: String, app_id: AppId },

    /// The registry has no evaluator for the requested kind
    #[error("unsupported evaluator kind: {0}")]
    UnsupportedEvaluator(String),

    /// A job could not be claimed or started
    #[error("dispatch failure: {0}")]
    Dispatch(String),

    /// Persistence fault reported by the backing store
    #[error("store error: {0}")]
    Store(String),
}

impl EvalError {
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// Dispatch-level faults the Task Dispatcher may retry a bounded
    /// number of times before marking the job failed
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Dispatch(_) | Self::Store(_))
    }
}
