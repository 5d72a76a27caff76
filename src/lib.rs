//! Evaluation orchestration core for LLM app variants.
//!
//! Takes a set of variants, a testset and a collection of evaluator
//! configurations, fans scenario work out to background workers, tracks
//! per-scenario and aggregated results, and answers status/result queries
//! while evaluations are still in flight.
//!
//! The HTTP layer, authentication policy and durable persistence live
//! outside this crate; they plug in through [`service::EvaluationService`],
//! [`service::AccessControl`], [`store::EvaluationStore`] and
//! [`variant::VariantInvoker`].

pub mod aggregation;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod evaluators;
pub mod job;
pub mod models;
pub mod output;
pub mod registry;
pub mod scenario;
pub mod service;
pub mod store;
pub mod variant;

pub use error::EvalError;
pub use service::{EvaluationService, Principal, SubmitRequest};
