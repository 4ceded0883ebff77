//! Conclave: multi-provider LLM agent orchestration core.
//!
//! Routes tasks across three heterogeneous providers (a reasoning-capable
//! chat model, a technical-analysis model, and a web-augmented research
//! model), manages per-provider credential pools with health tracking and
//! adaptive cooldown, runs multi-agent deliberation with cross-validation,
//! and enforces a budget-aware prompt-optimization pipeline.

pub mod breaker;
pub mod deliberation;
pub mod dispatch;
pub mod enrichment;
pub mod invoker;
pub mod keypool;
pub mod models;
pub mod optimizer;
pub mod orchestrator;
pub mod providers;
pub mod secrets;

pub use deliberation::{
    cross_validate, CrossValidationResult, DeliberationOptions, DeliberationResult, EnrichmentTarget,
    VotingStrategy,
};
pub use invoker::ProviderInvoker;
pub use models::{
    AgentChannel, AgentRequest, AgentResponse, AgentSignal, Direction, FailureKind, Provider, SignalType,
    TokenUsage,
};
pub use orchestrator::{Orchestrator, OrchestratorSnapshot};
