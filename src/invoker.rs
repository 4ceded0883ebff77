//! Narrow invocation seam.
//!
//! The enricher and the deliberation engine need "send this request, get a
//! structured response" and nothing else. Depending on this trait instead of
//! the full dispatcher breaks the cycle between enrichment and dispatch
//! (the enricher calls the research provider through the same pipeline).

use async_trait::async_trait;

use crate::models::{AgentRequest, AgentResponse};

#[async_trait]
pub trait ProviderInvoker: Send + Sync {
    async fn invoke(&self, request: AgentRequest) -> AgentResponse;
}
