use std::sync::Arc;

use async_trait::async_trait;

use super::{ChatModel, ModelCompletion, ModelMessage, ModelToolChoice, ModelToolDefinition};
use crate::config::ReliabilityPolicy;
use crate::error::ProviderError;
use crate::outcome::{ErrorCode, Outcome};
use crate::pipeline::ReliabilityPipeline;

/// A [`ChatModel`] whose calls are admitted, isolated and retried by a shared pipeline.
///
/// Several wrappers may share one pipeline; wrappers with the same resource key
/// share its rate limit, bulkhead and breaker.
pub struct ReliableChatModel<M> {
    inner: M,
    pipeline: Arc<ReliabilityPipeline>,
    resource: String,
    policy: ReliabilityPolicy,
}

impl<M: ChatModel> ReliableChatModel<M> {
    /// Wraps `inner` under `resource`, using the pipeline's table policy for that key.
    pub fn new(inner: M, pipeline: Arc<ReliabilityPipeline>, resource: impl Into<String>) -> Self {
        let resource = resource.into();
        let policy = pipeline.policies().policy_for(&resource).clone();
        Self {
            inner,
            pipeline,
            resource,
            policy,
        }
    }

    pub fn with_policy(mut self, policy: ReliabilityPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn pipeline(&self) -> &Arc<ReliabilityPipeline> {
        &self.pipeline
    }

    pub fn into_inner(self) -> M {
        self.inner
    }
}

#[async_trait]
impl<M: ChatModel> ChatModel for ReliableChatModel<M> {
    async fn invoke(
        &self,
        messages: &[ModelMessage],
        tools: &[ModelToolDefinition],
        tool_choice: ModelToolChoice,
    ) -> Result<ModelCompletion, ProviderError> {
        let outcome = self
            .pipeline
            .execute(
                &self.resource,
                || self.inner.invoke(messages, tools, tool_choice.clone()),
                &self.policy,
            )
            .await;

        match outcome {
            Outcome::Ok { value, .. } => Ok(value),
            Outcome::Err(failure) => Err(ProviderError::Rejected {
                code: failure.code,
                message: failure.error,
                retryable: failure.retryable,
            }),
            Outcome::Pass { message } => Err(ProviderError::Rejected {
                code: ErrorCode::Operation("NO_COMPLETION".to_string()),
                message: message.unwrap_or_else(|| "pipeline produced no completion".to_string()),
                retryable: false,
            }),
        }
    }
}
