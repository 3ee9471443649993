//! Runs tool calls under the approval policy with a per-call time allowance.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{SharedToolRegistry, ToolDescriptor, ToolEffect, ToolError, ToolResult, ToolTrait};
use crate::clients::ToolCall;
use crate::config::{ApprovalDecision, ApprovalPolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmationReason {
    BeforeExecution,
    RetryAfterFailure,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConfirmationRequest {
    pub tool_name: String,
    pub arguments: Map<String, Value>,
    pub effect: ToolEffect,
    pub reason: ConfirmationReason,
    /// Error of the failed attempt when asking to retry.
    pub error: Option<String>,
}

/// Asks someone whether a tool call may run. May block on human input.
#[async_trait]
pub trait ConfirmationHandler: Send + Sync {
    async fn confirm(&self, request: &ConfirmationRequest) -> bool;
}

/// Answers every confirmation with the same value.
#[derive(Debug, Clone, Copy)]
pub struct AutoApprove(pub bool);

#[async_trait]
impl ConfirmationHandler for AutoApprove {
    async fn confirm(&self, _request: &ConfirmationRequest) -> bool {
        self.0
    }
}

pub struct ToolExecutor {
    registry: SharedToolRegistry,
    policy: ApprovalPolicy,
    confirmation: Arc<dyn ConfirmationHandler>,
    timeout: Duration,
}

impl ToolExecutor {
    pub fn new(
        registry: SharedToolRegistry,
        policy: ApprovalPolicy,
        confirmation: Arc<dyn ConfirmationHandler>,
        timeout: Duration,
    ) -> Self {
        Self {
            registry,
            policy,
            confirmation,
            timeout,
        }
    }

    pub fn registry(&self) -> &SharedToolRegistry {
        &self.registry
    }

    pub fn policy(&self) -> ApprovalPolicy {
        self.policy
    }

    pub fn set_policy(&mut self, policy: ApprovalPolicy) {
        self.policy = policy;
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Executes one call. Every failure, including an unknown tool, a denial
    /// or a timeout, comes back as a failed [`ToolResult`].
    pub async fn execute(&self, call: &ToolCall) -> ToolResult {
        let entry = self.registry.read().await.handler(&call.name);
        let Some((descriptor, handler)) = entry else {
            warn!(tool = %call.name, "model requested an unknown tool");
            return ToolError::NotFound(call.name.clone()).into();
        };
        if !descriptor.enabled {
            return ToolError::Disabled(call.name.clone()).into();
        }

        let decision = self.policy.decide(descriptor.effect);
        debug!(tool = %call.name, policy = %self.policy, ?decision, "approval decision");

        match decision {
            ApprovalDecision::Allow => self.run(&descriptor, &handler, call).await,
            ApprovalDecision::Deny => {
                info!(tool = %call.name, "tool call denied by approval policy");
                ToolError::Rejected(format!(
                    "{} rejected by approval policy '{}'",
                    call.name, self.policy
                ))
                .into()
            }
            ApprovalDecision::Ask => {
                let request =
                    self.request(&descriptor, call, ConfirmationReason::BeforeExecution, None);
                if self.confirmation.confirm(&request).await {
                    self.run(&descriptor, &handler, call).await
                } else {
                    info!(tool = %call.name, "tool call declined");
                    ToolError::Rejected(format!("{} was declined by the user", call.name)).into()
                }
            }
            ApprovalDecision::AllowThenAskOnFailure => {
                let result = self.run(&descriptor, &handler, call).await;
                if result.success {
                    return result;
                }
                let request = self.request(
                    &descriptor,
                    call,
                    ConfirmationReason::RetryAfterFailure,
                    result.error.clone(),
                );
                if self.confirmation.confirm(&request).await {
                    info!(tool = %call.name, "retrying failed tool call");
                    self.run(&descriptor, &handler, call).await
                } else {
                    result
                }
            }
        }
    }

    fn request(
        &self,
        descriptor: &ToolDescriptor,
        call: &ToolCall,
        reason: ConfirmationReason,
        error: Option<String>,
    ) -> ConfirmationRequest {
        ConfirmationRequest {
            tool_name: call.name.clone(),
            arguments: call.arguments.clone(),
            effect: descriptor.effect,
            reason,
            error,
        }
    }

    async fn run(
        &self,
        descriptor: &ToolDescriptor,
        handler: &Arc<dyn ToolTrait>,
        call: &ToolCall,
    ) -> ToolResult {
        debug!(tool = %descriptor.name, kind = ?descriptor.kind, "executing tool");
        match tokio::time::timeout(self.timeout, handler.execute(call.arguments.clone())).await {
            Ok(Ok(result)) => result,
            Ok(Err(error)) => {
                debug!(tool = %descriptor.name, %error, "tool failed");
                error.into()
            }
            Err(_) => {
                warn!(tool = %descriptor.name, timeout = ?self.timeout, "tool timed out");
                ToolError::Timeout {
                    name: descriptor.name.clone(),
                    seconds: self.timeout.as_secs(),
                }
                .into()
            }
        }
    }
}
