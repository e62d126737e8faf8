use std::{sync::Arc, time::Duration};

use anyhow::Result;
use chrono::Utc;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::time::{self, Instant};
use tracing::{debug, info, warn};

use crate::{
    ai_backend::{AiRouter, PromptContext},
    config::Config,
    models::{
        DecisionEnvelope, EvidenceBundle, InvalidRequest, ScoreRequest, TransactionContext,
        UserSummary,
    },
    policy::{Decision, DecisionPolicy},
    tools::{ToolError, ToolRegistry, TRANSACTIONS_TOOL, USER_PROFILE_TOOL},
};

// Held back from the model budget so a fail-closed envelope is emitted before
// the request deadline fires.
const ASSESSMENT_RESERVE: Duration = Duration::from_millis(25);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    #[error(transparent)]
    InvalidRequest(#[from] InvalidRequest),
    #[error("scoring did not finish within {0} ms")]
    DeadlineExceeded(u64),
}

#[derive(Debug, Clone)]
pub struct GatewaySettings {
    pub policy: DecisionPolicy,
    pub fail_closed_decision: Decision,
    pub request_timeout: Duration,
    pub retry_backoff: Duration,
    pub transaction_limit: u32,
}

impl GatewaySettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            policy: config.policy,
            fail_closed_decision: config.fail_closed_decision,
            request_timeout: config.request_timeout,
            retry_backoff: config.retry_backoff,
            transaction_limit: config.transaction_limit,
        }
    }
}

pub struct ScoringGateway {
    tools: Arc<ToolRegistry>,
    router: AiRouter,
    settings: GatewaySettings,
}

impl ScoringGateway {
    pub fn new(tools: Arc<ToolRegistry>, router: AiRouter, settings: GatewaySettings) -> Self {
        Self {
            tools,
            router,
            settings,
        }
    }

    pub fn from_config(config: &Config, tools: Arc<ToolRegistry>) -> Result<Self> {
        let router = AiRouter::from_config(config)?;
        Ok(Self::new(tools, router, GatewaySettings::from_config(config)))
    }

    pub fn primary_backend(&self) -> &'static str {
        self.router.primary_name()
    }

    pub fn fallback_backend(&self) -> Option<&'static str> {
        self.router.fallback_name()
    }

    /// Scores a transaction under the smaller of the configured request
    /// timeout and `client_deadline`. Only invalid input and an expired
    /// deadline surface as errors; every other failure degrades or fails
    /// closed inside the envelope.
    pub async fn score(
        &self,
        request: ScoreRequest,
        client_deadline: Option<Duration>,
    ) -> Result<DecisionEnvelope, GatewayError> {
        let context = TransactionContext::from_request(request, Utc::now())?;
        let deadline = client_deadline
            .map(|d| d.min(self.settings.request_timeout))
            .unwrap_or(self.settings.request_timeout);

        let deadline_at = Instant::now() + deadline;
        match time::timeout(deadline, self.run(&context, deadline_at)).await {
            Ok(envelope) => {
                info!(
                    txn_id = %envelope.txn_id(),
                    risk_score = ?envelope.risk_score(),
                    decision = envelope.decision().as_str(),
                    backend = %envelope.ai_backend(),
                    fallback_used = envelope.fallback_used(),
                    profile_has_error = envelope.user_summary().profile_has_error,
                    reasons = envelope.rationale().len(),
                    "Transaction scored"
                );
                Ok(envelope)
            }
            Err(_) => {
                let millis = deadline.as_millis() as u64;
                warn!(txn_id = %context.txn_id(), deadline_ms = millis, "Scoring deadline exceeded");
                Err(GatewayError::DeadlineExceeded(millis))
            }
        }
    }

    async fn run(&self, context: &TransactionContext, deadline_at: Instant) -> DecisionEnvelope {
        let evidence = self.gather(context).await;
        let summary = UserSummary::from_evidence(context, &evidence, TRANSACTIONS_TOOL);
        let prompt = PromptContext::build(context, &evidence);
        let budget = deadline_at
            .saturating_duration_since(Instant::now())
            .saturating_sub(ASSESSMENT_RESERVE);

        match self.router.assess(&prompt, budget).await {
            Ok(routed) => DecisionEnvelope::assessed(
                context,
                routed.assessment,
                &self.settings.policy,
                routed.fallback_used,
                evidence.notes(),
                summary,
            ),
            Err(failure) => {
                warn!(txn_id = %context.txn_id(), error = %failure, "Failing closed");
                DecisionEnvelope::fail_closed(
                    context,
                    self.settings.fail_closed_decision,
                    failure.fallback_attempted(),
                    evidence.notes(),
                    summary,
                )
            }
        }
    }

    async fn gather(&self, context: &TransactionContext) -> EvidenceBundle {
        let profile_args = json!({ "user_id": context.user_id() });
        let history_args = json!({
            "user_id": context.user_id(),
            "limit": self.settings.transaction_limit,
        });

        let (profile, history) = tokio::join!(
            self.invoke_with_retry(USER_PROFILE_TOOL, &profile_args),
            self.invoke_with_retry(TRANSACTIONS_TOOL, &history_args),
        );

        let mut evidence = EvidenceBundle::default();
        match profile {
            Ok(payload) => evidence.record(USER_PROFILE_TOOL, payload),
            Err(ToolError::NotFound(_)) => {
                evidence.note_missing_profile("User profile not found; assessed without profile.")
            }
            Err(err) => {
                warn!(txn_id = %context.txn_id(), tool = USER_PROFILE_TOOL, error = %err, "Degrading without profile");
                evidence.note_missing_profile(format!(
                    "User profile unavailable ({}); assessed without profile.",
                    err.kind()
                ));
            }
        }
        match history {
            Ok(payload) => {
                debug!(
                    txn_id = %context.txn_id(),
                    items = payload.get("items").and_then(|v| v.as_array()).map(|items| items.len()),
                    "Recent transactions gathered"
                );
                evidence.record(TRANSACTIONS_TOOL, payload);
            }
            Err(err) => {
                warn!(txn_id = %context.txn_id(), tool = TRANSACTIONS_TOOL, error = %err, "Degrading without transaction history");
                evidence.note(format!(
                    "Recent transactions unavailable ({}); assessed without history.",
                    err.kind()
                ));
            }
        }
        evidence
    }

    async fn invoke_with_retry(&self, tool: &str, args: &Value) -> Result<Value, ToolError> {
        match self.tools.invoke(tool, args).await {
            Err(err) if err.retryable() => {
                debug!(tool = %tool, error = %err, "Retrying unavailable tool");
                time::sleep(self.settings.retry_backoff).await;
                self.tools.invoke(tool, args).await
            }
            other => other,
        }
    }
}
