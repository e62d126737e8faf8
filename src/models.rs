use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use crate::policy::{Decision, DecisionPolicy};

// Fields default so a missing identifier surfaces as INVALID_REQUEST from
// validation rather than as a body rejection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScoreRequest {
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub txn_id: String,
    #[serde(default)]
    pub amount: Option<f64>,
    #[serde(default)]
    pub merchant: String,
    #[serde(default)]
    pub geo: String,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct InvalidRequest(pub String);

#[derive(Debug, Clone, PartialEq)]
pub struct TransactionContext {
    user_id: String,
    txn_id: String,
    amount: f64,
    merchant: String,
    geo: String,
    timestamp: DateTime<Utc>,
}

impl TransactionContext {
    pub fn from_request(
        request: ScoreRequest,
        received_at: DateTime<Utc>,
    ) -> Result<Self, InvalidRequest> {
        let user_id = request.user_id.trim().to_string();
        if user_id.is_empty() {
            return Err(InvalidRequest("user_id is required".to_string()));
        }
        let txn_id = request.txn_id.trim().to_string();
        if txn_id.is_empty() {
            return Err(InvalidRequest("txn_id is required".to_string()));
        }
        let Some(amount) = request.amount else {
            return Err(InvalidRequest("amount is required".to_string()));
        };
        if !amount.is_finite() || amount < 0.0 {
            return Err(InvalidRequest(format!(
                "amount must be a non-negative number, got {amount}"
            )));
        }

        Ok(Self {
            user_id,
            txn_id,
            amount,
            merchant: request.merchant.trim().to_string(),
            geo: request.geo.trim().to_ascii_uppercase(),
            timestamp: request.timestamp.unwrap_or(received_at),
        })
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn txn_id(&self) -> &str {
        &self.txn_id
    }

    pub fn amount(&self) -> f64 {
        self.amount
    }

    pub fn merchant(&self) -> &str {
        &self.merchant
    }

    pub fn geo(&self) -> &str {
        &self.geo
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

#[derive(Debug, Clone, Default)]
pub struct EvidenceBundle {
    facts: BTreeMap<String, Value>,
    notes: Vec<String>,
    profile_missing: bool,
}

impl EvidenceBundle {
    pub fn record(&mut self, tool: &str, payload: Value) {
        self.facts.entry(tool.to_string()).or_insert(payload);
    }

    pub fn note_missing_profile(&mut self, note: impl Into<String>) {
        self.profile_missing = true;
        self.notes.push(note.into());
    }

    pub fn note(&mut self, note: impl Into<String>) {
        self.notes.push(note.into());
    }

    pub fn get(&self, tool: &str) -> Option<&Value> {
        self.facts.get(tool)
    }

    pub fn notes(&self) -> &[String] {
        &self.notes
    }

    pub fn profile_missing(&self) -> bool {
        self.profile_missing
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AiAssessment {
    pub risk_score: f64,
    pub rationale: Vec<String>,
    pub features_used: Vec<String>,
    pub backend: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserSummary {
    pub id: String,
    pub recent_txn_count: usize,
    pub profile_has_error: bool,
}

impl UserSummary {
    pub fn from_evidence(context: &TransactionContext, evidence: &EvidenceBundle, txn_tool: &str) -> Self {
        let recent_txn_count = evidence
            .get(txn_tool)
            .and_then(|v| v.get("items"))
            .and_then(Value::as_array)
            .map(Vec::len)
            .unwrap_or(0);
        Self {
            id: context.user_id().to_string(),
            recent_txn_count,
            profile_has_error: evidence.profile_missing(),
        }
    }
}

/// The single output of a scoring request.
///
/// Fields are private and the only constructors derive `decision` from the
/// score, so an envelope can never disagree with the policy.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DecisionEnvelope {
    txn_id: String,
    risk_score: Option<f64>,
    decision: Decision,
    ai_backend: String,
    rationale: Vec<String>,
    features_used: Vec<String>,
    fallback_used: bool,
    user_summary: UserSummary,
    assessed_at: DateTime<Utc>,
}

impl DecisionEnvelope {
    pub fn assessed(
        context: &TransactionContext,
        assessment: AiAssessment,
        policy: &DecisionPolicy,
        fallback_used: bool,
        evidence_notes: &[String],
        user_summary: UserSummary,
    ) -> Self {
        let decision = policy.decide(assessment.risk_score);
        let mut rationale = assessment.rationale;
        rationale.extend(evidence_notes.iter().cloned());
        Self {
            txn_id: context.txn_id().to_string(),
            risk_score: Some(assessment.risk_score),
            decision,
            ai_backend: assessment.backend.to_string(),
            rationale,
            features_used: assessment.features_used,
            fallback_used,
            user_summary,
            assessed_at: Utc::now(),
        }
    }

    /// Envelope for a request where no backend produced a usable score.
    /// `Allow` is never emitted here; it is promoted to `Block`.
    pub fn fail_closed(
        context: &TransactionContext,
        decision: Decision,
        fallback_used: bool,
        evidence_notes: &[String],
        user_summary: UserSummary,
    ) -> Self {
        let decision = match decision {
            Decision::Allow => Decision::Block,
            other => other,
        };
        let mut rationale = vec![format!(
            "Automated assessment unavailable; defaulted to {} pending manual handling.",
            decision.as_str()
        )];
        rationale.extend(evidence_notes.iter().cloned());
        Self {
            txn_id: context.txn_id().to_string(),
            risk_score: None,
            decision,
            ai_backend: "none".to_string(),
            rationale,
            features_used: Vec::new(),
            fallback_used,
            user_summary,
            assessed_at: Utc::now(),
        }
    }

    pub fn txn_id(&self) -> &str {
        &self.txn_id
    }

    pub fn risk_score(&self) -> Option<f64> {
        self.risk_score
    }

    pub fn decision(&self) -> Decision {
        self.decision
    }

    pub fn ai_backend(&self) -> &str {
        &self.ai_backend
    }

    pub fn rationale(&self) -> &[String] {
        &self.rationale
    }

    pub fn fallback_used(&self) -> bool {
        self.fallback_used
    }

    pub fn user_summary(&self) -> &UserSummary {
        &self.user_summary
    }
}

pub fn error_body(code: &str, message: impl Into<String>) -> Value {
    json!({
        "error": {
            "code": code,
            "message": message.into(),
        }
    })
}
