use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::StatusCode;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::time::{self, Instant};
use tracing::{info, warn};

use crate::{
    config::{AiBackendKind, Config},
    models::{AiAssessment, EvidenceBundle, TransactionContext},
    tools::{TRANSACTIONS_TOOL, USER_PROFILE_TOOL},
};

pub const MAX_RATIONALE_ITEMS: usize = 8;
pub const MAX_RATIONALE_CHARS: usize = 280;
const MAX_FEATURE_ITEMS: usize = 8;
const MAX_FEATURE_CHARS: usize = 64;
const MAX_PROMPT_TRANSACTIONS: usize = 20;
const HEURISTIC_AMOUNT_THRESHOLD: f64 = 5_000.0;

const REFUSAL_FINISH_REASONS: &[&str] = &[
    "SAFETY",
    "RECITATION",
    "BLOCKLIST",
    "PROHIBITED_CONTENT",
    "SPII",
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AssessmentError {
    #[error("{backend} timed out after {millis} ms")]
    Timeout { backend: &'static str, millis: u64 },
    #[error("{backend} rejected credentials: {message}")]
    Auth {
        backend: &'static str,
        message: String,
    },
    #[error("{backend} request failed: {message}")]
    Provider {
        backend: &'static str,
        message: String,
    },
    #[error("{backend} refused to assess: {reason}")]
    Refused {
        backend: &'static str,
        reason: String,
    },
    #[error("{backend} returned a malformed assessment: {message}")]
    MalformedAssessment {
        backend: &'static str,
        message: String,
    },
}

/// Structured prompt handed to every backend.
///
/// Built only from the transaction and its evidence, so identical inputs
/// serialize to identical bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct PromptContext(Value);

impl PromptContext {
    pub fn build(context: &TransactionContext, evidence: &EvidenceBundle) -> Self {
        let user_profile = evidence
            .get(USER_PROFILE_TOOL)
            .cloned()
            .unwrap_or_else(|| json!({}));
        let recent_transactions = evidence
            .get(TRANSACTIONS_TOOL)
            .and_then(|v| v.get("items"))
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .take(MAX_PROMPT_TRANSACTIONS)
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();

        Self(json!({
            "task": "Assess credit/fraud risk for a single card transaction.",
            "transaction": {
                "txn_id": context.txn_id(),
                "amount": context.amount(),
                "merchant": context.merchant(),
                "geo": context.geo(),
                "ts_utc": context.timestamp().to_rfc3339(),
            },
            "user_profile": user_profile,
            "recent_transactions": recent_transactions,
            "evidence_gaps": evidence.notes(),
            "requirements": {
                "risk_score_range": [0.0, 1.0],
                "provide_top_reasons": true,
                "json_only": true,
                "response_fields": ["risk_score", "reasons", "features_used"],
            },
        }))
    }

    pub fn to_text(&self) -> String {
        self.0.to_string()
    }

    fn amount(&self) -> Option<f64> {
        self.0
            .get("transaction")
            .and_then(|t| t.get("amount"))
            .and_then(Value::as_f64)
    }
}

#[derive(Debug, Clone)]
pub struct VertexClient {
    http: reqwest::Client,
    endpoint: String,
    access_token: String,
}

impl VertexClient {
    pub fn new(http: reqwest::Client, config: &Config) -> Result<Self> {
        let vertex = &config.vertex;
        let project = vertex
            .project_id
            .as_deref()
            .context("PROJECT_ID is required for the vertex backend")?;
        let access_token = vertex
            .access_token
            .clone()
            .context("VERTEX_ACCESS_TOKEN is required for the vertex backend")?;
        let endpoint = format!(
            "{}/projects/{}/locations/{}/publishers/google/models/{}:generateContent",
            vertex.endpoint_base(),
            project,
            vertex.location,
            vertex.model
        );
        Ok(Self {
            http,
            endpoint,
            access_token,
        })
    }

    async fn assess(&self, prompt: &PromptContext) -> Result<AiAssessment, AssessmentError> {
        let mut body = generate_content_body(prompt);
        body["generationConfig"]["responseSchema"] = json!({
            "type": "OBJECT",
            "properties": {
                "risk_score": {"type": "NUMBER"},
                "reasons": {"type": "ARRAY", "items": {"type": "STRING"}},
                "features_used": {"type": "ARRAY", "items": {"type": "STRING"}}
            },
            "required": ["risk_score", "reasons"]
        });
        let request = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.access_token)
            .json(&body);
        let text = send_generate_content(request, "vertex").await?;
        parse_assessment("vertex", &text)
    }
}

#[derive(Debug, Clone)]
pub struct StudioClient {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
}

impl StudioClient {
    pub fn new(http: reqwest::Client, config: &Config) -> Result<Self> {
        let studio = &config.studio;
        let api_key = studio
            .api_key
            .clone()
            .context("GOOGLE_API_KEY is required for the studio backend")?;
        let endpoint = format!("{}/models/{}:generateContent", studio.base_url, studio.model);
        Ok(Self {
            http,
            endpoint,
            api_key,
        })
    }

    async fn assess(&self, prompt: &PromptContext) -> Result<AiAssessment, AssessmentError> {
        let request = self
            .http
            .post(&self.endpoint)
            .header("x-goog-api-key", &self.api_key)
            .json(&generate_content_body(prompt));
        let text = send_generate_content(request, "studio").await?;
        parse_assessment("studio", &text)
    }
}

#[derive(Debug, Clone)]
pub enum AiBackend {
    Vertex(VertexClient),
    Studio(StudioClient),
    /// Amount-only rule; used only when explicitly configured.
    Heuristic,
}

impl AiBackend {
    pub fn from_config(kind: AiBackendKind, http: reqwest::Client, config: &Config) -> Result<Self> {
        Ok(match kind {
            AiBackendKind::Vertex => Self::Vertex(VertexClient::new(http, config)?),
            AiBackendKind::Studio => Self::Studio(StudioClient::new(http, config)?),
            AiBackendKind::Heuristic => Self::Heuristic,
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Vertex(_) => "vertex",
            Self::Studio(_) => "studio",
            Self::Heuristic => "heuristic",
        }
    }

    pub async fn assess(&self, prompt: &PromptContext) -> Result<AiAssessment, AssessmentError> {
        match self {
            Self::Vertex(client) => client.assess(prompt).await,
            Self::Studio(client) => client.assess(prompt).await,
            Self::Heuristic => heuristic_assessment(prompt),
        }
    }
}

fn heuristic_assessment(prompt: &PromptContext) -> Result<AiAssessment, AssessmentError> {
    let amount = prompt
        .amount()
        .ok_or_else(|| AssessmentError::MalformedAssessment {
            backend: "heuristic",
            message: "prompt carries no transaction amount".to_string(),
        })?;
    let risk_score = if amount <= HEURISTIC_AMOUNT_THRESHOLD {
        0.3
    } else {
        0.7
    };
    Ok(AiAssessment {
        risk_score,
        rationale: vec![
            "Heuristic assessment; no generative model consulted.".to_string(),
            format!("amount={amount}"),
        ],
        features_used: vec!["amount_threshold".to_string()],
        backend: "heuristic",
    })
}

fn generate_content_body(prompt: &PromptContext) -> Value {
    json!({
        "contents": [{
            "role": "user",
            "parts": [{"text": prompt.to_text()}]
        }],
        "generationConfig": {
            "temperature": 0.2,
            "topP": 0.8,
            "maxOutputTokens": 512,
            "responseMimeType": "application/json"
        }
    })
}

async fn send_generate_content(
    request: reqwest::RequestBuilder,
    backend: &'static str,
) -> Result<String, AssessmentError> {
    let response = request.send().await.map_err(|err| transport_error(backend, err))?;
    let status = response.status();
    let text = response
        .text()
        .await
        .map_err(|err| transport_error(backend, err))?;

    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(AssessmentError::Auth {
            backend,
            message: format!("status {status}"),
        });
    }
    if !status.is_success() {
        return Err(AssessmentError::Provider {
            backend,
            message: format!("status {status}: {}", truncate_chars(text.trim(), 200)),
        });
    }

    let parsed: Value = serde_json::from_str(&text).map_err(|err| {
        AssessmentError::MalformedAssessment {
            backend,
            message: format!("response is not JSON: {err}"),
        }
    })?;
    candidate_text(backend, &parsed)
}

fn transport_error(backend: &'static str, err: reqwest::Error) -> AssessmentError {
    if err.is_timeout() {
        AssessmentError::Timeout { backend, millis: 0 }
    } else {
        AssessmentError::Provider {
            backend,
            message: err.to_string(),
        }
    }
}

fn candidate_text(backend: &'static str, response: &Value) -> Result<String, AssessmentError> {
    if let Some(reason) = response
        .get("promptFeedback")
        .and_then(|f| f.get("blockReason"))
        .and_then(Value::as_str)
    {
        return Err(AssessmentError::Refused {
            backend,
            reason: reason.to_string(),
        });
    }

    let candidate = response
        .get("candidates")
        .and_then(Value::as_array)
        .and_then(|c| c.first())
        .ok_or_else(|| AssessmentError::MalformedAssessment {
            backend,
            message: "response has no candidates".to_string(),
        })?;

    if let Some(reason) = candidate.get("finishReason").and_then(Value::as_str) {
        if REFUSAL_FINISH_REASONS.contains(&reason) {
            return Err(AssessmentError::Refused {
                backend,
                reason: reason.to_string(),
            });
        }
    }

    let text = candidate
        .get("content")
        .and_then(|c| c.get("parts"))
        .and_then(Value::as_array)
        .map(|parts| {
            parts
                .iter()
                .filter_map(|p| p.get("text").and_then(Value::as_str))
                .collect::<String>()
        })
        .filter(|t| !t.trim().is_empty())
        .ok_or_else(|| AssessmentError::MalformedAssessment {
            backend,
            message: "candidate has no text content".to_string(),
        })?;
    Ok(text)
}

/// Validates untrusted model output. Scores outside `[0, 1]` are rejected,
/// never clamped.
pub fn parse_assessment(backend: &'static str, raw: &str) -> Result<AiAssessment, AssessmentError> {
    let malformed = |message: String| AssessmentError::MalformedAssessment { backend, message };

    let value: Value = serde_json::from_str(strip_code_fence(raw))
        .map_err(|err| malformed(format!("content is not JSON: {err}")))?;
    let risk_score = value
        .get("risk_score")
        .and_then(Value::as_f64)
        .ok_or_else(|| malformed("missing numeric risk_score".to_string()))?;
    if !risk_score.is_finite() || !(0.0..=1.0).contains(&risk_score) {
        return Err(malformed(format!("risk_score {risk_score} is outside [0, 1]")));
    }

    let mut rationale = bounded_strings(
        value.get("reasons").or_else(|| value.get("rationale")),
        MAX_RATIONALE_ITEMS,
        MAX_RATIONALE_CHARS,
    );
    if rationale.is_empty() {
        rationale.push("Model returned no reasons.".to_string());
    }
    let features_used = bounded_strings(
        value.get("features_used"),
        MAX_FEATURE_ITEMS,
        MAX_FEATURE_CHARS,
    );

    Ok(AiAssessment {
        risk_score,
        rationale,
        features_used,
        backend,
    })
}

fn strip_code_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = match rest.get(..4) {
        Some(tag) if tag.eq_ignore_ascii_case("json") => &rest[4..],
        _ => rest,
    };
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

fn bounded_strings(value: Option<&Value>, max_items: usize, max_chars: usize) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .take(max_items)
                .map(|s| truncate_chars(s, max_chars))
                .collect()
        })
        .unwrap_or_default()
}

fn truncate_chars(input: &str, max_chars: usize) -> String {
    input.chars().take(max_chars).collect()
}

#[derive(Debug, Clone, PartialEq)]
pub struct RoutedAssessment {
    pub assessment: AiAssessment,
    pub fallback_used: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("no AI backend produced an assessment (primary: {primary})")]
pub struct RoutingFailure {
    pub primary: AssessmentError,
    pub fallback: Option<AssessmentError>,
}

impl RoutingFailure {
    pub fn fallback_attempted(&self) -> bool {
        self.fallback.is_some()
    }
}

/// Primary-then-fallback routing. Each attempt is bounded by the AI timeout
/// and by what is left of the caller's budget; with a fallback configured the
/// primary gets at most half of that budget.
#[derive(Debug, Clone)]
pub struct AiRouter {
    primary: AiBackend,
    fallback: Option<AiBackend>,
    timeout: Duration,
}

impl AiRouter {
    pub fn new(primary: AiBackend, fallback: Option<AiBackend>, timeout: Duration) -> Self {
        Self {
            primary,
            fallback,
            timeout,
        }
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.ai_timeout)
            .build()
            .context("Failed to build AI provider HTTP client")?;
        let primary = AiBackend::from_config(config.primary_backend, http.clone(), config)?;
        let fallback = config
            .fallback_backend
            .map(|kind| AiBackend::from_config(kind, http.clone(), config))
            .transpose()?;
        Ok(Self::new(primary, fallback, config.ai_timeout))
    }

    pub fn primary_name(&self) -> &'static str {
        self.primary.name()
    }

    pub fn fallback_name(&self) -> Option<&'static str> {
        self.fallback.as_ref().map(AiBackend::name)
    }

    pub async fn assess(
        &self,
        prompt: &PromptContext,
        budget: Duration,
    ) -> Result<RoutedAssessment, RoutingFailure> {
        let started = Instant::now();
        let primary_budget = match self.fallback {
            Some(_) => budget / 2,
            None => budget,
        };
        let primary_err = match self.attempt(&self.primary, prompt, primary_budget).await {
            Ok(assessment) => {
                return Ok(RoutedAssessment {
                    assessment,
                    fallback_used: false,
                })
            }
            Err(err) => err,
        };

        let Some(fallback) = &self.fallback else {
            warn!(backend = self.primary.name(), error = %primary_err, "Primary AI backend failed; no fallback configured");
            return Err(RoutingFailure {
                primary: primary_err,
                fallback: None,
            });
        };

        warn!(
            backend = self.primary.name(),
            fallback = fallback.name(),
            error = %primary_err,
            "Primary AI backend failed; routing to fallback"
        );
        let remaining = budget.saturating_sub(started.elapsed());
        match self.attempt(fallback, prompt, remaining).await {
            Ok(assessment) => {
                info!(backend = fallback.name(), "Fallback AI backend produced an assessment");
                Ok(RoutedAssessment {
                    assessment,
                    fallback_used: true,
                })
            }
            Err(fallback_err) => {
                warn!(backend = fallback.name(), error = %fallback_err, "Fallback AI backend failed");
                Err(RoutingFailure {
                    primary: primary_err,
                    fallback: Some(fallback_err),
                })
            }
        }
    }

    async fn attempt(
        &self,
        backend: &AiBackend,
        prompt: &PromptContext,
        budget: Duration,
    ) -> Result<AiAssessment, AssessmentError> {
        let limit = self.timeout.min(budget);
        let millis = limit.as_millis() as u64;
        if limit.is_zero() {
            return Err(AssessmentError::Timeout {
                backend: backend.name(),
                millis,
            });
        }
        match time::timeout(limit, backend.assess(prompt)).await {
            Ok(Err(AssessmentError::Timeout { backend: name, .. })) => {
                Err(AssessmentError::Timeout {
                    backend: name,
                    millis,
                })
            }
            Ok(result) => result,
            Err(_) => Err(AssessmentError::Timeout {
                backend: backend.name(),
                millis,
            }),
        }
    }
}
