use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::{StatusCode, Url};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::debug;

const MAX_IDENTIFIER_LEN: usize = 128;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Unavailable(String),
    #[error("{0}")]
    Unexpected(String),
}

/// Read-only client for the user and transaction-history services.
///
/// Every operation issues exactly one request and never retries.
#[derive(Debug, Clone)]
pub struct BankClient {
    users_base: Url,
    txn_base: Url,
    http: reqwest::Client,
}

impl BankClient {
    pub fn new(users_api: &str, txn_api: &str, timeout: Duration) -> Result<Self> {
        let users_base = Url::parse(users_api.trim_end_matches('/'))
            .with_context(|| format!("Invalid USERS_API base address: {users_api}"))?;
        let txn_base = Url::parse(txn_api.trim_end_matches('/'))
            .with_context(|| format!("Invalid TXN_API base address: {txn_api}"))?;
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build backend HTTP client")?;

        Ok(Self {
            users_base,
            txn_base,
            http,
        })
    }

    pub async fn fetch_user_profile(&self, user_id: &str) -> Result<Value, BackendError> {
        validate_identifier(user_id)?;
        let url = join_segments(&self.users_base, &["users", user_id])?;
        let payload = self.get_json(url).await?;
        if !payload.is_object() {
            return Err(BackendError::Unexpected(
                "user service returned a non-object profile".to_string(),
            ));
        }
        Ok(payload)
    }

    /// Returns `{ "items": [...] }` whether the service answers with a bare
    /// array or an object wrapping one.
    pub async fn fetch_transactions(&self, user_id: &str, limit: u32) -> Result<Value, BackendError> {
        validate_identifier(user_id)?;
        let mut url = join_segments(&self.txn_base, &["transactions"])?;
        url.query_pairs_mut()
            .append_pair("user", user_id)
            .append_pair("limit", &limit.to_string());

        let payload = self.get_json(url).await?;
        let items = match payload {
            Value::Array(items) => items,
            Value::Object(mut map) => match map.remove("items") {
                Some(Value::Array(items)) => items,
                _ => {
                    return Err(BackendError::Unexpected(
                        "transaction service response is missing an items array".to_string(),
                    ))
                }
            },
            _ => {
                return Err(BackendError::Unexpected(
                    "transaction service returned neither an array nor an object".to_string(),
                ))
            }
        };
        Ok(json!({ "items": items }))
    }

    async fn get_json(&self, url: Url) -> Result<Value, BackendError> {
        let response = self
            .http
            .get(url.clone())
            .send()
            .await
            .map_err(|err| classify_transport(&url, err))?;

        let status = response.status();
        debug!(url = %url, status = status.as_u16(), "Backend response");

        if status == StatusCode::NOT_FOUND {
            return Err(BackendError::NotFound(format!("{} returned 404", url.path())));
        }
        if matches!(
            status,
            StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT
        ) {
            return Err(BackendError::Unavailable(format!(
                "{} returned {status}",
                url.path()
            )));
        }
        if !status.is_success() {
            return Err(BackendError::Unexpected(format!(
                "{} returned {status}",
                url.path()
            )));
        }

        response
            .json::<Value>()
            .await
            .map_err(|err| classify_transport(&url, err))
    }
}

fn classify_transport(url: &Url, err: reqwest::Error) -> BackendError {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        BackendError::Unavailable(format!("{} unreachable: {err}", url.path()))
    } else {
        BackendError::Unexpected(format!("{} failed: {err}", url.path()))
    }
}

fn join_segments(base: &Url, segments: &[&str]) -> Result<Url, BackendError> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|_| BackendError::Unexpected(format!("{base} cannot carry a path")))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

fn validate_identifier(id: &str) -> Result<(), BackendError> {
    if id.trim().is_empty() {
        return Err(BackendError::Unexpected("identifier must not be empty".to_string()));
    }
    if id.chars().count() > MAX_IDENTIFIER_LEN {
        return Err(BackendError::Unexpected(format!(
            "identifier exceeds {MAX_IDENTIFIER_LEN} characters"
        )));
    }
    if id.chars().all(|c| c == '.') {
        return Err(BackendError::Unexpected(
            "identifier must not be a dot segment".to_string(),
        ));
    }
    if id.chars().any(char::is_control) {
        return Err(BackendError::Unexpected(
            "identifier contains control characters".to_string(),
        ));
    }
    Ok(())
}
