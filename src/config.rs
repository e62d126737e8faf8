use std::{env, net::SocketAddr, time::Duration};

use thiserror::Error;

use crate::policy::{Decision, DecisionPolicy, PolicyError};

const DEFAULT_USERS_API: &str = "http://userservice.default.svc.cluster.local";
const DEFAULT_TXN_API: &str = "http://transactionhistory.default.svc.cluster.local";
const DEFAULT_STUDIO_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Policy(#[from] PolicyError),
    #[error("{var} has unsupported value `{value}`. Supported: {supported}.")]
    UnsupportedValue {
        var: &'static str,
        value: String,
        supported: &'static str,
    },
    #[error("{var} must be a number, got `{value}`")]
    InvalidNumber { var: &'static str, value: String },
    #[error("{var} must be greater than zero")]
    ZeroDuration { var: &'static str },
    #[error("primary and fallback AI backend are both `{0}`")]
    SameBackend(&'static str),
    #[error("{var} is required when the `{backend}` AI backend is configured")]
    MissingCredential {
        backend: &'static str,
        var: &'static str,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AiBackendKind {
    Vertex,
    Studio,
    Heuristic,
}

impl AiBackendKind {
    pub fn parse(var: &'static str, value: &str) -> Result<Self, ConfigError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "vertex" | "vertexai" => Ok(Self::Vertex),
            "studio" | "gemini" => Ok(Self::Studio),
            "heuristic" => Ok(Self::Heuristic),
            other => Err(ConfigError::UnsupportedValue {
                var,
                value: other.to_string(),
                supported: "vertex, studio/gemini, heuristic",
            }),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Vertex => "vertex",
            Self::Studio => "studio",
            Self::Heuristic => "heuristic",
        }
    }
}

#[derive(Debug, Clone)]
pub struct VertexSettings {
    pub project_id: Option<String>,
    pub location: String,
    pub model: String,
    pub access_token: Option<String>,
    pub base_url: Option<String>,
}

impl VertexSettings {
    pub fn endpoint_base(&self) -> String {
        match &self.base_url {
            Some(base) => base.trim_end_matches('/').to_string(),
            None => format!("https://{}-aiplatform.googleapis.com/v1", self.location),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StudioSettings {
    pub api_key: Option<String>,
    pub model: String,
    pub base_url: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub api_key: Option<String>,
    pub users_api: String,
    pub txn_api: String,
    pub primary_backend: AiBackendKind,
    pub fallback_backend: Option<AiBackendKind>,
    pub policy: DecisionPolicy,
    pub fail_closed_decision: Decision,
    pub backend_timeout: Duration,
    pub ai_timeout: Duration,
    pub request_timeout: Duration,
    pub retry_backoff: Duration,
    pub transaction_limit: u32,
    pub vertex: VertexSettings,
    pub studio: StudioSettings,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().trim_matches('"').trim_matches('\'').to_string())
                .filter(|v| !v.is_empty())
        };

        let bind_addr = match get("GATEWAY_BIND_ADDR") {
            None => SocketAddr::from(([0, 0, 0, 0], 8080)),
            Some(raw) => raw
                .parse::<SocketAddr>()
                .map_err(|_| ConfigError::UnsupportedValue {
                    var: "GATEWAY_BIND_ADDR",
                    value: raw,
                    supported: "an ip:port socket address",
                })?,
        };

        let users_api = get("USERS_API")
            .unwrap_or_else(|| DEFAULT_USERS_API.to_string())
            .trim_end_matches('/')
            .to_string();
        let txn_api = get("TXN_API")
            .unwrap_or_else(|| DEFAULT_TXN_API.to_string())
            .trim_end_matches('/')
            .to_string();

        let primary_backend = match get("GATEWAY_PRIMARY_BACKEND") {
            Some(raw) => AiBackendKind::parse("GATEWAY_PRIMARY_BACKEND", &raw)?,
            None => AiBackendKind::Vertex,
        };
        let fallback_backend = match get("GATEWAY_FALLBACK_BACKEND") {
            Some(raw) if matches!(raw.to_ascii_lowercase().as_str(), "none" | "off") => None,
            Some(raw) => Some(AiBackendKind::parse("GATEWAY_FALLBACK_BACKEND", &raw)?),
            None => Some(AiBackendKind::Studio),
        };
        if fallback_backend == Some(primary_backend) {
            return Err(ConfigError::SameBackend(primary_backend.as_str()));
        }

        let low = parse_f64(&get, "GATEWAY_THRESHOLD_LOW", 0.3)?;
        let high = parse_f64(&get, "GATEWAY_THRESHOLD_HIGH", 0.6)?;
        let policy = DecisionPolicy::new(low, high)?;

        let fail_closed_decision = match get("GATEWAY_FAIL_CLOSED_DECISION") {
            None => Decision::Block,
            Some(raw) => match raw.to_ascii_lowercase().as_str() {
                "block" => Decision::Block,
                "review" => Decision::Review,
                other => {
                    return Err(ConfigError::UnsupportedValue {
                        var: "GATEWAY_FAIL_CLOSED_DECISION",
                        value: other.to_string(),
                        supported: "block, review",
                    })
                }
            },
        };

        let backend_timeout = parse_millis(&get, "GATEWAY_BACKEND_TIMEOUT_MS", 3_000)?;
        let ai_timeout = parse_millis(&get, "GATEWAY_AI_TIMEOUT_MS", 15_000)?;
        let request_timeout = parse_millis(&get, "GATEWAY_REQUEST_TIMEOUT_MS", 30_000)?;
        let retry_backoff = parse_millis(&get, "GATEWAY_RETRY_BACKOFF_MS", 200)?;

        let transaction_limit = match get("GATEWAY_TRANSACTION_LIMIT") {
            None => 50,
            Some(raw) => raw
                .parse::<u32>()
                .ok()
                .filter(|v| (1..=100).contains(v))
                .ok_or(ConfigError::InvalidNumber {
                    var: "GATEWAY_TRANSACTION_LIMIT",
                    value: raw,
                })?,
        };

        let vertex = VertexSettings {
            project_id: get("PROJECT_ID"),
            location: get("VERTEX_LOCATION").unwrap_or_else(|| "us-central1".to_string()),
            model: get("VERTEX_MODEL").unwrap_or_else(|| "gemini-1.5-pro".to_string()),
            access_token: get("VERTEX_ACCESS_TOKEN"),
            base_url: get("VERTEX_BASE_URL"),
        };
        let studio = StudioSettings {
            api_key: get("GOOGLE_API_KEY"),
            model: get("STUDIO_MODEL").unwrap_or_else(|| "gemini-1.5-flash".to_string()),
            base_url: get("STUDIO_BASE_URL")
                .unwrap_or_else(|| DEFAULT_STUDIO_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
        };

        let config = Self {
            bind_addr,
            api_key: get("GATEWAY_API_KEY"),
            users_api,
            txn_api,
            primary_backend,
            fallback_backend,
            policy,
            fail_closed_decision,
            backend_timeout,
            ai_timeout,
            request_timeout,
            retry_backoff,
            transaction_limit,
            vertex,
            studio,
        };
        config.validate_backend_credentials()?;
        Ok(config)
    }

    fn validate_backend_credentials(&self) -> Result<(), ConfigError> {
        let configured = std::iter::once(self.primary_backend).chain(self.fallback_backend);
        for kind in configured {
            match kind {
                AiBackendKind::Vertex => {
                    if self.vertex.project_id.is_none() {
                        return Err(ConfigError::MissingCredential {
                            backend: kind.as_str(),
                            var: "PROJECT_ID",
                        });
                    }
                    if self.vertex.access_token.is_none() {
                        return Err(ConfigError::MissingCredential {
                            backend: kind.as_str(),
                            var: "VERTEX_ACCESS_TOKEN",
                        });
                    }
                }
                AiBackendKind::Studio => {
                    if self.studio.api_key.is_none() {
                        return Err(ConfigError::MissingCredential {
                            backend: kind.as_str(),
                            var: "GOOGLE_API_KEY",
                        });
                    }
                }
                AiBackendKind::Heuristic => {}
            }
        }
        Ok(())
    }
}

fn parse_f64<G>(get: &G, var: &'static str, default: f64) -> Result<f64, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    match get(var) {
        None => Ok(default),
        Some(raw) => raw
            .parse::<f64>()
            .map_err(|_| ConfigError::InvalidNumber { var, value: raw }),
    }
}

fn parse_millis<G>(get: &G, var: &'static str, default: u64) -> Result<Duration, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    let millis = match get(var) {
        None => default,
        Some(raw) => raw
            .parse::<u64>()
            .map_err(|_| ConfigError::InvalidNumber { var, value: raw })?,
    };
    if millis == 0 {
        return Err(ConfigError::ZeroDuration { var });
    }
    Ok(Duration::from_millis(millis))
}
