//! Shared fixtures for tests that run against an `httpmock` server standing in
//! for the bank services and both model providers.

use std::{collections::HashMap, sync::Arc};

use serde_json::{json, Value};

use crate::{build_state, config::Config, gateway::ScoringGateway, AppState};

pub const VERTEX_PATH: &str =
    "/projects/test-project/locations/us-central1/publishers/google/models/gemini-1.5-pro:generateContent";
pub const STUDIO_PATH: &str = "/models/gemini-1.5-flash:generateContent";

/// Configuration with every upstream pointed at `base_url`. `extra` entries
/// override the defaults.
pub fn config_for(base_url: &str, extra: &[(&str, &str)]) -> Config {
    let mut vars: HashMap<String, String> = [
        ("USERS_API", base_url),
        ("TXN_API", base_url),
        ("VERTEX_BASE_URL", base_url),
        ("STUDIO_BASE_URL", base_url),
        ("PROJECT_ID", "test-project"),
        ("VERTEX_ACCESS_TOKEN", "vertex-token"),
        ("GOOGLE_API_KEY", "studio-key"),
        ("GATEWAY_BACKEND_TIMEOUT_MS", "1000"),
        ("GATEWAY_AI_TIMEOUT_MS", "2000"),
        ("GATEWAY_RETRY_BACKOFF_MS", "10"),
    ]
    .iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();
    for (key, value) in extra {
        vars.insert(key.to_string(), value.to_string());
    }
    Config::from_lookup(move |key| vars.get(key).cloned()).expect("test config")
}

pub fn state_for(config: Config) -> AppState {
    build_state(config).expect("test state")
}

pub fn gateway_for(config: &Config) -> Arc<ScoringGateway> {
    state_for(config.clone()).gateway
}

pub fn gemini_response(text: &str) -> Value {
    json!({
        "candidates": [{
            "content": {"role": "model", "parts": [{"text": text}]},
            "finishReason": "STOP"
        }]
    })
}
