mod ai_backend;
mod api;
mod auth;
mod backend_client;
mod config;
mod gateway;
mod mcp_api;
mod models;
mod policy;
#[cfg(test)]
mod testing;
mod tools;

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    routing::{get, post},
    Router,
};
use backend_client::BankClient;
use config::Config;
use gateway::ScoringGateway;
use tools::ToolRegistry;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::info;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub tools: Arc<ToolRegistry>,
    pub gateway: Arc<ScoringGateway>,
}

pub fn build_state(config: Config) -> Result<AppState> {
    let client = BankClient::new(&config.users_api, &config.txn_api, config.backend_timeout)?;
    let tools = Arc::new(
        ToolRegistry::standard(client, config.backend_timeout)
            .context("Failed to build tool registry")?,
    );
    let gateway = Arc::new(ScoringGateway::from_config(&config, tools.clone())?);

    Ok(AppState {
        config: Arc::new(config),
        tools,
        gateway,
    })
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(api::healthz))
        .route("/fraud/score", post(api::score))
        .route("/v1/tools", get(api::list_tools))
        .route("/v1/tools/{name}", post(api::invoke_tool))
        .route("/mcp", post(mcp_api::mcp))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fraud_agent_gateway=info,tower_http=info".into()),
        )
        .init();

    let config = Config::from_env().context("Invalid gateway configuration")?;
    let bind_addr = config.bind_addr;
    let state = build_state(config)?;
    info!(
        primary = state.gateway.primary_backend(),
        fallback = state.gateway.fallback_backend().unwrap_or("none"),
        threshold_low = state.config.policy.low(),
        threshold_high = state.config.policy.high(),
        tools = state.tools.list().len(),
        "Scoring gateway configured"
    );

    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    info!("fraud-agent-gateway listening on {}", bind_addr);
    axum::serve(listener, app).await?;
    Ok(())
}
