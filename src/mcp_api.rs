use std::time::Instant;

use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, Response, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info};
use uuid::Uuid;

use crate::{auth::verify_bearer, tools::ToolError, AppState};

const MCP_SCHEMA_VERSION: &str = "2025-01";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JsonRpcRequest {
    jsonrpc: String,
    id: Option<Value>,
    method: String,
    params: Option<Value>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct JsonRpcSuccess {
    jsonrpc: &'static str,
    id: Value,
    result: Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct JsonRpcFailure {
    jsonrpc: &'static str,
    id: Value,
    error: JsonRpcError,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct JsonRpcError {
    code: i64,
    message: String,
    data: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ToolCallParams {
    name: String,
    #[serde(default)]
    arguments: Value,
}

pub async fn mcp(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<JsonRpcRequest>,
) -> impl IntoResponse {
    let request_id = request.id.clone().unwrap_or(Value::Null);

    if request.jsonrpc != "2.0" {
        return jsonrpc_error(
            request_id,
            -32600,
            "jsonrpc must be 2.0",
            json!({"code": "INVALID_REQUEST", "retryable": false}),
            StatusCode::BAD_REQUEST,
        );
    }

    if let Err(err) = verify_bearer(&headers, state.config.api_key.as_deref()) {
        return err.into_response();
    }

    let response = match request.method.as_str() {
        "ping" => jsonrpc_ok(
            request_id,
            json!({
                "schemaVersion": MCP_SCHEMA_VERSION,
                "ok": true,
            }),
        ),
        "initialize" => jsonrpc_ok(
            request_id,
            json!({
                "schemaVersion": MCP_SCHEMA_VERSION,
                "server": {
                    "name": env!("CARGO_PKG_NAME"),
                    "version": env!("CARGO_PKG_VERSION")
                },
                "capabilities": {
                    "tools": true,
                    "streaming": false
                }
            }),
        ),
        "tools/list" => jsonrpc_ok(
            request_id,
            json!({
                "schemaVersion": MCP_SCHEMA_VERSION,
                "tools": state.tools.list(),
            }),
        ),
        "tools/call" => {
            let params = match request
                .params
                .as_ref()
                .and_then(|value| serde_json::from_value::<ToolCallParams>(value.clone()).ok())
            {
                Some(params) => params,
                None => {
                    return jsonrpc_error(
                        request_id,
                        -32602,
                        "Invalid tool call parameters",
                        json!({"code": "SCHEMA_VIOLATION", "retryable": false}),
                        StatusCode::BAD_REQUEST,
                    )
                }
            };

            let trace_id = Uuid::new_v4().to_string();
            let start = Instant::now();
            let output = state.tools.invoke(&params.name, &params.arguments).await;
            let elapsed = start.elapsed().as_millis();

            match output {
                Ok(result) => {
                    info!(trace_id = %trace_id, tool = %params.name, timing_ms = elapsed as u64, "MCP tool call succeeded");
                    jsonrpc_ok(
                        request_id,
                        json!({
                            "schemaVersion": MCP_SCHEMA_VERSION,
                            "traceId": trace_id,
                            "tool": params.name,
                            "result": result,
                            "timingMs": elapsed,
                        }),
                    )
                }
                Err(err) => {
                    info!(trace_id = %trace_id, tool = %params.name, kind = err.kind(), "MCP tool call failed");
                    jsonrpc_error(
                        request_id,
                        rpc_code(&err),
                        err.to_string(),
                        json!({
                            "code": err.kind(),
                            "traceId": trace_id,
                            "retryable": err.retryable(),
                            "httpStatus": err.http_status().as_u16(),
                        }),
                        err.http_status(),
                    )
                }
            }
        }
        _ => jsonrpc_error(
            request_id,
            -32601,
            "Method not found",
            json!({"code": "METHOD_NOT_FOUND", "retryable": false}),
            StatusCode::NOT_FOUND,
        ),
    };

    debug!(method = %request.method, "MCP request handled");
    response
}

fn rpc_code(err: &ToolError) -> i64 {
    match err {
        ToolError::UnknownTool(_) => -32601,
        ToolError::SchemaViolation(_) => -32602,
        ToolError::NotFound(_) => -32004,
        ToolError::Unavailable(_) => -32003,
        ToolError::Unexpected(_) => -32603,
    }
}

fn jsonrpc_ok(id: Value, result: Value) -> Response<Body> {
    let payload = JsonRpcSuccess {
        jsonrpc: "2.0",
        id,
        result,
    };
    json_response(StatusCode::OK, &payload)
}

fn jsonrpc_error(
    id: Value,
    code: i64,
    message: impl Into<String>,
    data: Value,
    status: StatusCode,
) -> Response<Body> {
    let payload = JsonRpcFailure {
        jsonrpc: "2.0",
        id,
        error: JsonRpcError {
            code,
            message: message.into(),
            data,
        },
    };
    json_response(status, &payload)
}

fn json_response<T: Serialize>(status: StatusCode, payload: &T) -> Response<Body> {
    let body = serde_json::to_vec(payload).unwrap_or_else(|_| b"{}".to_vec());
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Body::from(body))
        .unwrap_or_else(|_| {
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error":{"code":"RESPONSE_BUILD_FAILED","message":"Failed building MCP response"}})),
            )
                .into_response()
        })
}
