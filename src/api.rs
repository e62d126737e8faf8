use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{rejection::JsonRejection, Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use serde_json::{json, Value};
use tracing::warn;

use crate::{
    auth::verify_bearer,
    gateway::GatewayError,
    models::{error_body, ScoreRequest},
    tools::ToolOutcome,
    AppState,
};

pub const REQUEST_TIMEOUT_HEADER: &str = "x-request-timeout-ms";

pub async fn healthz() -> impl IntoResponse {
    Json(json!({ "ok": true, "timestamp": Utc::now() }))
}

pub async fn score(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<ScoreRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match payload {
        Ok(payload) => payload,
        Err(rejection) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                "INVALID_REQUEST",
                rejection.body_text(),
            )
        }
    };

    let client_deadline = match client_deadline(&headers) {
        Ok(deadline) => deadline,
        Err(message) => return error_response(StatusCode::BAD_REQUEST, "INVALID_REQUEST", message),
    };

    match state.gateway.score(request, client_deadline).await {
        Ok(envelope) => (StatusCode::OK, Json(envelope)).into_response(),
        Err(GatewayError::InvalidRequest(err)) => {
            error_response(StatusCode::BAD_REQUEST, "INVALID_REQUEST", err.to_string())
        }
        Err(err @ GatewayError::DeadlineExceeded(_)) => {
            error_response(StatusCode::GATEWAY_TIMEOUT, "DEADLINE_EXCEEDED", err.to_string())
        }
    }
}

pub async fn list_tools(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(err) = verify_bearer(&headers, state.config.api_key.as_deref()) {
        return err.into_response();
    }

    Json(json!({ "tools": state.tools.list() })).into_response()
}

pub async fn invoke_tool(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(name): Path<String>,
    body: Bytes,
) -> Response {
    if let Err(err) = verify_bearer(&headers, state.config.api_key.as_deref()) {
        return err.into_response();
    }

    let arguments = if body.is_empty() {
        Value::Null
    } else {
        match serde_json::from_slice::<Value>(&body) {
            Ok(arguments) => arguments,
            Err(err) => {
                return error_response(
                    StatusCode::BAD_REQUEST,
                    "INVALID_REQUEST",
                    format!("Tool arguments must be JSON: {err}"),
                )
            }
        }
    };

    let result = state.tools.invoke(&name, &arguments).await;
    let status = match &result {
        Ok(_) => StatusCode::OK,
        Err(err) => {
            warn!(tool = %name, kind = err.kind(), error = %err, "Tool invocation failed");
            err.http_status()
        }
    };
    (status, Json(ToolOutcome::from(result))).into_response()
}

fn client_deadline(headers: &HeaderMap) -> Result<Option<Duration>, String> {
    let Some(raw) = headers.get(REQUEST_TIMEOUT_HEADER) else {
        return Ok(None);
    };
    let millis = raw
        .to_str()
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .filter(|v| *v > 0)
        .ok_or_else(|| format!("{REQUEST_TIMEOUT_HEADER} must be a positive integer"))?;
    Ok(Some(Duration::from_millis(millis)))
}

fn error_response(status: StatusCode, code: &str, message: impl Into<String>) -> Response {
    (status, Json(error_body(code, message))).into_response()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use httpmock::{
        Method::{GET, POST},
        MockServer,
    };
    use serde_json::{json, Value};

    use crate::{
        build_router,
        testing::{config_for, gemini_response, state_for, VERTEX_PATH},
    };

    async fn serve(server: &MockServer, extra: &[(&str, &str)]) -> String {
        let app = build_router(state_for(config_for(&server.base_url(), extra)));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve");
        });
        format!("http://{addr}")
    }

    async fn mock_happy_path(server: &MockServer, score: f64) {
        server
            .mock_async(|when, then| {
                when.method(GET).path("/users/alice");
                then.status(200).json_body(json!({"username": "alice"}));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/transactions");
                then.status(200).json_body(json!([]));
            })
            .await;
        let text = json!({"risk_score": score, "reasons": ["fine"]}).to_string();
        server
            .mock_async(|when, then| {
                when.method(POST).path(VERTEX_PATH);
                then.status(200).json_body(gemini_response(&text));
            })
            .await;
    }

    #[tokio::test]
    async fn healthz_reports_ok() {
        let server = MockServer::start_async().await;
        let base = serve(&server, &[]).await;
        let body: Value = reqwest::get(format!("{base}/healthz"))
            .await
            .expect("request")
            .json()
            .await
            .expect("json");
        assert_eq!(body["ok"], json!(true));
    }

    #[tokio::test]
    async fn score_returns_envelope() {
        let server = MockServer::start_async().await;
        mock_happy_path(&server, 0.2).await;
        let base = serve(&server, &[]).await;

        let response = reqwest::Client::new()
            .post(format!("{base}/fraud/score"))
            .json(&json!({
                "user_id": "alice",
                "txn_id": "t-1",
                "amount": 1200.0,
                "merchant": "Coffee",
                "geo": "US"
            }))
            .send()
            .await
            .expect("request");
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        let body: Value = response.json().await.expect("json");
        assert_eq!(body["decision"], json!("ALLOW"));
        assert_eq!(body["ai_backend"], json!("vertex"));
        assert_eq!(body["txn_id"], json!("t-1"));
        assert_eq!(body["user_summary"]["id"], json!("alice"));
    }

    #[tokio::test]
    async fn score_rejects_invalid_bodies() {
        let server = MockServer::start_async().await;
        let base = serve(&server, &[]).await;
        let client = reqwest::Client::new();

        for body in [
            json!({"user_id": "alice", "txn_id": "t-1", "amount": -1}),
            json!({"user_id": "", "txn_id": "t-1", "amount": 1}),
            json!({"user_id": "alice", "txn_id": "t-1", "amount": "lots"}),
        ] {
            let response = client
                .post(format!("{base}/fraud/score"))
                .json(&body)
                .send()
                .await
                .expect("request");
            assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST, "{body}");
            let payload: Value = response.json().await.expect("json");
            assert_eq!(payload["error"]["code"], json!("INVALID_REQUEST"));
        }
    }

    #[tokio::test]
    async fn score_honours_client_deadline_header() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET);
                then.status(200)
                    .delay(Duration::from_millis(800))
                    .json_body(json!({}));
            })
            .await;
        let base = serve(&server, &[]).await;

        let response = reqwest::Client::new()
            .post(format!("{base}/fraud/score"))
            .header("x-request-timeout-ms", "100")
            .json(&json!({"user_id": "alice", "txn_id": "t-1", "amount": 5}))
            .send()
            .await
            .expect("request");
        assert_eq!(response.status(), reqwest::StatusCode::GATEWAY_TIMEOUT);
        let payload: Value = response.json().await.expect("json");
        assert_eq!(payload["error"]["code"], json!("DEADLINE_EXCEEDED"));
    }

    #[tokio::test]
    async fn tool_surface_lists_and_invokes() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/users/bob");
                then.status(404);
            })
            .await;
        let base = serve(&server, &[]).await;
        let client = reqwest::Client::new();

        let listing: Value = client
            .get(format!("{base}/v1/tools"))
            .send()
            .await
            .expect("request")
            .json()
            .await
            .expect("json");
        assert_eq!(listing["tools"].as_array().map(Vec::len), Some(3));

        let flagged = client
            .post(format!("{base}/v1/tools/flag_transaction"))
            .json(&json!({"txn_id": "t-9", "reason": "velocity"}))
            .send()
            .await
            .expect("request");
        assert_eq!(flagged.status(), reqwest::StatusCode::OK);
        let flagged: Value = flagged.json().await.expect("json");
        assert_eq!(flagged["success"]["flagged"], json!(true));

        let missing = client
            .post(format!("{base}/v1/tools/get_user_profile"))
            .json(&json!({"user_id": "bob"}))
            .send()
            .await
            .expect("request");
        assert_eq!(missing.status(), reqwest::StatusCode::NOT_FOUND);
        let missing: Value = missing.json().await.expect("json");
        assert_eq!(missing["failure"]["kind"], json!("NOT_FOUND"));

        let unknown = client
            .post(format!("{base}/v1/tools/delete_account"))
            .send()
            .await
            .expect("request");
        let unknown: Value = unknown.json().await.expect("json");
        assert_eq!(unknown["failure"]["kind"], json!("UNKNOWN_TOOL"));
    }

    #[tokio::test]
    async fn tool_surface_requires_bearer_when_configured() {
        let server = MockServer::start_async().await;
        let base = serve(&server, &[("GATEWAY_API_KEY", "s3cret")]).await;
        let client = reqwest::Client::new();

        let denied = client
            .get(format!("{base}/v1/tools"))
            .send()
            .await
            .expect("request");
        assert_eq!(denied.status(), reqwest::StatusCode::UNAUTHORIZED);

        let allowed = client
            .get(format!("{base}/v1/tools"))
            .bearer_auth("s3cret")
            .send()
            .await
            .expect("request");
        assert_eq!(allowed.status(), reqwest::StatusCode::OK);
    }
}
