use std::{collections::BTreeMap, time::Duration};

use axum::http::StatusCode;
use jsonschema::Validator;
use serde::Serialize;
use serde_json::{json, Map, Value};
use thiserror::Error;
use tokio::time;
use tracing::{info, warn};

use crate::backend_client::{BackendError, BankClient};

pub const USER_PROFILE_TOOL: &str = "get_user_profile";
pub const TRANSACTIONS_TOOL: &str = "get_transactions";
pub const FLAG_TRANSACTION_TOOL: &str = "flag_transaction";

const DEFAULT_TRANSACTION_LIMIT: u64 = 25;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("tool `{0}` is registered more than once")]
    DuplicateTool(String),
    #[error("tool `{tool}` has an invalid {which} schema: {message}")]
    InvalidSchema {
        tool: String,
        which: &'static str,
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ToolError {
    #[error("Unknown tool: {0}")]
    UnknownTool(String),
    #[error("Arguments do not match the input schema: {0}")]
    SchemaViolation(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Unavailable(String),
    #[error("{0}")]
    Unexpected(String),
}

impl ToolError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UnknownTool(_) => "UNKNOWN_TOOL",
            Self::SchemaViolation(_) => "SCHEMA_VIOLATION",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Unavailable(_) => "UNAVAILABLE",
            Self::Unexpected(_) => "UNEXPECTED",
        }
    }

    pub fn retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }

    pub fn http_status(&self) -> StatusCode {
        match self {
            Self::UnknownTool(_) => StatusCode::NOT_FOUND,
            Self::SchemaViolation(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Unexpected(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

impl From<BackendError> for ToolError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::NotFound(message) => Self::NotFound(message),
            BackendError::Unavailable(message) => Self::Unavailable(message),
            BackendError::Unexpected(message) => Self::Unexpected(message),
        }
    }
}

/// Wire shape of one invocation: `{"success": payload}` or
/// `{"failure": {"kind": ..., "message": ...}}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolOutcome {
    Success(Value),
    Failure { kind: &'static str, message: String },
}

impl From<Result<Value, ToolError>> for ToolOutcome {
    fn from(result: Result<Value, ToolError>) -> Self {
        match result {
            Ok(payload) => Self::Success(payload),
            Err(err) => Self::Failure {
                kind: err.kind(),
                message: err.to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolHandler {
    UserProfile,
    Transactions,
    FlagTransaction,
}

#[derive(Debug, Clone)]
pub struct ToolSpec {
    pub name: &'static str,
    pub description: &'static str,
    pub input_schema: Value,
    pub output_schema: Value,
    pub handler: ToolHandler,
}

struct ToolDescriptor {
    spec: ToolSpec,
    input: Validator,
    output: Validator,
}

pub struct ToolRegistry {
    tools: BTreeMap<&'static str, ToolDescriptor>,
    client: BankClient,
    call_timeout: Duration,
}

impl ToolRegistry {
    pub fn build(
        specs: Vec<ToolSpec>,
        client: BankClient,
        call_timeout: Duration,
    ) -> Result<Self, RegistryError> {
        let mut tools = BTreeMap::new();
        for spec in specs {
            if tools.contains_key(spec.name) {
                return Err(RegistryError::DuplicateTool(spec.name.to_string()));
            }
            let input = compile(spec.name, "input", &spec.input_schema)?;
            let output = compile(spec.name, "output", &spec.output_schema)?;
            tools.insert(
                spec.name,
                ToolDescriptor {
                    spec,
                    input,
                    output,
                },
            );
        }

        info!(tools = tools.len(), "Tool registry built");
        Ok(Self {
            tools,
            client,
            call_timeout,
        })
    }

    pub fn standard(client: BankClient, call_timeout: Duration) -> Result<Self, RegistryError> {
        Self::build(standard_catalog(), client, call_timeout)
    }

    pub fn list(&self) -> Vec<Value> {
        self.tools
            .values()
            .map(|tool| {
                json!({
                    "name": tool.spec.name,
                    "description": tool.spec.description,
                    "inputSchema": tool.spec.input_schema,
                    "outputSchema": tool.spec.output_schema,
                })
            })
            .collect()
    }

    pub async fn invoke(&self, name: &str, arguments: &Value) -> Result<Value, ToolError> {
        let Some(tool) = self.tools.get(name) else {
            return Err(ToolError::UnknownTool(name.to_string()));
        };

        let empty = Value::Object(Map::new());
        let arguments = if arguments.is_null() { &empty } else { arguments };

        let violations = tool
            .input
            .iter_errors(arguments)
            .map(|e| e.to_string())
            .collect::<Vec<_>>();
        if !violations.is_empty() {
            return Err(ToolError::SchemaViolation(violations.join("; ")));
        }

        let call = self.dispatch(tool.spec.handler, arguments);
        let payload = match time::timeout(self.call_timeout, call).await {
            Ok(result) => result?,
            Err(_) => {
                warn!(tool = %name, "Tool call timed out");
                return Err(ToolError::Unavailable(format!(
                    "{name} timed out after {} ms",
                    self.call_timeout.as_millis()
                )));
            }
        };

        if !tool.output.is_valid(&payload) {
            return Err(ToolError::Unexpected(format!(
                "{name} produced a payload that does not match its output schema"
            )));
        }
        Ok(payload)
    }

    async fn dispatch(&self, handler: ToolHandler, args: &Value) -> Result<Value, ToolError> {
        match handler {
            ToolHandler::UserProfile => {
                let user_id = required_str(args, "user_id")?;
                Ok(self.client.fetch_user_profile(user_id).await?)
            }
            ToolHandler::Transactions => {
                let user_id = required_str(args, "user_id")?;
                let limit = args
                    .get("limit")
                    .and_then(Value::as_u64)
                    .unwrap_or(DEFAULT_TRANSACTION_LIMIT)
                    .clamp(1, 100) as u32;
                Ok(self.client.fetch_transactions(user_id, limit).await?)
            }
            ToolHandler::FlagTransaction => {
                let txn_id = required_str(args, "txn_id")?;
                let reason = required_str(args, "reason")?;
                info!(txn_id = %txn_id, reason = %reason, "Transaction flagged for review");
                Ok(json!({
                    "txn_id": txn_id,
                    "flagged": true,
                    "reason": reason,
                }))
            }
        }
    }
}

fn compile(tool: &str, which: &'static str, schema: &Value) -> Result<Validator, RegistryError> {
    jsonschema::validator_for(schema).map_err(|err| RegistryError::InvalidSchema {
        tool: tool.to_string(),
        which,
        message: err.to_string(),
    })
}

fn required_str<'a>(args: &'a Value, field: &str) -> Result<&'a str, ToolError> {
    args.get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| ToolError::SchemaViolation(format!("Missing required string field: {field}")))
}

fn identifier_schema() -> Value {
    json!({"type": "string", "minLength": 1, "maxLength": 128})
}

pub fn standard_catalog() -> Vec<ToolSpec> {
    vec![
        ToolSpec {
            name: USER_PROFILE_TOOL,
            description: "Fetch a user profile by user id",
            input_schema: json!({
                "type": "object",
                "required": ["user_id"],
                "properties": {"user_id": identifier_schema()},
                "additionalProperties": false
            }),
            output_schema: json!({"type": "object"}),
            handler: ToolHandler::UserProfile,
        },
        ToolSpec {
            name: TRANSACTIONS_TOOL,
            description: "Fetch recent transactions for a user id",
            input_schema: json!({
                "type": "object",
                "required": ["user_id"],
                "properties": {
                    "user_id": identifier_schema(),
                    "limit": {"type": "integer", "minimum": 1, "maximum": 100}
                },
                "additionalProperties": false
            }),
            output_schema: json!({
                "type": "object",
                "required": ["items"],
                "properties": {"items": {"type": "array"}}
            }),
            handler: ToolHandler::Transactions,
        },
        ToolSpec {
            name: FLAG_TRANSACTION_TOOL,
            description: "Flag a transaction for manual review",
            input_schema: json!({
                "type": "object",
                "required": ["txn_id", "reason"],
                "properties": {
                    "txn_id": identifier_schema(),
                    "reason": {"type": "string", "minLength": 1, "maxLength": 500}
                },
                "additionalProperties": false
            }),
            output_schema: json!({
                "type": "object",
                "required": ["txn_id", "flagged", "reason"],
                "properties": {
                    "txn_id": {"type": "string"},
                    "flagged": {"type": "boolean"},
                    "reason": {"type": "string"}
                }
            }),
            handler: ToolHandler::FlagTransaction,
        },
    ]
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use httpmock::{Method::GET, MockServer};
    use serde_json::json;

    use super::{
        standard_catalog, RegistryError, ToolError, ToolOutcome, ToolRegistry,
        FLAG_TRANSACTION_TOOL, TRANSACTIONS_TOOL, USER_PROFILE_TOOL,
    };
    use crate::backend_client::BankClient;

    fn registry(base_url: &str, timeout_ms: u64) -> ToolRegistry {
        let client =
            BankClient::new(base_url, base_url, Duration::from_secs(5)).expect("client");
        ToolRegistry::standard(client, Duration::from_millis(timeout_ms)).expect("registry")
    }

    #[test]
    fn duplicate_tool_names_fail_registration() {
        let mut specs = standard_catalog();
        specs.push(standard_catalog().remove(0));
        let client =
            BankClient::new("http://localhost", "http://localhost", Duration::from_secs(1))
                .expect("client");
        let err = ToolRegistry::build(specs, client, Duration::from_secs(1))
            .err()
            .expect("duplicate must fail");
        assert_eq!(err, RegistryError::DuplicateTool(USER_PROFILE_TOOL.to_string()));
    }

    #[test]
    fn listing_is_sorted_and_carries_schemas() {
        let registry = registry("http://localhost", 1_000);
        let listing = registry.list();
        let names = listing
            .iter()
            .map(|tool| tool["name"].as_str().unwrap_or_default().to_string())
            .collect::<Vec<_>>();
        assert_eq!(
            names,
            vec![FLAG_TRANSACTION_TOOL, TRANSACTIONS_TOOL, USER_PROFILE_TOOL]
        );
        assert!(listing
            .iter()
            .all(|tool| tool["inputSchema"].is_object() && tool["outputSchema"].is_object()));
    }

    #[tokio::test]
    async fn unknown_tool_fails_regardless_of_arguments() {
        let registry = registry("http://localhost", 1_000);
        for args in [json!(null), json!({}), json!({"user_id": "alice"}), json!([1, 2])] {
            let err = registry.invoke("delete_account", &args).await.expect_err("unknown");
            assert_eq!(err, ToolError::UnknownTool("delete_account".to_string()));
        }
    }

    #[tokio::test]
    async fn schema_violations_are_rejected_before_dispatch() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET);
                then.status(200).json_body(json!({}));
            })
            .await;
        let registry = registry(&server.base_url(), 1_000);

        let cases = [
            (USER_PROFILE_TOOL, json!({})),
            (USER_PROFILE_TOOL, json!({"user_id": 42})),
            (USER_PROFILE_TOOL, json!({"user_id": "alice", "admin": true})),
            (USER_PROFILE_TOOL, json!({"user_id": ""})),
            (TRANSACTIONS_TOOL, json!({"user_id": "alice", "limit": "ten"})),
            (TRANSACTIONS_TOOL, json!({"user_id": "alice", "limit": 0})),
            (FLAG_TRANSACTION_TOOL, json!({"txn_id": "t-1"})),
        ];
        for (tool, args) in cases {
            let err = registry.invoke(tool, &args).await.expect_err("violation");
            assert!(
                matches!(err, ToolError::SchemaViolation(_)),
                "{tool} {args} gave {err:?}"
            );
        }
        mock.assert_hits_async(0).await;
    }

    #[tokio::test]
    async fn user_profile_dispatches_to_backend() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/users/alice");
                then.status(200).json_body(json!({"username": "alice"}));
            })
            .await;
        let registry = registry(&server.base_url(), 1_000);

        let payload = registry
            .invoke(USER_PROFILE_TOOL, &json!({"user_id": "alice"}))
            .await
            .expect("profile");
        assert_eq!(payload, json!({"username": "alice"}));
    }

    #[tokio::test]
    async fn transactions_default_limit_is_sent() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/transactions")
                    .query_param("user", "alice")
                    .query_param("limit", "25");
                then.status(200).json_body(json!([]));
            })
            .await;
        let registry = registry(&server.base_url(), 1_000);

        let payload = registry
            .invoke(TRANSACTIONS_TOOL, &json!({"user_id": "alice"}))
            .await
            .expect("transactions");
        mock.assert_async().await;
        assert_eq!(payload, json!({"items": []}));
    }

    #[tokio::test]
    async fn backend_kinds_map_to_tool_kinds() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/users/ghost");
                then.status(404);
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/users/busy");
                then.status(502);
            })
            .await;
        let registry = registry(&server.base_url(), 1_000);

        let not_found = registry
            .invoke(USER_PROFILE_TOOL, &json!({"user_id": "ghost"}))
            .await
            .expect_err("404");
        assert_eq!(not_found.kind(), "NOT_FOUND");

        let busy = registry
            .invoke(USER_PROFILE_TOOL, &json!({"user_id": "busy"}))
            .await
            .expect_err("502");
        assert_eq!(busy.kind(), "UNAVAILABLE");
        assert!(busy.retryable());
    }

    #[tokio::test]
    async fn per_call_timeout_reports_unavailable() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/users/slow");
                then.status(200)
                    .delay(Duration::from_millis(500))
                    .json_body(json!({}));
            })
            .await;
        let registry = registry(&server.base_url(), 50);

        let err = registry
            .invoke(USER_PROFILE_TOOL, &json!({"user_id": "slow"}))
            .await
            .expect_err("timeout");
        assert!(matches!(err, ToolError::Unavailable(_)));
    }

    #[tokio::test]
    async fn non_object_profile_violates_output_contract() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/users/odd");
                then.status(200).json_body(json!(["not", "a", "profile"]));
            })
            .await;
        let registry = registry(&server.base_url(), 1_000);

        let err = registry
            .invoke(USER_PROFILE_TOOL, &json!({"user_id": "odd"}))
            .await
            .expect_err("bad shape");
        assert_eq!(err.kind(), "UNEXPECTED");
    }

    #[tokio::test]
    async fn flag_transaction_acknowledges_without_backend() {
        let registry = registry("http://127.0.0.1:9", 1_000);
        let outcome: ToolOutcome = registry
            .invoke(
                FLAG_TRANSACTION_TOOL,
                &json!({"txn_id": "t-9", "reason": "card testing pattern"}),
            )
            .await
            .into();
        assert_eq!(
            serde_json::to_value(outcome).expect("serialize"),
            json!({"success": {"txn_id": "t-9", "flagged": true, "reason": "card testing pattern"}})
        );
    }

    #[test]
    fn failure_outcome_serializes_kind_and_message() {
        let outcome = ToolOutcome::from(Err(ToolError::UnknownTool("nope".to_string())));
        assert_eq!(
            serde_json::to_value(outcome).expect("serialize"),
            json!({"failure": {"kind": "UNKNOWN_TOOL", "message": "Unknown tool: nope"}})
        );
    }
}
