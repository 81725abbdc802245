//! API request and response types.

use crate::coordinator::{ExecutionRequest, ResetSummary};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;
use utoipa::ToSchema;

/// Body of `POST /api/v1/exec`.
#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ExecBody {
    /// Statements to run. Bind `result` to choose the returned value.
    pub code: String,
    /// Variables bound while the code runs.
    #[serde(default)]
    #[schema(value_type = Object)]
    pub variables: Map<String, Value>,
    /// Per-call timeout (default: server setting).
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Clear the worker's namespace first.
    #[serde(default)]
    pub fresh: bool,
}

/// Body of `POST /api/v1/eval`.
#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct EvalBody {
    /// A single expression.
    pub expression: String,
    #[serde(default)]
    #[schema(value_type = Object)]
    pub variables: Map<String, Value>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub fresh: bool,
}

/// Body of `POST /api/v1/call-module`.
#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CallModuleBody {
    /// Module to import, e.g. `math` or `os.path`.
    pub module: String,
    /// Function to call; a dotted attribute path is allowed.
    pub function: String,
    #[serde(default)]
    #[schema(value_type = Vec<Object>)]
    pub args: Vec<Value>,
    #[serde(default)]
    #[schema(value_type = Object)]
    pub kwargs: Map<String, Value>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

fn with_options(mut request: ExecutionRequest, timeout_ms: Option<u64>, fresh: bool) -> ExecutionRequest {
    if let Some(ms) = timeout_ms {
        request = request.with_timeout(Duration::from_millis(ms));
    }
    if fresh {
        request = request.fresh();
    }
    request
}

impl From<ExecBody> for ExecutionRequest {
    fn from(body: ExecBody) -> Self {
        with_options(
            ExecutionRequest::exec(body.code).with_variables(body.variables),
            body.timeout_ms,
            body.fresh,
        )
    }
}

impl From<EvalBody> for ExecutionRequest {
    fn from(body: EvalBody) -> Self {
        with_options(
            ExecutionRequest::eval(body.expression).with_variables(body.variables),
            body.timeout_ms,
            body.fresh,
        )
    }
}

impl From<CallModuleBody> for ExecutionRequest {
    fn from(body: CallModuleBody) -> Self {
        with_options(
            ExecutionRequest::call_module(body.module, body.function, body.args)
                .with_variables(body.kwargs),
            body.timeout_ms,
            false,
        )
    }
}

/// Response of `POST /api/v1/reset`.
#[derive(Debug, Serialize, ToSchema)]
pub struct ResetResponse {
    /// Idle workers whose namespace was cleared.
    pub reset: usize,
    /// Workers that failed to reset and were replaced.
    pub failed: usize,
}

impl From<ResetSummary> for ResetResponse {
    fn from(summary: ResetSummary) -> Self {
        Self {
            reset: summary.reset,
            failed: summary.failed,
        }
    }
}

/// Response of `GET /api/v1/modules`.
#[derive(Debug, Serialize, ToSchema)]
pub struct ModulesResponse {
    pub count: usize,
    /// Lowercased distribution names, sorted.
    pub modules: Vec<String>,
}

impl From<Vec<String>> for ModulesResponse {
    fn from(modules: Vec<String>) -> Self {
        Self {
            count: modules.len(),
            modules,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::Operation;
    use serde_json::json;

    #[test]
    fn test_exec_body_defaults() {
        let body: ExecBody = serde_json::from_value(json!({"code": "x = 1"})).unwrap();
        assert!(body.variables.is_empty());
        assert!(body.timeout_ms.is_none());
        assert!(!body.fresh);
    }

    #[test]
    fn test_exec_body_to_request() {
        let body: ExecBody = serde_json::from_value(json!({
            "code": "result = a + b",
            "variables": {"a": 1, "b": 2},
            "timeoutMs": 250,
            "fresh": true
        }))
        .unwrap();
        let request = ExecutionRequest::from(body);
        assert_eq!(request.timeout, Some(Duration::from_millis(250)));
        assert!(request.fresh);
        match request.operation {
            Operation::Exec { code, variables } => {
                assert_eq!(code, "result = a + b");
                assert_eq!(variables["b"], 2);
            }
            other => panic!("unexpected operation {:?}", other),
        }
    }

    #[test]
    fn test_call_module_body_kwargs() {
        let body: CallModuleBody = serde_json::from_value(json!({
            "module": "json",
            "function": "dumps",
            "args": [[1, 2]],
            "kwargs": {"indent": 2}
        }))
        .unwrap();
        match ExecutionRequest::from(body).operation {
            Operation::CallModule { args, kwargs, .. } => {
                assert_eq!(args, vec![json!([1, 2])]);
                assert_eq!(kwargs["indent"], 2);
            }
            other => panic!("unexpected operation {:?}", other),
        }
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let result: Result<EvalBody, _> =
            serde_json::from_value(json!({"expression": "1", "expresion": "2"}));
        assert!(result.is_err());
    }

    #[test]
    fn test_big_integers_survive_parsing() {
        let body: EvalBody = serde_json::from_str(
            r#"{"expression": "n", "variables": {"n": 123456789012345678901234567890}}"#,
        )
        .unwrap();
        assert_eq!(
            body.variables["n"].to_string(),
            "123456789012345678901234567890"
        );
    }
}
