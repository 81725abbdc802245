//! Execution request and response types.

use crate::error::{ErrorKind, PyPoolError};
use crate::worker::{ScriptError, WorkerOp};
use serde::Serialize;
use serde_json::{Map, Value};
use std::time::Duration;
use utoipa::ToSchema;

/// The high-level operation a caller wants performed.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    /// Run a block of statements with the given variables bound.
    Exec {
        code: String,
        variables: Map<String, Value>,
    },
    /// Evaluate an expression with the given variables bound.
    Eval {
        expression: String,
        variables: Map<String, Value>,
    },
    /// Call `module.function(*args, **kwargs)`.
    CallModule {
        module: String,
        function: String,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    },
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Exec { .. } => "exec",
            Self::Eval { .. } => "eval",
            Self::CallModule { .. } => "call_module",
        }
    }

    /// True when resubmitting cannot duplicate an observable side effect.
    ///
    /// An expression evaluates in a throwaway copy of the namespace. A block
    /// without variables is treated as replayable; one that binds variables
    /// is not, because it may be the caller's way of feeding external state
    /// into a mutation.
    pub fn is_replayable(&self) -> bool {
        match self {
            Self::Eval { .. } => true,
            Self::Exec { variables, .. } => variables.is_empty(),
            Self::CallModule { .. } => false,
        }
    }

    /// Bytes of caller-supplied payload, for the size limit.
    pub fn payload_size(&self) -> usize {
        fn json_len<T: Serialize>(value: &T) -> usize {
            serde_json::to_string(value).map_or(0, |s| s.len())
        }
        match self {
            Self::Exec { code, variables } => code.len() + json_len(variables),
            Self::Eval {
                expression,
                variables,
            } => expression.len() + json_len(variables),
            Self::CallModule {
                module,
                function,
                args,
                kwargs,
            } => module.len() + function.len() + json_len(args) + json_len(kwargs),
        }
    }

    pub(crate) fn to_worker_op(&self) -> WorkerOp {
        match self.clone() {
            Self::Exec { code, variables } => WorkerOp::Exec { code, variables },
            Self::Eval {
                expression,
                variables,
            } => WorkerOp::Eval {
                expression,
                variables,
            },
            Self::CallModule {
                module,
                function,
                args,
                kwargs,
            } => WorkerOp::CallModule {
                module,
                function,
                args,
                kwargs,
            },
        }
    }
}

/// One call submitted to the [`Executor`](super::Executor).
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionRequest {
    pub operation: Operation,
    /// Per-call timeout. `None` uses the executor default.
    pub timeout: Option<Duration>,
    /// Clear the worker's namespace before running.
    pub fresh: bool,
}

impl ExecutionRequest {
    pub fn exec(code: impl Into<String>) -> Self {
        Self::new(Operation::Exec {
            code: code.into(),
            variables: Map::new(),
        })
    }

    pub fn eval(expression: impl Into<String>) -> Self {
        Self::new(Operation::Eval {
            expression: expression.into(),
            variables: Map::new(),
        })
    }

    pub fn call_module(
        module: impl Into<String>,
        function: impl Into<String>,
        args: Vec<Value>,
    ) -> Self {
        Self::new(Operation::CallModule {
            module: module.into(),
            function: function.into(),
            args,
            kwargs: Map::new(),
        })
    }

    fn new(operation: Operation) -> Self {
        Self {
            operation,
            timeout: None,
            fresh: false,
        }
    }

    /// Bind variables (exec/eval) or keyword arguments (call_module).
    pub fn with_variables(mut self, bindings: Map<String, Value>) -> Self {
        match &mut self.operation {
            Operation::Exec { variables, .. } | Operation::Eval { variables, .. } => {
                *variables = bindings
            }
            Operation::CallModule { kwargs, .. } => *kwargs = bindings,
        }
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn fresh(mut self) -> Self {
        self.fresh = true;
        self
    }
}

/// Structured failure description.
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ErrorInfo {
    pub kind: ErrorKind,
    pub message: String,
    /// Interpreter traceback for execution errors.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// Exception class name for execution errors, e.g. `ZeroDivisionError`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exception_type: Option<String>,
    /// Whether resubmitting the request later may succeed.
    pub retryable: bool,
}

impl ErrorInfo {
    pub fn is_transport(&self) -> bool {
        self.kind.is_transport()
    }
}

impl From<&PyPoolError> for ErrorInfo {
    fn from(error: &PyPoolError) -> Self {
        let kind = error.kind();
        Self {
            kind,
            message: error.to_string(),
            detail: None,
            exception_type: None,
            retryable: kind.is_retryable(),
        }
    }
}

impl From<ScriptError> for ErrorInfo {
    fn from(error: ScriptError) -> Self {
        let message = match &error.exception_type {
            Some(ty) if !error.message.is_empty() => format!("{}: {}", ty, error.message),
            Some(ty) => ty.clone(),
            None => error.message,
        };
        Self {
            kind: ErrorKind::ExecutionError,
            message,
            detail: error.traceback,
            exception_type: error.exception_type,
            retryable: false,
        }
    }
}

/// Outcome of one call. Always produced, whatever went wrong.
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<Object>)]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    /// Wall-clock time from submission to completion.
    pub execution_time_ms: u64,
    /// Text the script printed to stdout.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    /// Worker that served the final attempt.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<usize>,
}

impl ExecutionResponse {
    pub fn success(value: Value, output: Option<String>, elapsed: Duration) -> Self {
        Self {
            success: true,
            result: Some(value),
            error: None,
            execution_time_ms: elapsed.as_millis() as u64,
            output: non_empty(output),
            worker_id: None,
        }
    }

    pub fn failure(error: ErrorInfo, output: Option<String>, elapsed: Duration) -> Self {
        Self {
            success: false,
            result: None,
            error: Some(error),
            execution_time_ms: elapsed.as_millis() as u64,
            output: non_empty(output),
            worker_id: None,
        }
    }

    pub fn from_error(error: &PyPoolError, elapsed: Duration) -> Self {
        Self::failure(ErrorInfo::from(error), None, elapsed)
    }

    pub(crate) fn on_worker(mut self, worker_id: usize) -> Self {
        self.worker_id = Some(worker_id);
        self
    }

    /// Error kind, if the call failed.
    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }
}

fn non_empty(output: Option<String>) -> Option<String> {
    output.filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vars(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn test_replayable_operations() {
        assert!(ExecutionRequest::eval("1 + 1").operation.is_replayable());
        assert!(ExecutionRequest::exec("x = 1").operation.is_replayable());
        let bound = ExecutionRequest::exec("x = y").with_variables(vars(json!({"y": 1})));
        assert!(!bound.operation.is_replayable());
        let call = ExecutionRequest::call_module("math", "sqrt", vec![json!(4)]);
        assert!(!call.operation.is_replayable());
    }

    #[test]
    fn test_with_variables_sets_kwargs_for_call_module() {
        let req = ExecutionRequest::call_module("json", "dumps", vec![json!([1])])
            .with_variables(vars(json!({"indent": 2})));
        match req.operation {
            Operation::CallModule { kwargs, .. } => assert_eq!(kwargs["indent"], 2),
            other => panic!("unexpected operation {:?}", other),
        }
    }

    #[test]
    fn test_payload_size_counts_code_and_variables() {
        let plain = ExecutionRequest::exec("abcd");
        assert_eq!(plain.operation.payload_size(), 4 + 2);
        let bound = ExecutionRequest::eval("x").with_variables(vars(json!({"x": "hello"})));
        assert_eq!(bound.operation.payload_size(), 1 + r#"{"x":"hello"}"#.len());
    }

    #[test]
    fn test_to_worker_op_preserves_fields() {
        let req = ExecutionRequest::call_module("math", "sqrt", vec![json!(16)]);
        let op = req.operation.to_worker_op();
        assert_eq!(op.name(), "call_module");
        assert_eq!(
            op,
            WorkerOp::CallModule {
                module: "math".into(),
                function: "sqrt".into(),
                args: vec![json!(16)],
                kwargs: Map::new(),
            }
        );
    }

    #[test]
    fn test_script_error_message_includes_type() {
        let info = ErrorInfo::from(ScriptError {
            exception_type: Some("ZeroDivisionError".into()),
            message: "division by zero".into(),
            traceback: Some("Traceback ...".into()),
        });
        assert_eq!(info.kind, ErrorKind::ExecutionError);
        assert_eq!(info.message, "ZeroDivisionError: division by zero");
        assert_eq!(info.exception_type.as_deref(), Some("ZeroDivisionError"));
        assert!(!info.retryable);
        assert!(!info.is_transport());
    }

    #[test]
    fn test_response_serializes_camel_case() {
        let response = ExecutionResponse::success(json!(4), Some(String::new()), Duration::from_millis(7))
            .on_worker(1);
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["success"], true);
        assert_eq!(json["result"], 4);
        assert_eq!(json["executionTimeMs"], 7);
        assert_eq!(json["workerId"], 1);
        assert!(json.get("error").is_none());
        assert!(json.get("output").is_none());
    }

    #[test]
    fn test_failure_response_from_error() {
        let err = PyPoolError::Timeout {
            timeout: Duration::from_secs(1),
        };
        let response = ExecutionResponse::from_error(&err, Duration::from_millis(1000));
        assert!(!response.success);
        assert_eq!(response.error_kind(), Some(ErrorKind::Timeout));
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["error"]["kind"], "Timeout");
        assert_eq!(json["error"]["retryable"], true);
    }
}
