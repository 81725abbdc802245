//! Wire protocol between the host and a worker interpreter.
//!
//! Every message is one JSON object on one line. The host writes a request
//! tagged with `op` and a numeric `id`; the worker answers with exactly one
//! response carrying the same `id`, only after the operation has finished.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Identifier of the unsolicited hello line a worker emits on startup.
pub const HELLO_ID: u64 = 0;

/// An operation the worker can perform.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum WorkerOp {
    /// Run a block of statements in the worker's persistent namespace.
    Exec {
        code: String,
        variables: Map<String, Value>,
    },
    /// Evaluate a single expression.
    Eval {
        expression: String,
        variables: Map<String, Value>,
    },
    /// Import `module` and call `function` (a dotted attribute path is allowed).
    CallModule {
        module: String,
        function: String,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    },
    /// No-op liveness probe.
    Ping,
    /// Clear the persistent namespace.
    Reset,
    /// Report interpreter version details.
    Version,
    /// List installed distribution names, lowercased and sorted.
    ListModules,
    /// Answer, then exit the worker loop.
    Shutdown,
}

impl WorkerOp {
    /// Short name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Exec { .. } => "exec",
            Self::Eval { .. } => "eval",
            Self::CallModule { .. } => "call_module",
            Self::Ping => "ping",
            Self::Reset => "reset",
            Self::Version => "version",
            Self::ListModules => "list_modules",
            Self::Shutdown => "shutdown",
        }
    }
}

#[derive(Serialize)]
struct WireRequest<'a> {
    id: u64,
    #[serde(flatten)]
    op: &'a WorkerOp,
}

/// Serialize a request to a JSON line (with newline).
pub fn encode_request(id: u64, op: &WorkerOp) -> Result<String, serde_json::Error> {
    let mut json = serde_json::to_string(&WireRequest { id, op })?;
    json.push('\n');
    Ok(json)
}

/// Error payload attached to an unsuccessful response.
#[derive(Debug, Clone, Deserialize)]
pub struct WireError {
    /// `execution` for a caught script fault, `request` for a request the
    /// worker could not interpret.
    pub kind: String,
    #[serde(rename = "type", default)]
    pub exception_type: Option<String>,
    pub message: String,
    #[serde(default)]
    pub traceback: Option<String>,
}

/// A response line exactly as it appears on the wire.
#[derive(Debug, Clone, Deserialize)]
pub struct WireResponse {
    pub id: u64,
    pub ok: bool,
    #[serde(default)]
    pub result: Value,
    #[serde(default)]
    pub error: Option<WireError>,
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub elapsed_ms: Option<f64>,
}

impl WireResponse {
    /// Parse one response line.
    pub fn from_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim())
    }
}

/// A script-level failure reported by the worker.
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptError {
    pub exception_type: Option<String>,
    pub message: String,
    pub traceback: Option<String>,
}

/// A validated worker reply.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerReply {
    Success {
        value: Value,
        output: Option<String>,
    },
    ExecutionError {
        error: ScriptError,
        output: Option<String>,
    },
}

/// Reasons a response line fails schema validation.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolViolation {
    /// `ok` was false but no error object was attached.
    MissingError,
    /// `ok` was true but an error object was attached.
    UnexpectedError,
    /// The worker could not interpret the request it received.
    RejectedRequest(String),
}

impl std::fmt::Display for ProtocolViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingError => write!(f, "failure response without an error object"),
            Self::UnexpectedError => write!(f, "success response carrying an error object"),
            Self::RejectedRequest(msg) => write!(f, "worker rejected request: {}", msg),
        }
    }
}

impl WireResponse {
    /// Validate the response shape and turn it into a [`WorkerReply`].
    pub fn into_reply(self) -> Result<WorkerReply, ProtocolViolation> {
        let output = self.output.filter(|s| !s.is_empty());
        match (self.ok, self.error) {
            (true, None) => Ok(WorkerReply::Success {
                value: self.result,
                output,
            }),
            (true, Some(_)) => Err(ProtocolViolation::UnexpectedError),
            (false, None) => Err(ProtocolViolation::MissingError),
            (false, Some(err)) if err.kind == "execution" => Ok(WorkerReply::ExecutionError {
                error: ScriptError {
                    exception_type: err.exception_type,
                    message: err.message,
                    traceback: err.traceback,
                },
                output,
            }),
            (false, Some(err)) => Err(ProtocolViolation::RejectedRequest(err.message)),
        }
    }
}

/// Details from the hello line a worker prints once its loop is ready.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Hello {
    pub ready: bool,
    pub pid: u32,
    pub version: String,
}

impl Hello {
    /// Parse and check a hello line.
    pub fn from_line(line: &str) -> Result<Self, String> {
        let response = WireResponse::from_line(line).map_err(|e| e.to_string())?;
        if response.id != HELLO_ID || !response.ok {
            return Err(format!("unexpected startup line: {}", truncate(line, 200)));
        }
        let hello: Hello = serde_json::from_value(response.result).map_err(|e| e.to_string())?;
        if !hello.ready {
            return Err("worker reported not ready".to_string());
        }
        Ok(hello)
    }
}

/// Shorten a line for inclusion in an error message.
pub fn truncate(line: &str, max: usize) -> &str {
    match line.char_indices().nth(max) {
        Some((idx, _)) => &line[..idx],
        None => line,
    }
}
