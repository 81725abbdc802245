//! Command-line interface definitions using clap.

use clap::{Args, CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use pypool::config::{ExecutorConfig, PoolConfig};
use pypool::coordinator::{ExecutionRequest, ModulePolicy};
use pypool::logging::LogFormat;
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::time::Duration;

/// Run Python code on a pool of long-lived worker processes.
#[derive(Parser, Debug)]
#[command(name = "pypool")]
#[command(author, version, long_version = pypool::version::long_version(), about, long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub pool: PoolArgs,

    /// Enable verbose logging (-v for info, -vv for debug, -vvv for trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Only log errors.
    #[arg(short, long, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Log output format (pretty, compact, json).
    #[arg(long, env = "PYPOOL_LOG_FORMAT")]
    pub log_format: Option<LogFormat>,

    /// Also write logs to this file.
    #[arg(long, env = "PYPOOL_LOG_FILE")]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Pool and executor settings shared by every command that starts workers.
#[derive(Args, Debug, Clone, Default)]
pub struct PoolArgs {
    /// Number of worker processes.
    #[arg(short = 'w', long, env = "PYPOOL_POOL_SIZE")]
    pub workers: Option<usize>,

    /// Python interpreter to run workers with.
    #[arg(long, env = "PYPOOL_PYTHON")]
    pub python: Option<PathBuf>,

    /// Download a standalone interpreter if none is found.
    #[arg(long, env = "PYPOOL_AUTO_PROVISION")]
    pub auto_provision: bool,

    /// Default per-call timeout in milliseconds.
    #[arg(long, env = "PYPOOL_TIMEOUT_MS")]
    pub timeout_ms: Option<u64>,

    /// How long to wait for a free worker, in milliseconds.
    #[arg(long, env = "PYPOOL_ACQUIRE_TIMEOUT_MS")]
    pub acquire_timeout_ms: Option<u64>,

    /// Seconds between health checks (0 disables them).
    #[arg(long, env = "PYPOOL_HEALTH_INTERVAL_SECS")]
    pub health_interval_secs: Option<u64>,

    /// Modules callable through `call`, e.g. "math,os.path:join".
    #[arg(long, env = "PYPOOL_ALLOWED_MODULES", value_parser = parse_policy)]
    pub allowed_modules: Option<ModulePolicy>,

    /// Replace a worker after it has served this many requests.
    #[arg(long)]
    pub max_requests_per_worker: Option<u64>,
}

impl PoolArgs {
    /// Defaults, then environment, then flags.
    pub fn pool_config(&self) -> PoolConfig {
        let mut config = PoolConfig::default().with_env_overrides();
        if let Some(size) = self.workers {
            config.size = size;
        }
        if let Some(python) = &self.python {
            config.interpreter = Some(python.clone());
        }
        if self.auto_provision {
            config.auto_provision = true;
        }
        if let Some(secs) = self.health_interval_secs {
            config.health_check_interval = Duration::from_secs(secs);
        }
        if self.max_requests_per_worker.is_some() {
            config.max_requests_per_worker = self.max_requests_per_worker;
        }
        config
    }

    pub fn executor_config(&self) -> ExecutorConfig {
        let mut config = ExecutorConfig::default().with_env_overrides();
        if let Some(ms) = self.timeout_ms {
            config.default_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = self.acquire_timeout_ms {
            config.acquire_timeout = Duration::from_millis(ms);
        }
        if let Some(policy) = &self.allowed_modules {
            config.module_policy = Some(policy.clone());
        }
        config
    }
}

/// Available subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a block of statements and print the response.
    Exec(ExecArgs),

    /// Evaluate an expression and print the response.
    Eval(EvalArgs),

    /// Call a function from an importable module.
    Call(CallArgs),

    /// Show the interpreter version the workers run.
    Version,

    /// List the distributions installed for the worker interpreter.
    Modules,

    /// Start a pool and print a diagnostics report.
    Diagnostics,

    /// Start the HTTP API server.
    Serve(ServeArgs),

    /// Generate shell completions.
    Completions(CompletionsArgs),
}

/// Options shared by the execution subcommands.
#[derive(Args, Debug, Clone, Default)]
pub struct CallOptions {
    /// Timeout for this call in milliseconds.
    #[arg(long = "call-timeout-ms")]
    pub timeout_ms: Option<u64>,

    /// Clear the worker's namespace before running.
    #[arg(long)]
    pub fresh: bool,
}

impl CallOptions {
    fn apply(&self, mut request: ExecutionRequest) -> ExecutionRequest {
        if let Some(ms) = self.timeout_ms {
            request = request.with_timeout(Duration::from_millis(ms));
        }
        if self.fresh {
            request = request.fresh();
        }
        request
    }
}

/// Arguments for the exec command.
#[derive(Parser, Debug)]
pub struct ExecArgs {
    /// Code to run ("-" reads it from stdin).
    pub code: String,

    /// Bind a variable before running: NAME=JSON (non-JSON values bind as strings).
    #[arg(long = "var", value_parser = parse_binding)]
    pub variables: Vec<(String, Value)>,

    #[command(flatten)]
    pub options: CallOptions,
}

impl ExecArgs {
    /// Build the request, with `code` already resolved from stdin if needed.
    pub fn to_request(&self, code: String) -> ExecutionRequest {
        self.options
            .apply(ExecutionRequest::exec(code).with_variables(bindings(&self.variables)))
    }
}

/// Arguments for the eval command.
#[derive(Parser, Debug)]
pub struct EvalArgs {
    /// Expression to evaluate.
    pub expression: String,

    /// Bind a variable before evaluating: NAME=JSON.
    #[arg(long = "var", value_parser = parse_binding)]
    pub variables: Vec<(String, Value)>,

    #[command(flatten)]
    pub options: CallOptions,
}

impl EvalArgs {
    pub fn to_request(&self) -> ExecutionRequest {
        self.options.apply(
            ExecutionRequest::eval(self.expression.clone())
                .with_variables(bindings(&self.variables)),
        )
    }
}

/// Arguments for the call command.
#[derive(Parser, Debug)]
pub struct CallArgs {
    /// Module to import, e.g. "math" or "os.path".
    pub module: String,

    /// Function name within the module.
    pub function: String,

    /// Positional arguments as JSON literals.
    #[arg(value_parser = parse_json_value, allow_hyphen_values = true)]
    pub args: Vec<Value>,

    /// Keyword argument: NAME=JSON.
    #[arg(long = "kwarg", value_parser = parse_binding)]
    pub kwargs: Vec<(String, Value)>,

    #[command(flatten)]
    pub options: CallOptions,
}

impl CallArgs {
    pub fn to_request(&self) -> ExecutionRequest {
        let request =
            ExecutionRequest::call_module(&self.module, &self.function, self.args.clone())
                .with_variables(bindings(&self.kwargs));
        self.options.apply(request)
    }
}

/// Arguments for the serve command.
#[derive(Parser, Debug)]
pub struct ServeArgs {
    /// Host address to bind to.
    #[arg(long, default_value = "127.0.0.1", env = "PYPOOL_HOST")]
    pub host: String,

    /// Port to listen on.
    #[arg(short, long, default_value_t = 8080, env = "PYPOOL_PORT")]
    pub port: u16,

    /// Enable CORS for all origins.
    #[arg(long)]
    pub cors: bool,

    /// Specific CORS origins (comma-separated).
    #[arg(long, value_delimiter = ',')]
    pub cors_origins: Option<Vec<String>>,
}

/// Arguments for shell completions.
#[derive(Parser, Debug)]
pub struct CompletionsArgs {
    /// Shell to generate completions for.
    #[arg(value_enum)]
    pub shell: Shell,
}

impl CompletionsArgs {
    /// Generate and print completions to stdout.
    pub fn generate(&self) {
        clap_complete::generate(
            self.shell,
            &mut Cli::command(),
            "pypool",
            &mut std::io::stdout(),
        );
    }
}

/// Verbosity level for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Verbosity {
    /// -q: errors only.
    Quiet,
    /// Default: warnings and errors.
    Normal,
    /// -v: pool lifecycle events.
    Info,
    /// -vv: every request and worker exchange.
    Debug,
    /// -vvv: protocol lines.
    Trace,
}

impl Verbosity {
    pub fn level(self) -> tracing::Level {
        match self {
            Self::Quiet => tracing::Level::ERROR,
            Self::Normal => tracing::Level::WARN,
            Self::Info => tracing::Level::INFO,
            Self::Debug => tracing::Level::DEBUG,
            Self::Trace => tracing::Level::TRACE,
        }
    }
}

impl Cli {
    pub fn verbosity(&self) -> Verbosity {
        if self.quiet {
            return Verbosity::Quiet;
        }
        match self.verbose {
            0 => Verbosity::Normal,
            1 => Verbosity::Info,
            2 => Verbosity::Debug,
            _ => Verbosity::Trace,
        }
    }
}

fn parse_policy(entries: &str) -> Result<ModulePolicy, String> {
    ModulePolicy::parse(entries).map_err(|e| e.to_string())
}

/// Parse a JSON literal, taking anything that is not valid JSON as a string.
fn parse_json_value(raw: &str) -> Result<Value, String> {
    Ok(serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string())))
}

fn parse_binding(raw: &str) -> Result<(String, Value), String> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=VALUE, got '{}'", raw))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("missing variable name in '{}'", raw));
    }
    Ok((name.to_string(), parse_json_value(value)?))
}

fn bindings(pairs: &[(String, Value)]) -> Map<String, Value> {
    pairs.iter().cloned().collect()
}
