//! pypool - run Python code on a pool of worker processes.

mod cli;

use std::io::Read;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use pypool::logging::{self, LogConfig};
use pypool::{ExecutionRequest, ExecutionResponse, ScriptApi};
use serde::Serialize;

use cli::{Cli, Commands};

/// Exit status when the script itself raised.
const EXIT_SCRIPT_ERROR: i32 = 1;
/// Exit status when the call failed outside the script (timeout, crash, capacity).
const EXIT_TRANSPORT_ERROR: i32 = 2;

/// Parse arguments, run the selected command, and report top-level errors.
///
/// One-shot commands print their JSON response on stdout. Anything that keeps
/// the command from producing a response is printed with its cause chain on
/// stderr and exits with status 1.
fn main() {
    let cli = Cli::parse();
    init_logging(&cli);

    let result = match &cli.command {
        Commands::Exec(args) => read_code(&args.code).and_then(|code| {
            let request = args.to_request(code);
            cmd_execute(&cli, &request)
        }),
        Commands::Eval(args) => cmd_execute(&cli, &args.to_request()),
        Commands::Call(args) => cmd_execute(&cli, &args.to_request()),
        Commands::Version => cmd_version(&cli),
        Commands::Modules => cmd_modules(&cli),
        Commands::Diagnostics => cmd_diagnostics(&cli),
        Commands::Serve(args) => cmd_serve(&cli, args).map(|()| 0),
        Commands::Completions(args) => {
            args.generate();
            Ok(0)
        }
    };

    match result {
        Ok(0) => {}
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("error: {}", e);
            for cause in e.chain().skip(1) {
                eprintln!("  caused by: {}", cause);
            }
            std::process::exit(1);
        }
    }
}

fn init_logging(cli: &Cli) {
    let mut config = match cli.command {
        Commands::Serve(_) => LogConfig::for_server(),
        _ => LogConfig::for_cli(),
    }
    .with_env_overrides();

    if cli.quiet || cli.verbose > 0 {
        config = config.with_level(cli.verbosity().level());
        config.filter = None;
    }
    if let Some(format) = cli.log_format {
        config = config.with_format(format);
    }
    if let Some(path) = &cli.log_file {
        config = config.with_file(path.clone());
    }

    logging::init_with_file(config);
}

fn start_api(cli: &Cli) -> Result<ScriptApi> {
    ScriptApi::start(cli.pool.pool_config(), cli.pool.executor_config())
        .context("Failed to start the worker pool")
}

fn read_code(code: &str) -> Result<String> {
    if code != "-" {
        return Ok(code.to_string());
    }
    let mut buf = String::new();
    std::io::stdin()
        .read_to_string(&mut buf)
        .context("Failed to read code from stdin")?;
    Ok(buf)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Exit status for a finished call.
fn exit_code(response: &ExecutionResponse) -> i32 {
    match response.error_kind() {
        None => 0,
        Some(kind) if kind.is_transport() => EXIT_TRANSPORT_ERROR,
        Some(_) => EXIT_SCRIPT_ERROR,
    }
}

fn cmd_execute(cli: &Cli, request: &ExecutionRequest) -> Result<i32> {
    let api = start_api(cli)?;
    let response = api.execute(request);
    api.shutdown();

    print_json(&response)?;
    Ok(exit_code(&response))
}

fn cmd_version(cli: &Cli) -> Result<i32> {
    let api = start_api(cli)?;
    let info = api.get_version();
    api.shutdown();

    print_json(&info)?;
    Ok(if info.available { 0 } else { EXIT_TRANSPORT_ERROR })
}

fn cmd_modules(cli: &Cli) -> Result<i32> {
    let api = start_api(cli)?;
    let modules = api.list_modules();
    api.shutdown();

    for name in modules.context("Failed to list installed modules")? {
        println!("{}", name);
    }
    Ok(0)
}

fn cmd_diagnostics(cli: &Cli) -> Result<i32> {
    let api = start_api(cli)?;
    let report = api.diagnostics();
    api.shutdown();

    print_json(&report)?;
    Ok(if report.healthy { 0 } else { EXIT_TRANSPORT_ERROR })
}

/// Start the pool, then serve the HTTP API until Ctrl+C.
fn cmd_serve(cli: &Cli, args: &cli::ServeArgs) -> Result<()> {
    use pypool::server::{ServerConfig, run_server};

    let config = ServerConfig {
        host: args.host.clone(),
        port: args.port,
        cors: args.cors,
        cors_origins: args.cors_origins.clone(),
    };

    let api = Arc::new(start_api(cli)?);

    let rt = tokio::runtime::Runtime::new().context("Failed to create Tokio runtime")?;
    let served = rt.block_on(run_server(config, Arc::clone(&api)));

    api.shutdown();
    served.context("HTTP server failed")
}
