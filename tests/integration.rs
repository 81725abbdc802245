//! Integration tests for the pypool CLI.
//!
//! Tests that start workers are skipped when no Python 3 interpreter is found.

use assert_cmd::Command;
use predicates::prelude::*;

/// Get a command for the pypool binary with a clean `PYPOOL_*` environment.
fn pypool() -> Command {
    #[allow(deprecated)]
    let mut cmd = Command::cargo_bin("pypool").unwrap();
    for var in [
        "PYPOOL_POOL_SIZE",
        "PYPOOL_PYTHON",
        "PYPOOL_AUTO_PROVISION",
        "PYPOOL_TIMEOUT_MS",
        "PYPOOL_ACQUIRE_TIMEOUT_MS",
        "PYPOOL_HEALTH_INTERVAL_SECS",
        "PYPOOL_ALLOWED_MODULES",
        "PYPOOL_LOG",
        "PYPOOL_LOG_FORMAT",
        "PYPOOL_LOG_FILE",
        "RUST_LOG",
    ] {
        cmd.env_remove(var);
    }
    cmd
}

fn have_python() -> bool {
    let found = pypool::interpreter::discover().is_some();
    if !found {
        eprintln!("skipping: no Python 3 interpreter found");
    }
    found
}

#[test]
fn test_help() {
    pypool()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("exec"))
        .stdout(predicate::str::contains("eval"))
        .stdout(predicate::str::contains("serve"));
}

#[test]
fn test_version_flag() {
    pypool()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn test_completions_bash() {
    pypool()
        .args(["completions", "bash"])
        .assert()
        .success()
        .stdout(predicate::str::contains("pypool"));
}

#[test]
fn test_missing_subcommand() {
    pypool().assert().failure();
}

#[test]
fn test_bad_interpreter_is_a_configuration_error() {
    pypool()
        .args(["--python", "/nonexistent/bin/python3", "eval", "1"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("Failed to start the worker pool"))
        .stderr(predicate::str::contains("Configuration error"));
}

#[test]
fn test_invalid_module_policy_rejected() {
    pypool()
        .args(["--allowed-modules", "bad name", "version"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid module policy entry"));
}

#[test]
fn test_eval() {
    if !have_python() {
        return;
    }
    pypool()
        .args(["--workers", "1", "eval", "2 + 2"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"success\": true"))
        .stdout(predicate::str::contains("\"result\": 4"));
}

#[test]
fn test_exec_with_variables() {
    if !have_python() {
        return;
    }
    pypool()
        .args(["-w", "1", "exec", "result = x * y", "--var", "x=6", "--var", "y=7"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"result\": 42"));
}

#[test]
fn test_exec_from_stdin() {
    if !have_python() {
        return;
    }
    pypool()
        .args(["-w", "1", "exec", "-"])
        .write_stdin("print('from stdin')\nresult = 'done'\n")
        .assert()
        .success()
        .stdout(predicate::str::contains("from stdin"))
        .stdout(predicate::str::contains("\"result\": \"done\""));
}

#[test]
fn test_script_error_exit_code() {
    if !have_python() {
        return;
    }
    pypool()
        .args(["-w", "1", "exec", "1/0"])
        .assert()
        .code(1)
        .stdout(predicate::str::contains("ExecutionError"))
        .stdout(predicate::str::contains("ZeroDivisionError"));
}

#[test]
fn test_timeout_exit_code() {
    if !have_python() {
        return;
    }
    pypool()
        .args([
            "-w",
            "1",
            "exec",
            "import time\ntime.sleep(10)",
            "--call-timeout-ms",
            "200",
        ])
        .assert()
        .code(2)
        .stdout(predicate::str::contains("\"Timeout\""));
}

#[test]
fn test_call_module() {
    if !have_python() {
        return;
    }
    pypool()
        .args(["-w", "1", "call", "math", "factorial", "5"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"result\": 120"));
}

#[test]
fn test_call_denied_by_policy() {
    if !have_python() {
        return;
    }
    pypool()
        .args(["-w", "1", "--allowed-modules", "math", "call", "os", "getcwd"])
        .assert()
        .code(2)
        .stdout(predicate::str::contains("PolicyViolation"));
}

#[test]
fn test_version_command() {
    if !have_python() {
        return;
    }
    pypool()
        .args(["-w", "1", "version"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"available\": true"))
        .stdout(predicate::str::contains("\"version\": \"3."));
}

#[test]
fn test_modules_command() {
    if !have_python() {
        return;
    }
    pypool().args(["-w", "1", "modules"]).assert().success();
}

#[test]
fn test_diagnostics_command() {
    if !have_python() {
        return;
    }
    pypool()
        .args(["-w", "2", "diagnostics"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"healthy\": true"))
        .stdout(predicate::str::contains("\"totalSize\": 2"))
        .stdout(predicate::str::contains("\"idleWorkers\""));
}
