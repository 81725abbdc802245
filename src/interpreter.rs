//! Interpreter discovery and auto-provisioning.
//!
//! Resolution order:
//!
//! 1. The configured interpreter, if any (must work; no fallback)
//! 2. A previously provisioned interpreter in the data directory
//! 3. Well-known executable names and locations on the host
//! 4. A freshly downloaded standalone CPython, when auto-provisioning is on
//!
//! Every candidate must report a version of at least 3.8.

use crate::config::PoolConfig;
use crate::error::{PyPoolError, Result};
use crate::paths;
use flate2::read::GzDecoder;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Oldest supported interpreter.
pub const MIN_VERSION: (u32, u32) = (3, 8);

/// Executables tried when no interpreter is configured.
const CANDIDATES: &[&str] = &[
    "python3",
    "python",
    "/usr/local/bin/python3",
    "/opt/homebrew/bin/python3",
    "/usr/bin/python3",
];

/// Standalone CPython build used for auto-provisioning.
const STANDALONE_BASE_URL: &str =
    "https://github.com/indygreg/python-build-standalone/releases/download/20231002";
const STANDALONE_VERSION: &str = "3.11.6+20231002";

/// Optional pinned SHA-256 of the archive for this host.
const SHA256_ENV: &str = "PYPOOL_PYTHON_SHA256";

const PROBE_SCRIPT: &str = "import sys; v = sys.version_info; \
                            print('%d.%d.%d' % (v[0], v[1], v[2])); print(sys.executable)";

/// Maximum number of retry attempts for network operations.
const MAX_RETRIES: u32 = 3;

/// Base delay for exponential backoff (in milliseconds).
const BASE_DELAY_MS: u64 = 1000;

const CONNECT_TIMEOUT_SECS: u64 = 30;
const READ_TIMEOUT_SECS: u64 = 600;

/// A working interpreter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interpreter {
    pub executable: PathBuf,
    pub version: (u32, u32, u32),
}

impl Interpreter {
    pub fn version_string(&self) -> String {
        let (major, minor, micro) = self.version;
        format!("{}.{}.{}", major, minor, micro)
    }

    fn is_supported(&self) -> bool {
        (self.version.0, self.version.1) >= MIN_VERSION
    }
}

/// Find an interpreter for the pool, provisioning one if allowed.
///
/// A missing interpreter is a [`PyPoolError::Configuration`] error.
pub fn resolve(config: &PoolConfig) -> Result<PathBuf> {
    if let Some(configured) = &config.interpreter {
        let path = paths::expand_tilde(configured);
        return match probe(&path) {
            Some(found) if found.is_supported() => Ok(found.executable),
            Some(found) => Err(PyPoolError::Configuration(format!(
                "interpreter {} is Python {}, need {}.{} or newer",
                path.display(),
                found.version_string(),
                MIN_VERSION.0,
                MIN_VERSION.1
            ))),
            None => Err(PyPoolError::Configuration(format!(
                "interpreter {} could not be run",
                path.display()
            ))),
        };
    }

    if let Some(found) = discover() {
        info!(
            interpreter = %found.executable.display(),
            version = %found.version_string(),
            "Using detected interpreter"
        );
        return Ok(found.executable);
    }

    if !config.auto_provision {
        return Err(PyPoolError::Configuration(format!(
            "no Python {}.{}+ interpreter found; pass --python or enable auto-provisioning",
            MIN_VERSION.0, MIN_VERSION.1
        )));
    }

    let exe = provision(&paths::get_python_dir()).map_err(|e| {
        PyPoolError::Configuration(format!("auto-provisioning failed: {}", e))
    })?;
    match probe(&exe) {
        Some(found) if found.is_supported() => Ok(found.executable),
        _ => Err(PyPoolError::Configuration(format!(
            "provisioned interpreter {} does not run",
            exe.display()
        ))),
    }
}

/// Look for a usable interpreter without downloading anything.
pub fn discover() -> Option<Interpreter> {
    let provisioned = paths::provisioned_interpreter(paths::get_python_dir());
    let provisioned = provisioned.exists().then_some(provisioned);

    provisioned
        .into_iter()
        .chain(CANDIDATES.iter().map(PathBuf::from))
        .filter_map(|candidate| {
            let found = probe(&candidate)?;
            if found.is_supported() {
                Some(found)
            } else {
                debug!(
                    candidate = %candidate.display(),
                    version = %found.version_string(),
                    "Skipping unsupported interpreter"
                );
                None
            }
        })
        .next()
}

/// Run `candidate` and ask it for its version and real path.
pub fn probe(candidate: &Path) -> Option<Interpreter> {
    let output = Command::new(candidate)
        .args(["-c", PROBE_SCRIPT])
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    parse_probe_output(&String::from_utf8_lossy(&output.stdout))
}

fn parse_probe_output(stdout: &str) -> Option<Interpreter> {
    let mut lines = stdout.lines();
    let mut parts = lines.next()?.trim().split('.').map(|p| p.parse::<u32>());
    let version = (parts.next()?.ok()?, parts.next()?.ok()?, parts.next()?.ok()?);
    let executable = lines.next().map(str::trim).filter(|s| !s.is_empty())?;
    Some(Interpreter {
        executable: PathBuf::from(executable),
        version,
    })
}

/// Archive URL for a platform, as reported by `std::env::consts`.
pub fn standalone_url(os: &str, arch: &str) -> Option<String> {
    let triple = match (os, arch) {
        ("linux", "x86_64") => "x86_64-unknown-linux-gnu",
        ("linux", "aarch64") => "aarch64-unknown-linux-gnu",
        ("macos", "x86_64") => "x86_64-apple-darwin",
        ("macos", "aarch64") => "aarch64-apple-darwin",
        _ => return None,
    };
    Some(format!(
        "{}/cpython-{}-{}-install_only.tar.gz",
        STANDALONE_BASE_URL, STANDALONE_VERSION, triple
    ))
}

/// Download and unpack a standalone CPython into `target`.
///
/// Returns the path of the unpacked interpreter executable.
pub fn provision(target: &Path) -> Result<PathBuf> {
    let url = standalone_url(std::env::consts::OS, std::env::consts::ARCH).ok_or_else(|| {
        PyPoolError::Provision(format!(
            "no standalone build for {}-{}",
            std::env::consts::OS,
            std::env::consts::ARCH
        ))
    })?;
    let parent = target
        .parent()
        .ok_or_else(|| PyPoolError::Provision(format!("invalid target {}", target.display())))?;
    std::fs::create_dir_all(parent)?;

    info!(url = %url, target = %target.display(), "Provisioning interpreter");
    let archive = target.with_extension("tar.gz.tmp");
    let expected = std::env::var(SHA256_ENV).ok().filter(|s| !s.is_empty());
    let downloaded = download_archive(&url, &archive, expected.as_deref())
        .and_then(|()| unpack_archive(&archive, target));
    let _ = std::fs::remove_file(&archive);
    downloaded?;

    let exe = paths::provisioned_interpreter(target);
    if !exe.exists() {
        return Err(PyPoolError::Provision(format!(
            "archive did not contain {}",
            exe.display()
        )));
    }
    info!(interpreter = %exe.display(), "Interpreter provisioned");
    Ok(exe)
}

/// Retry a network operation with exponential backoff.
fn retry_with_backoff<T, E, F>(max_retries: u32, mut operation: F) -> std::result::Result<T, E>
where
    F: FnMut() -> std::result::Result<T, E>,
    E: std::fmt::Display,
{
    let mut attempt = 0;
    loop {
        match operation() {
            Ok(result) => return Ok(result),
            Err(e) if attempt < max_retries => {
                let delay_ms = BASE_DELAY_MS * 2u64.pow(attempt);
                warn!(
                    attempt = attempt + 1,
                    max_attempts = max_retries + 1,
                    error = %e,
                    retry_in_ms = delay_ms,
                    "Network error, retrying"
                );
                std::thread::sleep(Duration::from_millis(delay_ms));
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

fn download_archive(url: &str, dest: &Path, expected_sha256: Option<&str>) -> Result<()> {
    let client = reqwest::blocking::Client::builder()
        .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
        .timeout(Duration::from_secs(READ_TIMEOUT_SECS))
        .build()?;

    let response = retry_with_backoff(MAX_RETRIES, || {
        client.get(url).send().and_then(|r| r.error_for_status())
    })?;

    let mut reader = BufReader::new(response);
    let mut writer = BufWriter::new(File::create(dest)?);
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];
    let mut total = 0u64;
    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        writer.write_all(&buffer[..bytes_read])?;
        hasher.update(&buffer[..bytes_read]);
        total += bytes_read as u64;
    }
    writer.flush()?;
    debug!(bytes = total, "Archive downloaded");

    let actual = format!("{:x}", hasher.finalize());
    match expected_sha256 {
        Some(expected) if !expected.eq_ignore_ascii_case(&actual) => {
            Err(PyPoolError::ChecksumMismatch {
                expected: expected.to_string(),
                actual,
            })
        }
        Some(_) => Ok(()),
        None => {
            debug!(sha256 = %actual, "No pinned checksum; skipping verification");
            Ok(())
        }
    }
}

/// Unpack a `python/...` tarball so its contents land in `target`.
fn unpack_archive(archive: &Path, target: &Path) -> Result<()> {
    let staging = target.with_extension("staging");
    if staging.exists() {
        std::fs::remove_dir_all(&staging)?;
    }
    std::fs::create_dir_all(&staging)?;

    let decoder = GzDecoder::new(BufReader::new(File::open(archive)?));
    tar::Archive::new(decoder).unpack(&staging)?;

    let unpacked = staging.join(paths::PYTHON_DIR_NAME);
    if !unpacked.is_dir() {
        let _ = std::fs::remove_dir_all(&staging);
        return Err(PyPoolError::Provision(
            "archive has no top-level python directory".into(),
        ));
    }
    if target.exists() {
        std::fs::remove_dir_all(target)?;
    }
    std::fs::rename(&unpacked, target)?;
    let _ = std::fs::remove_dir_all(&staging);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use tempfile::tempdir;

    #[test]
    fn test_parse_probe_output() {
        let found = parse_probe_output("3.11.6\n/usr/bin/python3\n").unwrap();
        assert_eq!(found.version, (3, 11, 6));
        assert_eq!(found.executable, PathBuf::from("/usr/bin/python3"));
        assert_eq!(found.version_string(), "3.11.6");
        assert!(found.is_supported());
    }

    #[test]
    fn test_parse_probe_output_rejects_garbage() {
        assert!(parse_probe_output("").is_none());
        assert!(parse_probe_output("Python 3.11\n/usr/bin/python3").is_none());
        assert!(parse_probe_output("3.11.6\n").is_none());
    }

    #[test]
    fn test_old_versions_unsupported() {
        let old = Interpreter {
            executable: PathBuf::from("/usr/bin/python"),
            version: (2, 7, 18),
        };
        assert!(!old.is_supported());
        let edge = Interpreter {
            executable: PathBuf::from("/usr/bin/python3.8"),
            version: (3, 8, 0),
        };
        assert!(edge.is_supported());
    }

    #[test]
    fn test_standalone_urls() {
        let url = standalone_url("linux", "x86_64").unwrap();
        assert!(url.starts_with("https://github.com/indygreg/python-build-standalone/"));
        assert!(url.ends_with("cpython-3.11.6+20231002-x86_64-unknown-linux-gnu-install_only.tar.gz"));
        assert!(standalone_url("macos", "aarch64").unwrap().contains("aarch64-apple-darwin"));
        assert!(standalone_url("windows", "x86_64").is_none());
    }

    #[test]
    fn test_probe_missing_executable() {
        assert!(probe(Path::new("/nonexistent/python3")).is_none());
    }

    #[test]
    fn test_configured_missing_interpreter_is_configuration_error() {
        let config = PoolConfig::default().with_interpreter("/nonexistent/python3");
        let err = resolve(&config).unwrap_err();
        assert!(matches!(err, PyPoolError::Configuration(_)));
        assert!(err.to_string().contains("/nonexistent/python3"));
    }

    #[test]
    fn test_retry_with_backoff_returns_first_success() {
        let mut calls = 0;
        let result: std::result::Result<u32, String> = retry_with_backoff(3, || {
            calls += 1;
            Ok(7)
        });
        assert_eq!(result, Ok(7));
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_retry_with_backoff_gives_up() {
        let mut calls = 0;
        let result: std::result::Result<(), String> = retry_with_backoff(0, || {
            calls += 1;
            Err("offline".to_string())
        });
        assert_eq!(result, Err("offline".to_string()));
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_unpack_archive_moves_python_dir() {
        let dir = tempdir().unwrap();
        let archive = dir.path().join("python.tar.gz");
        {
            let file = File::create(&archive).unwrap();
            let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::fast()));
            let body = b"#!/bin/sh\n";
            let mut header = tar::Header::new_gnu();
            header.set_size(body.len() as u64);
            header.set_mode(0o755);
            header.set_cksum();
            builder
                .append_data(&mut header, "python/bin/python3", &body[..])
                .unwrap();
            builder.into_inner().unwrap().finish().unwrap();
        }

        let target = dir.path().join("python");
        unpack_archive(&archive, &target).unwrap();
        assert!(paths::provisioned_interpreter(&target).exists());
        assert!(!target.with_extension("staging").exists());
    }

    #[test]
    fn test_unpack_archive_rejects_unexpected_layout() {
        let dir = tempdir().unwrap();
        let archive = dir.path().join("other.tar.gz");
        {
            let file = File::create(&archive).unwrap();
            let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::fast()));
            let mut header = tar::Header::new_gnu();
            header.set_size(0);
            header.set_cksum();
            builder.append_data(&mut header, "other/README", &[][..]).unwrap();
            builder.into_inner().unwrap().finish().unwrap();
        }
        let err = unpack_archive(&archive, &dir.path().join("python")).unwrap_err();
        assert!(matches!(err, PyPoolError::Provision(_)));
    }
}
