//! Version strings for the pypool binary and API.
//!
//! Release builds may set `PYPOOL_GIT_REV` at compile time to stamp the
//! git revision into `--version` and the diagnostics report.

use std::sync::LazyLock;

/// The package version from Cargo.toml.
pub const PKG_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Git revision baked in at build time (empty string if not set).
pub const GIT_REV: &str = match option_env!("PYPOOL_GIT_REV") {
    Some(rev) => rev,
    None => "",
};

static FULL_VERSION: LazyLock<String> = LazyLock::new(|| {
    if GIT_REV.is_empty() {
        PKG_VERSION.to_string()
    } else {
        format!("{} ({})", PKG_VERSION, GIT_REV)
    }
});

static LONG_VERSION: LazyLock<String> = LazyLock::new(|| {
    let mut version = full_version();
    version.push_str("\nWorker protocol: JSON lines over stdin/stdout");
    version
});

/// Returns the full version string for display.
///
/// `"X.Y.Z (abcdef0)"` when a git revision was recorded, otherwise `"X.Y.Z"`.
///
/// # Examples
///
/// ```
/// use pypool::version::full_version;
///
/// let version = full_version();
/// assert!(version.starts_with(env!("CARGO_PKG_VERSION")));
/// ```
pub fn full_version() -> String {
    FULL_VERSION.clone()
}

/// Returns the long version string for `--version`.
pub fn long_version() -> &'static str {
    LONG_VERSION.as_str()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_version_format() {
        let version = full_version();
        if GIT_REV.is_empty() {
            assert_eq!(version, PKG_VERSION);
        } else {
            assert!(version.contains(GIT_REV));
            assert!(version.ends_with(')'));
        }
    }

    #[test]
    fn test_long_version_mentions_protocol() {
        let long = long_version();
        assert!(long.starts_with(&full_version()));
        assert!(long.contains("JSON lines"));
    }
}
