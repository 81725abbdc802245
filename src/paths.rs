//! Path utilities for pypool data storage.

use std::path::{Path, PathBuf};

/// Directory (under the data dir) holding a provisioned interpreter.
pub const PYTHON_DIR_NAME: &str = "python";

/// Get the data directory for pypool.
///
/// `PYPOOL_DATA_DIR` wins when set. Otherwise the platform data directory:
/// - Linux: `~/.local/share/pypool`
/// - macOS: `~/Library/Application Support/pypool`
pub fn get_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("PYPOOL_DATA_DIR")
        && !dir.is_empty()
    {
        return expand_tilde(dir);
    }
    dirs::data_dir()
        .map(|d| d.join("pypool"))
        .unwrap_or_else(|| PathBuf::from(".pypool"))
}

/// Install root for a provisioned interpreter.
pub fn get_python_dir() -> PathBuf {
    get_data_dir().join(PYTHON_DIR_NAME)
}

/// Executable inside a provisioned install root.
///
/// Standalone CPython archives unpack to `python/bin/python3`.
pub fn provisioned_interpreter<P: AsRef<Path>>(python_dir: P) -> PathBuf {
    python_dir.as_ref().join("bin").join("python3")
}

/// Expands a leading `~` in a path to the user's home directory.
///
/// # Examples
///
/// ```
/// use std::path::PathBuf;
/// use pypool::paths::expand_tilde;
///
/// let path = PathBuf::from("/tmp/foo");
/// assert_eq!(expand_tilde(&path), path);
/// ```
pub fn expand_tilde<P: AsRef<Path>>(path: P) -> PathBuf {
    let path = path.as_ref();
    if let Ok(stripped) = path.strip_prefix("~")
        && let Some(home) = dirs::home_dir()
    {
        return home.join(stripped);
    }
    path.to_path_buf()
}

/// Ensures the data directory exists, creating it and any missing parents.
pub fn ensure_data_dir() -> std::io::Result<PathBuf> {
    let data_dir = get_data_dir();
    if !data_dir.exists() {
        std::fs::create_dir_all(&data_dir)?;
    }
    Ok(data_dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_python_dir_is_in_data_dir() {
        let python_dir = get_python_dir();
        assert!(python_dir.starts_with(get_data_dir()));
        assert_eq!(python_dir.file_name().unwrap(), "python");
    }

    #[test]
    fn test_provisioned_interpreter_layout() {
        let exe = provisioned_interpreter("/opt/pypool/python");
        assert_eq!(exe, PathBuf::from("/opt/pypool/python/bin/python3"));
    }

    #[test]
    fn test_expand_tilde_with_home() {
        let expanded = expand_tilde("~/Documents/test");
        assert!(!expanded.to_str().unwrap().starts_with("~"));
        assert!(expanded.to_str().unwrap().ends_with("Documents/test"));
    }

    #[test]
    fn test_expand_tilde_relative_path_unchanged() {
        let path = PathBuf::from("./relative/path");
        assert_eq!(expand_tilde(&path), path);
    }
}
