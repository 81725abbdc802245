//! Allow-list for `call_module` targets.

use crate::error::{PyPoolError, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Which `(module, function)` pairs `call_module` may reach.
///
/// Entries are written as `module` (any public function of the module) or
/// `module:function` (that function only), e.g. `math,os.path:join`.
/// Underscore-prefixed attributes are always refused, whatever the entries
/// say.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModulePolicy {
    modules: BTreeMap<String, Allowed>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Allowed {
    Everything,
    Only(BTreeSet<String>),
}

/// A malformed policy entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyParseError {
    entry: String,
    reason: &'static str,
}

impl fmt::Display for PolicyParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid module policy entry '{}': {}", self.entry, self.reason)
    }
}

impl std::error::Error for PolicyParseError {}

impl ModulePolicy {
    /// Parse a comma separated list of entries. Blank entries are skipped.
    pub fn parse(entries: &str) -> std::result::Result<Self, PolicyParseError> {
        let mut policy = Self::default();
        for raw in entries.split(',') {
            let entry = raw.trim();
            if entry.is_empty() {
                continue;
            }
            let invalid = |reason| PolicyParseError {
                entry: entry.to_string(),
                reason,
            };
            match entry.split_once(':') {
                Some((module, function)) => {
                    let (module, function) = (module.trim(), function.trim());
                    if !is_dotted_name(module) {
                        return Err(invalid("module is not a dotted identifier"));
                    }
                    if !is_dotted_name(function) {
                        return Err(invalid("function is not a dotted identifier"));
                    }
                    policy.allow_function(module, function);
                }
                None => {
                    if !is_dotted_name(entry) {
                        return Err(invalid("module is not a dotted identifier"));
                    }
                    policy.allow_module(entry);
                }
            }
        }
        Ok(policy)
    }

    /// Allow every public function of `module`.
    pub fn allow_module(&mut self, module: &str) {
        self.modules.insert(module.to_string(), Allowed::Everything);
    }

    /// Allow one function of `module`. No-op if the whole module is allowed.
    pub fn allow_function(&mut self, module: &str, function: &str) {
        let entry = self
            .modules
            .entry(module.to_string())
            .or_insert_with(|| Allowed::Only(BTreeSet::new()));
        if let Allowed::Only(functions) = entry {
            functions.insert(function.to_string());
        }
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    pub fn permits(&self, module: &str, function: &str) -> bool {
        if function.split('.').any(|part| part.starts_with('_')) {
            return false;
        }
        match self.modules.get(module) {
            Some(Allowed::Everything) => true,
            Some(Allowed::Only(functions)) => functions.contains(function),
            None => false,
        }
    }

    /// Like [`permits`](Self::permits), as a `PolicyDenied` error.
    pub fn check(&self, module: &str, function: &str) -> Result<()> {
        if self.permits(module, function) {
            Ok(())
        } else {
            Err(PyPoolError::PolicyDenied {
                module: module.to_string(),
                function: function.to_string(),
            })
        }
    }
}

impl fmt::Display for ModulePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (module, allowed) in &self.modules {
            let entries: Vec<String> = match allowed {
                Allowed::Everything => vec![module.clone()],
                Allowed::Only(functions) => functions
                    .iter()
                    .map(|function| format!("{}:{}", module, function))
                    .collect(),
            };
            for entry in entries {
                if !first {
                    f.write_str(",")?;
                }
                f.write_str(&entry)?;
                first = false;
            }
        }
        Ok(())
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c == '_' || c.is_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c == '_' || c.is_alphanumeric())
}

/// `os.path`, `json`, ...
pub(crate) fn is_dotted_name(name: &str) -> bool {
    !name.is_empty() && name.split('.').all(is_identifier)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_module_and_function_entries() {
        let policy = ModulePolicy::parse("math, os.path:join").unwrap();
        assert!(policy.permits("math", "sqrt"));
        assert!(policy.permits("math", "floor"));
        assert!(policy.permits("os.path", "join"));
        assert!(!policy.permits("os.path", "exists"));
        assert!(!policy.permits("os", "system"));
    }

    #[test]
    fn test_private_names_always_refused() {
        let policy = ModulePolicy::parse("math").unwrap();
        assert!(!policy.permits("math", "_private"));
        assert!(!policy.permits("math", "__import__"));
        assert!(!policy.permits("math", "inf.__class__"));
    }

    #[test]
    fn test_module_entry_subsumes_function_entries() {
        let policy = ModulePolicy::parse("json:dumps,json").unwrap();
        assert!(policy.permits("json", "loads"));
        assert_eq!(policy.to_string(), "json");
    }

    #[test]
    fn test_blank_entries_skipped() {
        let policy = ModulePolicy::parse(" , ,").unwrap();
        assert!(policy.is_empty());
        assert!(!policy.permits("math", "sqrt"));
    }

    #[test]
    fn test_invalid_entries_rejected() {
        let err = ModulePolicy::parse("math,os;rm").unwrap_err();
        assert!(err.to_string().contains("os;rm"));
        assert!(ModulePolicy::parse("math:").is_err());
        assert!(ModulePolicy::parse("1abc").is_err());
        assert!(ModulePolicy::parse("a..b").is_err());
    }

    #[test]
    fn test_check_returns_policy_denied() {
        let policy = ModulePolicy::parse("math:sqrt").unwrap();
        assert!(policy.check("math", "sqrt").is_ok());
        let err = policy.check("subprocess", "run").unwrap_err();
        assert!(matches!(err, PyPoolError::PolicyDenied { .. }));
    }

    #[test]
    fn test_display_roundtrips() {
        let policy = ModulePolicy::parse("os.path:join,math,os.path:basename").unwrap();
        let again = ModulePolicy::parse(&policy.to_string()).unwrap();
        assert_eq!(policy, again);
    }

    #[test]
    fn test_dotted_names() {
        assert!(is_dotted_name("os.path"));
        assert!(is_dotted_name("_thread"));
        assert!(!is_dotted_name(""));
        assert!(!is_dotted_name("os."));
        assert!(!is_dotted_name("os path"));
    }
}
