use anyhow::Result;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

pub mod branches;

pub use branches::{format_branches, parse_branches};

/// Stable, caller-assigned repository identifier.
pub type RepoId = u32;

/// Indexing urgency. Higher values are dequeued first.
pub type Priority = f64;

/// A branch name pinned to the commit that should be (or was) indexed.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, JsonSchema)]
pub struct Branch {
    pub name: String,
    pub version: String,
}

impl Branch {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }
}

impl fmt::Display for Branch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.version)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, JsonSchema)]
pub struct ErrorEnvelope {
    pub code: String,
    pub message: String,
    pub details: Option<serde_json::Value>,
    pub hint: Option<String>,
}

impl ErrorEnvelope {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
            hint: None,
        }
    }

    #[must_use]
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }
}

pub fn serialize_json<T: Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn branch_displays_as_name_at_version() {
        assert_eq!(Branch::new("main", "deadbeef").to_string(), "main@deadbeef");
    }

    #[test]
    fn error_envelope_serializes_hint() {
        let env = ErrorEnvelope::new("not_found", "no such route").with_hint("try /debug/queue");
        let raw = serialize_json(&env).expect("serialize");
        assert!(raw.contains("\"code\":\"not_found\""));
        assert!(raw.contains("\"hint\":\"try /debug/queue\""));
    }
}
