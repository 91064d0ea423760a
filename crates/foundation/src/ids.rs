//! Typed identifiers for graph nodes.
//!
//! Nodes are identified by name. The wrapper keeps map keys and log output
//! honest about what the string means and provides consistent serialization.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Unique identity of a node in the expression graph.
///
/// Two nodes with the same `ArgId` are the same node as far as the engine is
/// concerned, even if they are distinct objects (de-duplicated aliases share
/// the canonical node's data token).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ArgId(String);

impl ArgId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ArgId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ArgId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ArgId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_roundtrip() {
        let id = ArgId::from("sig.mu");
        assert_eq!(id.as_str(), "sig.mu");
        assert_eq!(id.to_string(), "sig.mu");
        assert_eq!(id, ArgId::new(String::from("sig.mu")));
    }
}
