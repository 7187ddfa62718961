//! `"<kind> <name>"` addressing used by callers to point at one object.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NameError {
    #[error("manifest name {0:?} must be of the form \"<kind> <name>\"")]
    Malformed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestName {
    pub kind: String,
    pub name: String,
}

impl ManifestName {
    /// Parse `"<kind> <name>"`. A dot-qualified kind such as
    /// `HorizontalPodAutoscaler.autoscaling` keeps only the part before the first dot.
    pub fn parse(s: &str) -> Result<Self, NameError> {
        let mut parts = s.split_whitespace();
        let (kind, name) = match (parts.next(), parts.next(), parts.next()) {
            (Some(k), Some(n), None) => (k, n),
            _ => return Err(NameError::Malformed(s.to_string())),
        };
        let kind = kind.split('.').next().unwrap_or(kind);
        if kind.is_empty() {
            return Err(NameError::Malformed(s.to_string()));
        }
        Ok(Self { kind: kind.to_string(), name: name.to_string() })
    }

    pub fn is_kind(&self, kind: &str) -> bool { self.kind.eq_ignore_ascii_case(kind) }
}

impl fmt::Display for ManifestName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{} {}", self.kind, self.name) }
}

/// `Deployment` -> `deployment`, `ReplicaSet` -> `replicaSet`.
pub fn lower_camel(kind: &str) -> String {
    let mut chars = kind.chars();
    match chars.next() {
        Some(first) => first.to_lowercase().chain(chars).collect(),
        None => String::new(),
    }
}
