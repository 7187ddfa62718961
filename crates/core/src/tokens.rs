//! Token issuers: a fixed map for wiring/tests and an environment-backed one for the CLI.

use std::collections::HashMap;

use anyhow::{anyhow, Result};

use crate::TokenIssuer;

/// Issues a fixed default token, or a per-reference token when one is registered.
#[derive(Debug, Clone, Default)]
pub struct StaticTokenIssuer {
    default: Option<String>,
    by_ref: HashMap<String, String>,
}

impl StaticTokenIssuer {
    pub fn new(default: impl Into<String>) -> Self { Self { default: Some(default.into()), by_ref: HashMap::new() } }

    pub fn with_ref(mut self, provider_ref: impl Into<String>, token: impl Into<String>) -> Self {
        self.by_ref.insert(provider_ref.into(), token.into());
        self
    }
}

#[async_trait::async_trait]
impl TokenIssuer for StaticTokenIssuer {
    async fn token(&self, provider_ref: Option<&str>) -> Result<String> {
        if let Some(r) = provider_ref {
            return self.by_ref.get(r).cloned().ok_or_else(|| anyhow!("no token registered for provider {}", r));
        }
        self.default.clone().ok_or_else(|| anyhow!("no default token configured"))
    }
}

/// Reads `KATO_TOKEN` for the default token and `KATO_TOKEN_<REF>` for references
/// (reference upper-cased, non-alphanumerics mapped to `_`).
#[derive(Debug, Clone, Default)]
pub struct EnvTokenIssuer;

impl EnvTokenIssuer {
    pub fn var_name(provider_ref: Option<&str>) -> String {
        match provider_ref {
            None => "KATO_TOKEN".to_string(),
            Some(r) => {
                let norm: String = r.chars().map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' }).collect();
                format!("KATO_TOKEN_{}", norm)
            }
        }
    }
}

#[async_trait::async_trait]
impl TokenIssuer for EnvTokenIssuer {
    async fn token(&self, provider_ref: Option<&str>) -> Result<String> {
        let var = Self::var_name(provider_ref);
        match std::env::var(&var) {
            Ok(v) if !v.is_empty() => Ok(v),
            _ => Err(anyhow!("token not available: {} is unset", var)),
        }
    }
}
