//! Per-operation cluster connection config.
//!
//! Built fresh from the account's provider record and a freshly issued token
//! for every operation; nothing here is cached, so rotated credentials apply
//! on the next call.

use std::fmt;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use kato_core::Provider;
use kube::config::{KubeConfigOptions, Kubeconfig};

use crate::{ClientError, ClientResult, REQUEST_TIMEOUT};

const PEM_CERT_MARKER: &str = "-----BEGIN CERTIFICATE-----";

#[derive(Clone)]
pub struct ClusterConfig {
    pub name: String,
    pub host: String,
    /// Base64 PEM bundle, validated at construction.
    pub ca_data: Option<String>,
    pub bearer_token: String,
    pub timeout: Duration,
}

impl fmt::Debug for ClusterConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterConfig")
            .field("name", &self.name)
            .field("host", &self.host)
            .field("has_ca", &self.ca_data.is_some())
            .field("bearer_token", &"<redacted>")
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl ClusterConfig {
    /// Validate the provider's connection data. Fails before any network call
    /// on a missing host or malformed CA data; decode errors keep their own text.
    pub fn from_provider(provider: &Provider, bearer_token: String) -> ClientResult<Self> {
        if provider.host.trim().is_empty() {
            return Err(ClientError::Config(format!("provider {} has no host", provider.name)));
        }
        let ca_data = match provider.ca_data.trim() {
            "" => None,
            raw => {
                let pem = BASE64.decode(raw).map_err(|e| ClientError::Config(e.to_string()))?;
                let text = String::from_utf8_lossy(&pem);
                if !text.contains(PEM_CERT_MARKER) {
                    return Err(ClientError::Config(format!("CA data for provider {} is not a PEM certificate bundle", provider.name)));
                }
                Some(raw.to_string())
            }
        };
        Ok(Self { name: provider.name.clone(), host: provider.host.clone(), ca_data, bearer_token, timeout: REQUEST_TIMEOUT })
    }

    /// In-memory kubeconfig with one cluster, one token user and one context.
    pub fn kubeconfig(&self) -> ClientResult<Kubeconfig> {
        let mut cluster = serde_json::json!({ "server": self.host });
        if let Some(ca) = &self.ca_data {
            cluster["certificate-authority-data"] = serde_json::Value::String(ca.clone());
        }
        let doc = serde_json::json!({
            "apiVersion": "v1",
            "kind": "Config",
            "clusters": [ { "name": self.name, "cluster": cluster } ],
            "users": [ { "name": self.name, "user": { "token": self.bearer_token } } ],
            "contexts": [ { "name": self.name, "context": { "cluster": self.name, "user": self.name } } ],
            "current-context": self.name,
        });
        Ok(serde_json::from_value(doc)?)
    }

    pub async fn kube_config(&self) -> ClientResult<kube::Config> {
        let kubeconfig = self.kubeconfig()?;
        let mut config = kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .map_err(|e| ClientError::Config(e.to_string()))?;
        config.read_timeout = Some(self.timeout);
        Ok(config)
    }
}
