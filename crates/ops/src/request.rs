//! Inbound operation documents.
//!
//! A request body is a JSON array; each entry is an object with exactly one
//! variant key (`deployManifest`, `deleteManifest`, ...). Entries without a
//! known key are skipped.

use anyhow::{bail, Context, Result};
use kato_core::{Artifact, Document, Moniker};
use serde::{de, Deserialize, Deserializer, Serialize};
use serde_json::Value as Json;
use tracing::warn;

/// Accept `"3"` or `3` for fields callers send either way.
fn string_or_number<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    match Json::deserialize(d)? {
        Json::String(s) => Ok(s),
        Json::Number(n) => Ok(n.to_string()),
        Json::Null => Ok(String::new()),
        other => Err(de::Error::custom(format!("expected a string or number, got {}", other))),
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeployManifestRequest {
    pub account: String,
    pub manifests: Vec<Document>,
    pub moniker: Moniker,
    pub namespace_override: Option<String>,
    pub required_artifacts: Vec<Artifact>,
    pub optional_artifacts: Vec<Artifact>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeleteOptions {
    pub cascading: bool,
    pub grace_period_seconds: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeleteManifestRequest {
    pub account: String,
    pub app: String,
    pub manifest_name: String,
    pub location: String,
    pub mode: String,
    pub options: DeleteOptions,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ScaleManifestRequest {
    pub account: String,
    pub app: String,
    pub manifest_name: String,
    pub location: String,
    #[serde(deserialize_with = "string_or_number")]
    pub replicas: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PatchOptions {
    pub merge_strategy: String,
    pub record: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PatchManifestRequest {
    pub account: String,
    pub app: String,
    pub manifest_name: String,
    pub location: String,
    pub patch_body: Json,
    pub options: PatchOptions,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UndoRolloutManifestRequest {
    pub account: String,
    pub app: String,
    pub manifest_name: String,
    pub location: String,
    #[serde(deserialize_with = "string_or_number")]
    pub revision: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RollingRestartManifestRequest {
    pub account: String,
    pub app: String,
    pub manifest_name: String,
    pub location: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RunJobRequest {
    pub account: String,
    pub application: String,
    pub manifest: Document,
    pub namespace_override: Option<String>,
    pub required_artifacts: Vec<Artifact>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CleanupArtifactsRequest {
    pub account: String,
    pub manifests: Vec<Document>,
}

/// One requested mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Operation {
    DeployManifest(DeployManifestRequest),
    DeleteManifest(DeleteManifestRequest),
    ScaleManifest(ScaleManifestRequest),
    PatchManifest(PatchManifestRequest),
    UndoRolloutManifest(UndoRolloutManifestRequest),
    RollingRestartManifest(RollingRestartManifestRequest),
    RunJob(RunJobRequest),
    CleanupArtifacts(CleanupArtifactsRequest),
}

const VARIANT_KEYS: &[&str] = &[
    "deployManifest",
    "deleteManifest",
    "scaleManifest",
    "patchManifest",
    "undoRolloutManifest",
    "rollingRestartManifest",
    "runJob",
    "cleanupArtifacts",
];

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::DeployManifest(_) => "deployManifest",
            Operation::DeleteManifest(_) => "deleteManifest",
            Operation::ScaleManifest(_) => "scaleManifest",
            Operation::PatchManifest(_) => "patchManifest",
            Operation::UndoRolloutManifest(_) => "undoRolloutManifest",
            Operation::RollingRestartManifest(_) => "rollingRestartManifest",
            Operation::RunJob(_) => "runJob",
            Operation::CleanupArtifacts(_) => "cleanupArtifacts",
        }
    }

    pub fn account(&self) -> &str {
        match self {
            Operation::DeployManifest(r) => &r.account,
            Operation::DeleteManifest(r) => &r.account,
            Operation::ScaleManifest(r) => &r.account,
            Operation::PatchManifest(r) => &r.account,
            Operation::UndoRolloutManifest(r) => &r.account,
            Operation::RollingRestartManifest(r) => &r.account,
            Operation::RunJob(r) => &r.account,
            Operation::CleanupArtifacts(r) => &r.account,
        }
    }
}

/// Parse a request body into operations, in order. Unknown entries are
/// skipped; an entry naming more than one variant is rejected.
pub fn parse_operations(body: &Json) -> Result<Vec<Operation>> {
    let Some(entries) = body.as_array() else {
        bail!("operations must be a JSON array");
    };
    let mut ops = Vec::with_capacity(entries.len());
    for (i, entry) in entries.iter().enumerate() {
        let Some(obj) = entry.as_object() else {
            warn!(index = i, "skipping non-object operation entry");
            continue;
        };
        let keys: Vec<&str> = obj.keys().map(|k| k.as_str()).filter(|k| VARIANT_KEYS.contains(k)).collect();
        match keys.as_slice() {
            [] => {
                warn!(index = i, keys = ?obj.keys().collect::<Vec<_>>(), "skipping operation with no known variant");
            }
            [key] => {
                let mut single = serde_json::Map::new();
                single.insert(key.to_string(), obj[*key].clone());
                let op: Operation = serde_json::from_value(Json::Object(single)).with_context(|| format!("decoding {} at index {}", key, i))?;
                ops.push(op);
            }
            many => bail!("operation at index {} names more than one variant: {}", i, many.join(", ")),
        }
    }
    Ok(ops)
}
