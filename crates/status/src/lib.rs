//! Kato status: typed workload views and the rollout status engine.
//!
//! Status is never stored. It is recomputed from the live document every time
//! a task or manifest is read.

#![forbid(unsafe_code)]

pub mod rollout;
pub mod views;

use anyhow::Result;
use kato_core::doc;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    pub state: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

impl Condition {
    fn yes() -> Self { Self { state: true, message: String::new() } }
    fn no() -> Self { Self { state: false, message: String::new() } }
}

/// Rollout summary of one object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RolloutStatus {
    pub stable: Condition,
    pub available: Condition,
    pub paused: Condition,
    pub failed: Condition,
}

impl Default for RolloutStatus {
    fn default() -> Self {
        Self { stable: Condition::yes(), available: Condition::yes(), paused: Condition::no(), failed: Condition::no() }
    }
}

impl RolloutStatus {
    pub fn unstable(&mut self, message: &str) {
        self.stable = Condition { state: false, message: message.to_string() };
    }

    pub fn unavailable(&mut self, message: &str) {
        self.available = Condition { state: false, message: message.to_string() };
    }

    pub fn fail(&mut self, message: &str) {
        self.failed = Condition { state: true, message: message.to_string() };
        self.unstable(message);
    }
}

/// Rollout status of a generic document. Kinds without rollout semantics are
/// reported stable.
pub fn status_for(d: &Json) -> Result<RolloutStatus> {
    let kind = doc::kind(d).to_ascii_lowercase();
    let status = match kind.as_str() {
        "deployment" => rollout::deployment(&views::deployment(d)?),
        "replicaset" => rollout::replica_set(&views::replica_set(d)?),
        "daemonset" => rollout::daemon_set(&views::daemon_set(d)?),
        "statefulset" => rollout::stateful_set(&views::stateful_set(d)?),
        "job" => rollout::job(&views::job(d)?),
        "pod" => rollout::pod(&views::pod(d)?),
        "horizontalpodautoscaler" => rollout::hpa(&views::hpa(d)?),
        _ => RolloutStatus::default(),
    };
    debug!(kind = %kind, name = doc::name(d), stable = status.stable.state, "rollout status");
    Ok(status)
}
