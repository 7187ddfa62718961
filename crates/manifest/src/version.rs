//! Sequence numbers for versioned kinds.
//!
//! Versioned objects are never updated in place. Each deploy creates a new
//! object named `<name>-v<NNN>` and the previous ones stay around for rollback.

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use kato_core::{doc, keys, names::lower_camel};
use serde_json::Value as Json;

/// Sequence reported when no prior version exists.
pub const NO_VERSION: &str = "-1";

const MAX_SEQUENCE: u32 = 1000;

/// Next sequence in its two spellings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    /// Bare integer, e.g. `4`.
    pub short: String,
    /// Zero padded with a `v` prefix, e.g. `v004`.
    pub long: String,
}

/// Pods, ReplicaSets, ConfigMaps and Secrets are versioned unless the
/// document says otherwise via the versioned-strategy annotation.
pub fn is_versioned(d: &Json) -> bool {
    match doc::annotation(d, keys::STRATEGY_VERSIONED) {
        Some(v) if v.eq_ignore_ascii_case("true") => true,
        Some(v) if v.eq_ignore_ascii_case("false") => false,
        _ => matches!(doc::kind(d).to_ascii_lowercase().as_str(), "pod" | "replicaset" | "configmap" | "secret"),
    }
}

/// Cluster moniker for an object, `"<lowerCamelKind> <name>"`.
pub fn cluster_moniker(kind: &str, name: &str) -> String { format!("{} {}", lower_camel(kind), name) }

fn created_at(d: &Json) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(doc::creation_timestamp(d)).ok().map(|t| t.with_timezone(&Utc))
}

/// Current sequence of `kind name` among `candidates`: the sequence annotation
/// of the newest candidate in that cluster that carries a sequence label.
/// Returns [`NO_VERSION`] when nothing qualifies.
pub fn current_version(candidates: &[Json], kind: &str, name: &str) -> String {
    let cluster = cluster_moniker(kind, name);
    let newest = candidates
        .iter()
        .filter(|c| doc::annotation(c, keys::MONIKER_CLUSTER).map_or(false, |m| m.eq_ignore_ascii_case(&cluster)))
        .filter(|c| doc::label(c, keys::MONIKER_SEQUENCE).is_some())
        .max_by_key(|c| created_at(c));
    newest
        .and_then(|c| doc::annotation(c, keys::MONIKER_SEQUENCE))
        .map(|s| s.to_string())
        .unwrap_or_else(|| NO_VERSION.to_string())
}

/// Sequence after `current`, wrapping from 999 back to 0. Accepts the short
/// or long spelling.
pub fn increment_version(current: &str) -> Result<Version> {
    let raw = current.trim();
    let digits = raw.strip_prefix('v').unwrap_or(raw);
    let n: i64 = match digits.parse() {
        Ok(n) => n,
        Err(e) => bail!("invalid sequence {:?}: {}", current, e),
    };
    if n < -1 || n >= MAX_SEQUENCE as i64 {
        bail!("sequence {} out of range", n);
    }
    let next = ((n + 1) as u32) % MAX_SEQUENCE;
    Ok(Version { short: next.to_string(), long: format!("v{:03}", next) })
}

/// Rename `d` to its versioned name and stamp the sequence on the object and
/// its pod template.
pub fn apply_version(d: &mut Json, version: &Version) {
    let versioned = format!("{}-{}", doc::name(d), version.long);
    doc::set_name(d, &versioned);
    doc::set_annotation(d, keys::MONIKER_SEQUENCE, &version.short);
    doc::set_annotation(d, keys::ARTIFACT_VERSION, &version.long);
    doc::set_label(d, keys::MONIKER_SEQUENCE, &version.short);
    doc::set_pod_template_annotation(d, keys::MONIKER_SEQUENCE, &version.short);
    doc::set_pod_template_label(d, keys::MONIKER_SEQUENCE, &version.short);
}
