//! Spinnaker bookkeeping stamped on every deployed object.

use kato_core::{doc, keys, names::lower_camel, Moniker};
use serde_json::Value as Json;

use crate::version::{cluster_moniker, is_versioned};

/// Stamp application, cluster and artifact annotations plus the
/// managed-by/name labels on `d` and, for controllers, on its pod template.
/// `location` is the namespace the object lands in.
///
/// Versioned objects always carry their own `"<kind> <name>"` cluster, since
/// that is what the next deploy looks them up by. Other objects take the
/// requested cluster when one is given.
pub fn annotate(d: &mut Json, moniker: &Moniker, location: &str) {
    let kind = doc::kind(d).to_string();
    let name = doc::name(d).to_string();
    let cluster = match moniker.cluster.as_deref().filter(|c| !c.is_empty()) {
        Some(c) if !is_versioned(d) => c.to_string(),
        _ => cluster_moniker(&kind, &name),
    };
    let artifact_type = format!("kubernetes/{}", lower_camel(&kind));

    let annotations = [
        (keys::MONIKER_APPLICATION, moniker.app.as_str()),
        (keys::MONIKER_CLUSTER, cluster.as_str()),
        (keys::ARTIFACT_NAME, name.as_str()),
        (keys::ARTIFACT_TYPE, artifact_type.as_str()),
        (keys::ARTIFACT_LOCATION, location),
    ];
    for (k, v) in annotations {
        doc::set_annotation(d, k, v);
        doc::set_pod_template_annotation(d, k, v);
    }

    let labels = [(keys::LABEL_MANAGED_BY, keys::MANAGED_BY_SPINNAKER), (keys::LABEL_NAME, moniker.app.as_str())];
    for (k, v) in labels {
        doc::set_label(d, k, v);
        doc::set_pod_template_label(d, k, v);
    }
}
