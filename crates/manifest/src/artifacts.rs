//! Rewrite artifact references in pod specs before apply.

use std::collections::HashMap;

use kato_core::{doc, Artifact};
use serde_json::Value as Json;
use tracing::debug;

pub const DOCKER_IMAGE: &str = "docker/image";
pub const CONFIG_MAP: &str = "kubernetes/configMap";
pub const SECRET: &str = "kubernetes/secret";

/// Artifacts indexed by `(type, name)`. Later entries win.
pub struct ArtifactIndex<'a> {
    by_key: HashMap<(&'a str, &'a str), &'a str>,
}

impl<'a> ArtifactIndex<'a> {
    pub fn new(artifacts: impl IntoIterator<Item = &'a Artifact>) -> Self {
        let mut by_key = HashMap::new();
        for a in artifacts {
            if a.name.is_empty() || a.reference.is_empty() {
                continue;
            }
            by_key.insert((a.type_.as_str(), a.name.as_str()), a.reference.as_str());
        }
        Self { by_key }
    }

    fn reference(&self, type_: &str, name: &str) -> Option<&'a str> { self.by_key.get(&(type_, name)).copied() }

    pub fn is_empty(&self) -> bool { self.by_key.is_empty() }
}

fn rewrite(slot: Option<&mut Json>, index: &ArtifactIndex<'_>, type_: &str) -> bool {
    let Some(slot) = slot else { return false };
    let Some(reference) = slot.as_str().and_then(|current| index.reference(type_, current)) else { return false };
    *slot = Json::String(reference.to_string());
    true
}

/// Replace container images (including init containers) and configMap/secret
/// volume names that exactly match an artifact of the right type. Returns how
/// many fields changed. Kinds without a pod spec are left alone.
pub fn bind_artifacts(d: &mut Json, index: &ArtifactIndex<'_>) -> usize {
    if index.is_empty() {
        return 0;
    }
    let kind = doc::kind(d).to_string();
    let Some(path) = doc::pod_spec_path(&kind) else { return 0 };
    let mut spec = &mut *d;
    for seg in path {
        match spec.get_mut(*seg) {
            Some(next) => spec = next,
            None => return 0,
        }
    }

    let mut changed = 0;
    for list in ["containers", "initContainers"] {
        if let Some(containers) = spec.get_mut(list).and_then(|c| c.as_array_mut()) {
            for c in containers.iter_mut() {
                changed += rewrite(c.get_mut("image"), index, DOCKER_IMAGE) as usize;
            }
        }
    }
    if let Some(volumes) = spec.get_mut("volumes").and_then(|v| v.as_array_mut()) {
        for v in volumes.iter_mut() {
            changed += rewrite(v.pointer_mut("/configMap/name"), index, CONFIG_MAP) as usize;
            changed += rewrite(v.pointer_mut("/secret/secretName"), index, SECRET) as usize;
        }
    }
    if changed > 0 {
        debug!(kind = %kind, name = doc::name(d), changed, "artifacts bound");
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn artifact(type_: &str, name: &str, reference: &str) -> Artifact {
        Artifact { type_: type_.into(), name: name.into(), reference: reference.into(), ..Default::default() }
    }

    #[test]
    fn rewrites_matching_image_only() {
        let arts = vec![artifact(DOCKER_IMAGE, "gcr.io/p/img", "gcr.io/p/img:v1.0.0")];
        let mut d = json!({
            "kind": "Deployment",
            "metadata": { "name": "web" },
            "spec": { "template": { "spec": { "containers": [
                { "name": "a", "image": "gcr.io/p/img" },
                { "name": "b", "image": "gcr.io/p/other" }
            ] } } }
        });
        assert_eq!(bind_artifacts(&mut d, &ArtifactIndex::new(&arts)), 1);
        let cs = &d["spec"]["template"]["spec"]["containers"];
        assert_eq!(cs[0]["image"], "gcr.io/p/img:v1.0.0");
        assert_eq!(cs[1]["image"], "gcr.io/p/other");
    }

    #[test]
    fn pod_volumes_init_containers_and_type_mismatch() {
        let arts = vec![
            artifact(CONFIG_MAP, "cfg", "cfg-v002"),
            artifact(SECRET, "creds", "creds-v000"),
            artifact(CONFIG_MAP, "busybox", "wrong-type"),
            artifact(DOCKER_IMAGE, "busybox", "busybox:1.36"),
        ];
        let mut d = json!({
            "kind": "Pod",
            "metadata": { "name": "p" },
            "spec": {
                "initContainers": [ { "name": "init", "image": "busybox" } ],
                "containers": [ { "name": "main", "image": "app" } ],
                "volumes": [
                    { "name": "v1", "configMap": { "name": "cfg" } },
                    { "name": "v2", "secret": { "secretName": "creds" } },
                    { "name": "v3", "secret": { "secretName": "cfg" } }
                ]
            }
        });
        assert_eq!(bind_artifacts(&mut d, &ArtifactIndex::new(&arts)), 3);
        assert_eq!(d["spec"]["initContainers"][0]["image"], "busybox:1.36");
        assert_eq!(d["spec"]["containers"][0]["image"], "app");
        assert_eq!(d["spec"]["volumes"][0]["configMap"]["name"], "cfg-v002");
        assert_eq!(d["spec"]["volumes"][1]["secret"]["secretName"], "creds-v000");
        assert_eq!(d["spec"]["volumes"][2]["secret"]["secretName"], "cfg");
    }

    #[test]
    fn cron_job_template_and_kinds_without_containers() {
        let arts = vec![artifact(DOCKER_IMAGE, "job", "job:2")];
        let mut cj = json!({
            "kind": "CronJob",
            "metadata": { "name": "c" },
            "spec": { "jobTemplate": { "spec": { "template": { "spec": { "containers": [ { "image": "job" } ] } } } } }
        });
        assert_eq!(bind_artifacts(&mut cj, &ArtifactIndex::new(&arts)), 1);
        let mut svc = json!({ "kind": "Service", "metadata": { "name": "s" } });
        assert_eq!(bind_artifacts(&mut svc, &ArtifactIndex::new(&arts)), 0);
        let mut bare = json!({ "kind": "Deployment", "metadata": { "name": "d" }, "spec": {} });
        assert_eq!(bind_artifacts(&mut bare, &ArtifactIndex::new(&arts)), 0);
    }
}
