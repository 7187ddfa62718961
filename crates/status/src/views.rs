//! Typed projections of generic documents.
//!
//! A view is decoded from a copy of the document and is never written back
//! wholesale. Mutations go through [`merge_back`], which copies only the
//! touched sub-tree into the generic document, so fields the typed structs do
//! not model survive untouched.

use anyhow::{Context, Result};
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, ReplicaSet, StatefulSet};
use k8s_openapi::api::autoscaling::v2::HorizontalPodAutoscaler;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Pod;
use kato_core::doc;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value as Json;

/// Status counters the typed structs require; an absent counter means zero.
const REQUIRED_STATUS: &[(&str, &[&str])] = &[
    ("DaemonSet", &["currentNumberScheduled", "desiredNumberScheduled", "numberMisscheduled", "numberReady"]),
    ("ReplicaSet", &["replicas"]),
    ("StatefulSet", &["replicas"]),
    ("HorizontalPodAutoscaler", &["desiredReplicas"]),
];

/// True when the document carries a non-empty `status` object.
pub fn has_status(d: &Json) -> bool {
    d.get("status").and_then(|s| s.as_object()).map_or(false, |s| !s.is_empty())
}

/// Decode `d` as `K`. The apiVersion/kind are normalised to `K`'s, so a
/// document served at another version of the same group still projects. An
/// empty status becomes `None`.
pub fn project<K>(d: &Json) -> Result<K>
where
    K: k8s_openapi::Resource + DeserializeOwned,
{
    let mut v = d.clone();
    let present = has_status(&v);
    if let Some(obj) = v.as_object_mut() {
        obj.insert("apiVersion".into(), Json::String(K::API_VERSION.to_string()));
        obj.insert("kind".into(), Json::String(K::KIND.to_string()));
        if !present {
            obj.remove("status");
        }
    }
    if present {
        if let Some((_, fields)) = REQUIRED_STATUS.iter().find(|(k, _)| *k == K::KIND) {
            let status = doc::object_at_mut(&mut v, &["status"]);
            for f in fields.iter() {
                status.entry(f.to_string()).or_insert(Json::from(0));
            }
        }
    }
    serde_json::from_value(v).with_context(|| format!("decoding {} {}", K::KIND, doc::name(d)))
}

/// Copy the sub-tree at JSON pointer `pointer` from the serialized `view`
/// into `d`, creating parents as needed. A pointer the view leaves empty
/// removes the field from `d`.
pub fn merge_back<K: Serialize>(d: &mut Json, view: &K, pointer: &str) -> Result<()> {
    let rendered = serde_json::to_value(view).context("encoding typed view")?;
    let segments: Vec<&str> = pointer.trim_start_matches('/').split('/').filter(|s| !s.is_empty()).collect();
    let Some((last, parents)) = segments.split_last() else {
        anyhow::bail!("empty merge pointer");
    };
    let parent = doc::object_at_mut(d, parents);
    match rendered.pointer(pointer) {
        Some(v) => {
            parent.insert(last.to_string(), v.clone());
        }
        None => {
            parent.remove(*last);
        }
    }
    Ok(())
}

pub fn deployment(d: &Json) -> Result<Deployment> { project(d) }
pub fn replica_set(d: &Json) -> Result<ReplicaSet> { project(d) }
pub fn daemon_set(d: &Json) -> Result<DaemonSet> { project(d) }
pub fn stateful_set(d: &Json) -> Result<StatefulSet> { project(d) }
pub fn job(d: &Json) -> Result<Job> { project(d) }
pub fn pod(d: &Json) -> Result<Pod> { project(d) }
pub fn hpa(d: &Json) -> Result<HorizontalPodAutoscaler> { project(d) }

/// Set a Deployment's desired replica count through its typed view.
pub fn set_deployment_replicas(d: &mut Json, replicas: i32) -> Result<()> {
    let mut view = deployment(d)?;
    view.spec.get_or_insert_with(Default::default).replicas = Some(replicas);
    merge_back(d, &view, "/spec/replicas")
}

/// Stamp one pod-template annotation on a Deployment through its typed view.
pub fn set_deployment_template_annotation(d: &mut Json, key: &str, value: &str) -> Result<()> {
    let mut view = deployment(d)?;
    let spec = view.spec.get_or_insert_with(Default::default);
    let meta = spec.template.metadata.get_or_insert_with(Default::default);
    meta.annotations.get_or_insert_with(Default::default).insert(key.to_string(), value.to_string());
    merge_back(d, &view, "/spec/template/metadata/annotations")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn deploy() -> Json {
        json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": { "name": "web", "namespace": "prod", "annotations": { "a": "1" } },
            "spec": {
                "replicas": 2,
                "selector": { "matchLabels": { "app": "web" } },
                "template": {
                    "metadata": { "labels": { "app": "web" } },
                    "spec": { "containers": [ { "name": "web", "image": "nginx", "futureField": true } ] }
                },
                "someExtension": { "keep": "me" }
            },
            "status": {}
        })
    }

    #[test]
    fn empty_status_projects_to_none() {
        let d = deployment(&deploy()).unwrap();
        assert!(d.status.is_none());
        assert_eq!(d.spec.unwrap().replicas, Some(2));
    }

    #[test]
    fn required_counters_default_to_zero() {
        let ds = daemon_set(&json!({
            "kind": "DaemonSet",
            "metadata": { "name": "agent" },
            "spec": { "selector": {}, "template": {} },
            "status": { "numberAvailable": 1 }
        }))
        .unwrap();
        let st = ds.status.unwrap();
        assert_eq!(st.desired_number_scheduled, 0);
        assert_eq!(st.number_available, Some(1));
    }

    #[test]
    fn replica_change_leaves_unmodelled_fields_alone() {
        let mut d = deploy();
        set_deployment_replicas(&mut d, 7).unwrap();
        assert_eq!(d["spec"]["replicas"], 7);
        assert_eq!(d["spec"]["someExtension"]["keep"], "me");
        assert_eq!(d["spec"]["template"]["spec"]["containers"][0]["futureField"], true);
        assert_eq!(d["status"], json!({}));
    }

    #[test]
    fn template_annotation_is_added_next_to_existing_ones() {
        let mut d = deploy();
        d["spec"]["template"]["metadata"]["annotations"] = json!({ "keep": "x" });
        set_deployment_template_annotation(&mut d, "restartedAt", "now").unwrap();
        assert_eq!(d["spec"]["template"]["metadata"]["annotations"], json!({ "keep": "x", "restartedAt": "now" }));
        assert_eq!(d["spec"]["template"]["spec"]["containers"][0]["futureField"], true);
    }

    #[test]
    fn other_served_versions_still_project() {
        let h = hpa(&json!({
            "apiVersion": "autoscaling/v1",
            "kind": "HorizontalPodAutoscaler",
            "metadata": { "name": "web" },
            "spec": { "maxReplicas": 5, "scaleTargetRef": { "kind": "Deployment", "name": "web" } },
            "status": { "currentReplicas": 2 }
        }))
        .unwrap();
        let st = h.status.unwrap();
        assert_eq!(st.current_replicas, Some(2));
        assert_eq!(st.desired_replicas, 0);
    }
}
