//! Kato apply: last-applied bookkeeping and three-way merge patches.
//!
//! `Apply` in the cluster client is create-or-patch. On patch it computes a
//! three-way patch from the configuration recorded at the previous apply
//! (`original`), the caller's new configuration (`modified`) and the live
//! object (`current`). Only fields the caller owns are touched: fields the
//! caller drops since the previous apply are deleted, fields changed by others
//! but not mentioned by the caller are left alone.

#![forbid(unsafe_code)]

use std::fmt;
use std::str::FromStr;

use anyhow::{Context, Result};
use kato_core::{doc, keys};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};

/// Patch semantics the cluster understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PatchStrategy {
    Strategic,
    Json,
    Merge,
}

impl PatchStrategy {
    pub fn content_type(&self) -> &'static str {
        match self {
            PatchStrategy::Strategic => "application/strategic-merge-patch+json",
            PatchStrategy::Json => "application/json-patch+json",
            PatchStrategy::Merge => "application/merge-patch+json",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid merge strategy {0}")]
pub struct InvalidStrategy(pub String);

impl FromStr for PatchStrategy {
    type Err = InvalidStrategy;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "strategic" => Ok(PatchStrategy::Strategic),
            "json" => Ok(PatchStrategy::Json),
            "merge" => Ok(PatchStrategy::Merge),
            other => Err(InvalidStrategy(other.to_string())),
        }
    }
}

impl fmt::Display for PatchStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PatchStrategy::Strategic => "strategic",
            PatchStrategy::Json => "json",
            PatchStrategy::Merge => "merge",
        })
    }
}

/// Drop fields the server owns; they never belong in an applied configuration.
pub fn strip_server_fields(mut v: Json) -> Json {
    if let Some(meta) = v.get_mut("metadata") {
        if let Some(obj) = meta.as_object_mut() {
            obj.remove("managedFields");
            obj.remove("resourceVersion");
            obj.remove("generation");
            obj.remove("creationTimestamp");
            obj.remove("uid");
            obj.remove("selfLink");
        }
    }
    if let Some(obj) = v.as_object_mut() {
        obj.remove("status");
    }
    v
}

/// Serialized form of `doc` as it should be recorded in the last-applied
/// annotation: the document itself minus that annotation.
pub fn last_applied_configuration(doc: &Json) -> Result<String> {
    let mut copy = doc.clone();
    doc::remove_annotation(&mut copy, keys::LAST_APPLIED);
    prune_empty_annotations(&mut copy);
    serde_json::to_string(&copy).context("serializing last-applied configuration")
}

fn prune_empty_annotations(v: &mut Json) {
    if let Some(meta) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        if meta.get("annotations").and_then(|a| a.as_object()).map_or(false, |a| a.is_empty()) {
            meta.remove("annotations");
        }
    }
}

/// Caller document prepared for apply: server fields stripped and the
/// last-applied annotation stamped from its own content.
pub fn prepare_modified(doc: &Json) -> Result<Json> {
    let mut modified = strip_server_fields(doc.clone());
    let cfg = last_applied_configuration(&modified)?;
    doc::set_annotation(&mut modified, keys::LAST_APPLIED, &cfg);
    Ok(modified)
}

/// Configuration recorded by the previous apply, if the live object carries one.
pub fn original_from_live(live: &Json) -> Result<Option<Json>> {
    match doc::annotation(live, keys::LAST_APPLIED) {
        Some(s) if !s.is_empty() => {
            let v = serde_json::from_str(s).context("parsing last-applied configuration annotation")?;
            Ok(Some(v))
        }
        _ => Ok(None),
    }
}

/// API groups served by the apiserver itself. Their types carry patch merge
/// keys, so applies to them use strategic merge patches.
const BUILTIN_GROUPS: &[&str] = &[
    "",
    "apps",
    "batch",
    "autoscaling",
    "policy",
    "networking.k8s.io",
    "rbac.authorization.k8s.io",
    "storage.k8s.io",
    "scheduling.k8s.io",
    "coordination.k8s.io",
    "discovery.k8s.io",
    "node.k8s.io",
    "apiextensions.k8s.io",
];

/// Patch flavour `Apply` sends for objects of `group`. Custom resources only
/// understand JSON merge patches.
pub fn apply_strategy(group: &str) -> PatchStrategy {
    if BUILTIN_GROUPS.contains(&group) { PatchStrategy::Strategic } else { PatchStrategy::Merge }
}

/// Merge key of a list field under strategic merge. `elems` disambiguates
/// `ports`, which are keyed by `containerPort` in pods and by `port` elsewhere.
fn merge_key(field: &str, elems: &[Json]) -> Option<&'static str> {
    match field {
        "containers" | "initContainers" | "ephemeralContainers" | "volumes" | "env" | "imagePullSecrets" => Some("name"),
        "volumeMounts" => Some("mountPath"),
        "ports" if elems.iter().any(|e| e.get("containerPort").is_some()) => Some("containerPort"),
        "ports" => Some("port"),
        _ => None,
    }
}

fn keyed(list: &[Json], key: &str) -> bool { list.iter().all(|e| e.get(key).is_some()) }

fn find_keyed<'a>(list: &'a [Json], key: &str, id: &Json) -> Option<&'a Json> { list.iter().find(|e| e.get(key) == Some(id)) }

/// Three-way JSON merge patch turning `current` into the caller's intent.
/// Lists are replaced wholesale. Returns an object; an empty object means
/// nothing to do.
pub fn three_way_merge_patch(original: Option<&Json>, modified: &Json, current: &Json) -> Json {
    three_way_patch(original, modified, current, PatchStrategy::Merge)
}

/// Three-way patch in the given flavour. Under [`PatchStrategy::Strategic`]
/// keyed lists are merged element by element, so entries added by others
/// (injected sidecars, server defaults inside containers) are left alone.
pub fn three_way_patch(original: Option<&Json>, modified: &Json, current: &Json, strategy: PatchStrategy) -> Json {
    let empty = Map::new();
    let m = modified.as_object().unwrap_or(&empty);
    let strategic = strategy == PatchStrategy::Strategic;
    Json::Object(three_way(original.and_then(|o| o.as_object()), m, current.as_object(), strategic))
}

fn three_way(original: Option<&Map<String, Json>>, modified: &Map<String, Json>, current: Option<&Map<String, Json>>, strategic: bool) -> Map<String, Json> {
    let mut patch = Map::new();
    for (k, mv) in modified.iter() {
        let cv = current.and_then(|c| c.get(k));
        let ov = original.and_then(|o| o.get(k));
        let list_key = match (mv, cv) {
            (Json::Array(ma), Some(Json::Array(ca))) if strategic => merge_key(k, ma).filter(|key| keyed(ma, key) && keyed(ca, key)),
            _ => None,
        };
        match (mv, cv, list_key) {
            (Json::Object(mo), Some(Json::Object(co)), _) => {
                let sub = three_way(ov.and_then(|o| o.as_object()), mo, Some(co), strategic);
                if !sub.is_empty() {
                    patch.insert(k.clone(), Json::Object(sub));
                }
            }
            (Json::Array(ma), Some(Json::Array(ca)), Some(key)) => {
                let sub = keyed_list_patch(ov.and_then(|o| o.as_array()).map(|o| o.as_slice()), ma, ca, key);
                if !sub.is_empty() {
                    patch.insert(k.clone(), Json::Array(sub));
                }
            }
            _ => {
                if cv != Some(mv) {
                    patch.insert(k.clone(), mv.clone());
                }
            }
        }
    }
    // Deletions: previously applied, no longer wanted, still present.
    if let Some(o) = original {
        for k in o.keys() {
            if !modified.contains_key(k) && current.map_or(false, |c| c.contains_key(k)) {
                patch.insert(k.clone(), Json::Null);
            }
        }
    }
    patch
}

/// Element patches for a keyed list. Unchanged elements are omitted, new ones
/// are sent whole, and elements dropped since the previous apply get a
/// `$patch: delete` directive.
fn keyed_list_patch(original: Option<&[Json]>, modified: &[Json], current: &[Json], key: &str) -> Vec<Json> {
    let mut out = Vec::new();
    for me in modified {
        let (Some(id), Some(mo)) = (me.get(key), me.as_object()) else { continue };
        match find_keyed(current, key, id).and_then(|c| c.as_object()) {
            Some(co) => {
                let oe = original.and_then(|o| find_keyed(o, key, id)).and_then(|o| o.as_object());
                let mut sub = three_way(oe, mo, Some(co), true);
                if !sub.is_empty() {
                    sub.insert(key.to_string(), id.clone());
                    out.push(Json::Object(sub));
                }
            }
            None => out.push(me.clone()),
        }
    }
    for oe in original.unwrap_or(&[]) {
        let Some(id) = oe.get(key) else { continue };
        if find_keyed(modified, key, id).is_none() && find_keyed(current, key, id).is_some() {
            let mut del = Map::new();
            del.insert(key.to_string(), id.clone());
            del.insert(PATCH_DIRECTIVE.to_string(), Json::String("delete".into()));
            out.push(Json::Object(del));
        }
    }
    out
}

const PATCH_DIRECTIVE: &str = "$patch";

pub fn is_empty_patch(patch: &Json) -> bool {
    match patch {
        Json::Object(m) => m.is_empty(),
        Json::Null => true,
        _ => false,
    }
}

/// Apply a JSON merge patch (RFC 7386) to `target`.
pub fn apply_merge_patch(target: &mut Json, patch: &Json) { merge_into(target, patch, false) }

/// Apply a strategic merge patch to `target`: keyed lists merge by their key
/// and honour `$patch: delete`, everything else follows RFC 7386.
pub fn apply_strategic_patch(target: &mut Json, patch: &Json) { merge_into(target, patch, true) }

/// Apply `patch` to `target` locally. JSON patches are not supported here.
pub fn apply_patch(target: &mut Json, patch: &Json, strategy: PatchStrategy) {
    match strategy {
        PatchStrategy::Strategic => apply_strategic_patch(target, patch),
        PatchStrategy::Merge | PatchStrategy::Json => apply_merge_patch(target, patch),
    }
}

fn merge_into(target: &mut Json, patch: &Json, strategic: bool) {
    match patch {
        Json::Object(pm) => {
            if !target.is_object() {
                *target = Json::Object(Map::new());
            }
            if let Json::Object(tm) = target {
                for (k, pv) in pm.iter() {
                    if pv.is_null() {
                        tm.remove(k);
                        continue;
                    }
                    if let (true, Json::Array(pa), Some(Json::Array(ta))) = (strategic, pv, tm.get_mut(k)) {
                        if let Some(key) = merge_key(k, pa).filter(|key| keyed(pa, key)) {
                            merge_keyed_list(ta, pa, key);
                            continue;
                        }
                    }
                    let entry = tm.entry(k.clone()).or_insert(Json::Null);
                    merge_into(entry, pv, strategic);
                }
            }
        }
        other => *target = other.clone(),
    }
}

fn merge_keyed_list(target: &mut Vec<Json>, patch: &[Json], key: &str) {
    for pe in patch {
        let Some(id) = pe.get(key) else { continue };
        let pos = target.iter().position(|t| t.get(key) == Some(id));
        let delete = pe.get(PATCH_DIRECTIVE).and_then(|d| d.as_str()) == Some("delete");
        match (pos, delete) {
            (Some(i), true) => {
                target.remove(i);
            }
            (None, true) => {}
            (Some(i), false) => merge_into(&mut target[i], pe, true),
            (None, false) => target.push(pe.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn deployment(replicas: i64, image: &str) -> Json {
        json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": { "name": "web", "namespace": "default" },
            "spec": {
                "replicas": replicas,
                "template": { "spec": { "containers": [ { "name": "web", "image": image } ] } }
            }
        })
    }

    #[test]
    fn strip_server_fields_prunes_common_fields() {
        let v = json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {
                "name": "x",
                "managedFields": [ {"foo": "bar"} ],
                "resourceVersion": "123",
                "generation": 5,
                "uid": "abc",
                "creationTimestamp": "2020-01-01T00:00:00Z"
            },
            "status": { "obs": true },
            "data": { "k": "v" }
        });
        let pruned = strip_server_fields(v);
        let meta = pruned["metadata"].as_object().unwrap();
        for k in ["managedFields", "resourceVersion", "generation", "uid", "creationTimestamp"] {
            assert!(!meta.contains_key(k), "{} still present", k);
        }
        assert!(!pruned.as_object().unwrap().contains_key("status"));
        assert_eq!(pruned["data"]["k"], "v");
    }

    #[test]
    fn prepared_document_records_itself_without_the_annotation() {
        let m = prepare_modified(&deployment(2, "nginx:1")).unwrap();
        let recorded = original_from_live(&m).unwrap().unwrap();
        assert!(doc::annotation(&recorded, keys::LAST_APPLIED).is_none());
        assert_eq!(recorded["spec"]["replicas"], 2);
        // Re-preparing the prepared document is stable.
        assert_eq!(prepare_modified(&m).unwrap(), m);
    }

    #[test]
    fn second_apply_against_unchanged_live_is_noop() {
        let modified = prepare_modified(&deployment(3, "nginx:1")).unwrap();
        // First apply created the object; the server added its own fields.
        let mut live = modified.clone();
        live["status"] = json!({"replicas": 3});
        live["metadata"]["uid"] = json!("u-1");
        let original = original_from_live(&live).unwrap();
        let patch = three_way_merge_patch(original.as_ref(), &modified, &live);
        assert!(is_empty_patch(&patch), "patch = {}", patch);
    }

    #[test]
    fn changed_field_is_patched_and_foreign_edits_survive() {
        let first = prepare_modified(&deployment(3, "nginx:1")).unwrap();
        let mut live = first.clone();
        // Someone else labels the object.
        live["metadata"]["labels"] = json!({"team": "ops"});
        let second = prepare_modified(&deployment(5, "nginx:1")).unwrap();
        let original = original_from_live(&live).unwrap();
        let patch = three_way_merge_patch(original.as_ref(), &second, &live);
        assert_eq!(patch["spec"]["replicas"], 5);
        assert!(patch["metadata"].get("labels").is_none());
        apply_merge_patch(&mut live, &patch);
        assert_eq!(live["spec"]["replicas"], 5);
        assert_eq!(live["metadata"]["labels"]["team"], "ops");
        // Converged: applying again is a no-op.
        let original = original_from_live(&live).unwrap();
        assert!(is_empty_patch(&three_way_merge_patch(original.as_ref(), &second, &live)));
    }

    #[test]
    fn dropped_field_is_deleted() {
        let mut with_data = json!({"kind": "ConfigMap", "metadata": {"name": "c"}, "data": {"a": "1", "b": "2"}});
        let first = prepare_modified(&with_data).unwrap();
        let live = first.clone();
        with_data["data"].as_object_mut().unwrap().remove("b");
        let second = prepare_modified(&with_data).unwrap();
        let original = original_from_live(&live).unwrap();
        let patch = three_way_merge_patch(original.as_ref(), &second, &live);
        assert_eq!(patch["data"]["b"], Json::Null);
        assert!(patch["data"].get("a").is_none());
    }

    #[test]
    fn merge_patch_follows_rfc7386() {
        let mut t = json!({"a": "b", "c": {"d": "e", "f": "g"}});
        apply_merge_patch(&mut t, &json!({"a": "z", "c": {"f": null}}));
        assert_eq!(t, json!({"a": "z", "c": {"d": "e"}}));
        let mut arr = json!({"a": [1, 2]});
        apply_merge_patch(&mut arr, &json!({"a": [3]}));
        assert_eq!(arr, json!({"a": [3]}));
    }

    fn pod_template(containers: Json) -> Json {
        json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": { "name": "web" },
            "spec": { "template": { "spec": { "containers": containers } } }
        })
    }

    #[test]
    fn builtin_groups_apply_strategically() {
        assert_eq!(apply_strategy(""), PatchStrategy::Strategic);
        assert_eq!(apply_strategy("apps"), PatchStrategy::Strategic);
        assert_eq!(apply_strategy("example.com"), PatchStrategy::Merge);
    }

    #[test]
    fn server_defaults_and_foreign_sidecars_survive_reapply() {
        let modified = prepare_modified(&pod_template(json!([{ "name": "main", "image": "img" }]))).unwrap();
        let mut live = modified.clone();
        live["spec"]["template"]["spec"]["containers"] = json!([
            { "name": "main", "image": "img", "imagePullPolicy": "Always", "terminationMessagePath": "/dev/termination-log" },
            { "name": "istio-proxy", "image": "proxy" }
        ]);
        let original = original_from_live(&live).unwrap();
        let patch = three_way_patch(original.as_ref(), &modified, &live, PatchStrategy::Strategic);
        assert!(is_empty_patch(&patch), "patch = {}", patch);

        // A plain merge patch would replace the list and lose the sidecar.
        let merge = three_way_patch(original.as_ref(), &modified, &live, PatchStrategy::Merge);
        assert!(!is_empty_patch(&merge));
    }

    #[test]
    fn keyed_list_changes_touch_only_their_element() {
        let first = prepare_modified(&pod_template(json!([{ "name": "main", "image": "img:1" }, { "name": "log", "image": "fluent" }]))).unwrap();
        let mut live = first.clone();
        live["spec"]["template"]["spec"]["containers"]
            .as_array_mut()
            .unwrap()
            .push(json!({ "name": "istio-proxy", "image": "proxy" }));
        let second = prepare_modified(&pod_template(json!([{ "name": "main", "image": "img:2" }]))).unwrap();
        let original = original_from_live(&live).unwrap();
        let patch = three_way_patch(original.as_ref(), &second, &live, PatchStrategy::Strategic);
        assert_eq!(
            patch["spec"]["template"]["spec"]["containers"],
            json!([{ "name": "main", "image": "img:2" }, { "name": "log", "$patch": "delete" }])
        );

        apply_strategic_patch(&mut live, &patch);
        let names: Vec<&str> = live["spec"]["template"]["spec"]["containers"]
            .as_array()
            .unwrap()
            .iter()
            .map(|c| c["name"].as_str().unwrap())
            .collect();
        assert_eq!(names, vec!["main", "istio-proxy"]);
        assert_eq!(live["spec"]["template"]["spec"]["containers"][0]["image"], "img:2");
        let original = original_from_live(&live).unwrap();
        assert!(is_empty_patch(&three_way_patch(original.as_ref(), &second, &live, PatchStrategy::Strategic)));
    }

    #[test]
    fn ports_merge_on_container_port() {
        let mut live = json!({ "ports": [ { "containerPort": 80, "protocol": "TCP" }, { "containerPort": 9090 } ] });
        apply_strategic_patch(&mut live, &json!({ "ports": [ { "containerPort": 80, "name": "http" } ] }));
        assert_eq!(live["ports"], json!([ { "containerPort": 80, "protocol": "TCP", "name": "http" }, { "containerPort": 9090 } ]));
    }

    #[test]
    fn strategy_parsing() {
        assert_eq!("strategic".parse::<PatchStrategy>().unwrap(), PatchStrategy::Strategic);
        assert_eq!("json".parse::<PatchStrategy>().unwrap().content_type(), "application/json-patch+json");
        assert_eq!("merge".parse::<PatchStrategy>().unwrap(), PatchStrategy::Merge);
        let e = "bogus".parse::<PatchStrategy>().unwrap_err();
        assert_eq!(e.to_string(), "invalid merge strategy bogus");
    }
}
