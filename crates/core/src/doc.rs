//! Accessors and in-place mutators for generic resource documents.
//!
//! Everything here works on `serde_json::Value` directly so fields the caller
//! does not touch survive untouched.

use serde_json::{Map, Value as Json};

pub fn str_at<'a>(doc: &'a Json, path: &[&str]) -> Option<&'a str> {
    let mut cur = doc;
    for seg in path {
        cur = cur.get(*seg)?;
    }
    cur.as_str()
}

pub fn kind(doc: &Json) -> &str { doc.get("kind").and_then(|v| v.as_str()).unwrap_or("") }
pub fn api_version(doc: &Json) -> &str { doc.get("apiVersion").and_then(|v| v.as_str()).unwrap_or("") }
pub fn name(doc: &Json) -> &str { str_at(doc, &["metadata", "name"]).unwrap_or("") }
pub fn namespace(doc: &Json) -> &str { str_at(doc, &["metadata", "namespace"]).unwrap_or("") }
pub fn generate_name(doc: &Json) -> &str { str_at(doc, &["metadata", "generateName"]).unwrap_or("") }
pub fn creation_timestamp(doc: &Json) -> &str { str_at(doc, &["metadata", "creationTimestamp"]).unwrap_or("") }

/// Walk `path`, creating empty objects along the way, and return the map at its end.
/// Non-object values sitting on the path are replaced.
pub fn object_at_mut<'a>(doc: &'a mut Json, path: &[&str]) -> &'a mut Map<String, Json> {
    if !doc.is_object() {
        *doc = Json::Object(Map::new());
    }
    let mut cur = doc;
    for seg in path {
        let map = match cur {
            Json::Object(m) => m,
            _ => unreachable!("ensured object above"),
        };
        let next = map.entry(seg.to_string()).or_insert_with(|| Json::Object(Map::new()));
        if !next.is_object() {
            *next = Json::Object(Map::new());
        }
        cur = next;
    }
    match cur {
        Json::Object(m) => m,
        _ => unreachable!("ensured object above"),
    }
}

pub fn set_name(doc: &mut Json, name: &str) {
    object_at_mut(doc, &["metadata"]).insert("name".into(), Json::String(name.to_string()));
}

pub fn set_namespace(doc: &mut Json, ns: &str) {
    object_at_mut(doc, &["metadata"]).insert("namespace".into(), Json::String(ns.to_string()));
}

pub fn clear_namespace(doc: &mut Json) {
    if let Some(meta) = doc.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        meta.remove("namespace");
    }
}

fn string_map_get<'a>(doc: &'a Json, path: &[&str], key: &str) -> Option<&'a str> {
    let mut cur = doc;
    for seg in path {
        cur = cur.get(*seg)?;
    }
    cur.get(key).and_then(|v| v.as_str())
}

pub fn annotation<'a>(doc: &'a Json, key: &str) -> Option<&'a str> { string_map_get(doc, &["metadata", "annotations"], key) }
pub fn label<'a>(doc: &'a Json, key: &str) -> Option<&'a str> { string_map_get(doc, &["metadata", "labels"], key) }

pub fn set_annotation(doc: &mut Json, key: &str, value: &str) {
    object_at_mut(doc, &["metadata", "annotations"]).insert(key.to_string(), Json::String(value.to_string()));
}

pub fn set_label(doc: &mut Json, key: &str, value: &str) {
    object_at_mut(doc, &["metadata", "labels"]).insert(key.to_string(), Json::String(value.to_string()));
}

pub fn remove_annotation(doc: &mut Json, key: &str) -> Option<Json> {
    doc.get_mut("metadata")
        .and_then(|m| m.get_mut("annotations"))
        .and_then(|a| a.as_object_mut())
        .and_then(|a| a.remove(key))
}

/// Path from the document root to the pod spec for kinds that carry one.
pub fn pod_spec_path(kind: &str) -> Option<&'static [&'static str]> {
    match kind.to_ascii_lowercase().as_str() {
        "pod" => Some(&["spec"]),
        "cronjob" => Some(&["spec", "jobTemplate", "spec", "template", "spec"]),
        "deployment" | "replicaset" | "daemonset" | "statefulset" | "job" | "replicationcontroller" => {
            Some(&["spec", "template", "spec"])
        }
        _ => None,
    }
}

/// Path to the pod template metadata for controllers (not bare pods).
pub fn pod_template_metadata_path(kind: &str) -> Option<&'static [&'static str]> {
    match kind.to_ascii_lowercase().as_str() {
        "cronjob" => Some(&["spec", "jobTemplate", "spec", "template", "metadata"]),
        "deployment" | "replicaset" | "daemonset" | "statefulset" | "job" | "replicationcontroller" => {
            Some(&["spec", "template", "metadata"])
        }
        _ => None,
    }
}

/// Set one annotation on the pod template, if the kind has one.
pub fn set_pod_template_annotation(doc: &mut Json, key: &str, value: &str) -> bool {
    let kind = kind(doc).to_string();
    match pod_template_metadata_path(&kind) {
        Some(path) => {
            let meta = object_at_mut(doc, path);
            let annos = meta.entry("annotations").or_insert_with(|| Json::Object(Map::new()));
            if let Some(a) = annos.as_object_mut() {
                a.insert(key.to_string(), Json::String(value.to_string()));
            }
            true
        }
        None => false,
    }
}

pub fn set_pod_template_label(doc: &mut Json, key: &str, value: &str) -> bool {
    let kind = kind(doc).to_string();
    match pod_template_metadata_path(&kind) {
        Some(path) => {
            let meta = object_at_mut(doc, path);
            let labels = meta.entry("labels").or_insert_with(|| Json::Object(Map::new()));
            if let Some(l) = labels.as_object_mut() {
                l.insert(key.to_string(), Json::String(value.to_string()));
            }
            true
        }
        None => false,
    }
}
