//! Kato manifest preparation.
//!
//! A deploy batch goes through, in order: [`flatten_lists`], stamping
//! ([`annotate::annotate`]), versioning ([`version`]), artifact binding
//! ([`artifacts::bind_artifacts`]) and finally [`order::sort_manifests`].

#![forbid(unsafe_code)]

pub mod annotate;
pub mod artifacts;
pub mod order;
pub mod version;

use kato_core::doc;
use serde_json::Value as Json;

pub use annotate::annotate;
pub use artifacts::{bind_artifacts, ArtifactIndex};
pub use order::{priority, sort_manifests};
pub use version::{current_version, increment_version, is_versioned, Version};

/// Expand `kind: List` documents into their items, recursively, keeping order.
pub fn flatten_lists(docs: Vec<Json>) -> Vec<Json> {
    let mut out = Vec::with_capacity(docs.len());
    for d in docs {
        if doc::kind(&d) == "List" {
            let items = match d {
                Json::Object(mut m) => match m.remove("items") {
                    Some(Json::Array(items)) => items,
                    _ => Vec::new(),
                },
                _ => Vec::new(),
            };
            out.extend(flatten_lists(items));
        } else {
            out.push(d);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn lists_are_flattened_in_place() {
        let docs = vec![
            json!({ "kind": "Namespace", "metadata": { "name": "a" } }),
            json!({ "kind": "List", "items": [
                { "kind": "ConfigMap", "metadata": { "name": "b" } },
                { "kind": "List", "items": [ { "kind": "Secret", "metadata": { "name": "c" } } ] }
            ] }),
            json!({ "kind": "List" }),
            json!({ "kind": "Service", "metadata": { "name": "d" } }),
        ];
        let flat = flatten_lists(docs);
        let names: Vec<&str> = flat.iter().map(doc::name).collect();
        assert_eq!(names, vec!["a", "b", "c", "d"]);
    }
}
