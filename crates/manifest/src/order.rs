//! Apply order for a manifest batch: dependencies (namespaces, RBAC, config)
//! before the workloads that consume them.

use kato_core::doc;
use serde_json::Value as Json;

/// Priority of kinds that are not in the table; they go last.
pub const UNKNOWN_PRIORITY: u32 = 1000;

const PRIORITIES: &[(&str, u32)] = &[
    ("namespace", 0),
    ("clusterrole", 20),
    ("role", 20),
    ("clusterrolebinding", 30),
    ("customresourcedefinition", 30),
    ("rolebinding", 30),
    ("mutatingwebhookconfiguration", 40),
    ("persistentvolume", 40),
    ("serviceaccount", 40),
    ("storageclass", 40),
    ("validatingwebhookconfiguration", 40),
    ("configmap", 50),
    ("persistentvolumeclaim", 50),
    ("secret", 50),
    ("ingress", 70),
    ("networkpolicy", 70),
    ("service", 70),
    ("apiservice", 80),
    ("limitrange", 90),
    ("poddisruptionbudget", 90),
    ("podpreset", 90),
    ("podsecuritypolicy", 90),
    ("cronjob", 100),
    ("daemonset", 100),
    ("deployment", 100),
    ("job", 100),
    ("pod", 100),
    ("replicaset", 100),
    ("statefulset", 100),
    ("horizontalpodautoscaler", 110),
];

pub fn priority(kind: &str) -> u32 {
    PRIORITIES
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(kind))
        .map(|(_, p)| *p)
        .unwrap_or(UNKNOWN_PRIORITY)
}

/// Stable sort by kind priority; equal priorities keep their input order.
pub fn sort_manifests(docs: &mut [Json]) {
    docs.sort_by_key(|d| priority(doc::kind(d)));
}
