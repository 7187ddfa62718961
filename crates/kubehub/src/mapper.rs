//! Resource-kind resolution: short kind/resource names to REST mappings.

use std::collections::HashMap;
use std::sync::Arc;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{APIGroupList, APIResourceList, APIVersions};
use kato_core::ResourceIdentity;
use serde::de::DeserializeOwned;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::cache::DiscoveryTransport;
use crate::{ClientError, ClientResult};

/// REST route and scope of one served kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mapping {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub plural: String,
    pub namespaced: bool,
}

impl Mapping {
    pub fn api_version(&self) -> String {
        if self.group.is_empty() { self.version.clone() } else { format!("{}/{}", self.group, self.version) }
    }

    pub fn api_resource(&self) -> kube::core::ApiResource {
        kube::core::ApiResource {
            group: self.group.clone(),
            version: self.version.clone(),
            api_version: self.api_version(),
            kind: self.kind.clone(),
            plural: self.plural.clone(),
        }
    }

    /// `deployments.apps`, `pods` for core.
    pub fn qualified_resource(&self) -> String {
        if self.group.is_empty() { self.plural.clone() } else { format!("{}.{}", self.plural, self.group) }
    }

    pub fn identity(&self, name: &str, namespace: &str) -> ResourceIdentity {
        ResourceIdentity {
            name: name.to_string(),
            namespace: if self.namespaced { namespace.to_string() } else { String::new() },
            group: self.group.clone(),
            version: self.version.clone(),
            resource: self.plural.clone(),
            kind: self.kind.clone(),
        }
    }
}

/// Immutable view of the cluster's served kinds at one point in time.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    mappings: Vec<Mapping>,
    by_name: HashMap<String, usize>,
}

impl Snapshot {
    /// Build from resource lists in priority order: earlier lists win name clashes.
    pub fn from_resource_lists(lists: &[APIResourceList]) -> Self {
        let mut snap = Snapshot::default();
        for list in lists {
            let (group, version) = match list.group_version.split_once('/') {
                Some((g, v)) => (g.to_string(), v.to_string()),
                None => (String::new(), list.group_version.clone()),
            };
            for res in &list.resources {
                // subresources (pods/log, deployments/scale) are not addressable kinds
                if res.name.contains('/') {
                    continue;
                }
                let mapping = Mapping {
                    group: group.clone(),
                    version: version.clone(),
                    kind: res.kind.clone(),
                    plural: res.name.clone(),
                    namespaced: res.namespaced,
                };
                let mut aliases = vec![res.kind.clone(), res.name.clone(), res.singular_name.clone()];
                aliases.extend(res.short_names.clone().unwrap_or_default());
                snap.push(mapping, &aliases);
            }
        }
        snap
    }

    fn push(&mut self, mapping: Mapping, aliases: &[String]) {
        let idx = self.mappings.len();
        self.mappings.push(mapping);
        for a in aliases {
            if a.is_empty() {
                continue;
            }
            self.by_name.entry(a.to_ascii_lowercase()).or_insert(idx);
        }
    }

    /// Case-insensitive lookup by kind, plural, singular or short name.
    pub fn lookup(&self, name: &str) -> Option<&Mapping> {
        self.by_name.get(&name.to_ascii_lowercase()).map(|&i| &self.mappings[i])
    }

    pub fn mappings(&self) -> &[Mapping] { &self.mappings }

    pub fn is_empty(&self) -> bool { self.mappings.is_empty() }

    /// Kinds every conformant cluster serves. Backs the in-memory client.
    pub fn builtin() -> Self {
        // (group, version, kind, plural, namespaced, short names)
        const KINDS: &[(&str, &str, &str, &str, bool, &[&str])] = &[
            ("", "v1", "Namespace", "namespaces", false, &["ns"]),
            ("", "v1", "Pod", "pods", true, &["po"]),
            ("", "v1", "Service", "services", true, &["svc"]),
            ("", "v1", "ConfigMap", "configmaps", true, &["cm"]),
            ("", "v1", "Secret", "secrets", true, &[]),
            ("", "v1", "ServiceAccount", "serviceaccounts", true, &["sa"]),
            ("", "v1", "PersistentVolume", "persistentvolumes", false, &["pv"]),
            ("", "v1", "PersistentVolumeClaim", "persistentvolumeclaims", true, &["pvc"]),
            ("", "v1", "LimitRange", "limitranges", true, &["limits"]),
            ("apps", "v1", "Deployment", "deployments", true, &["deploy"]),
            ("apps", "v1", "ReplicaSet", "replicasets", true, &["rs"]),
            ("apps", "v1", "DaemonSet", "daemonsets", true, &["ds"]),
            ("apps", "v1", "StatefulSet", "statefulsets", true, &["sts"]),
            ("batch", "v1", "Job", "jobs", true, &[]),
            ("batch", "v1", "CronJob", "cronjobs", true, &["cj"]),
            ("autoscaling", "v2", "HorizontalPodAutoscaler", "horizontalpodautoscalers", true, &["hpa"]),
            ("networking.k8s.io", "v1", "Ingress", "ingresses", true, &["ing"]),
            ("networking.k8s.io", "v1", "NetworkPolicy", "networkpolicies", true, &["netpol"]),
            ("policy", "v1", "PodDisruptionBudget", "poddisruptionbudgets", true, &["pdb"]),
            ("rbac.authorization.k8s.io", "v1", "ClusterRole", "clusterroles", false, &[]),
            ("rbac.authorization.k8s.io", "v1", "ClusterRoleBinding", "clusterrolebindings", false, &[]),
            ("rbac.authorization.k8s.io", "v1", "Role", "roles", true, &[]),
            ("rbac.authorization.k8s.io", "v1", "RoleBinding", "rolebindings", true, &[]),
            ("storage.k8s.io", "v1", "StorageClass", "storageclasses", false, &["sc"]),
            ("apiextensions.k8s.io", "v1", "CustomResourceDefinition", "customresourcedefinitions", false, &["crd", "crds"]),
        ];
        let mut snap = Snapshot::default();
        for (group, version, kind, plural, namespaced, shorts) in KINDS {
            let mapping = Mapping {
                group: group.to_string(),
                version: version.to_string(),
                kind: kind.to_string(),
                plural: plural.to_string(),
                namespaced: *namespaced,
            };
            let singular = kind.to_ascii_lowercase();
            let mut aliases = vec![kind.to_string(), plural.to_string(), singular];
            aliases.extend(shorts.iter().map(|s| s.to_string()));
            snap.push(mapping, &aliases);
        }
        snap
    }
}

/// Lazily loads a [`Snapshot`] through a discovery transport and shares it
/// between concurrent callers.
pub struct RestMapper {
    transport: Arc<dyn DiscoveryTransport>,
    snapshot: RwLock<Option<Arc<Snapshot>>>,
}

impl RestMapper {
    pub fn new(transport: Arc<dyn DiscoveryTransport>) -> Self {
        Self { transport, snapshot: RwLock::new(None) }
    }

    pub async fn snapshot(&self) -> ClientResult<Arc<Snapshot>> {
        if let Some(s) = self.snapshot.read().await.as_ref() {
            return Ok(s.clone());
        }
        let mut guard = self.snapshot.write().await;
        if let Some(s) = guard.as_ref() {
            return Ok(s.clone());
        }
        let snap = Arc::new(load_snapshot(self.transport.as_ref()).await?);
        *guard = Some(snap.clone());
        Ok(snap)
    }

    /// Kind resolution failures are not retried here; the discovery cache TTL
    /// bounds how stale the snapshot can get.
    pub async fn resolve(&self, kind: &str) -> ClientResult<Mapping> {
        let snap = self.snapshot().await?;
        snap.lookup(kind)
            .cloned()
            .ok_or_else(|| ClientError::Discovery(format!("no matches for kind \"{}\"", kind)))
    }
}

async fn fetch<T: DeserializeOwned>(transport: &dyn DiscoveryTransport, path: &str) -> ClientResult<T> {
    let resp = transport.get(path, None).await?;
    if resp.status != 200 {
        return Err(ClientError::Discovery(format!(
            "discovery request {} failed with status {}: {}",
            path,
            resp.status,
            String::from_utf8_lossy(&resp.body)
        )));
    }
    Ok(serde_json::from_slice(&resp.body)?)
}

/// Core versions first, then every API group at its preferred version in the
/// order the server lists them. Groups whose resource list cannot be fetched
/// (typically unavailable aggregated APIs) are skipped.
pub async fn load_snapshot(transport: &dyn DiscoveryTransport) -> ClientResult<Snapshot> {
    let mut lists: Vec<APIResourceList> = Vec::new();

    let core: APIVersions = fetch(transport, "/api").await?;
    for v in &core.versions {
        lists.push(fetch(transport, &format!("/api/{}", v)).await?);
    }

    let groups: APIGroupList = fetch(transport, "/apis").await?;
    for group in &groups.groups {
        let gv = match group.preferred_version.as_ref().or_else(|| group.versions.first()) {
            Some(gv) => gv.group_version.clone(),
            None => continue,
        };
        match fetch::<APIResourceList>(transport, &format!("/apis/{}", gv)).await {
            Ok(list) => lists.push(list),
            Err(e) => warn!(group_version = %gv, error = %e, "skipping unavailable api group"),
        }
    }

    let snap = Snapshot::from_resource_lists(&lists);
    debug!(lists = lists.len(), "discovery lists loaded");
    info!(kinds = snap.mappings().len(), scope = %transport.scope(), "discovery snapshot built");
    Ok(snap)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::RawResponse;
    use std::collections::HashMap as Map;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StaticDiscovery {
        docs: Map<&'static str, serde_json::Value>,
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl DiscoveryTransport for StaticDiscovery {
        fn scope(&self) -> String { "test".into() }

        async fn get(&self, path: &str, _etag: Option<&str>) -> ClientResult<RawResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.docs.get(path) {
                Some(v) => Ok(RawResponse { status: 200, etag: None, body: serde_json::to_vec(v).unwrap() }),
                None => Ok(RawResponse { status: 503, etag: None, body: b"service unavailable".to_vec() }),
            }
        }
    }

    fn discovery() -> StaticDiscovery {
        let mut docs = Map::new();
        docs.insert("/api", serde_json::json!({"kind": "APIVersions", "versions": ["v1"], "serverAddressByClientCIDRs": []}));
        docs.insert("/api/v1", serde_json::json!({
            "kind": "APIResourceList", "groupVersion": "v1",
            "resources": [
                {"name": "pods", "singularName": "pod", "namespaced": true, "kind": "Pod", "verbs": ["get"], "shortNames": ["po"]},
                {"name": "pods/log", "singularName": "", "namespaced": true, "kind": "Pod", "verbs": ["get"]},
                {"name": "namespaces", "singularName": "namespace", "namespaced": false, "kind": "Namespace", "verbs": ["get"], "shortNames": ["ns"]},
                {"name": "events", "singularName": "event", "namespaced": true, "kind": "Event", "verbs": ["get"], "shortNames": ["ev"]}
            ]
        }));
        docs.insert("/apis", serde_json::json!({
            "kind": "APIGroupList",
            "groups": [
                {"name": "apps", "versions": [{"groupVersion": "apps/v1", "version": "v1"}], "preferredVersion": {"groupVersion": "apps/v1", "version": "v1"}},
                {"name": "events.k8s.io", "versions": [{"groupVersion": "events.k8s.io/v1", "version": "v1"}], "preferredVersion": {"groupVersion": "events.k8s.io/v1", "version": "v1"}},
                {"name": "metrics.k8s.io", "versions": [{"groupVersion": "metrics.k8s.io/v1beta1", "version": "v1beta1"}]}
            ]
        }));
        docs.insert("/apis/apps/v1", serde_json::json!({
            "kind": "APIResourceList", "groupVersion": "apps/v1",
            "resources": [
                {"name": "deployments", "singularName": "deployment", "namespaced": true, "kind": "Deployment", "verbs": ["get"], "shortNames": ["deploy"]},
                {"name": "deployments/scale", "singularName": "", "namespaced": true, "kind": "Scale", "verbs": ["get"]}
            ]
        }));
        docs.insert("/apis/events.k8s.io/v1", serde_json::json!({
            "kind": "APIResourceList", "groupVersion": "events.k8s.io/v1",
            "resources": [
                {"name": "events", "singularName": "event", "namespaced": true, "kind": "Event", "verbs": ["get"], "shortNames": ["ev"]}
            ]
        }));
        StaticDiscovery { docs, calls: AtomicUsize::new(0) }
    }

    #[tokio::test]
    async fn resolves_every_alias_case_insensitively() {
        let mapper = RestMapper::new(Arc::new(discovery()));
        for alias in ["deployment", "Deployment", "deployments", "deploy", "DEPLOY"] {
            let m = mapper.resolve(alias).await.unwrap();
            assert_eq!(m.group, "apps");
            assert_eq!(m.version, "v1");
            assert_eq!(m.plural, "deployments");
            assert!(m.namespaced);
        }
        let ns = mapper.resolve("ns").await.unwrap();
        assert!(!ns.namespaced);
        assert_eq!(ns.api_version(), "v1");
    }

    #[tokio::test]
    async fn core_group_wins_name_clashes_and_subresources_are_skipped() {
        let mapper = RestMapper::new(Arc::new(discovery()));
        let ev = mapper.resolve("event").await.unwrap();
        assert_eq!(ev.group, "");
        assert!(mapper.resolve("scale").await.is_err());
    }

    #[tokio::test]
    async fn unknown_kind_fails_without_refetching() {
        let transport = Arc::new(discovery());
        let mapper = RestMapper::new(transport.clone());
        let err = mapper.resolve("widget").await.unwrap_err();
        assert_eq!(err.to_string(), "no matches for kind \"widget\"");
        let after_first = transport.calls.load(Ordering::SeqCst);
        let _ = mapper.resolve("widget").await;
        let _ = mapper.resolve("pod").await.unwrap();
        assert_eq!(transport.calls.load(Ordering::SeqCst), after_first);
    }

    #[test]
    fn identity_drops_namespace_for_cluster_scoped() {
        let snap = Snapshot::builtin();
        let ns = snap.lookup("namespace").unwrap();
        assert_eq!(ns.identity("team", "ignored").namespace, "");
        let deploy = snap.lookup("deploy").unwrap();
        let id = deploy.identity("web", "prod");
        assert_eq!(id.namespace, "prod");
        assert_eq!(id.resource, "deployments");
        assert_eq!(deploy.qualified_resource(), "deployments.apps");
    }
}
