//! In-memory [`ResourceClient`] backed by the builtin kind table.
//!
//! Applies go through the same three-way patch computation as the real
//! client, so idempotence and foreign-edit behaviour can be exercised without
//! a cluster.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use kato_apply::PatchStrategy;
use kato_core::{doc, ResourceIdentity};
use serde_json::Value as Json;

use crate::mapper::{Mapping, Snapshot};
use crate::{
    effective_namespace, ClientError, ClientResult, ClusterConfig, Connector, DeleteOptions, DiscoveredResource, ListOptions,
    ResourceClient,
};

type Key = (String, String, String);

#[derive(Default)]
struct State {
    objects: BTreeMap<Key, Json>,
    calls: Vec<String>,
    failing_lists: HashSet<String>,
    deletes: Vec<DeleteOptions>,
    next_uid: u64,
}

pub struct MemoryClient {
    snapshot: Snapshot,
    state: Mutex<State>,
}

impl Default for MemoryClient {
    fn default() -> Self { Self::new() }
}

impl MemoryClient {
    pub fn new() -> Self { Self { snapshot: Snapshot::builtin(), state: Mutex::new(State::default()) } }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        match self.state.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn mapping(&self, kind: &str) -> ClientResult<Mapping> {
        self.snapshot
            .lookup(kind)
            .cloned()
            .ok_or_else(|| ClientError::Discovery(format!("no matches for kind \"{}\"", kind)))
    }

    fn key(mapping: &Mapping, namespace: &str, name: &str) -> Key {
        let ns = if mapping.namespaced { namespace.to_string() } else { String::new() };
        (mapping.plural.clone(), ns, name.to_string())
    }

    /// Store `object` as-is, bypassing apply bookkeeping. Namespaced kinds
    /// without a namespace land in `default`.
    pub fn insert(&self, object: Json) -> ClientResult<ResourceIdentity> {
        let mapping = self.mapping(doc::kind(&object))?;
        let name = doc::name(&object).to_string();
        let ns = effective_namespace(&mapping, doc::namespace(&object), None);
        let mut object = object;
        if mapping.namespaced {
            doc::set_namespace(&mut object, &ns);
        }
        self.lock().objects.insert(Self::key(&mapping, &ns, &name), object);
        Ok(mapping.identity(&name, &ns))
    }

    /// Builder form of [`MemoryClient::insert`] for test fixtures.
    pub fn with(self, object: Json) -> Self {
        let _ = self.insert(object);
        self
    }

    /// Stored copy of an object, if present.
    pub fn object(&self, kind: &str, name: &str, namespace: &str) -> Option<Json> {
        let mapping = self.mapping(kind).ok()?;
        self.lock().objects.get(&Self::key(&mapping, namespace, name)).cloned()
    }

    pub fn len(&self) -> usize { self.lock().objects.len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// Mutating calls seen so far, as `"<verb> <plural> <ns>/<name>"`.
    pub fn calls(&self) -> Vec<String> { self.lock().calls.clone() }

    /// Options passed to each successful delete, in call order.
    pub fn delete_options(&self) -> Vec<DeleteOptions> { self.lock().deletes.clone() }

    /// Make every list of `kind` fail.
    pub fn fail_list(&self, kind: &str) {
        if let Ok(m) = self.mapping(kind) {
            self.lock().failing_lists.insert(m.plural);
        }
    }

    fn record(state: &mut State, verb: &str, key: &Key) {
        state.calls.push(format!("{} {} {}/{}", verb, key.0, key.1, key.2));
    }

    fn not_found(mapping: &Mapping, name: &str) -> ClientError {
        ClientError::NotFound { resource: mapping.qualified_resource(), name: name.to_string() }
    }
}

/// Equality-based label selector matching (`a=b`, `a==b`, `a!=b`, bare `a`).
pub fn selector_matches(selector: &str, object: &Json) -> bool {
    let labels = object.pointer("/metadata/labels").and_then(|l| l.as_object());
    let get = |k: &str| labels.and_then(|l| l.get(k)).and_then(|v| v.as_str());
    selector.split(',').map(str::trim).filter(|t| !t.is_empty()).all(|term| {
        if let Some((k, v)) = term.split_once("!=") {
            get(k.trim()) != Some(v.trim())
        } else if let Some((k, v)) = term.split_once("==").or_else(|| term.split_once('=')) {
            get(k.trim()) == Some(v.trim())
        } else {
            get(term).is_some()
        }
    })
}

#[async_trait::async_trait]
impl ResourceClient for MemoryClient {
    async fn resolve(&self, kind: &str) -> ClientResult<Mapping> { self.mapping(kind) }

    async fn discovered(&self) -> ClientResult<Vec<DiscoveredResource>> {
        Ok(self.snapshot.mappings().iter().map(DiscoveredResource::from).collect())
    }

    async fn get(&self, kind: &str, name: &str, namespace: &str) -> ClientResult<Json> {
        let mapping = self.mapping(kind)?;
        self.lock().objects.get(&Self::key(&mapping, namespace, name)).cloned().ok_or_else(|| Self::not_found(&mapping, name))
    }

    async fn list(&self, kind: &str, opts: &ListOptions) -> ClientResult<Vec<Json>> {
        let mapping = self.mapping(kind)?;
        let state = self.lock();
        if state.failing_lists.contains(&mapping.plural) {
            return Err(ClientError::Other(anyhow::anyhow!("listing {} failed", mapping.qualified_resource())));
        }
        let ns = opts.namespace.as_deref().filter(|_| mapping.namespaced);
        Ok(state
            .objects
            .iter()
            .filter(|((plural, obj_ns, _), _)| plural == &mapping.plural && ns.map_or(true, |n| n == obj_ns))
            .map(|(_, v)| v)
            .filter(|v| opts.label_selector.as_deref().map_or(true, |s| selector_matches(s, v)))
            .cloned()
            .collect())
    }

    async fn apply(&self, manifest: &Json, namespace_override: Option<&str>) -> ClientResult<ResourceIdentity> {
        let kind = doc::kind(manifest);
        let name = doc::name(manifest).to_string();
        if kind.is_empty() || name.is_empty() {
            return Err(ClientError::InvalidManifest("manifest is missing kind or metadata.name".into()));
        }
        let mapping = self.mapping(kind)?;
        let ns = effective_namespace(&mapping, doc::namespace(manifest), namespace_override);
        let mut desired = manifest.clone();
        if mapping.namespaced { doc::set_namespace(&mut desired, &ns) } else { doc::clear_namespace(&mut desired) }
        let modified = kato_apply::prepare_modified(&desired)?;

        let key = Self::key(&mapping, &ns, &name);
        let mut state = self.lock();
        match state.objects.get(&key).cloned() {
            None => {
                state.next_uid += 1;
                let mut created = modified;
                let meta = doc::object_at_mut(&mut created, &["metadata"]);
                meta.insert("uid".into(), Json::String(format!("uid-{}", state.next_uid)));
                meta.insert("creationTimestamp".into(), Json::String(chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()));
                meta.insert("generation".into(), Json::from(1));
                Self::record(&mut state, "create", &key);
                state.objects.insert(key, created);
            }
            Some(mut live) => {
                let original = kato_apply::original_from_live(&live)?;
                let strategy = kato_apply::apply_strategy(&mapping.group);
                let patch = kato_apply::three_way_patch(original.as_ref(), &modified, &live, strategy);
                if !kato_apply::is_empty_patch(&patch) {
                    kato_apply::apply_patch(&mut live, &patch, strategy);
                    bump_generation(&mut live);
                    Self::record(&mut state, "patch", &key);
                    state.objects.insert(key, live);
                }
            }
        }
        Ok(mapping.identity(&name, &ns))
    }

    async fn patch(&self, kind: &str, name: &str, namespace: &str, patch: &[u8], strategy: PatchStrategy) -> ClientResult<ResourceIdentity> {
        let mapping = self.mapping(kind)?;
        if strategy == PatchStrategy::Json {
            return Err(ClientError::Other(anyhow::anyhow!("json patches are not supported by the in-memory client")));
        }
        let patch: Json = serde_json::from_slice(patch)?;
        let key = Self::key(&mapping, namespace, name);
        let mut state = self.lock();
        let live = state.objects.get_mut(&key).ok_or_else(|| Self::not_found(&mapping, name))?;
        kato_apply::apply_patch(live, &patch, strategy);
        bump_generation(live);
        Self::record(&mut state, "patch", &key);
        Ok(mapping.identity(name, &key.1))
    }

    async fn delete(&self, kind: &str, name: &str, namespace: &str, opts: &DeleteOptions) -> ClientResult<ResourceIdentity> {
        let mapping = self.mapping(kind)?;
        let key = Self::key(&mapping, namespace, name);
        let mut state = self.lock();
        if state.objects.remove(&key).is_none() {
            return Err(Self::not_found(&mapping, name));
        }
        Self::record(&mut state, "delete", &key);
        state.deletes.push(opts.clone());
        Ok(mapping.identity(name, &key.1))
    }
}

fn bump_generation(obj: &mut Json) {
    let meta = doc::object_at_mut(obj, &["metadata"]);
    let next = meta.get("generation").and_then(|g| g.as_i64()).unwrap_or(0) + 1;
    meta.insert("generation".into(), Json::from(next));
}

/// Hands out [`MemoryClient`]s by cluster host. Unknown hosts fail to connect.
#[derive(Default)]
pub struct MemoryConnector {
    clusters: HashMap<String, Arc<MemoryClient>>,
}

impl MemoryConnector {
    pub fn new() -> Self { Self::default() }

    pub fn with_cluster(mut self, host: impl Into<String>, client: Arc<MemoryClient>) -> Self {
        self.clusters.insert(host.into(), client);
        self
    }
}

#[async_trait::async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, cfg: &ClusterConfig) -> ClientResult<Arc<dyn ResourceClient>> {
        match self.clusters.get(&cfg.host) {
            Some(c) => Ok(c.clone() as Arc<dyn ResourceClient>),
            None => Err(ClientError::Config(format!("dial tcp {}: connection refused", cfg.host))),
        }
    }
}
