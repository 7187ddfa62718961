//! kube-backed implementation of [`ResourceClient`].

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use http_body_util::BodyExt;
use kato_apply::PatchStrategy;
use kato_core::{doc, ResourceIdentity};
use kube::{
    api::{Api, DeleteParams, ListParams, PostParams, PropagationPolicy},
    core::DynamicObject,
    Client, Resource,
};
use metrics::{counter, histogram};
use serde_json::Value as Json;
use tracing::{debug, info};

use crate::cache::{self, CachedTransport, DiscoveryTransport, RawResponse};
use crate::mapper::{Mapping, RestMapper};
use crate::{
    effective_namespace, ClientError, ClientResult, ClusterConfig, Connector, DeleteOptions, DiscoveredResource, ListOptions,
    Propagation, ResourceClient, GET_TIMEOUT, LIST_TIMEOUT, REQUEST_TIMEOUT,
};

/// Discovery GETs straight through a kube client.
pub struct KubeTransport {
    client: Client,
    scope: String,
}

impl KubeTransport {
    pub fn new(client: Client, scope: impl Into<String>) -> Self { Self { client, scope: scope.into() } }
}

#[async_trait::async_trait]
impl DiscoveryTransport for KubeTransport {
    fn scope(&self) -> String { self.scope.clone() }

    async fn get(&self, path: &str, if_none_match: Option<&str>) -> ClientResult<RawResponse> {
        let mut builder = http::Request::get(path).header(http::header::ACCEPT, "application/json");
        if let Some(tag) = if_none_match {
            builder = builder.header(http::header::IF_NONE_MATCH, tag);
        }
        let req = builder.body(kube::client::Body::from(Vec::new())).map_err(|e| ClientError::Other(e.into()))?;
        let res = self.client.send(req).await?;
        let status = res.status().as_u16();
        let etag = res.headers().get(http::header::ETAG).and_then(|v| v.to_str().ok()).map(|s| s.to_string());
        let body = res
            .into_body()
            .collect()
            .await
            .map_err(|e| ClientError::Other(anyhow::anyhow!("reading discovery response body: {}", e)))?
            .to_bytes()
            .to_vec();
        Ok(RawResponse { status, etag, body })
    }
}

async fn within<T, F>(budget: Duration, fut: F) -> ClientResult<T>
where
    F: std::future::Future<Output = ClientResult<T>>,
{
    match tokio::time::timeout(budget, fut).await {
        Ok(r) => r,
        Err(_) => Err(ClientError::Timeout(budget)),
    }
}

fn not_found_or(e: kube::Error, mapping: &Mapping, name: &str) -> ClientError {
    match e {
        kube::Error::Api(ae) if ae.code == 404 => ClientError::NotFound { resource: mapping.qualified_resource(), name: name.to_string() },
        other => ClientError::Kube(other),
    }
}

fn required_str<'a>(v: &'a Json, what: &str, f: fn(&Json) -> &str) -> ClientResult<&'a str> {
    let s = f(v);
    if s.is_empty() {
        return Err(ClientError::InvalidManifest(format!("manifest is missing {}", what)));
    }
    Ok(s)
}

pub struct DynamicClient {
    client: Client,
    mapper: Arc<RestMapper>,
}

impl DynamicClient {
    pub fn new(client: Client, mapper: Arc<RestMapper>) -> Self { Self { client, mapper } }

    /// Build a client for `cfg`, with discovery fronted by the disk cache at `cache_root`.
    pub async fn connect(cfg: &ClusterConfig, cache_root: &std::path::Path, ttl: Duration) -> ClientResult<Self> {
        let config = cfg.kube_config().await?;
        let client = Client::try_from(config)?;
        let transport = CachedTransport::new(KubeTransport::new(client.clone(), cfg.host.clone()), cache_root, ttl);
        let mapper = Arc::new(RestMapper::new(Arc::new(transport)));
        Ok(Self::new(client, mapper))
    }

    fn api(&self, mapping: &Mapping, namespace: Option<&str>) -> Api<DynamicObject> {
        let ar = mapping.api_resource();
        match namespace {
            Some(ns) if mapping.namespaced && !ns.is_empty() => Api::namespaced_with(self.client.clone(), ns, &ar),
            _ => Api::all_with(self.client.clone(), &ar),
        }
    }

    async fn raw_patch(&self, mapping: &Mapping, name: &str, namespace: &str, body: Vec<u8>, strategy: PatchStrategy) -> ClientResult<DynamicObject> {
        let ns = if mapping.namespaced && !namespace.is_empty() { Some(namespace) } else { None };
        let url = format!("{}/{}", DynamicObject::url_path(&mapping.api_resource(), ns), name);
        let req = http::Request::patch(url)
            .header(http::header::CONTENT_TYPE, strategy.content_type())
            .body(body)
            .map_err(|e| ClientError::Other(e.into()))?;
        self.client.request::<DynamicObject>(req).await.map_err(|e| not_found_or(e, mapping, name))
    }
}

#[async_trait::async_trait]
impl ResourceClient for DynamicClient {
    async fn resolve(&self, kind: &str) -> ClientResult<Mapping> { self.mapper.resolve(kind).await }

    async fn discovered(&self) -> ClientResult<Vec<DiscoveredResource>> {
        let snap = self.mapper.snapshot().await?;
        Ok(snap.mappings().iter().map(DiscoveredResource::from).collect())
    }

    async fn get(&self, kind: &str, name: &str, namespace: &str) -> ClientResult<Json> {
        let mapping = self.resolve(kind).await?;
        let api = self.api(&mapping, Some(namespace));
        let obj = within(GET_TIMEOUT, async { api.get(name).await.map_err(|e| not_found_or(e, &mapping, name)) }).await?;
        Ok(serde_json::to_value(obj)?)
    }

    async fn list(&self, kind: &str, opts: &ListOptions) -> ClientResult<Vec<Json>> {
        let mapping = self.resolve(kind).await?;
        let api = self.api(&mapping, opts.namespace.as_deref());
        let mut lp = ListParams::default();
        if let Some(sel) = &opts.label_selector {
            lp = lp.labels(sel);
        }
        if let Some(sel) = &opts.field_selector {
            lp = lp.fields(sel);
        }
        let list = within(LIST_TIMEOUT, async { api.list(&lp).await.map_err(ClientError::from) }).await?;
        let mut out = Vec::with_capacity(list.items.len());
        for item in list.items {
            out.push(serde_json::to_value(item)?);
        }
        debug!(kind, count = out.len(), ns = ?opts.namespace, "listed");
        Ok(out)
    }

    async fn apply(&self, manifest: &Json, namespace_override: Option<&str>) -> ClientResult<ResourceIdentity> {
        let t0 = Instant::now();
        let kind = required_str(manifest, "kind", doc::kind)?;
        let name = required_str(manifest, "metadata.name", doc::name)?;
        let mapping = self.resolve(kind).await?;
        let ns = effective_namespace(&mapping, doc::namespace(manifest), namespace_override);

        let mut desired = manifest.clone();
        if mapping.namespaced { doc::set_namespace(&mut desired, &ns) } else { doc::clear_namespace(&mut desired) }
        let modified = kato_apply::prepare_modified(&desired)?;

        let api = self.api(&mapping, Some(&ns));
        let existing = within(REQUEST_TIMEOUT, async { api.get_opt(name).await.map_err(ClientError::from) }).await?;
        match existing {
            None => {
                let obj: DynamicObject = serde_json::from_value(modified)?;
                within(REQUEST_TIMEOUT, async { api.create(&PostParams::default(), &obj).await.map_err(ClientError::from) }).await?;
                counter!("apply_created", 1u64);
                info!(kind = %mapping.kind, name, ns = %ns, "created");
            }
            Some(live) => {
                let live = serde_json::to_value(live)?;
                let original = kato_apply::original_from_live(&live)?;
                let strategy = kato_apply::apply_strategy(&mapping.group);
                let patch = kato_apply::three_way_patch(original.as_ref(), &modified, &live, strategy);
                if kato_apply::is_empty_patch(&patch) {
                    counter!("apply_unchanged", 1u64);
                    debug!(kind = %mapping.kind, name, ns = %ns, "unchanged");
                } else {
                    let body = serde_json::to_vec(&patch)?;
                    within(REQUEST_TIMEOUT, self.raw_patch(&mapping, name, &ns, body, strategy)).await?;
                    counter!("apply_patched", 1u64);
                    info!(kind = %mapping.kind, name, ns = %ns, strategy = %strategy, "configured");
                }
            }
        }
        histogram!("apply_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        Ok(mapping.identity(name, &ns))
    }

    async fn patch(&self, kind: &str, name: &str, namespace: &str, patch: &[u8], strategy: PatchStrategy) -> ClientResult<ResourceIdentity> {
        let mapping = self.resolve(kind).await?;
        let obj = self.raw_patch(&mapping, name, namespace, patch.to_vec(), strategy).await?;
        let ns = obj.metadata.namespace.clone().unwrap_or_else(|| namespace.to_string());
        info!(kind = %mapping.kind, name, ns = %ns, strategy = %strategy, "patched");
        Ok(mapping.identity(name, &ns))
    }

    async fn delete(&self, kind: &str, name: &str, namespace: &str, opts: &DeleteOptions) -> ClientResult<ResourceIdentity> {
        let mapping = self.resolve(kind).await?;
        let api = self.api(&mapping, Some(namespace));
        let dp = DeleteParams {
            propagation_policy: opts.propagation.map(|p| match p {
                Propagation::Foreground => PropagationPolicy::Foreground,
                Propagation::Background => PropagationPolicy::Background,
                Propagation::Orphan => PropagationPolicy::Orphan,
            }),
            grace_period_seconds: opts.grace_period_seconds,
            ..Default::default()
        };
        api.delete(name, &dp).await.map_err(|e| not_found_or(e, &mapping, name))?;
        info!(kind = %mapping.kind, name, ns = %namespace, "deleted");
        Ok(mapping.identity(name, namespace))
    }
}

/// Connects to real clusters. Discovery responses are cached under `cache_root`.
pub struct KubeConnector {
    cache_root: PathBuf,
    ttl: Duration,
}

impl KubeConnector {
    pub fn new(cache_root: impl Into<PathBuf>, ttl: Duration) -> Self { Self { cache_root: cache_root.into(), ttl } }

    pub fn from_env() -> Self { Self::new(cache::default_cache_root(), cache::default_ttl()) }
}

#[async_trait::async_trait]
impl Connector for KubeConnector {
    async fn connect(&self, cfg: &ClusterConfig) -> ClientResult<Arc<dyn ResourceClient>> {
        let client = DynamicClient::connect(cfg, &self.cache_root, self.ttl).await?;
        Ok(Arc::new(client))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn slow_calls_report_a_timeout() {
        let budget = Duration::from_millis(20);
        let slow = within(budget, async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, ClientError>(())
        })
        .await;
        assert!(matches!(slow, Err(ClientError::Timeout(d)) if d == budget));

        let quick = within(budget, async { Ok::<_, ClientError>(7) }).await;
        assert_eq!(quick.unwrap(), 7);
    }
}
