//! One action per operation variant. Actions validate their request before
//! touching the network and record every object they change.

use anyhow::{anyhow, bail, Context, Result};
use kato_apply::PatchStrategy;
use kato_core::{doc, keys, Artifact, ManifestName, Moniker, TaskType};
use kato_kubehub::{effective_namespace, DeleteOptions as ClientDeleteOptions, ListOptions, Propagation};
use kato_manifest::{artifacts, version, ArtifactIndex};
use rand::Rng;
use serde_json::Value as Json;
use tracing::{debug, info, warn};

use crate::request::*;
use crate::TaskContext;

/// Uniform contract: do the work, or say why not.
#[async_trait::async_trait]
pub trait Action: Send + Sync {
    async fn run(&self, ctx: &TaskContext<'_>) -> Result<()>;
}

pub async fn dispatch(op: &Operation, ctx: &TaskContext<'_>) -> Result<()> {
    match op {
        Operation::DeployManifest(r) => r.run(ctx).await,
        Operation::DeleteManifest(r) => r.run(ctx).await,
        Operation::ScaleManifest(r) => r.run(ctx).await,
        Operation::PatchManifest(r) => r.run(ctx).await,
        Operation::UndoRolloutManifest(r) => r.run(ctx).await,
        Operation::RollingRestartManifest(r) => r.run(ctx).await,
        Operation::RunJob(r) => r.run(ctx).await,
        Operation::CleanupArtifacts(r) => r.run(ctx).await,
    }
}

fn require_deployment(name: &ManifestName, verb: &str) -> Result<()> {
    if !name.is_kind("deployment") {
        bail!("{} kind {} not currently supported", verb, name.kind);
    }
    Ok(())
}

#[async_trait::async_trait]
impl Action for DeployManifestRequest {
    async fn run(&self, ctx: &TaskContext<'_>) -> Result<()> {
        let client = ctx.connect(&self.account).await?;
        let override_ns = self.namespace_override.as_deref().filter(|ns| !ns.is_empty());
        let mut available: Vec<Artifact> = self.required_artifacts.iter().chain(self.optional_artifacts.iter()).cloned().collect();

        let mut docs = kato_manifest::flatten_lists(self.manifests.clone());
        for d in docs.iter_mut() {
            let kind = doc::kind(d).to_string();
            let name = doc::name(d).to_string();
            if kind.is_empty() || name.is_empty() {
                bail!("manifest is missing kind or metadata.name");
            }
            let mapping = client.resolve(&kind).await?;
            let ns = effective_namespace(&mapping, doc::namespace(d), override_ns);
            kato_manifest::annotate(d, &self.moniker, &ns);

            if kato_manifest::is_versioned(d) {
                let opts = if mapping.namespaced { ListOptions::in_namespace(&ns) } else { ListOptions::default() };
                let candidates = client.list(&kind, &opts).await?;
                let current = version::current_version(&candidates, &kind, &name);
                let next = version::increment_version(&current)?;
                version::apply_version(d, &next);
                debug!(kind = %kind, name = %name, current = %current, next = %next.long, "versioned");
                let artifact_type = match mapping.kind.as_str() {
                    "ConfigMap" => Some(artifacts::CONFIG_MAP),
                    "Secret" => Some(artifacts::SECRET),
                    _ => None,
                };
                if let Some(t) = artifact_type {
                    available.push(Artifact {
                        type_: t.to_string(),
                        name,
                        reference: doc::name(d).to_string(),
                        version: next.long.clone(),
                        location: ns.clone(),
                    });
                }
            }
        }

        let index = ArtifactIndex::new(&available);
        for d in docs.iter_mut() {
            kato_manifest::bind_artifacts(d, &index);
        }
        kato_manifest::sort_manifests(&mut docs);

        for d in &docs {
            let id = client.apply(d, override_ns).await?;
            info!(account = %self.account, kind = %id.kind, name = %id.name, ns = %id.namespace, "deployed");
            ctx.record(TaskType::Deploy, &self.account, &self.moniker.app, &id).await?;
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Action for DeleteManifestRequest {
    async fn run(&self, ctx: &TaskContext<'_>) -> Result<()> {
        match self.mode.as_str() {
            "static" | "dynamic" => {}
            other => bail!("requested to delete manifest {} using mode {} which is not implemented", self.manifest_name, other),
        }
        let name = ManifestName::parse(&self.manifest_name)?;
        let opts = ClientDeleteOptions {
            propagation: Some(if self.options.cascading { Propagation::Foreground } else { Propagation::Orphan }),
            grace_period_seconds: self.options.grace_period_seconds,
        };
        let client = ctx.connect(&self.account).await?;
        let id = client.delete(&name.kind, &name.name, &self.location, &opts).await?;
        info!(account = %self.account, manifest = %name, ns = %id.namespace, "deleted");
        ctx.record(TaskType::Delete, &self.account, &self.app, &id).await
    }
}

#[async_trait::async_trait]
impl Action for ScaleManifestRequest {
    async fn run(&self, ctx: &TaskContext<'_>) -> Result<()> {
        let name = ManifestName::parse(&self.manifest_name)?;
        require_deployment(&name, "scaling")?;
        let replicas: i32 = self.replicas.trim().parse()?;

        let client = ctx.connect(&self.account).await?;
        let mut live = client.get(&name.kind, &name.name, &self.location).await?;
        kato_status::views::set_deployment_replicas(&mut live, replicas)?;
        let id = client.apply(&live, None).await?;
        info!(account = %self.account, manifest = %name, replicas, "scaled");
        ctx.record(TaskType::Scale, &self.account, &self.app, &id).await
    }
}

#[async_trait::async_trait]
impl Action for PatchManifestRequest {
    async fn run(&self, ctx: &TaskContext<'_>) -> Result<()> {
        let strategy: PatchStrategy = self.options.merge_strategy.parse()?;
        let name = ManifestName::parse(&self.manifest_name)?;
        let body = serde_json::to_vec(&self.patch_body)?;
        if self.options.record {
            // TODO: write the change-cause annotation once patch recording is supported
            warn!(manifest = %name, "record requested but change-cause annotations are not written");
        }
        let client = ctx.connect(&self.account).await?;
        let id = client.patch(&name.kind, &name.name, &self.location, &body, strategy).await?;
        info!(account = %self.account, manifest = %name, strategy = %strategy, "patched");
        ctx.record(TaskType::Patch, &self.account, &self.app, &id).await
    }
}

/// Annotations that describe a ReplicaSet's own revision and must not be
/// copied back onto the Deployment.
const ROLLBACK_SKIPPED_ANNOTATIONS: &[&str] = &[
    keys::LAST_APPLIED,
    keys::DEPLOYMENT_REVISION,
    keys::DEPLOYMENT_REVISION_HISTORY,
    keys::DEPLOYMENT_DESIRED_REPLICAS,
    keys::DEPLOYMENT_MAX_REPLICAS,
];

/// Copy the pod template and eligible annotations of `rs` onto `deployment`.
pub fn roll_back_to(deployment: &mut Json, rs: &Json) -> Result<()> {
    let mut template = rs.pointer("/spec/template").cloned().ok_or_else(|| anyhow!("replicaset {} has no pod template", doc::name(rs)))?;
    if let Some(labels) = template.pointer_mut("/metadata/labels").and_then(|l| l.as_object_mut()) {
        labels.remove(keys::POD_TEMPLATE_HASH);
    }
    doc::object_at_mut(deployment, &["spec"]).insert("template".into(), template);

    if let Some(annotations) = rs.pointer("/metadata/annotations").and_then(|a| a.as_object()) {
        for (k, v) in annotations {
            if ROLLBACK_SKIPPED_ANNOTATIONS.contains(&k.as_str()) {
                continue;
            }
            if let Some(v) = v.as_str() {
                doc::set_annotation(deployment, k, v);
            }
        }
    }
    Ok(())
}

#[async_trait::async_trait]
impl Action for UndoRolloutManifestRequest {
    async fn run(&self, ctx: &TaskContext<'_>) -> Result<()> {
        if self.app.is_empty() {
            bail!("no application provided for rollback of {}", self.manifest_name);
        }
        let name = ManifestName::parse(&self.manifest_name)?;
        require_deployment(&name, "rolling back")?;

        let client = ctx.connect(&self.account).await?;
        let mut deployment = client.get(&name.kind, &name.name, &self.location).await?;
        let history = client
            .list("replicaset", &ListOptions::in_namespace(&self.location).labels(&keys::app_selector(&self.app)))
            .await
            .context("listing replicaset history")?;
        let target = history.iter().find(|rs| {
            doc::annotation(rs, keys::ARTIFACT_NAME) == Some(name.name.as_str())
                && doc::annotation(rs, keys::ARTIFACT_TYPE) == Some("kubernetes/deployment")
                && doc::annotation(rs, keys::DEPLOYMENT_REVISION) == Some(self.revision.as_str())
        });
        let Some(rs) = target else {
            bail!("revision {} of {} not found", self.revision, name);
        };
        debug!(manifest = %name, replicaset = doc::name(rs), "rolling back to replicaset");

        roll_back_to(&mut deployment, rs)?;
        let id = client.apply(&deployment, None).await?;
        info!(account = %self.account, manifest = %name, revision = %self.revision, "rolled back");
        ctx.record(TaskType::Rollback, &self.account, &self.app, &id).await
    }
}

#[async_trait::async_trait]
impl Action for RollingRestartManifestRequest {
    async fn run(&self, ctx: &TaskContext<'_>) -> Result<()> {
        let name = ManifestName::parse(&self.manifest_name)?;
        require_deployment(&name, "restarting")?;

        let client = ctx.connect(&self.account).await?;
        let mut live = client.get(&name.kind, &name.name, &self.location).await?;
        let now = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
        kato_status::views::set_deployment_template_annotation(&mut live, keys::RESTARTED_AT, &now)?;
        let id = client.apply(&live, None).await?;
        info!(account = %self.account, manifest = %name, "restarted");
        ctx.record(TaskType::RollingRestart, &self.account, &self.app, &id).await
    }
}

const NAME_SUFFIX_ALPHABET: &[u8] = b"bcdfghjklmnpqrstvwxz2456789";

/// `prefix` plus five random characters, the way the API server expands generateName.
pub fn generated_name(prefix: &str) -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..5).map(|_| NAME_SUFFIX_ALPHABET[rng.gen_range(0..NAME_SUFFIX_ALPHABET.len())] as char).collect();
    format!("{}{}", prefix, suffix)
}

#[async_trait::async_trait]
impl Action for RunJobRequest {
    async fn run(&self, ctx: &TaskContext<'_>) -> Result<()> {
        let mut job = self.manifest.clone();
        let kind = doc::kind(&job).to_string();
        if kind.is_empty() {
            bail!("job manifest has no kind");
        }
        if doc::name(&job).is_empty() {
            let prefix = doc::generate_name(&job).to_string();
            if prefix.is_empty() {
                bail!("job manifest has neither metadata.name nor metadata.generateName");
            }
            doc::set_name(&mut job, &generated_name(&prefix));
        }

        let client = ctx.connect(&self.account).await?;
        let override_ns = self.namespace_override.as_deref().filter(|ns| !ns.is_empty());
        let mapping = client.resolve(&kind).await?;
        let ns = effective_namespace(&mapping, doc::namespace(&job), override_ns);
        let moniker = Moniker { app: self.application.clone(), cluster: None };
        kato_manifest::annotate(&mut job, &moniker, &ns);
        kato_manifest::bind_artifacts(&mut job, &ArtifactIndex::new(&self.required_artifacts));

        let id = client.apply(&job, override_ns).await?;
        info!(account = %self.account, name = %id.name, ns = %id.namespace, "job started");
        ctx.record(TaskType::RunJob, &self.account, &self.application, &id).await
    }
}

#[async_trait::async_trait]
impl Action for CleanupArtifactsRequest {
    async fn run(&self, ctx: &TaskContext<'_>) -> Result<()> {
        let client = ctx.connect(&self.account).await?;
        for m in &self.manifests {
            let mapping = client.resolve(doc::kind(m)).await?;
            let ns = effective_namespace(&mapping, doc::namespace(m), None);
            let id = mapping.identity(doc::name(m), &ns);
            let app = doc::annotation(m, keys::MONIKER_APPLICATION).unwrap_or_default();
            ctx.record(TaskType::Cleanup, &self.account, app, &id).await?;
            debug!(account = %self.account, kind = %id.kind, name = %id.name, "artifact left in place");
        }
        Ok(())
    }
}
