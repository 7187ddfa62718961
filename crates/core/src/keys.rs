//! Annotation and label names stamped on or read from managed objects.

pub const ARTIFACT_LOCATION: &str = "artifact.spinnaker.io/location";
pub const ARTIFACT_NAME: &str = "artifact.spinnaker.io/name";
pub const ARTIFACT_TYPE: &str = "artifact.spinnaker.io/type";
pub const ARTIFACT_VERSION: &str = "artifact.spinnaker.io/version";

pub const MONIKER_APPLICATION: &str = "moniker.spinnaker.io/application";
pub const MONIKER_CLUSTER: &str = "moniker.spinnaker.io/cluster";
pub const MONIKER_SEQUENCE: &str = "moniker.spinnaker.io/sequence";

/// Explicit override of whether a kind is versioned ("true"/"false").
pub const STRATEGY_VERSIONED: &str = "strategy.spinnaker.io/versioned";

pub const RESTARTED_AT: &str = "clouddriver.spinnaker.io/restartedAt";

pub const LAST_APPLIED: &str = "kubectl.kubernetes.io/last-applied-configuration";

pub const DEPLOYMENT_REVISION: &str = "deployment.kubernetes.io/revision";
pub const DEPLOYMENT_REVISION_HISTORY: &str = "deployment.kubernetes.io/revision-history";
pub const DEPLOYMENT_DESIRED_REPLICAS: &str = "deployment.kubernetes.io/desired-replicas";
pub const DEPLOYMENT_MAX_REPLICAS: &str = "deployment.kubernetes.io/max-replicas";

pub const POD_TEMPLATE_HASH: &str = "pod-template-hash";

pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";
pub const LABEL_NAME: &str = "app.kubernetes.io/name";
pub const MANAGED_BY_SPINNAKER: &str = "spinnaker";

/// Selector matching everything Spinnaker manages for `app`.
pub fn app_selector(app: &str) -> String {
    format!("{}={},{}={}", LABEL_MANAGED_BY, MANAGED_BY_SPINNAKER, LABEL_NAME, app)
}
