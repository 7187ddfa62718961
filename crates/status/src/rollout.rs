//! Per-kind rollout checks. Each starts from [`RolloutStatus::default`]
//! (stable and available) and reports the first unmet condition.

use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, ReplicaSet, StatefulSet};
use k8s_openapi::api::autoscaling::v2::HorizontalPodAutoscaler;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use crate::RolloutStatus;

const NO_STATUS: &str = "No status reported yet";

/// Unset generations count as zero on both sides.
fn generation_observed(meta: &ObjectMeta, observed: Option<i64>) -> bool { meta.generation.unwrap_or(0) == observed.unwrap_or(0) }

pub fn deployment(d: &Deployment) -> RolloutStatus {
    let mut s = RolloutStatus::default();
    let spec = d.spec.clone().unwrap_or_default();
    if spec.paused == Some(true) {
        s.paused.state = true;
    }
    let status = d.status.clone().unwrap_or_default();

    if !generation_observed(&d.metadata, status.observed_generation) {
        s.unstable("Waiting for status generation to match updated object generation");
        return s;
    }

    for c in status.conditions.iter().flatten() {
        if c.type_ == "Progressing" && c.reason.as_deref() == Some("ProgressDeadlineExceeded") {
            s.fail(&format!("Deployment exceeded its progress deadline: {}", c.message.as_deref().unwrap_or_default()));
            return s;
        }
    }
    if let Some(c) = status.conditions.iter().flatten().find(|c| c.type_ == "Available" && c.status == "False") {
        let reason = c.reason.clone().unwrap_or_default();
        s.unavailable(&reason);
        s.unstable(&reason);
        return s;
    }

    let desired = spec.replicas.unwrap_or(0);
    let updated = status.updated_replicas.unwrap_or(0);
    let existing = status.replicas.unwrap_or(0);
    let available = status.available_replicas.unwrap_or(0);
    let ready = status.ready_replicas.unwrap_or(0);

    if desired > updated {
        s.unstable("Waiting for all replicas to be updated");
    } else if existing > updated {
        s.unstable("Waiting for old replicas to finish termination");
    } else if desired > available {
        s.unavailable("Waiting for all replicas to be available");
        s.unstable("Waiting for all replicas to be available");
    } else if desired > ready {
        s.unstable("Waiting for all replicas to be ready");
    }
    s
}

pub fn replica_set(rs: &ReplicaSet) -> RolloutStatus {
    let mut s = RolloutStatus::default();
    let desired = rs.spec.as_ref().and_then(|sp| sp.replicas).unwrap_or(0);
    let status = rs.status.clone().unwrap_or_default();

    if desired > status.fully_labeled_replicas.unwrap_or(0) {
        s.unstable("Waiting for all replicas to be fully-labeled");
    } else if desired > status.ready_replicas.unwrap_or(0) {
        s.unstable("Waiting for all replicas to be ready");
    } else if desired > status.available_replicas.unwrap_or(0) {
        s.unavailable("Waiting for all replicas to be available");
        s.unstable("Waiting for all replicas to be available");
    } else if !generation_observed(&rs.metadata, status.observed_generation) {
        s.unstable("Waiting for replicaset spec update to be observed");
    }
    s
}

pub fn daemon_set(ds: &DaemonSet) -> RolloutStatus {
    let mut s = RolloutStatus::default();
    let Some(status) = ds.status.as_ref() else {
        s.unstable(NO_STATUS);
        return s;
    };
    let strategy = ds.spec.as_ref().and_then(|sp| sp.update_strategy.as_ref()).and_then(|u| u.type_.as_deref());
    if strategy == Some("RollingUpdate") {
        return s;
    }
    if !generation_observed(&ds.metadata, status.observed_generation) {
        s.unstable("Waiting for daemonset spec update to be observed");
        return s;
    }

    let desired = status.desired_number_scheduled;
    if desired > status.current_number_scheduled {
        s.unstable("Waiting for all replicas to be scheduled");
    } else if desired > status.updated_number_scheduled.unwrap_or(0) {
        s.unstable("Waiting for all updated replicas to be scheduled");
    } else if desired > status.number_available.unwrap_or(0) {
        s.unavailable("Waiting for all replicas to be available");
        s.unstable("Waiting for all replicas to be available");
    } else if desired > status.number_ready {
        s.unstable("Waiting for all replicas to be ready");
    }
    s
}

pub fn stateful_set(sts: &StatefulSet) -> RolloutStatus {
    let mut s = RolloutStatus::default();
    let spec = sts.spec.clone().unwrap_or_default();
    let strategy = spec.update_strategy.clone().unwrap_or_default();
    if strategy.type_.as_deref() == Some("OnDelete") {
        return s;
    }
    let Some(status) = sts.status.as_ref() else {
        s.unstable(NO_STATUS);
        return s;
    };
    if !generation_observed(&sts.metadata, status.observed_generation) {
        s.unstable("Waiting for statefulset spec update to be observed");
        return s;
    }

    let desired = spec.replicas.unwrap_or(0);
    let existing = status.replicas;
    if desired > existing {
        s.unstable("Waiting for at least the desired replica count to be met");
        return s;
    }
    if desired > status.ready_replicas.unwrap_or(0) {
        s.unstable("Waiting for all updated replicas to be ready");
        return s;
    }

    let partition = if strategy.type_.as_deref().unwrap_or("RollingUpdate") == "RollingUpdate" {
        strategy.rolling_update.as_ref().and_then(|r| r.partition)
    } else {
        None
    };
    if let Some(partition) = partition {
        let updated = status.updated_replicas.unwrap_or(0);
        if updated < existing - partition {
            s.unstable(&format!(
                "Waiting for partitioned roll out to finish: {} of {} updated (partition {})",
                updated, existing, partition
            ));
        } else {
            s.stable.message = format!("Partitioned roll out complete: {} of {} updated (partition {})", updated, existing, partition);
        }
        return s;
    }

    if desired > status.current_replicas.unwrap_or(0) {
        s.unstable("Waiting for all updated replicas to be scheduled");
    } else if status.update_revision != status.current_revision {
        s.unstable("Waiting for the updated revision to match the current revision");
    }
    s
}

pub fn job(j: &Job) -> RolloutStatus {
    let mut s = RolloutStatus::default();
    let completions = j.spec.as_ref().and_then(|sp| sp.completions).unwrap_or(1);
    let status = j.status.clone().unwrap_or_default();
    if status.succeeded.unwrap_or(0) >= completions {
        return s;
    }
    let failed = status.conditions.iter().flatten().find(|c| c.type_ == "Failed" && c.status == "True");
    match failed {
        Some(c) => {
            let msg = c.message.clone().or_else(|| c.reason.clone()).unwrap_or_else(|| "Job failed".to_string());
            s.fail(&msg);
        }
        None => s.unstable("Waiting for jobs to finish"),
    }
    s
}

pub fn pod(p: &Pod) -> RolloutStatus {
    let mut s = RolloutStatus::default();
    let phase = p.status.as_ref().and_then(|st| st.phase.as_deref()).unwrap_or_default();
    if matches!(phase, "Pending" | "Failed" | "Unknown") {
        let msg = format!("Pod is {}", phase);
        s.unavailable(&msg);
        s.unstable(&msg);
    }
    s
}

pub fn hpa(h: &HorizontalPodAutoscaler) -> RolloutStatus {
    let mut s = RolloutStatus::default();
    let (current, desired) = match h.status.as_ref() {
        Some(st) => (st.current_replicas.unwrap_or(0), st.desired_replicas),
        None => (0, 0),
    };
    if desired != current {
        let direction = if desired > current { "up" } else { "down" };
        let msg = format!("Waiting for HPA to complete a scale {}, current: {} desired: {}", direction, current, desired);
        s.unavailable(&msg);
        s.unstable(&msg);
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::views;
    use serde_json::json;

    fn deploy(desired: i32, status: serde_json::Value) -> Deployment {
        views::deployment(&json!({
            "kind": "Deployment",
            "metadata": { "name": "web", "generation": 3 },
            "spec": { "replicas": desired, "selector": {}, "template": {} },
            "status": status
        }))
        .unwrap()
    }

    #[test]
    fn zero_valued_views_are_stable() {
        for s in [
            deployment(&Deployment::default()),
            replica_set(&ReplicaSet::default()),
            pod(&Pod::default()),
            hpa(&HorizontalPodAutoscaler::default()),
        ] {
            assert!(s.stable.state && s.available.state && !s.paused.state && !s.failed.state, "{:?}", s);
        }
    }

    #[test]
    fn missing_generation_reads_as_zero() {
        let unset = views::deployment(&json!({
            "kind": "Deployment",
            "metadata": { "name": "web" },
            "spec": { "replicas": 0, "selector": {}, "template": {} },
            "status": { "observedGeneration": 2 }
        }))
        .unwrap();
        assert_eq!(deployment(&unset).stable.message, "Waiting for status generation to match updated object generation");

        let zero = views::deployment(&json!({
            "kind": "Deployment",
            "metadata": { "name": "web" },
            "spec": { "replicas": 0, "selector": {}, "template": {} },
            "status": { "observedGeneration": 0 }
        }))
        .unwrap();
        assert!(deployment(&zero).stable.state);
    }

    #[test]
    fn deployment_waits_for_updated_replicas() {
        let s = deployment(&deploy(4, json!({ "observedGeneration": 3, "updatedReplicas": 2 })));
        assert!(!s.stable.state);
        assert_eq!(s.stable.message, "Waiting for all replicas to be updated");
    }

    #[test]
    fn deployment_check_order() {
        let s = deployment(&deploy(2, json!({ "observedGeneration": 2 })));
        assert_eq!(s.stable.message, "Waiting for status generation to match updated object generation");

        let s = deployment(&deploy(2, json!({ "observedGeneration": 3, "updatedReplicas": 2, "replicas": 3 })));
        assert_eq!(s.stable.message, "Waiting for old replicas to finish termination");

        let s = deployment(&deploy(2, json!({ "observedGeneration": 3, "updatedReplicas": 2, "replicas": 2, "readyReplicas": 2 })));
        assert!(!s.available.state);
        assert_eq!(s.available.message, "Waiting for all replicas to be available");

        let s = deployment(&deploy(2, json!({
            "observedGeneration": 3, "updatedReplicas": 2, "replicas": 2, "availableReplicas": 2, "readyReplicas": 1
        })));
        assert!(s.available.state);
        assert_eq!(s.stable.message, "Waiting for all replicas to be ready");

        let s = deployment(&deploy(2, json!({
            "observedGeneration": 3, "updatedReplicas": 2, "replicas": 2, "availableReplicas": 2, "readyReplicas": 2
        })));
        assert!(s.stable.state && s.available.state);
    }

    #[test]
    fn deployment_conditions() {
        let s = deployment(&deploy(1, json!({
            "observedGeneration": 3,
            "conditions": [ { "type": "Progressing", "status": "False", "reason": "ProgressDeadlineExceeded", "message": "too slow" } ]
        })));
        assert!(s.failed.state);
        assert!(s.failed.message.contains("too slow"));

        let s = deployment(&deploy(1, json!({
            "observedGeneration": 3,
            "conditions": [ { "type": "Available", "status": "False", "reason": "MinimumReplicasUnavailable" } ]
        })));
        assert!(!s.available.state && !s.stable.state);
        assert_eq!(s.available.message, "MinimumReplicasUnavailable");
    }

    #[test]
    fn daemon_set_empty_status_and_rolling_update() {
        let ds = views::daemon_set(&json!({ "kind": "DaemonSet", "metadata": { "name": "a" }, "spec": { "selector": {}, "template": {} }, "status": {} })).unwrap();
        assert_eq!(daemon_set(&ds).stable.message, NO_STATUS);

        let ds = views::daemon_set(&json!({
            "kind": "DaemonSet", "metadata": { "name": "a" },
            "spec": { "selector": {}, "template": {}, "updateStrategy": { "type": "RollingUpdate" } },
            "status": { "desiredNumberScheduled": 3 }
        }))
        .unwrap();
        assert!(daemon_set(&ds).stable.state);

        let ds = views::daemon_set(&json!({
            "kind": "DaemonSet", "metadata": { "name": "a" },
            "spec": { "selector": {}, "template": {}, "updateStrategy": { "type": "OnDelete" } },
            "status": { "desiredNumberScheduled": 3, "currentNumberScheduled": 3, "updatedNumberScheduled": 1 }
        }))
        .unwrap();
        assert_eq!(daemon_set(&ds).stable.message, "Waiting for all updated replicas to be scheduled");
    }

    fn sts(spec_extra: serde_json::Value, status: serde_json::Value) -> StatefulSet {
        let mut spec = json!({ "replicas": 3, "selector": {}, "template": {}, "serviceName": "db" });
        if let (Some(s), Some(extra)) = (spec.as_object_mut(), spec_extra.as_object()) {
            for (k, v) in extra {
                s.insert(k.clone(), v.clone());
            }
        }
        views::stateful_set(&json!({ "kind": "StatefulSet", "metadata": { "name": "db" }, "spec": spec, "status": status })).unwrap()
    }

    #[test]
    fn stateful_set_branches() {
        assert_eq!(stateful_set(&sts(json!({}), json!({}))).stable.message, NO_STATUS);
        assert!(stateful_set(&sts(json!({ "updateStrategy": { "type": "OnDelete" } }), json!({}))).stable.state);

        let s = stateful_set(&sts(json!({}), json!({ "replicas": 2 })));
        assert_eq!(s.stable.message, "Waiting for at least the desired replica count to be met");

        let s = stateful_set(&sts(json!({}), json!({ "replicas": 3, "readyReplicas": 2 })));
        assert_eq!(s.stable.message, "Waiting for all updated replicas to be ready");

        let s = stateful_set(&sts(json!({}), json!({
            "replicas": 3, "readyReplicas": 3, "currentReplicas": 3, "updateRevision": "b", "currentRevision": "a"
        })));
        assert_eq!(s.stable.message, "Waiting for the updated revision to match the current revision");
    }

    #[test]
    fn stateful_set_partition_ignores_revisions() {
        let partitioned = json!({ "updateStrategy": { "type": "RollingUpdate", "rollingUpdate": { "partition": 2 } } });
        let s = stateful_set(&sts(partitioned.clone(), json!({
            "replicas": 3, "readyReplicas": 3, "updatedReplicas": 1, "updateRevision": "b", "currentRevision": "a"
        })));
        assert!(s.stable.state, "{:?}", s);
        assert!(s.stable.message.starts_with("Partitioned roll out complete"));

        let s = stateful_set(&sts(partitioned, json!({ "replicas": 3, "readyReplicas": 3, "updatedReplicas": 0 })));
        assert!(!s.stable.state);
        assert!(s.stable.message.starts_with("Waiting for partitioned roll out to finish"));
    }

    #[test]
    fn job_completion_and_failure() {
        let j = views::job(&json!({ "kind": "Job", "metadata": { "name": "j" }, "spec": { "template": {} }, "status": {} })).unwrap();
        assert_eq!(job(&j).stable.message, "Waiting for jobs to finish");

        let j = views::job(&json!({ "kind": "Job", "metadata": { "name": "j" }, "spec": { "template": {}, "completions": 2 }, "status": { "succeeded": 2 } })).unwrap();
        assert!(job(&j).stable.state);

        let j = views::job(&json!({
            "kind": "Job", "metadata": { "name": "j" }, "spec": { "template": {} },
            "status": { "conditions": [ { "type": "Failed", "status": "True", "message": "BackoffLimitExceeded" } ] }
        }))
        .unwrap();
        let s = job(&j);
        assert!(s.failed.state);
        assert_eq!(s.failed.message, "BackoffLimitExceeded");
    }

    #[test]
    fn pod_phase_and_hpa_direction() {
        let p = views::pod(&json!({ "kind": "Pod", "metadata": { "name": "p" }, "status": { "phase": "Pending" } })).unwrap();
        let s = pod(&p);
        assert!(!s.stable.state && !s.available.state);
        assert_eq!(s.stable.message, "Pod is Pending");

        let h = views::hpa(&json!({
            "kind": "HorizontalPodAutoscaler", "metadata": { "name": "h" },
            "spec": { "maxReplicas": 5, "scaleTargetRef": { "kind": "Deployment", "name": "web" } },
            "status": { "currentReplicas": 2, "desiredReplicas": 4 }
        }))
        .unwrap();
        assert_eq!(hpa(&h).stable.message, "Waiting for HPA to complete a scale up, current: 2 desired: 4");
    }
}
