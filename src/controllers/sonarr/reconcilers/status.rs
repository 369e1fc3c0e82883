use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::Deployment;
use kube::ResourceExt;

use crate::resources::sonarrs::{SonarrPhase, SonarrStatus};

pub const AVAILABLE: &str = "Available";
pub const PROGRESSING: &str = "Progressing";
pub const REPLICA_FAILURE: &str = "ReplicaFailure";

// reported by the deployment controller once a rollout is complete
const ROLLOUT_COMPLETE: &str = "has successfully progressed";

/// Condition buckets with nothing in them
pub fn empty_conditions() -> BTreeMap<String, Vec<String>> {
    [AVAILABLE, PROGRESSING, REPLICA_FAILURE]
        .into_iter()
        .map(|c| (c.to_owned(), Vec::new()))
        .collect()
}

/// Group the deployment under every condition type it currently reports as true.
///
/// A failing deployment is never reported as progressing or available, and a
/// deployment mid-rollout is never reported as available.
pub fn deployment_conditions(deployment: &Deployment) -> BTreeMap<String, Vec<String>> {
    let mut buckets = empty_conditions();
    let name = deployment.name_any();

    let conditions = deployment
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_deref())
        .unwrap_or_default();

    for condition in conditions.iter().filter(|c| c.status == "True") {
        if condition.type_ == PROGRESSING
            && condition
                .message
                .as_deref()
                .is_some_and(|m| m.contains(ROLLOUT_COMPLETE))
        {
            continue;
        }
        buckets
            .entry(condition.type_.clone())
            .or_default()
            .push(name.clone());
    }

    if !bucket(&buckets, PROGRESSING).is_empty() {
        buckets.insert(AVAILABLE.into(), Vec::new());
    }
    if !bucket(&buckets, REPLICA_FAILURE).is_empty() {
        buckets.insert(AVAILABLE.into(), Vec::new());
        buckets.insert(PROGRESSING.into(), Vec::new());
    }

    buckets
}

/// Set phase and reason from the condition buckets in `status.deployments`.
///
/// Leaves both untouched when no bucket has any members.
pub fn derive_phase(status: &mut SonarrStatus) {
    let (phase, reason) = if !bucket(&status.deployments, REPLICA_FAILURE).is_empty() {
        (SonarrPhase::ReplicaFailure, Some("Deployment replica failure"))
    } else if !bucket(&status.deployments, PROGRESSING).is_empty() {
        (SonarrPhase::Progressing, Some("Deployment progressing"))
    } else if !bucket(&status.deployments, AVAILABLE).is_empty() {
        (SonarrPhase::Available, None)
    } else {
        return;
    };

    status.phase = Some(phase);
    status.reason = reason.map(Into::into);
}

fn bucket<'a>(buckets: &'a BTreeMap<String, Vec<String>>, condition: &str) -> &'a [String] {
    buckets.get(condition).map(Vec::as_slice).unwrap_or_default()
}
