use std::collections::BTreeMap;
use std::fmt;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Sonarr describes a single Sonarr instance managed by the operator.
/// The operator runs it as a Deployment and exposes it through a Service of the same name.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    kind = "Sonarr",
    group = "sonarr.parflesh.github.io",
    version = "v1alpha1",
    namespaced,
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Reason", "type":"string", "jsonPath":".status.reason", "priority": 1}"#,
    printcolumn = r#"{"name":"Image", "type":"string", "jsonPath":".status.image", "priority": 1}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[kube(status = "SonarrStatus", shortname = "sonarr")]
#[serde(rename_all = "camelCase")]
pub struct SonarrSpec {
    /// Container image capable of running Sonarr. Defaults to quay.io/parflesh/sonarr:latest.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// Stop automatic updates when the digest behind the image tag changes.
    #[serde(default)]
    pub disable_updates: bool,

    /// Names of image pull secrets for private container images.
    #[serde(default, alias = "imagePullSecret", skip_serializing_if = "Vec::is_empty")]
    pub image_pull_secrets: Vec<String>,

    /// Time to wait between checking resource status, e.g. `1m` or `1h30m`. Defaults to 1m.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub watch_frequency: Option<String>,

    /// Priority class of the Sonarr pod.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority_class_name: Option<String>,

    /// User id the Sonarr process runs as.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_as_user: Option<i64>,

    /// Group id the Sonarr process runs as.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_as_group: Option<i64>,

    /// Supplementary group applied to mounted volumes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fs_group: Option<i64>,

    /// Persistent volume claims to mount into the Sonarr container.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<SonarrVolume>,
}

/// A persistent volume claim mounted into the Sonarr container
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SonarrVolume {
    /// Volume name, unique within the Sonarr resource
    pub name: String,

    /// Name of the PersistentVolumeClaim backing this volume
    pub claim: String,

    /// Absolute path inside the container
    pub mount_path: String,

    /// Optional path within the volume to mount instead of its root
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_path: Option<String>,
}

impl SonarrSpec {
    /// The configured image, ignoring empty strings
    pub fn image(&self) -> Option<&str> {
        non_empty(self.image.as_deref())
    }

    pub fn watch_frequency(&self) -> Option<&str> {
        non_empty(self.watch_frequency.as_deref())
    }

    pub fn priority_class_name(&self) -> Option<&str> {
        non_empty(self.priority_class_name.as_deref())
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.is_empty())
}

/// Coarse summary of where a Sonarr instance is in its lifecycle
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum SonarrPhase {
    Initializing,
    Updating,
    Progressing,
    Available,
    ReplicaFailure,
}

impl fmt::Display for SonarrPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let phase = match self {
            SonarrPhase::Initializing => "Initializing",
            SonarrPhase::Updating => "Updating",
            SonarrPhase::Progressing => "Progressing",
            SonarrPhase::Available => "Available",
            SonarrPhase::ReplicaFailure => "ReplicaFailure",
        };
        f.write_str(phase)
    }
}

/// Status of the Sonarr
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SonarrStatus {
    /// Image reference currently deployed, pinned to a digest when updates are enabled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// The spec image that `image` was resolved from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_image: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<SonarrPhase>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Deployment condition type to the names of the deployments currently reporting it
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub deployments: BTreeMap<String, Vec<String>>,
}
