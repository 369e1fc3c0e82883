use std::collections::{BTreeMap, HashSet};
use std::fmt;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec, DeploymentStrategy};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, HTTPGetAction, LocalObjectReference,
    PersistentVolumeClaimVolumeSource, PodSecurityContext, PodSpec, PodTemplateSpec, Probe,
    Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;

use crate::resources::sonarrs::{Sonarr, SonarrVolume};
use crate::{Error, Result};

use super::{label_selector, object_meta, APP_NAME, HTTP_PORT, HTTP_PORT_NAME};

const REVISION_HISTORY_LIMIT: i32 = 5;

fn http_probe() -> Probe {
    Probe {
        http_get: Some(HTTPGetAction {
            path: Some("/".into()),
            port: IntOrString::Int(HTTP_PORT),
            scheme: Some("HTTP".into()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// The Deployment that runs `image` for this Sonarr.
///
/// Pure: the same Sonarr and image always give an identical Deployment.
pub fn desired_deployment(sonarr: &Sonarr, image: &str) -> Result<Deployment> {
    let spec = &sonarr.spec;
    let metadata = object_meta(sonarr)?;
    let labels = metadata.labels.clone();
    let (volumes, volume_mounts) = volumes(&spec.volumes)?;

    let image_pull_secrets: Vec<LocalObjectReference> = spec
        .image_pull_secrets
        .iter()
        .map(|secret| LocalObjectReference {
            name: secret.clone().into(),
        })
        .collect();

    let security_context = PodSecurityContext {
        run_as_user: spec.run_as_user,
        run_as_group: spec.run_as_group,
        fs_group: spec.fs_group,
        ..Default::default()
    };

    Ok(Deployment {
        metadata,
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: label_selector(&sonarr.name_any()),
            strategy: Some(DeploymentStrategy {
                type_: Some("Recreate".into()),
                rolling_update: None,
            }),
            revision_history_limit: Some(REVISION_HISTORY_LIMIT),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels,
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: APP_NAME.into(),
                        image: Some(image.into()),
                        image_pull_policy: Some("IfNotPresent".into()),
                        ports: Some(vec![ContainerPort {
                            name: Some(HTTP_PORT_NAME.into()),
                            container_port: HTTP_PORT,
                            protocol: Some("TCP".into()),
                            ..Default::default()
                        }]),
                        liveness_probe: Some(http_probe()),
                        readiness_probe: Some(http_probe()),
                        volume_mounts,
                        ..Default::default()
                    }],
                    volumes,
                    image_pull_secrets: (!image_pull_secrets.is_empty())
                        .then_some(image_pull_secrets),
                    priority_class_name: spec.priority_class_name().map(Into::into),
                    restart_policy: Some("Always".into()),
                    security_context: Some(security_context),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        status: None,
    })
}

type Volumes = (Option<Vec<Volume>>, Option<Vec<VolumeMount>>);

/// Turn the spec volumes into pod volumes and container mounts, in spec order
fn volumes(spec_volumes: &[SonarrVolume]) -> Result<Volumes> {
    if spec_volumes.is_empty() {
        return Ok((None, None));
    }

    let mut seen = HashSet::new();
    let mut volumes = Vec::with_capacity(spec_volumes.len());
    let mut mounts = Vec::with_capacity(spec_volumes.len());

    for vol in spec_volumes {
        let invalid = |message: &str| Error::InvalidVolume {
            name: vol.name.clone(),
            message: message.into(),
        };

        if !is_dns_label(&vol.name) {
            return Err(invalid("name must be a lowercase DNS label"));
        }
        if !seen.insert(vol.name.as_str()) {
            return Err(invalid("name is used by more than one volume"));
        }
        if vol.claim.is_empty() {
            return Err(invalid("claim must name a PersistentVolumeClaim"));
        }
        if !vol.mount_path.starts_with('/') {
            return Err(invalid("mountPath must be an absolute path"));
        }
        let sub_path = vol.sub_path.as_deref().filter(|p| !p.is_empty());
        if let Some(sub_path) = sub_path {
            if sub_path.starts_with('/') || sub_path.split('/').any(|p| p == "..") {
                return Err(invalid("subPath must be a relative path inside the volume"));
            }
        }

        volumes.push(Volume {
            name: vol.name.clone(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: vol.claim.clone(),
                read_only: None,
            }),
            ..Default::default()
        });
        mounts.push(VolumeMount {
            name: vol.name.clone(),
            mount_path: vol.mount_path.clone(),
            sub_path: sub_path.map(Into::into),
            ..Default::default()
        });
    }

    Ok((Some(volumes), Some(mounts)))
}

// RFC 1123 label, as the API server requires for volume names
fn is_dns_label(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 63
        && !name.starts_with('-')
        && !name.ends_with('-')
        && name
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
}

/// A group of Deployment fields that is compared and corrected as one unit.
///
/// Groups are checked in the order of [`FieldGroup::ORDERED`]; earlier groups win.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FieldGroup {
    Volumes,
    PriorityClass,
    RunAsUser,
    RunAsGroup,
    FsGroup,
    Image,
    ImagePullSecrets,
    Labels,
    Replicas,
}

impl FieldGroup {
    pub const ORDERED: [FieldGroup; 9] = [
        FieldGroup::Volumes,
        FieldGroup::PriorityClass,
        FieldGroup::RunAsUser,
        FieldGroup::RunAsGroup,
        FieldGroup::FsGroup,
        FieldGroup::Image,
        FieldGroup::ImagePullSecrets,
        FieldGroup::Labels,
        FieldGroup::Replicas,
    ];

    pub fn message(self) -> &'static str {
        match self {
            FieldGroup::Volumes => "deployment volumes/volumemounts mismatch",
            FieldGroup::PriorityClass => "priority class name mismatch",
            FieldGroup::RunAsUser => "user mismatch",
            FieldGroup::RunAsGroup => "group mismatch",
            FieldGroup::FsGroup => "filesystem group mismatch",
            FieldGroup::Image => "image mismatch",
            FieldGroup::ImagePullSecrets => "image pull secrets mismatch",
            FieldGroup::Labels => "labels mismatch",
            FieldGroup::Replicas => "replicas mismatch",
        }
    }

    /// Stable label for metrics
    pub fn label(self) -> &'static str {
        match self {
            FieldGroup::Volumes => "volumes",
            FieldGroup::PriorityClass => "priority_class",
            FieldGroup::RunAsUser => "run_as_user",
            FieldGroup::RunAsGroup => "run_as_group",
            FieldGroup::FsGroup => "fs_group",
            FieldGroup::Image => "image",
            FieldGroup::ImagePullSecrets => "image_pull_secrets",
            FieldGroup::Labels => "labels",
            FieldGroup::Replicas => "replicas",
        }
    }

    fn differs(self, observed: &Deployment, desired: &Deployment) -> bool {
        match self {
            FieldGroup::Volumes => {
                slice(pod_spec(observed).and_then(|p| p.volumes.as_ref()))
                    != slice(pod_spec(desired).and_then(|p| p.volumes.as_ref()))
                    || slice(container(observed).and_then(|c| c.volume_mounts.as_ref()))
                        != slice(container(desired).and_then(|c| c.volume_mounts.as_ref()))
            }
            FieldGroup::PriorityClass => {
                priority_class_name(observed) != priority_class_name(desired)
            }
            FieldGroup::RunAsUser => {
                security_context(observed).and_then(|s| s.run_as_user)
                    != security_context(desired).and_then(|s| s.run_as_user)
            }
            FieldGroup::RunAsGroup => {
                security_context(observed).and_then(|s| s.run_as_group)
                    != security_context(desired).and_then(|s| s.run_as_group)
            }
            FieldGroup::FsGroup => {
                security_context(observed).and_then(|s| s.fs_group)
                    != security_context(desired).and_then(|s| s.fs_group)
            }
            FieldGroup::Image => {
                container(observed).and_then(|c| c.image.as_deref())
                    != container(desired).and_then(|c| c.image.as_deref())
            }
            FieldGroup::ImagePullSecrets => {
                slice(pod_spec(observed).and_then(|p| p.image_pull_secrets.as_ref()))
                    != slice(pod_spec(desired).and_then(|p| p.image_pull_secrets.as_ref()))
            }
            FieldGroup::Labels => {
                observed.metadata.labels != desired.metadata.labels
                    || template_labels(observed) != template_labels(desired)
                    || selector_labels(observed) != selector_labels(desired)
            }
            FieldGroup::Replicas => replicas(observed) != replicas(desired),
        }
    }

    /// Copy this group's fields from `desired` into `observed`
    fn apply(self, observed: &mut Deployment, desired: &Deployment) {
        match self {
            FieldGroup::Volumes => {
                pod_spec_mut(observed).volumes = pod_spec(desired).and_then(|p| p.volumes.clone());
                container_mut(observed).volume_mounts =
                    container(desired).and_then(|c| c.volume_mounts.clone());
            }
            FieldGroup::PriorityClass => {
                pod_spec_mut(observed).priority_class_name =
                    priority_class_name(desired).map(Into::into);
            }
            FieldGroup::RunAsUser => {
                security_context_mut(observed).run_as_user =
                    security_context(desired).and_then(|s| s.run_as_user);
            }
            FieldGroup::RunAsGroup => {
                security_context_mut(observed).run_as_group =
                    security_context(desired).and_then(|s| s.run_as_group);
            }
            FieldGroup::FsGroup => {
                security_context_mut(observed).fs_group =
                    security_context(desired).and_then(|s| s.fs_group);
            }
            FieldGroup::Image => {
                container_mut(observed).image = container(desired).and_then(|c| c.image.clone());
            }
            FieldGroup::ImagePullSecrets => {
                pod_spec_mut(observed).image_pull_secrets =
                    pod_spec(desired).and_then(|p| p.image_pull_secrets.clone());
            }
            FieldGroup::Labels => {
                observed.metadata.labels = desired.metadata.labels.clone();
                let template_labels = template_labels(desired).cloned();
                spec_mut(observed)
                    .template
                    .metadata
                    .get_or_insert_with(Default::default)
                    .labels = template_labels;
                spec_mut(observed).selector.match_labels = selector_labels(desired).cloned();
            }
            FieldGroup::Replicas => spec_mut(observed).replicas = replicas(desired),
        }
    }
}

impl fmt::Display for FieldGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

/// Correct the first field group in which `observed` differs from `desired`.
///
/// At most one group is changed per call so that every correction is written and
/// observed on its own. Returns the corrected group, or `None` if nothing differs.
pub fn reconcile_deployment(observed: &mut Deployment, desired: &Deployment) -> Option<FieldGroup> {
    let group = FieldGroup::ORDERED
        .into_iter()
        .find(|group| group.differs(observed, desired))?;
    group.apply(observed, desired);
    Some(group)
}

// an absent list and an empty list mean the same thing to the API server
fn slice<T>(list: Option<&Vec<T>>) -> &[T] {
    list.map(Vec::as_slice).unwrap_or_default()
}

fn pod_spec(dep: &Deployment) -> Option<&PodSpec> {
    dep.spec.as_ref()?.template.spec.as_ref()
}

fn container(dep: &Deployment) -> Option<&Container> {
    pod_spec(dep)?.containers.first()
}

fn security_context(dep: &Deployment) -> Option<&PodSecurityContext> {
    pod_spec(dep)?.security_context.as_ref()
}

fn priority_class_name(dep: &Deployment) -> Option<&str> {
    pod_spec(dep)?
        .priority_class_name
        .as_deref()
        .filter(|p| !p.is_empty())
}

fn template_labels(dep: &Deployment) -> Option<&BTreeMap<String, String>> {
    dep.spec.as_ref()?.template.metadata.as_ref()?.labels.as_ref()
}

fn selector_labels(dep: &Deployment) -> Option<&BTreeMap<String, String>> {
    dep.spec.as_ref()?.selector.match_labels.as_ref()
}

fn replicas(dep: &Deployment) -> Option<i32> {
    dep.spec.as_ref()?.replicas
}

fn spec_mut(dep: &mut Deployment) -> &mut DeploymentSpec {
    dep.spec.get_or_insert_with(Default::default)
}

fn pod_spec_mut(dep: &mut Deployment) -> &mut PodSpec {
    spec_mut(dep)
        .template
        .spec
        .get_or_insert_with(Default::default)
}

fn container_mut(dep: &mut Deployment) -> &mut Container {
    let pod_spec = pod_spec_mut(dep);
    if pod_spec.containers.is_empty() {
        pod_spec.containers.push(Container {
            name: APP_NAME.into(),
            ..Default::default()
        });
    }
    &mut pod_spec.containers[0]
}

fn security_context_mut(dep: &mut Deployment) -> &mut PodSecurityContext {
    pod_spec_mut(dep)
        .security_context
        .get_or_insert_with(Default::default)
}
