use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::{Resource, ResourceExt};

use crate::resources::sonarrs::Sonarr;
use crate::{Error, Result};

pub mod defaults;
pub mod deployment;
pub mod image;
pub mod service;
pub mod status;

pub const APP_NAME: &str = "sonarr";
pub const HTTP_PORT_NAME: &str = "http";
pub const HTTP_PORT: i32 = 8989;

pub const APP_MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

// selector labels; deployment selectors are immutable so these must never change
pub fn selector_labels(instance: &str) -> BTreeMap<String, String> {
    BTreeMap::from_iter([
        ("app.kubernetes.io/name".into(), APP_NAME.into()),
        ("app.kubernetes.io/instance".into(), instance.into()),
    ])
}

pub fn resource_labels(instance: &str) -> BTreeMap<String, String> {
    let mut labels = selector_labels(instance);
    labels.insert(APP_MANAGED_BY_LABEL.into(), "sonarr-operator".into());
    labels
}

pub fn label_selector(instance: &str) -> LabelSelector {
    LabelSelector {
        match_labels: Some(selector_labels(instance)),
        match_expressions: None,
    }
}

/// Metadata for a child object: same name and namespace as the Sonarr, owned by it
pub fn object_meta(sonarr: &Sonarr) -> Result<ObjectMeta> {
    let oref = sonarr
        .controller_owner_ref(&())
        .ok_or(Error::MissingObjectKey("metadata.uid"))?;
    let name = sonarr.name_any();

    Ok(ObjectMeta {
        name: Some(name.clone()),
        namespace: sonarr.namespace(),
        labels: Some(resource_labels(&name)),
        owner_references: Some(vec![oref]),
        ..Default::default()
    })
}
