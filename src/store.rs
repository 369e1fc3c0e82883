use std::fmt::Debug;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use tracing::*;

use crate::resources::sonarrs::Sonarr;
use crate::{Error, Result};

pub const FIELD_MANAGER: &str = "sonarr-operator";

/// The cluster API operations the controller relies on.
///
/// Reads return `None` when the object does not exist. Writes of a stale object
/// (resource version mismatch) fail with [`Error::Conflict`].
#[async_trait::async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get_sonarr(&self, namespace: &str, name: &str) -> Result<Option<Sonarr>>;
    /// Replace spec and metadata of a Sonarr
    async fn update_sonarr(&self, sonarr: &Sonarr) -> Result<Sonarr>;
    /// Overwrite the status subresource with `sonarr.status`
    async fn update_sonarr_status(&self, sonarr: &Sonarr) -> Result<Sonarr>;

    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Option<Deployment>>;
    async fn create_deployment(&self, deployment: &Deployment) -> Result<Deployment>;
    async fn update_deployment(&self, deployment: &Deployment) -> Result<Deployment>;

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>>;
    async fn create_service(&self, service: &Service) -> Result<Service>;
}

/// [`ObjectStore`] backed by the Kubernetes API server
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>,
    {
        Api::namespaced(self.client.clone(), namespace)
    }

    async fn get_opt<K>(&self, namespace: &str, name: &str) -> Result<Option<K>>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + Debug,
    {
        Ok(self.api::<K>(namespace).get_opt(name).await?)
    }

    async fn create<K>(&self, obj: &K) -> Result<K>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + Serialize
            + DeserializeOwned
            + Debug,
    {
        let api = self.api::<K>(&namespace_of(obj));
        debug!("Creating {} {}", K::kind(&()), obj.name_any());
        api.create(&post_params(), obj)
            .await
            .map_err(|err| write_error::<K>(obj, err))
    }

    async fn replace<K>(&self, obj: &K) -> Result<K>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + Serialize
            + DeserializeOwned
            + Debug,
    {
        let api = self.api::<K>(&namespace_of(obj));
        debug!("Replacing {} {}", K::kind(&()), obj.name_any());
        api.replace(&obj.name_any(), &post_params(), obj)
            .await
            .map_err(|err| write_error::<K>(obj, err))
    }
}

#[async_trait::async_trait]
impl ObjectStore for KubeStore {
    async fn get_sonarr(&self, namespace: &str, name: &str) -> Result<Option<Sonarr>> {
        self.get_opt(namespace, name).await
    }

    async fn update_sonarr(&self, sonarr: &Sonarr) -> Result<Sonarr> {
        self.replace(sonarr).await
    }

    async fn update_sonarr_status(&self, sonarr: &Sonarr) -> Result<Sonarr> {
        let api = self.api::<Sonarr>(&namespace_of(sonarr));
        let name = sonarr.name_any();

        // always overwrite the whole status object with what we computed
        let new_status = Patch::Apply(json!({
            "apiVersion": Sonarr::api_version(&()),
            "kind": Sonarr::kind(&()),
            "status": sonarr.status.clone().unwrap_or_default(),
        }));

        debug!("Updating status of Sonarr {name}");

        let ps = PatchParams::apply(FIELD_MANAGER).force();
        api.patch_status(&name, &ps, &new_status)
            .await
            .map_err(|err| write_error::<Sonarr>(sonarr, err))
    }

    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Option<Deployment>> {
        self.get_opt(namespace, name).await
    }

    async fn create_deployment(&self, deployment: &Deployment) -> Result<Deployment> {
        self.create(deployment).await
    }

    async fn update_deployment(&self, deployment: &Deployment) -> Result<Deployment> {
        self.replace(deployment).await
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>> {
        self.get_opt(namespace, name).await
    }

    async fn create_service(&self, service: &Service) -> Result<Service> {
        self.create(service).await
    }
}

fn post_params() -> PostParams {
    PostParams {
        dry_run: false,
        field_manager: Some(FIELD_MANAGER.to_owned()),
    }
}

fn namespace_of<K: Resource>(obj: &K) -> String {
    match obj.meta().namespace.as_deref() {
        Some("") | None => "default".to_owned(),
        Some(ns) => ns.to_owned(),
    }
}

// 409 means a stale resourceVersion or an object that already exists
fn write_error<K: Resource<DynamicType = ()>>(obj: &K, err: kube::Error) -> Error {
    match err {
        kube::Error::Api(resp) if resp.code == 409 => Error::Conflict {
            kind: K::kind(&()).into_owned(),
            name: obj.meta().name.clone().unwrap_or_default(),
            message: resp.message,
        },
        err => Error::KubeError(err),
    }
}
