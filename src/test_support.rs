//! In-memory stand-ins for the cluster API and the container registry.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Service;
use kube::{Resource, ResourceExt};

use crate::registry::{Manifest, RegistryClient, RegistryError, DEFAULT_TAG};
use crate::resources::sonarrs::Sonarr;
use crate::store::ObjectStore;
use crate::{Error, Result};

type Key = (String, String);

fn key<K: Resource>(obj: &K) -> Key {
    (
        obj.meta().namespace.clone().unwrap_or_else(|| "default".into()),
        obj.meta().name.clone().unwrap_or_default(),
    )
}

/// Keeps objects in maps and behaves like the API server where the controller can tell:
/// uids and resource versions are assigned on write, stale writes conflict,
/// and status updates leave spec alone.
#[derive(Default)]
pub struct FakeStore {
    sonarrs: Mutex<BTreeMap<Key, Sonarr>>,
    deployments: Mutex<BTreeMap<Key, Deployment>>,
    services: Mutex<BTreeMap<Key, Service>>,
    revision: AtomicUsize,
    writes: AtomicUsize,
}

impl FakeStore {
    pub fn with_sonarr(sonarr: Sonarr) -> Self {
        let store = Self::default();
        let mut sonarr = sonarr;
        store.stamp_new(&mut sonarr);
        store.sonarrs.lock().unwrap().insert(key(&sonarr), sonarr);
        store
    }

    /// Number of successful writes so far
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn sonarr(&self, namespace: &str, name: &str) -> Option<Sonarr> {
        self.sonarrs
            .lock()
            .unwrap()
            .get(&(namespace.into(), name.into()))
            .cloned()
    }

    pub fn deployment(&self, namespace: &str, name: &str) -> Option<Deployment> {
        self.deployments
            .lock()
            .unwrap()
            .get(&(namespace.into(), name.into()))
            .cloned()
    }

    pub fn service(&self, namespace: &str, name: &str) -> Option<Service> {
        self.services
            .lock()
            .unwrap()
            .get(&(namespace.into(), name.into()))
            .cloned()
    }

    /// Change a stored deployment behind the controller's back, as another writer would
    pub fn edit_deployment(
        &self,
        namespace: &str,
        name: &str,
        edit: impl FnOnce(&mut Deployment),
    ) {
        let mut deployments = self.deployments.lock().unwrap();
        let deployment = deployments
            .get_mut(&(namespace.into(), name.into()))
            .expect("deployment to exist");
        edit(deployment);
        deployment.metadata.resource_version = Some(self.next_revision());
    }

    pub fn edit_sonarr(&self, namespace: &str, name: &str, edit: impl FnOnce(&mut Sonarr)) {
        let mut sonarrs = self.sonarrs.lock().unwrap();
        let sonarr = sonarrs
            .get_mut(&(namespace.into(), name.into()))
            .expect("sonarr to exist");
        edit(sonarr);
        sonarr.metadata.resource_version = Some(self.next_revision());
    }

    fn next_revision(&self) -> String {
        (self.revision.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    fn stamp_new<K: Resource>(&self, obj: &mut K) {
        let revision = self.next_revision();
        let meta = obj.meta_mut();
        meta.namespace.get_or_insert_with(|| "default".into());
        meta.uid = Some(format!("uid-{revision}"));
        meta.resource_version = Some(revision);
    }

    fn create<K: Resource<DynamicType = ()> + Clone>(
        &self,
        objects: &Mutex<BTreeMap<Key, K>>,
        obj: &K,
    ) -> Result<K> {
        let mut objects = objects.lock().unwrap();
        let mut obj = obj.clone();
        if objects.contains_key(&key(&obj)) {
            return Err(conflict(&obj, "already exists"));
        }
        self.stamp_new(&mut obj);
        objects.insert(key(&obj), obj.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(obj)
    }

    fn replace<K: Resource<DynamicType = ()> + Clone>(
        &self,
        objects: &Mutex<BTreeMap<Key, K>>,
        obj: &K,
        merge: impl FnOnce(&K, &mut K),
    ) -> Result<K> {
        let mut objects = objects.lock().unwrap();
        let stored = objects
            .get(&key(obj))
            .ok_or_else(|| conflict(obj, "not found"))?;
        if obj.meta().resource_version.is_some()
            && obj.meta().resource_version != stored.meta().resource_version
        {
            return Err(conflict(obj, "the object has been modified"));
        }
        let mut updated = obj.clone();
        merge(stored, &mut updated);
        updated.meta_mut().uid = stored.meta().uid.clone();
        updated.meta_mut().resource_version = Some(self.next_revision());
        objects.insert(key(&updated), updated.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(updated)
    }
}

fn conflict<K: Resource<DynamicType = ()>>(obj: &K, message: &str) -> Error {
    Error::Conflict {
        kind: K::kind(&()).into_owned(),
        name: obj.name_any(),
        message: message.into(),
    }
}

#[async_trait::async_trait]
impl ObjectStore for FakeStore {
    async fn get_sonarr(&self, namespace: &str, name: &str) -> Result<Option<Sonarr>> {
        Ok(self.sonarr(namespace, name))
    }

    async fn update_sonarr(&self, sonarr: &Sonarr) -> Result<Sonarr> {
        // status is a subresource; a regular update does not touch it
        self.replace(&self.sonarrs, sonarr, |stored, updated| {
            updated.status = stored.status.clone()
        })
    }

    async fn update_sonarr_status(&self, sonarr: &Sonarr) -> Result<Sonarr> {
        let mut sonarrs = self.sonarrs.lock().unwrap();
        let stored = sonarrs
            .get_mut(&key(sonarr))
            .ok_or_else(|| conflict(sonarr, "not found"))?;
        stored.status = sonarr.status.clone();
        stored.metadata.resource_version = Some(self.next_revision());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(stored.clone())
    }

    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Option<Deployment>> {
        Ok(self.deployment(namespace, name))
    }

    async fn create_deployment(&self, deployment: &Deployment) -> Result<Deployment> {
        self.create(&self.deployments, deployment)
    }

    async fn update_deployment(&self, deployment: &Deployment) -> Result<Deployment> {
        self.replace(&self.deployments, deployment, |stored, updated| {
            updated.status = stored.status.clone()
        })
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>> {
        Ok(self.service(namespace, name))
    }

    async fn create_service(&self, service: &Service) -> Result<Service> {
        self.create(&self.services, service)
    }
}

/// Registry that answers every manifest request with a fixed digest and lists only `latest`
#[derive(Default)]
pub struct FakeRegistry {
    digest: Mutex<Option<String>>,
    calls: AtomicUsize,
}

impl FakeRegistry {
    pub fn with_digest(digest: &str) -> Self {
        let registry = Self::default();
        registry.set_digest(digest);
        registry
    }

    pub fn set_digest(&self, digest: &str) {
        *self.digest.lock().unwrap() = Some(digest.into());
    }

    /// Make every following manifest request fail
    pub fn fail(&self) {
        *self.digest.lock().unwrap() = None;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl RegistryClient for FakeRegistry {
    async fn manifest_for_tag(
        &self,
        registry: &str,
        repository: &str,
        tag: &str,
    ) -> Result<Manifest, RegistryError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.digest.lock().unwrap().clone() {
            Some(config_digest) => Ok(Manifest { config_digest }),
            None => Err(RegistryError::Auth(format!(
                "no manifest for {registry}/{repository}:{tag}"
            ))),
        }
    }

    async fn tags(
        &self,
        registry: &str,
        repository: &str,
    ) -> Result<Vec<String>, RegistryError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.digest.lock().unwrap().as_ref() {
            Some(_) => Ok(vec![DEFAULT_TAG.to_owned()]),
            None => Err(RegistryError::Auth(format!("no tags for {registry}/{repository}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fake_registry_lists_tags_until_it_fails() {
        let registry = FakeRegistry::with_digest("sha256:abc123");
        assert_eq!(
            registry.tags("docker.io", "lib/app").await.unwrap(),
            vec![DEFAULT_TAG]
        );

        registry.fail();
        assert!(matches!(
            registry.tags("docker.io", "lib/app").await,
            Err(RegistryError::Auth(_))
        ));
        assert_eq!(registry.calls(), 2);
    }
}
