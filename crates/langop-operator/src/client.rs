//! Kubernetes access for the controllers
//!
//! Everything the reconcilers read or write goes through [`KubeClient`] so
//! unit tests can run against `MockKubeClient` without an API server. The
//! langop kinds travel as `DynamicObject` and are parsed by the caller,
//! which keeps the trait object-safe.

use std::fmt;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use k8s_openapi::api::batch::v1::CronJob;
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Secret, Service};
use k8s_openapi::api::networking::v1::NetworkPolicy;
use kube::api::{Api, ApiResource, DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use langop_common::crd::{LanguageAgent, LanguageCluster, LanguageModel, LanguagePersona, LanguageTool};
use langop_common::{Error, FIELD_MANAGER};
use langop_network::{ClusterInspector, ServiceLookup};

use crate::sync::{ChildKind, ChildResource};

/// The langop resource kinds
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    /// LanguageAgent
    Agent,
    /// LanguageModel
    Model,
    /// LanguageTool
    Tool,
    /// LanguagePersona
    Persona,
    /// LanguageCluster
    Cluster,
}

impl ResourceKind {
    /// Kind name as it appears in manifests and labels
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Agent => "LanguageAgent",
            Self::Model => "LanguageModel",
            Self::Tool => "LanguageTool",
            Self::Persona => "LanguagePersona",
            Self::Cluster => "LanguageCluster",
        }
    }

    /// API resource descriptor for dynamic access
    pub fn api_resource(&self) -> ApiResource {
        match self {
            Self::Agent => ApiResource::erase::<LanguageAgent>(&()),
            Self::Model => ApiResource::erase::<LanguageModel>(&()),
            Self::Tool => ApiResource::erase::<LanguageTool>(&()),
            Self::Persona => ApiResource::erase::<LanguagePersona>(&()),
            Self::Cluster => ApiResource::erase::<LanguageCluster>(&()),
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parse a dynamic object into a typed langop resource
pub fn parse_object<K>(obj: DynamicObject) -> Result<K, Error>
where
    K: Resource<DynamicType = ()> + DeserializeOwned,
{
    obj.try_parse::<K>()
        .map_err(|e| Error::serialization_for_kind(K::kind(&()).to_string(), e.to_string()))
}

/// Trait abstracting Kubernetes operations for the controllers
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait KubeClient: Send + Sync {
    /// Get a langop resource, `None` when it does not exist
    async fn get_object(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DynamicObject>, Error>;

    /// List langop resources of one kind in a namespace
    async fn list_objects(
        &self,
        kind: ResourceKind,
        namespace: &str,
    ) -> Result<Vec<DynamicObject>, Error>;

    /// Delete a langop resource; a missing resource is not an error
    async fn delete_object(&self, kind: ResourceKind, namespace: &str, name: &str) -> Result<(), Error>;

    /// Merge-patch a langop resource's metadata
    async fn patch_metadata(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
        patch: Value,
    ) -> Result<(), Error>;

    /// Merge-patch a langop resource's status subresource
    async fn patch_status(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
        status: Value,
    ) -> Result<(), Error>;

    /// Get a child resource, `None` when it does not exist
    async fn get_child(
        &self,
        kind: ChildKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ChildResource>, Error>;

    /// Create a child resource
    async fn create_child(&self, child: ChildResource) -> Result<ChildResource, Error>;

    /// Replace a child resource (resourceVersion must be set)
    async fn replace_child(&self, child: ChildResource) -> Result<ChildResource, Error>;

    /// Delete a child resource; a missing child is not an error
    async fn delete_child(&self, kind: ChildKind, namespace: &str, name: &str) -> Result<(), Error>;

    /// Whether a Secret exists
    async fn secret_exists(&self, namespace: &str, name: &str) -> Result<bool, Error>;
}

/// Real Kubernetes client implementation
#[derive(Clone)]
pub struct KubeClientImpl {
    client: Client,
}

impl KubeClientImpl {
    /// Create a new KubeClientImpl wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn dynamic_api(&self, kind: ResourceKind, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, &kind.api_resource())
    }

    fn typed_api<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope, DynamicType = ()>,
    {
        Api::namespaced(self.client.clone(), namespace)
    }
}

async fn create_typed<K>(api: Api<K>, obj: &K) -> Result<K, Error>
where
    K: Resource + Clone + Serialize + DeserializeOwned + fmt::Debug,
{
    Ok(api.create(&PostParams::default(), obj).await?)
}

async fn replace_typed<K>(api: Api<K>, obj: &K) -> Result<K, Error>
where
    K: Resource + Clone + Serialize + DeserializeOwned + fmt::Debug,
{
    let name = obj.meta().name.clone().unwrap_or_default();
    Ok(api.replace(&name, &PostParams::default(), obj).await?)
}

async fn delete_typed<K>(api: Api<K>, name: &str) -> Result<(), Error>
where
    K: Resource + Clone + DeserializeOwned + fmt::Debug,
{
    match api.delete(name, &DeleteParams::background()).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl KubeClient for KubeClientImpl {
    async fn get_object(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DynamicObject>, Error> {
        Ok(self.dynamic_api(kind, namespace).get_opt(name).await?)
    }

    async fn list_objects(
        &self,
        kind: ResourceKind,
        namespace: &str,
    ) -> Result<Vec<DynamicObject>, Error> {
        let list = self
            .dynamic_api(kind, namespace)
            .list(&ListParams::default())
            .await?;
        Ok(list.items)
    }

    async fn delete_object(&self, kind: ResourceKind, namespace: &str, name: &str) -> Result<(), Error> {
        match self
            .dynamic_api(kind, namespace)
            .delete(name, &DeleteParams::background())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn patch_metadata(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
        patch: Value,
    ) -> Result<(), Error> {
        self.dynamic_api(kind, namespace)
            .patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn patch_status(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
        status: Value,
    ) -> Result<(), Error> {
        let status_patch = serde_json::json!({ "status": status });
        self.dynamic_api(kind, namespace)
            .patch_status(
                name,
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(&status_patch),
            )
            .await?;
        Ok(())
    }

    async fn get_child(
        &self,
        kind: ChildKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ChildResource>, Error> {
        let child = match kind {
            ChildKind::ConfigMap => self
                .typed_api::<ConfigMap>(namespace)
                .get_opt(name)
                .await?
                .map(ChildResource::ConfigMap),
            ChildKind::Deployment => self
                .typed_api::<Deployment>(namespace)
                .get_opt(name)
                .await?
                .map(ChildResource::Deployment),
            ChildKind::Service => self
                .typed_api::<Service>(namespace)
                .get_opt(name)
                .await?
                .map(ChildResource::Service),
            ChildKind::NetworkPolicy => self
                .typed_api::<NetworkPolicy>(namespace)
                .get_opt(name)
                .await?
                .map(ChildResource::NetworkPolicy),
            ChildKind::CronJob => self
                .typed_api::<CronJob>(namespace)
                .get_opt(name)
                .await?
                .map(ChildResource::CronJob),
            ChildKind::PersistentVolumeClaim => self
                .typed_api::<PersistentVolumeClaim>(namespace)
                .get_opt(name)
                .await?
                .map(ChildResource::PersistentVolumeClaim),
        };
        Ok(child)
    }

    async fn create_child(&self, child: ChildResource) -> Result<ChildResource, Error> {
        let ns = child.namespace().to_string();
        let created = match &child {
            ChildResource::ConfigMap(o) => {
                ChildResource::ConfigMap(create_typed(self.typed_api(&ns), o).await?)
            }
            ChildResource::Deployment(o) => {
                ChildResource::Deployment(create_typed(self.typed_api(&ns), o).await?)
            }
            ChildResource::Service(o) => {
                ChildResource::Service(create_typed(self.typed_api(&ns), o).await?)
            }
            ChildResource::NetworkPolicy(o) => {
                ChildResource::NetworkPolicy(create_typed(self.typed_api(&ns), o).await?)
            }
            ChildResource::CronJob(o) => {
                ChildResource::CronJob(create_typed(self.typed_api(&ns), o).await?)
            }
            ChildResource::PersistentVolumeClaim(o) => {
                ChildResource::PersistentVolumeClaim(create_typed(self.typed_api(&ns), o).await?)
            }
        };
        Ok(created)
    }

    async fn replace_child(&self, child: ChildResource) -> Result<ChildResource, Error> {
        let ns = child.namespace().to_string();
        let replaced = match &child {
            ChildResource::ConfigMap(o) => {
                ChildResource::ConfigMap(replace_typed(self.typed_api(&ns), o).await?)
            }
            ChildResource::Deployment(o) => {
                ChildResource::Deployment(replace_typed(self.typed_api(&ns), o).await?)
            }
            ChildResource::Service(o) => {
                ChildResource::Service(replace_typed(self.typed_api(&ns), o).await?)
            }
            ChildResource::NetworkPolicy(o) => {
                ChildResource::NetworkPolicy(replace_typed(self.typed_api(&ns), o).await?)
            }
            ChildResource::CronJob(o) => {
                ChildResource::CronJob(replace_typed(self.typed_api(&ns), o).await?)
            }
            ChildResource::PersistentVolumeClaim(o) => {
                ChildResource::PersistentVolumeClaim(replace_typed(self.typed_api(&ns), o).await?)
            }
        };
        Ok(replaced)
    }

    async fn delete_child(&self, kind: ChildKind, namespace: &str, name: &str) -> Result<(), Error> {
        match kind {
            ChildKind::ConfigMap => delete_typed(self.typed_api::<ConfigMap>(namespace), name).await,
            ChildKind::Deployment => delete_typed(self.typed_api::<Deployment>(namespace), name).await,
            ChildKind::Service => delete_typed(self.typed_api::<Service>(namespace), name).await,
            ChildKind::NetworkPolicy => {
                delete_typed(self.typed_api::<NetworkPolicy>(namespace), name).await
            }
            ChildKind::CronJob => delete_typed(self.typed_api::<CronJob>(namespace), name).await,
            ChildKind::PersistentVolumeClaim => {
                delete_typed(self.typed_api::<PersistentVolumeClaim>(namespace), name).await
            }
        }
    }

    async fn secret_exists(&self, namespace: &str, name: &str) -> Result<bool, Error> {
        Ok(self
            .typed_api::<Secret>(namespace)
            .get_metadata_opt(name)
            .await?
            .is_some())
    }
}

#[async_trait]
impl ClusterInspector for KubeClientImpl {
    async fn list_daemonsets(&self, namespace: &str) -> Result<Vec<DaemonSet>, Error> {
        let list = self
            .typed_api::<DaemonSet>(namespace)
            .list(&ListParams::default())
            .await?;
        Ok(list.items)
    }

    async fn list_configmaps(&self, namespace: &str) -> Result<Vec<ConfigMap>, Error> {
        let list = self
            .typed_api::<ConfigMap>(namespace)
            .list(&ListParams::default())
            .await?;
        Ok(list.items)
    }
}

#[async_trait]
impl ServiceLookup for KubeClientImpl {
    async fn get_service(&self, name: &str, namespace: &str) -> Result<Option<Service>, Error> {
        Ok(self.typed_api::<Service>(namespace).get_opt(name).await?)
    }
}
