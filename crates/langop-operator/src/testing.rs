//! In-memory fakes shared by the controller unit tests

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{DaemonSet, DaemonSetSpec};
use k8s_openapi::api::core::v1::{ConfigMap, Container, PodSpec, PodTemplateSpec, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::DynamicObject;
use kube::core::ErrorResponse;
use kube::runtime::controller::Action;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use langop_common::Error;
use langop_network::{ClusterInspector, ServiceLookup, StaticResolver};

use crate::client::{KubeClient, ResourceKind};
use crate::context::Context;
use crate::reconciler::{merge_json, reconcile, Reconcilable};
use crate::sync::{ChildKind, ChildResource};

/// Metadata for a freshly created langop resource
pub fn resource_meta(name: &str, namespace: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        uid: Some(format!("uid-{}", name)),
        generation: Some(1),
        resource_version: Some("1".to_string()),
        ..Default::default()
    }
}

/// Kubernetes API error with the given HTTP code
pub fn api_error(code: u16) -> Error {
    Error::Kube {
        source: kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: format!("injected {}", code),
            reason: "Injected".to_string(),
            code,
        }),
    }
}

fn key(kind: impl std::fmt::Display, namespace: &str, name: &str) -> String {
    format!("{}/{}/{}", kind, namespace, name)
}

/// API server stand-in holding langop objects, children and secrets
#[derive(Default)]
pub struct FakeKube {
    objects: Mutex<BTreeMap<String, Value>>,
    children: Mutex<BTreeMap<String, ChildResource>>,
    secrets: Mutex<BTreeSet<String>>,
    failing: Mutex<BTreeMap<String, u16>>,
    ops: Mutex<Vec<String>>,
}

impl FakeKube {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a langop object
    pub fn insert<K: Serialize>(&self, kind: ResourceKind, obj: &K) {
        let value = serde_json::to_value(obj).unwrap();
        let ns = value["metadata"]["namespace"].as_str().unwrap().to_string();
        let name = value["metadata"]["name"].as_str().unwrap().to_string();
        self.objects
            .lock()
            .unwrap()
            .insert(key(kind, &ns, &name), value);
    }

    /// Read a langop object back as its typed form
    pub fn object<K: DeserializeOwned>(&self, kind: ResourceKind, namespace: &str, name: &str) -> Option<K> {
        self.objects
            .lock()
            .unwrap()
            .get(&key(kind, namespace, name))
            .map(|v| serde_json::from_value(v.clone()).unwrap())
    }

    /// Mark a langop object as being deleted
    pub fn mark_deleting(&self, kind: ResourceKind, namespace: &str, name: &str) {
        let mut objects = self.objects.lock().unwrap();
        let obj = objects.get_mut(&key(kind, namespace, name)).unwrap();
        obj["metadata"]["deletionTimestamp"] = serde_json::json!("2024-01-01T00:00:00Z");
    }

    /// Bump metadata.generation as a spec edit would
    pub fn bump_generation(&self, kind: ResourceKind, namespace: &str, name: &str) {
        let mut objects = self.objects.lock().unwrap();
        let obj = objects.get_mut(&key(kind, namespace, name)).unwrap();
        let gen = obj["metadata"]["generation"].as_i64().unwrap_or(1);
        obj["metadata"]["generation"] = serde_json::json!(gen + 1);
    }

    /// Register an existing secret
    pub fn add_secret(&self, namespace: &str, name: &str) {
        self.secrets
            .lock()
            .unwrap()
            .insert(format!("{}/{}", namespace, name));
    }

    /// Make create/replace of a child kind fail with an HTTP code
    pub fn fail_child(&self, kind: ChildKind, code: u16) {
        self.failing
            .lock()
            .unwrap()
            .insert(kind.as_str().to_string(), code);
    }

    /// Stop failing writes of a child kind
    pub fn heal_child(&self, kind: ChildKind) {
        self.failing.lock().unwrap().remove(kind.as_str());
    }

    /// Insert a child as if another pass had created it
    pub fn put_child(&self, child: ChildResource) {
        let k = key(child.kind(), child.namespace(), child.name());
        self.children.lock().unwrap().insert(k, child);
    }

    pub fn child(&self, kind: ChildKind, namespace: &str, name: &str) -> Option<ChildResource> {
        self.children
            .lock()
            .unwrap()
            .get(&key(kind, namespace, name))
            .cloned()
    }

    pub fn child_count(&self) -> usize {
        self.children.lock().unwrap().len()
    }

    /// Every recorded write, in order
    pub fn ops(&self) -> Vec<String> {
        self.ops.lock().unwrap().clone()
    }

    /// Forget recorded writes
    pub fn clear_ops(&self) {
        self.ops.lock().unwrap().clear();
    }

    /// Recorded writes that mutated children
    pub fn child_writes(&self) -> Vec<String> {
        self.ops()
            .into_iter()
            .filter(|op| op.starts_with("create ") || op.starts_with("replace "))
            .collect()
    }

    fn record(&self, op: String) {
        self.ops.lock().unwrap().push(op);
    }

    fn check_failing(&self, kind: ChildKind) -> Result<(), Error> {
        match self.failing.lock().unwrap().get(kind.as_str()) {
            Some(code) => Err(api_error(*code)),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl KubeClient for FakeKube {
    async fn get_object(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DynamicObject>, Error> {
        let objects = self.objects.lock().unwrap();
        Ok(objects
            .get(&key(kind, namespace, name))
            .map(|v| serde_json::from_value(v.clone()).unwrap()))
    }

    async fn list_objects(
        &self,
        kind: ResourceKind,
        namespace: &str,
    ) -> Result<Vec<DynamicObject>, Error> {
        let prefix = format!("{}/{}/", kind, namespace);
        let objects = self.objects.lock().unwrap();
        Ok(objects
            .iter()
            .filter(|(k, _)| k.starts_with(&prefix))
            .map(|(_, v)| serde_json::from_value(v.clone()).unwrap())
            .collect())
    }

    async fn delete_object(&self, kind: ResourceKind, namespace: &str, name: &str) -> Result<(), Error> {
        self.record(format!("delete {} {}/{}", kind, namespace, name));
        let mut objects = self.objects.lock().unwrap();
        let k = key(kind, namespace, name);
        let has_finalizers = objects
            .get(&k)
            .and_then(|v| v["metadata"]["finalizers"].as_array())
            .is_some_and(|f| !f.is_empty());
        if has_finalizers {
            if let Some(obj) = objects.get_mut(&k) {
                obj["metadata"]["deletionTimestamp"] = serde_json::json!("2024-01-01T00:00:00Z");
            }
        } else {
            objects.remove(&k);
        }
        Ok(())
    }

    async fn patch_metadata(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
        patch: Value,
    ) -> Result<(), Error> {
        self.record(format!("patch_metadata {} {}/{}", kind, namespace, name));
        let mut objects = self.objects.lock().unwrap();
        let k = key(kind, namespace, name);
        let Some(obj) = objects.get_mut(&k) else {
            return Err(api_error(404));
        };
        let mut meta_patch = patch["metadata"].clone();
        if let Some(m) = meta_patch.as_object_mut() {
            m.remove("resourceVersion");
        }
        merge_json(&mut obj["metadata"], &meta_patch);
        let released = obj["metadata"]["deletionTimestamp"].is_string()
            && obj["metadata"]["finalizers"]
                .as_array()
                .map_or(true, |f| f.is_empty());
        if released {
            objects.remove(&k);
        }
        Ok(())
    }

    async fn patch_status(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
        status: Value,
    ) -> Result<(), Error> {
        self.record(format!("patch_status {} {}/{}", kind, namespace, name));
        let mut objects = self.objects.lock().unwrap();
        let Some(obj) = objects.get_mut(&key(kind, namespace, name)) else {
            return Err(api_error(404));
        };
        if !obj["status"].is_object() {
            obj["status"] = serde_json::json!({});
        }
        merge_json(&mut obj["status"], &status);
        Ok(())
    }

    async fn get_child(
        &self,
        kind: ChildKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ChildResource>, Error> {
        Ok(self.child(kind, namespace, name))
    }

    async fn create_child(&self, mut child: ChildResource) -> Result<ChildResource, Error> {
        self.check_failing(child.kind())?;
        let k = key(child.kind(), child.namespace(), child.name());
        self.record(format!("create {}", k));
        let mut children = self.children.lock().unwrap();
        if children.contains_key(&k) {
            return Err(api_error(409));
        }
        child.meta_mut().resource_version = Some("1".to_string());
        children.insert(k, child.clone());
        Ok(child)
    }

    async fn replace_child(&self, mut child: ChildResource) -> Result<ChildResource, Error> {
        self.check_failing(child.kind())?;
        let k = key(child.kind(), child.namespace(), child.name());
        self.record(format!("replace {}", k));
        let mut children = self.children.lock().unwrap();
        let Some(live) = children.get(&k) else {
            return Err(api_error(404));
        };
        if live.meta().resource_version != child.meta().resource_version {
            return Err(api_error(409));
        }
        let next = live
            .meta()
            .resource_version
            .as_deref()
            .and_then(|rv| rv.parse::<u64>().ok())
            .unwrap_or(0)
            + 1;
        child.meta_mut().resource_version = Some(next.to_string());
        children.insert(k, child.clone());
        Ok(child)
    }

    async fn delete_child(&self, kind: ChildKind, namespace: &str, name: &str) -> Result<(), Error> {
        let k = key(kind, namespace, name);
        self.record(format!("delete {}", k));
        self.children.lock().unwrap().remove(&k);
        Ok(())
    }

    async fn secret_exists(&self, namespace: &str, name: &str) -> Result<bool, Error> {
        Ok(self
            .secrets
            .lock()
            .unwrap()
            .contains(&format!("{}/{}", namespace, name)))
    }
}

#[async_trait]
impl ServiceLookup for FakeKube {
    async fn get_service(&self, name: &str, namespace: &str) -> Result<Option<Service>, Error> {
        match self.child(ChildKind::Service, namespace, name) {
            Some(ChildResource::Service(svc)) => Ok(Some(svc)),
            _ => Ok(None),
        }
    }
}

/// Cluster inspector returning fixed objects
#[derive(Clone, Debug, Default)]
pub struct StaticInspector {
    pub daemonsets: Vec<DaemonSet>,
    pub configmaps: Vec<ConfigMap>,
}

impl StaticInspector {
    /// Inspector seeing one CNI DaemonSet running `image`
    pub fn with_daemonset(name: &str, image: &str) -> Self {
        Self {
            daemonsets: vec![daemonset(name, image)],
            configmaps: Vec::new(),
        }
    }
}

/// DaemonSet with a single container
pub fn daemonset(name: &str, image: &str) -> DaemonSet {
    DaemonSet {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("kube-system".to_string()),
            ..Default::default()
        },
        spec: Some(DaemonSetSpec {
            template: PodTemplateSpec {
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: "cni".to_string(),
                        image: Some(image.to_string()),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
                ..Default::default()
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[async_trait]
impl ClusterInspector for StaticInspector {
    async fn list_daemonsets(&self, _namespace: &str) -> Result<Vec<DaemonSet>, Error> {
        Ok(self.daemonsets.clone())
    }

    async fn list_configmaps(&self, _namespace: &str) -> Result<Vec<ConfigMap>, Error> {
        Ok(self.configmaps.clone())
    }
}

/// Service lookup where no Service exists
pub struct NoServices;

#[async_trait]
impl ServiceLookup for NoServices {
    async fn get_service(&self, _name: &str, _namespace: &str) -> Result<Option<Service>, Error> {
        Ok(None)
    }
}

/// Context wired to in-memory fakes
pub fn test_context(
    kube: Arc<FakeKube>,
    inspector: StaticInspector,
    dns: StaticResolver,
) -> Arc<Context> {
    Arc::new(Context::for_testing(
        kube.clone(),
        Arc::new(inspector),
        kube,
        Arc::new(dns),
    ))
}

/// Reconcile the stored object until it stops asking for an immediate requeue
pub async fn converge<K: Reconcilable>(
    fake: &FakeKube,
    ctx: &Arc<Context>,
    namespace: &str,
    name: &str,
) -> Result<Action, Error> {
    let mut action = Action::requeue(Duration::ZERO);
    for _ in 0..3 {
        let obj: K = fake.object(K::KIND, namespace, name).unwrap();
        action = reconcile(Arc::new(obj), ctx.clone()).await?;
        if action != Action::requeue(Duration::ZERO) {
            break;
        }
    }
    Ok(action)
}
