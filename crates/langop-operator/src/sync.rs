//! Owned-resource synchronizer
//!
//! Create-or-update of one child with a controller owner reference. The
//! desired object's managed content (labels, annotations and spec or data)
//! is hashed into an annotation; a live child carrying the same hash and
//! owner is left untouched, so re-running against an unchanged spec writes
//! nothing.

use std::fmt;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::batch::v1::CronJob;
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Service};
use k8s_openapi::api::networking::v1::NetworkPolicy;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use serde_json::json;
use tracing::{debug, info};

use langop_common::kube_utils::{content_hash, is_owned_by};
use langop_common::Error;

use crate::client::KubeClient;

/// Annotation holding the hash of the last applied managed content
pub const SPEC_HASH_ANNOTATION: &str = "langop.io/spec-hash";

// =============================================================================
// Child resources
// =============================================================================

/// Kinds of children the operator creates
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChildKind {
    /// Config artifact
    ConfigMap,
    /// Continuous workload
    Deployment,
    /// Service endpoint
    Service,
    /// Network isolation
    NetworkPolicy,
    /// Scheduled workload
    CronJob,
    /// Agent workspace
    PersistentVolumeClaim,
}

impl ChildKind {
    /// Kubernetes kind name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConfigMap => "ConfigMap",
            Self::Deployment => "Deployment",
            Self::Service => "Service",
            Self::NetworkPolicy => "NetworkPolicy",
            Self::CronJob => "CronJob",
            Self::PersistentVolumeClaim => "PersistentVolumeClaim",
        }
    }
}

impl fmt::Display for ChildKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A child resource of any supported kind
#[derive(Clone, Debug, PartialEq)]
pub enum ChildResource {
    /// ConfigMap child
    ConfigMap(ConfigMap),
    /// Deployment child
    Deployment(Deployment),
    /// Service child
    Service(Service),
    /// NetworkPolicy child
    NetworkPolicy(NetworkPolicy),
    /// CronJob child
    CronJob(CronJob),
    /// PersistentVolumeClaim child
    PersistentVolumeClaim(PersistentVolumeClaim),
}

impl ChildResource {
    /// Kind of this child
    pub fn kind(&self) -> ChildKind {
        match self {
            Self::ConfigMap(_) => ChildKind::ConfigMap,
            Self::Deployment(_) => ChildKind::Deployment,
            Self::Service(_) => ChildKind::Service,
            Self::NetworkPolicy(_) => ChildKind::NetworkPolicy,
            Self::CronJob(_) => ChildKind::CronJob,
            Self::PersistentVolumeClaim(_) => ChildKind::PersistentVolumeClaim,
        }
    }

    /// Object metadata
    pub fn meta(&self) -> &ObjectMeta {
        match self {
            Self::ConfigMap(o) => &o.metadata,
            Self::Deployment(o) => &o.metadata,
            Self::Service(o) => &o.metadata,
            Self::NetworkPolicy(o) => &o.metadata,
            Self::CronJob(o) => &o.metadata,
            Self::PersistentVolumeClaim(o) => &o.metadata,
        }
    }

    /// Mutable object metadata
    pub fn meta_mut(&mut self) -> &mut ObjectMeta {
        match self {
            Self::ConfigMap(o) => &mut o.metadata,
            Self::Deployment(o) => &mut o.metadata,
            Self::Service(o) => &mut o.metadata,
            Self::NetworkPolicy(o) => &mut o.metadata,
            Self::CronJob(o) => &mut o.metadata,
            Self::PersistentVolumeClaim(o) => &mut o.metadata,
        }
    }

    /// Object name
    pub fn name(&self) -> &str {
        self.meta().name.as_deref().unwrap_or_default()
    }

    /// Object namespace
    pub fn namespace(&self) -> &str {
        self.meta().namespace.as_deref().unwrap_or_default()
    }

    /// Hash of everything the operator manages on this child
    pub fn managed_hash(&self) -> Result<String, Error> {
        let meta = self.meta();
        let mut annotations = meta.annotations.clone().unwrap_or_default();
        annotations.remove(SPEC_HASH_ANNOTATION);

        let body = match self {
            Self::ConfigMap(o) => json!({ "data": o.data, "binaryData": o.binary_data }),
            Self::Deployment(o) => json!({ "spec": o.spec }),
            Self::Service(o) => json!({ "spec": o.spec }),
            Self::NetworkPolicy(o) => json!({ "spec": o.spec }),
            Self::CronJob(o) => json!({ "spec": o.spec }),
            Self::PersistentVolumeClaim(o) => json!({ "spec": o.spec }),
        };
        let managed = json!({
            "labels": meta.labels,
            "annotations": annotations,
            "body": body,
        });
        let serialized = serde_json::to_string(&managed).map_err(|e| {
            Error::serialization_for_kind(self.kind().as_str(), e.to_string())
        })?;
        Ok(content_hash(&serialized))
    }

    fn live_hash(&self) -> Option<&str> {
        self.meta()
            .annotations
            .as_ref()
            .and_then(|a| a.get(SPEC_HASH_ANNOTATION))
            .map(String::as_str)
    }

    /// Carry server-owned state from the live object into a replacement
    fn adopt_live_state(&mut self, live: &ChildResource) {
        let live_meta = live.meta();
        let meta = self.meta_mut();
        meta.resource_version = live_meta.resource_version.clone();
        if let Some(live_annotations) = &live_meta.annotations {
            let annotations = meta.annotations.get_or_insert_with(Default::default);
            for (k, v) in live_annotations {
                annotations.entry(k.clone()).or_insert_with(|| v.clone());
            }
        }

        // clusterIP is immutable once allocated
        if let (Self::Service(desired), Self::Service(live)) = (self, live) {
            if let (Some(spec), Some(live_spec)) = (desired.spec.as_mut(), live.spec.as_ref()) {
                spec.cluster_ip = live_spec.cluster_ip.clone();
                spec.cluster_ips = live_spec.cluster_ips.clone();
            }
        }
    }
}

// =============================================================================
// Synchronization
// =============================================================================

/// What happened to a child during synchronization
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncOutcome {
    /// The child did not exist and was created
    Created,
    /// The child drifted and was replaced
    Updated,
    /// The child already matched
    Unchanged,
}

/// Converge one child toward `desired`
///
/// Returns the outcome together with the live object after the call.
pub async fn sync_child(
    kube: &dyn KubeClient,
    owner: &OwnerReference,
    mut desired: ChildResource,
) -> Result<(SyncOutcome, ChildResource), Error> {
    let hash = desired.managed_hash()?;
    {
        let meta = desired.meta_mut();
        meta.owner_references = Some(vec![owner.clone()]);
        meta.annotations
            .get_or_insert_with(Default::default)
            .insert(SPEC_HASH_ANNOTATION.to_string(), hash.clone());
    }

    let kind = desired.kind();
    let name = desired.name().to_string();
    let namespace = desired.namespace().to_string();

    let Some(live) = kube.get_child(kind, &namespace, &name).await? else {
        let created = kube.create_child(desired).await?;
        info!(kind = %kind, child = %name, "created child resource");
        return Ok((SyncOutcome::Created, created));
    };

    if live.live_hash() == Some(hash.as_str()) && is_owned_by(live.meta(), &owner.uid) {
        debug!(kind = %kind, child = %name, "child resource unchanged");
        return Ok((SyncOutcome::Unchanged, live));
    }

    // Claim size and storage class cannot change after binding
    if kind == ChildKind::PersistentVolumeClaim {
        debug!(child = %name, "leaving existing workspace claim as is");
        return Ok((SyncOutcome::Unchanged, live));
    }

    desired.adopt_live_state(&live);
    let updated = kube.replace_child(desired).await?;
    info!(kind = %kind, child = %name, "updated child resource");
    Ok((SyncOutcome::Updated, updated))
}
