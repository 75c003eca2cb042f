//! Shared Kubernetes utilities: labels, child naming, ownership and hashing

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::{Resource, ResourceExt};
use sha2::{Digest, Sha256};

use crate::{
    Error, LABEL_CLUSTER, LABEL_KIND, LABEL_MANAGED_BY, LABEL_MANAGED_BY_LANGOP, LABEL_NAME,
    LABEL_PART_OF, LABEL_PART_OF_LANGOP,
};

// =============================================================================
// Labels and naming
// =============================================================================

/// Labels every child of a langop resource carries
///
/// These double as the pod selector of the owner's workload and network
/// policy, so they must stay stable across reconciles.
pub fn common_labels(name: &str, kind: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_NAME.to_string(), name.to_string()),
        (
            LABEL_MANAGED_BY.to_string(),
            LABEL_MANAGED_BY_LANGOP.to_string(),
        ),
        (LABEL_PART_OF.to_string(), LABEL_PART_OF_LANGOP.to_string()),
        (LABEL_KIND.to_string(), kind.to_string()),
    ])
}

/// Common labels plus the cluster label when the resource joins a cluster
pub fn member_labels(
    name: &str,
    kind: &str,
    cluster_ref: Option<&str>,
) -> BTreeMap<String, String> {
    let mut labels = common_labels(name, kind);
    if let Some(cluster) = cluster_ref.filter(|c| !c.is_empty()) {
        labels.insert(LABEL_CLUSTER.to_string(), cluster.to_string());
    }
    labels
}

/// Name of a config artifact owned by `owner`: `{owner}-{suffix}`
pub fn child_name(owner: &str, suffix: &str) -> String {
    format!("{}-{}", owner, suffix)
}

/// Metadata builder for child resources
#[derive(Clone, Debug, Default)]
pub struct ChildMeta {
    meta: ObjectMeta,
}

impl ChildMeta {
    /// Start metadata for a namespaced child
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            meta: ObjectMeta {
                name: Some(name.into()),
                namespace: Some(namespace.into()),
                ..Default::default()
            },
        }
    }

    /// Replace all labels
    pub fn labels(mut self, labels: BTreeMap<String, String>) -> Self {
        self.meta.labels = Some(labels);
        self
    }

    /// Add an annotation
    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.meta
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(key.into(), value.into());
        self
    }

    /// Finish building
    pub fn build(self) -> ObjectMeta {
        self.meta
    }
}

// =============================================================================
// Ownership
// =============================================================================

/// Controller owner reference pointing at `owner`
///
/// Fails when the owner has not been persisted yet (no UID), since the API
/// server rejects owner references without one.
pub fn controller_owner_ref<K>(owner: &K) -> Result<OwnerReference, Error>
where
    K: Resource<DynamicType = ()>,
{
    owner.controller_owner_ref(&()).ok_or_else(|| {
        Error::internal_with_context(
            "owner_reference",
            format!("{} {} has no uid", K::kind(&()), owner.name_any()),
        )
    })
}

/// True when `meta` lists an owner reference with the given uid
pub fn is_owned_by(meta: &ObjectMeta, owner_uid: &str) -> bool {
    meta.owner_references
        .as_ref()
        .is_some_and(|refs| refs.iter().any(|r| r.uid == owner_uid))
}

// =============================================================================
// Hashing
// =============================================================================

/// Full SHA-256 hex digest, used for content hashes persisted in annotations
/// and status
pub fn content_hash(input: &str) -> String {
    hex::encode(Sha256::digest(input.as_bytes()))
}

/// Compute a deterministic hash of the input string, returning a 16-char hex digest.
pub fn deterministic_hash(input: &str) -> String {
    let mut full = content_hash(input);
    full.truncate(16);
    full
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{LanguagePersona, LanguagePersonaSpec};

    #[test]
    fn common_labels_include_kind_and_manager() {
        let labels = common_labels("gpt4", "LanguageModel");
        assert_eq!(labels.get("app.kubernetes.io/name").unwrap(), "gpt4");
        assert_eq!(
            labels.get("app.kubernetes.io/managed-by").unwrap(),
            "language-operator"
        );
        assert_eq!(labels.get("app.kubernetes.io/part-of").unwrap(), "langop");
        assert_eq!(labels.get("langop.io/kind").unwrap(), "LanguageModel");
    }

    #[test]
    fn member_labels_add_cluster_only_when_set() {
        let labels = member_labels("a", "LanguageAgent", Some("prod"));
        assert_eq!(labels.get("langop.io/cluster").unwrap(), "prod");
        assert!(!member_labels("a", "LanguageAgent", Some(""))
            .contains_key("langop.io/cluster"));
        assert!(!member_labels("a", "LanguageAgent", None).contains_key("langop.io/cluster"));
    }

    #[test]
    fn child_names() {
        assert_eq!(child_name("gpt4", "model"), "gpt4-model");
    }

    #[test]
    fn child_meta_builder() {
        let meta = ChildMeta::new("x-code", "ns")
            .labels(common_labels("x", "LanguageAgent"))
            .with_annotation("langop.io/instructions-hash", "abc")
            .build();
        assert_eq!(meta.name.as_deref(), Some("x-code"));
        assert_eq!(meta.namespace.as_deref(), Some("ns"));
        assert_eq!(
            meta.annotations.unwrap().get("langop.io/instructions-hash").unwrap(),
            "abc"
        );
    }

    #[test]
    fn owner_ref_requires_uid() {
        let mut persona = LanguagePersona::new("analyst", LanguagePersonaSpec::default());
        assert!(controller_owner_ref(&persona).is_err());

        persona.metadata.uid = Some("uid-1".to_string());
        let owner = controller_owner_ref(&persona).unwrap();
        assert_eq!(owner.kind, "LanguagePersona");
        assert_eq!(owner.api_version, "langop.io/v1alpha1");
        assert_eq!(owner.controller, Some(true));

        let child = ObjectMeta {
            owner_references: Some(vec![owner]),
            ..Default::default()
        };
        assert!(is_owned_by(&child, "uid-1"));
        assert!(!is_owned_by(&child, "uid-2"));
    }

    #[test]
    fn hashes_are_stable() {
        assert_eq!(
            content_hash("hello"),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        assert_eq!(deterministic_hash("hello"), "2cf24dba5fb0a30e");
    }
}
