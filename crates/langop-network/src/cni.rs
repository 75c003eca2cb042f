//! CNI capability detection
//!
//! There is no API that reports which network plugin a cluster runs, so
//! detection matches the system namespace's DaemonSets (and, failing that,
//! its ConfigMaps) against a small registry of known plugin signatures.
//!
//! Detection runs on every reconcile; a plugin migration is picked up on the
//! next pass.

use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::DaemonSet;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::ResourceExt;
use thiserror::Error;
use tracing::{debug, warn};

use langop_common::conditions::CONDITION_NETWORK_POLICY_ENFORCED;
use langop_common::crd::ConditionStatus;

/// Name reported when no plugin could be identified
pub const CNI_NONE: &str = "none";

/// Version reported when no image tag qualifies
pub const VERSION_UNKNOWN: &str = "unknown";

// =============================================================================
// Registry
// =============================================================================

/// A known network plugin and how to recognize it
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CniSignature {
    /// Plugin name reported in capabilities (e.g. "cilium")
    pub name: String,
    /// DaemonSet name, matched exactly or as a prefix (`kube-flannel-ds-amd64`)
    pub daemon_pattern: String,
    /// Whether the plugin enforces NetworkPolicy objects
    pub supports_network_policy: bool,
}

impl CniSignature {
    /// Create a signature
    pub fn new(name: &str, daemon_pattern: &str, supports_network_policy: bool) -> Self {
        Self {
            name: name.to_string(),
            daemon_pattern: daemon_pattern.to_string(),
            supports_network_policy,
        }
    }

    fn matches_daemon(&self, daemon: &str) -> bool {
        daemon == self.daemon_pattern || daemon.starts_with(&self.daemon_pattern)
    }
}

/// Ordered signature table; the first match wins
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CniRegistry {
    signatures: Vec<CniSignature>,
}

impl CniRegistry {
    /// Registry from an explicit signature list
    pub fn new(signatures: Vec<CniSignature>) -> Self {
        Self { signatures }
    }

    /// Add a signature at the end of the table
    pub fn with(mut self, signature: CniSignature) -> Self {
        self.signatures.push(signature);
        self
    }

    /// Signatures in match order
    pub fn signatures(&self) -> &[CniSignature] {
        &self.signatures
    }
}

impl Default for CniRegistry {
    fn default() -> Self {
        Self::new(vec![
            CniSignature::new("cilium", "cilium", true),
            CniSignature::new("calico", "calico-node", true),
            CniSignature::new("weave", "weave-net", true),
            CniSignature::new("antrea", "antrea-agent", true),
            CniSignature::new("flannel", "kube-flannel-ds", false),
        ])
    }
}

// =============================================================================
// Detection
// =============================================================================

/// What the detector learned about the cluster's network plugin
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CniCapabilities {
    /// Plugin name, or [`CNI_NONE`]
    pub name: String,
    /// Whether NetworkPolicy objects are enforced
    pub supports_network_policy: bool,
    /// Image tag of the plugin, [`VERSION_UNKNOWN`], or empty when undetected
    pub version: String,
}

impl CniCapabilities {
    /// Descriptor returned alongside [`DetectError::NotDetected`]
    pub fn none() -> Self {
        Self {
            name: CNI_NONE.to_string(),
            supports_network_policy: false,
            version: String::new(),
        }
    }
}

/// Detection failures
#[derive(Debug, Error)]
pub enum DetectError {
    /// No signature matched; `capabilities` is still safe to use
    #[error("no known CNI plugin found in namespace {namespace}")]
    NotDetected {
        /// Namespace that was scanned
        namespace: String,
        /// Zero-value descriptor (`none`, no enforcement)
        capabilities: CniCapabilities,
    },

    /// Listing cluster objects failed; retry later
    #[error("CNI lookup failed: {0}")]
    Lookup(#[from] langop_common::Error),
}

/// Cluster reads needed for detection
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ClusterInspector: Send + Sync {
    /// List DaemonSets in a namespace
    async fn list_daemonsets(&self, namespace: &str) -> Result<Vec<DaemonSet>, langop_common::Error>;

    /// List ConfigMaps in a namespace
    async fn list_configmaps(&self, namespace: &str) -> Result<Vec<ConfigMap>, langop_common::Error>;
}

/// Identify the cluster's network plugin
///
/// DaemonSets are checked first so a version can be read from the image tag;
/// ConfigMaps are a fallback that only yields a name.
pub async fn detect_network_policy_support(
    inspector: &dyn ClusterInspector,
    registry: &CniRegistry,
    namespace: &str,
) -> Result<CniCapabilities, DetectError> {
    let daemonsets = inspector.list_daemonsets(namespace).await?;
    if let Some(caps) = match_daemonsets(registry, &daemonsets) {
        debug!(cni = %caps.name, version = %caps.version, "detected CNI from daemonset");
        return Ok(caps);
    }

    let configmaps = inspector.list_configmaps(namespace).await?;
    if let Some(caps) = match_configmaps(registry, &configmaps) {
        debug!(cni = %caps.name, "detected CNI from configmap");
        return Ok(caps);
    }

    Err(DetectError::NotDetected {
        namespace: namespace.to_string(),
        capabilities: CniCapabilities::none(),
    })
}

/// [`detect_network_policy_support`] bounded by a deadline
pub async fn detect_with_timeout(
    inspector: &dyn ClusterInspector,
    registry: &CniRegistry,
    namespace: &str,
    timeout: Duration,
) -> Result<CniCapabilities, DetectError> {
    match tokio::time::timeout(
        timeout,
        detect_network_policy_support(inspector, registry, namespace),
    )
    .await
    {
        Ok(result) => result,
        Err(_) => Err(DetectError::Lookup(langop_common::Error::timeout(
            "cni detection",
            timeout.as_secs(),
        ))),
    }
}

fn match_daemonsets(registry: &CniRegistry, daemonsets: &[DaemonSet]) -> Option<CniCapabilities> {
    for ds in daemonsets {
        let name = ds.name_any();
        if let Some(sig) = registry.signatures().iter().find(|s| s.matches_daemon(&name)) {
            return Some(CniCapabilities {
                name: sig.name.clone(),
                supports_network_policy: sig.supports_network_policy,
                version: image_version(ds),
            });
        }
    }
    None
}

/// Tag of the first container image whose tag is not `latest`
///
/// Order-dependent: an unrelated sidecar listed first wins.
fn image_version(ds: &DaemonSet) -> String {
    let containers = ds
        .spec
        .as_ref()
        .and_then(|s| s.template.spec.as_ref())
        .map(|p| p.containers.as_slice())
        .unwrap_or(&[]);

    containers
        .iter()
        .filter_map(|c| c.image.as_deref())
        .filter_map(image_tag)
        .find(|tag| *tag != "latest")
        .map(str::to_string)
        .unwrap_or_else(|| VERSION_UNKNOWN.to_string())
}

fn image_tag(image: &str) -> Option<&str> {
    let (_, tag) = image.rsplit_once(':')?;
    // registry:port/name with no tag
    if tag.contains('/') || tag.is_empty() {
        return None;
    }
    Some(tag)
}

fn match_configmaps(registry: &CniRegistry, configmaps: &[ConfigMap]) -> Option<CniCapabilities> {
    let found = |sig: &CniSignature| CniCapabilities {
        name: sig.name.clone(),
        supports_network_policy: sig.supports_network_policy,
        version: VERSION_UNKNOWN.to_string(),
    };

    let mentioned = move |text: &str| {
        let text = text.to_lowercase();
        registry
            .signatures()
            .iter()
            .find(|s| text.contains(&s.name.to_lowercase()))
    };

    for cm in configmaps {
        if let Some(sig) = mentioned(&cm.name_any()) {
            return Some(found(sig));
        }
    }

    // Only CNI config payloads, so unrelated data naming a plugin is ignored
    for cm in configmaps {
        let Some(data) = cm.data.as_ref() else {
            continue;
        };
        let cni_payloads = data
            .iter()
            .filter(|(key, _)| is_cni_config_key(key))
            .map(|(_, value)| value);
        for value in cni_payloads {
            if let Some(sig) = mentioned(value) {
                return Some(found(sig));
            }
        }
    }
    None
}

fn is_cni_config_key(key: &str) -> bool {
    key.contains("cni-conf") || key == "10-calico.conflist"
}

// =============================================================================
// Condition mapping
// =============================================================================

/// `NetworkPolicyEnforced` condition derived from a detection result
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EnforcementCondition {
    /// Condition status
    pub status: ConditionStatus,
    /// CamelCase reason
    pub reason: &'static str,
    /// Human-readable message
    pub message: String,
}

impl EnforcementCondition {
    /// Condition type this maps to
    pub const TYPE: &'static str = CONDITION_NETWORK_POLICY_ENFORCED;
}

/// Map a detection result onto the `NetworkPolicyEnforced` condition
///
/// Returns `None` for lookup failures: the previous condition stays as is and
/// the caller retries.
pub fn enforcement_condition(
    result: &Result<CniCapabilities, DetectError>,
) -> Option<EnforcementCondition> {
    match result {
        Ok(caps) if caps.supports_network_policy => Some(EnforcementCondition {
            status: ConditionStatus::True,
            reason: "CNISupported",
            message: format!(
                "CNI {} ({}) enforces NetworkPolicy",
                caps.name, caps.version
            ),
        }),
        Ok(caps) => Some(EnforcementCondition {
            status: ConditionStatus::False,
            reason: "IncompatibleCNI",
            message: format!(
                "CNI {} does not enforce NetworkPolicy; egress restrictions are not applied",
                caps.name
            ),
        }),
        Err(DetectError::NotDetected { namespace, .. }) => Some(EnforcementCondition {
            status: ConditionStatus::Unknown,
            reason: "CNINotDetected",
            message: format!(
                "no known CNI plugin found in {}; NetworkPolicy enforcement cannot be confirmed",
                namespace
            ),
        }),
        Err(DetectError::Lookup(e)) => {
            warn!(error = %e, "CNI detection failed, keeping previous condition");
            None
        }
    }
}
