//! LanguageCluster CRD: logical grouping for agents and tools

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{Condition, ResourcePhase};

/// Spec for a LanguageCluster
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "langop.io",
    version = "v1alpha1",
    kind = "LanguageCluster",
    plural = "languageclusters",
    shortname = "lcluster",
    namespaced,
    status = "LanguageClusterStatus",
    printcolumn = r#"{"name":"Domain","type":"string","jsonPath":".spec.domain"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct LanguageClusterSpec {
    /// Base domain for agent webhook routing (e.g., "example.com")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
}

/// Status of a LanguageCluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LanguageClusterStatus {
    /// Current phase
    #[serde(default)]
    pub phase: ResourcePhase,
    /// Last observed generation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    /// Status conditions
    #[serde(default)]
    pub conditions: Vec<Condition>,
    /// Human-readable message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl LanguageCluster {
    /// True once the cluster has reconciled successfully
    pub fn is_ready(&self) -> bool {
        self.status
            .as_ref()
            .is_some_and(|s| s.phase == ResourcePhase::Ready)
    }
}

/// Validate a DNS domain name (RFC 1123 labels separated by dots)
pub fn validate_domain(domain: &str) -> Result<(), String> {
    if domain.is_empty() || domain.len() > 253 {
        return Err(format!("domain '{}' must be 1-253 characters", domain));
    }
    for label in domain.split('.') {
        super::validate_dns_label(label)
            .map_err(|e| format!("domain '{}': {}", domain, e))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_validation() {
        assert!(validate_domain("example.com").is_ok());
        assert!(validate_domain("agents.internal-1.example.com").is_ok());
        assert!(validate_domain("").is_err());
        assert!(validate_domain("example..com").is_err());
        assert!(validate_domain("-bad.com").is_err());
        assert!(validate_domain("Upper.com").is_err());
    }

    #[test]
    fn readiness_follows_phase() {
        let mut cluster = LanguageCluster::new("prod", LanguageClusterSpec::default());
        assert!(!cluster.is_ready());
        cluster.status = Some(LanguageClusterStatus {
            phase: ResourcePhase::Ready,
            ..Default::default()
        });
        assert!(cluster.is_ready());
    }
}
