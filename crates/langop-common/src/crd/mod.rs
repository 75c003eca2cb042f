//! Custom Resource Definitions for langop
//!
//! This module contains all CRD definitions reconciled by the langop operator.

mod agent;
mod cluster;
mod model;
mod network;
mod persona;
mod tool;
mod types;

pub use agent::{
    ExecutionMode, LanguageAgent, LanguageAgentSpec, LanguageAgentStatus, SynthesisInfo,
    WorkspaceSpec, DEFAULT_WORKSPACE_MOUNT_PATH, DEFAULT_WORKSPACE_SIZE,
};
pub use cluster::{validate_domain, LanguageCluster, LanguageClusterSpec, LanguageClusterStatus};
pub use model::{
    LanguageModel, LanguageModelSpec, LanguageModelStatus, ModelFallback, RateLimitSpec,
};
pub use network::{
    validate_cidr, NetworkPeer, NetworkPort, NetworkRule, Protocol, RuleDirection,
    ServiceReference,
};
pub use persona::{LanguagePersona, LanguagePersonaSpec, LanguagePersonaStatus};
pub use tool::{
    DeploymentMode, LanguageTool, LanguageToolSpec, LanguageToolStatus, DEFAULT_TOOL_PORT,
};
pub use types::{
    Condition, ConditionStatus, ResourcePhase, ResourceRef, SecretReference, DEFAULT_SECRET_KEY,
};

// =============================================================================
// Status access
// =============================================================================

/// Read access to the conditions every langop status carries
pub trait HasConditions {
    /// Current conditions (empty when the resource has no status yet)
    fn conditions(&self) -> &[Condition];
}

macro_rules! impl_has_conditions {
    ($($kind:ty),+ $(,)?) => {
        $(
            impl HasConditions for $kind {
                fn conditions(&self) -> &[Condition] {
                    self.status
                        .as_ref()
                        .map(|s| s.conditions.as_slice())
                        .unwrap_or(&[])
                }
            }
        )+
    };
}

impl_has_conditions!(
    LanguageAgent,
    LanguageModel,
    LanguageTool,
    LanguagePersona,
    LanguageCluster,
);

// =============================================================================
// Validation helpers
// =============================================================================

/// Validate an RFC 1123 DNS label (lowercase alphanumeric with inner hyphens).
pub(crate) fn validate_dns_label(s: &str) -> Result<(), String> {
    if s.is_empty() || s.len() > 63 {
        return Err(format!("label '{}' must be 1-63 characters", s));
    }
    if !s
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        return Err(format!(
            "label '{}' must be lowercase alphanumeric with hyphens",
            s
        ));
    }
    if s.starts_with('-') || s.ends_with('-') {
        return Err(format!("label '{}' cannot start or end with a hyphen", s));
    }
    Ok(())
}
