//! LanguageTool CRD: a tool server agents can call

use k8s_openapi::api::core::v1::{EnvVar, ResourceRequirements};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::network::NetworkRule;
use super::types::{Condition, ResourcePhase};

/// Default port tool servers listen on
pub const DEFAULT_TOOL_PORT: u16 = 8080;

/// Spec for a LanguageTool
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "langop.io",
    version = "v1alpha1",
    kind = "LanguageTool",
    plural = "languagetools",
    shortname = "ltool",
    namespaced,
    status = "LanguageToolStatus",
    printcolumn = r#"{"name":"Type","type":"string","jsonPath":".spec.type"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Ready","type":"integer","jsonPath":".status.readyReplicas"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct LanguageToolSpec {
    /// Container image of the tool server
    pub image: String,

    /// Tool protocol type (e.g., "mcp")
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub type_: Option<String>,

    /// Port the tool server listens on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// Number of replicas (defaults to 1)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    /// How the tool is deployed
    #[serde(default)]
    pub deployment_mode: DeploymentMode,

    /// Cluster this tool belongs to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_ref: Option<String>,

    /// Environment variables for the tool container
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,

    /// Resource requests/limits for the tool container
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,

    /// Additional network rules
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub egress: Vec<NetworkRule>,
}

/// Deployment mode of a tool
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentMode {
    /// Standalone Deployment + Service
    #[default]
    Service,
    /// Injected into agent pods; no Deployment of its own
    Sidecar,
}

/// Status of a LanguageTool
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LanguageToolStatus {
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
    /// In-cluster URL of the tool server
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    /// Ready replicas of the tool Deployment
    #[serde(default)]
    pub ready_replicas: i32,
    /// Available replicas of the tool Deployment
    #[serde(default)]
    pub available_replicas: i32,
    /// Updated replicas of the tool Deployment
    #[serde(default)]
    pub updated_replicas: i32,
    /// Unavailable replicas of the tool Deployment
    #[serde(default)]
    pub unavailable_replicas: i32,
}

impl LanguageToolSpec {
    /// Port with default fallback
    pub fn port_or_default(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_TOOL_PORT)
    }

    /// Replica count with default fallback
    pub fn replicas_or_default(&self) -> i32 {
        self.replicas.unwrap_or(1)
    }

    /// Validate the spec
    pub fn validate(&self) -> Result<(), String> {
        if self.image.trim().is_empty() {
            return Err("image is required".to_string());
        }
        if self.port == Some(0) {
            return Err("port must be between 1 and 65535".to_string());
        }
        if self.replicas.is_some_and(|r| r < 0) {
            return Err("replicas cannot be negative".to_string());
        }
        for rule in &self.egress {
            rule.validate()?;
        }
        Ok(())
    }
}
