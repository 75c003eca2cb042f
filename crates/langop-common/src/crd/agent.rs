//! LanguageAgent CRD: an autonomous or scheduled agent workload
//!
//! Agents reference models, tools and personas by name. When instructions
//! are present and a synthesizer is configured, the operator stores the
//! synthesized agent code in a ConfigMap mounted into the agent pod.

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{EnvVar, ResourceRequirements};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::network::NetworkRule;
use super::types::{Condition, ResourcePhase, ResourceRef};

/// Spec for a LanguageAgent
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "langop.io",
    version = "v1alpha1",
    kind = "LanguageAgent",
    plural = "languageagents",
    shortname = "lagent",
    namespaced,
    status = "LanguageAgentStatus",
    printcolumn = r#"{"name":"Mode","type":"string","jsonPath":".spec.executionMode"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct LanguageAgentSpec {
    /// LanguageCluster this agent belongs to (same namespace)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_ref: Option<String>,

    /// Agent runtime image
    pub image: String,

    /// Models the agent may call
    #[serde(default)]
    pub model_refs: Vec<ResourceRef>,

    /// Tools the agent may call
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_refs: Vec<ResourceRef>,

    /// Personas shaping the agent's behavior
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub persona_refs: Vec<ResourceRef>,

    /// High-level goal
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goal: Option<String>,

    /// Natural-language instructions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,

    /// Execution mode; when unset it is taken from synthesized code
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_mode: Option<ExecutionMode>,

    /// Cron schedule for scheduled agents
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<String>,

    /// Number of replicas for continuous agents (defaults to 1)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    /// Environment variables for the agent container
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,

    /// Resource requests/limits for the agent container
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,

    /// Persistent workspace volume
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace: Option<WorkspaceSpec>,

    /// Additional network rules
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub egress: Vec<NetworkRule>,
}

/// How an agent runs
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutionMode {
    /// Runs continuously
    Autonomous,
    /// Serves interactive sessions
    Interactive,
    /// Wakes on external events
    EventDriven,
    /// Runs on a cron schedule
    Scheduled,
}

impl ExecutionMode {
    /// Wire value of the mode
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Autonomous => "autonomous",
            Self::Interactive => "interactive",
            Self::EventDriven => "event-driven",
            Self::Scheduled => "scheduled",
        }
    }
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persistent workspace for an agent
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceSpec {
    /// Whether the workspace PVC is created
    #[serde(default)]
    pub enabled: bool,
    /// PVC size (defaults to "10Gi")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
    /// Storage class for the PVC
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class_name: Option<String>,
    /// Mount path inside the agent container (defaults to "/workspace")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mount_path: Option<String>,
}

/// Default workspace PVC size
pub const DEFAULT_WORKSPACE_SIZE: &str = "10Gi";

/// Default workspace mount path
pub const DEFAULT_WORKSPACE_MOUNT_PATH: &str = "/workspace";

/// Status of a LanguageAgent
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LanguageAgentStatus {
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
    /// Execution mode the workload was built for
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effective_mode: Option<ExecutionMode>,
    /// Last synthesis result
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synthesis: Option<SynthesisInfo>,
}

/// Bookkeeping for the last code synthesis
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SynthesisInfo {
    /// SHA-256 of the synthesized code
    pub code_hash: String,
    /// SHA-256 of the instructions the code was synthesized from
    pub instructions_hash: String,
    /// Model that produced the code
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Wall-clock synthesis time
    #[serde(default)]
    pub duration_seconds: f64,
    /// When synthesis last ran
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_synthesis_time: Option<DateTime<Utc>>,
}

impl LanguageAgentSpec {
    /// Replica count with default fallback
    pub fn replicas_or_default(&self) -> i32 {
        self.replicas.unwrap_or(1)
    }

    /// True when the agent has what synthesis needs
    pub fn wants_synthesis(&self) -> bool {
        !self.model_refs.is_empty()
            && self.instructions.as_deref().is_some_and(|i| !i.trim().is_empty())
    }

    /// Workspace settings when a workspace PVC should exist
    pub fn enabled_workspace(&self) -> Option<&WorkspaceSpec> {
        self.workspace.as_ref().filter(|w| w.enabled)
    }

    /// Validate the spec
    pub fn validate(&self) -> Result<(), String> {
        if self.image.trim().is_empty() {
            return Err("image is required".to_string());
        }
        if self.execution_mode == Some(ExecutionMode::Scheduled)
            && self.schedule.as_deref().map_or(true, |s| s.trim().is_empty())
        {
            return Err("schedule is required when executionMode is scheduled".to_string());
        }
        if self.replicas.is_some_and(|r| r < 0) {
            return Err("replicas cannot be negative".to_string());
        }
        for reference in self
            .model_refs
            .iter()
            .chain(&self.tool_refs)
            .chain(&self.persona_refs)
        {
            if reference.name.is_empty() {
                return Err("reference names cannot be empty".to_string());
            }
        }
        for rule in &self.egress {
            rule.validate()?;
        }
        Ok(())
    }
}
