//! LanguagePersona CRD: reusable behavioral profile for agents

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{Condition, ResourcePhase};

/// Spec for a LanguagePersona
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "langop.io",
    version = "v1alpha1",
    kind = "LanguagePersona",
    plural = "languagepersonas",
    shortname = "lpersona",
    namespaced,
    status = "LanguagePersonaStatus",
    derive = "PartialEq",
    printcolumn = r#"{"name":"Display Name","type":"string","jsonPath":".spec.displayName"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct LanguagePersonaSpec {
    /// Human-friendly name
    pub display_name: String,

    /// What this persona is for
    #[serde(default)]
    pub description: String,

    /// System prompt prepended to agent instructions
    pub system_prompt: String,

    /// Conversational tone (e.g., "concise")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tone: Option<String>,

    /// Response language (e.g., "en")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,

    /// Extra guidelines appended to agent instructions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub instructions: Vec<String>,
}

/// Status of a LanguagePersona
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LanguagePersonaStatus {
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

impl LanguagePersonaSpec {
    /// Validate the spec
    pub fn validate(&self) -> Result<(), String> {
        if self.display_name.trim().is_empty() {
            return Err("displayName is required".to_string());
        }
        if self.system_prompt.trim().is_empty() {
            return Err("systemPrompt is required".to_string());
        }
        Ok(())
    }

    /// Merge this persona into agent instructions
    ///
    /// The system prompt comes first, then the agent's own instructions,
    /// then any persona guidelines as a bullet list.
    pub fn merge_instructions(&self, instructions: Option<&str>) -> String {
        let mut merged = match instructions.filter(|i| !i.is_empty()) {
            Some(own) => format!("{}\n\n{}", self.system_prompt, own),
            None => self.system_prompt.clone(),
        };
        if !self.instructions.is_empty() {
            merged.push_str("\n\nAdditional Guidelines:\n");
            for guideline in &self.instructions {
                merged.push_str("- ");
                merged.push_str(guideline);
                merged.push('\n');
            }
        }
        merged
    }
}
