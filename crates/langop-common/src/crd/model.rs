//! LanguageModel CRD: a proxied LLM endpoint
//!
//! Each LanguageModel runs a small proxy Deployment that agents call instead
//! of the provider directly. The proxy's egress is restricted to the
//! provider's API host (or the explicit endpoint) by the compiled
//! NetworkPolicy.

use k8s_openapi::api::core::v1::ResourceRequirements;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::network::NetworkRule;
use super::types::{Condition, ResourcePhase, SecretReference};

/// Spec for a LanguageModel
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "langop.io",
    version = "v1alpha1",
    kind = "LanguageModel",
    plural = "languagemodels",
    shortname = "lmodel",
    namespaced,
    status = "LanguageModelStatus",
    printcolumn = r#"{"name":"Provider","type":"string","jsonPath":".spec.provider"}"#,
    printcolumn = r#"{"name":"Model","type":"string","jsonPath":".spec.modelName"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct LanguageModelSpec {
    /// Provider name (e.g., "openai", "anthropic", "openai-compatible")
    pub provider: String,

    /// Model identifier at the provider (e.g., "gpt-4o")
    pub model_name: String,

    /// Explicit API endpoint URL; overrides the provider's default host
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    /// Secret holding the provider API key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_secret_ref: Option<SecretReference>,

    /// Request rate limits enforced by the proxy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limits: Option<RateLimitSpec>,

    /// Request timeout (e.g., "30s")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,

    /// Models to fall back to when this one fails
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fallbacks: Vec<ModelFallback>,

    /// Resource requests/limits for the proxy container
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,

    /// Additional network rules
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub egress: Vec<NetworkRule>,
}

/// Proxy rate limits
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitSpec {
    /// Requests per minute
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requests_per_minute: Option<u32>,
    /// Tokens per minute
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_per_minute: Option<u32>,
    /// Maximum in-flight requests
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrent_requests: Option<u32>,
}

/// A fallback model
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ModelFallback {
    /// Name of the LanguageModel to fall back to
    pub model_ref: String,
    /// Failure conditions that trigger the fallback (e.g., "timeout", "rate_limit")
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<String>,
}

/// Status of a LanguageModel
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LanguageModelStatus {
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
    /// In-cluster URL of the model proxy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
}

impl LanguageModelSpec {
    /// Validate the spec
    pub fn validate(&self) -> Result<(), String> {
        if self.provider.trim().is_empty() {
            return Err("provider is required".to_string());
        }
        if self.model_name.trim().is_empty() {
            return Err("modelName is required".to_string());
        }
        if let Some(secret) = &self.api_key_secret_ref {
            if secret.name.is_empty() {
                return Err("apiKeySecretRef.name cannot be empty".to_string());
            }
        }
        for fallback in &self.fallbacks {
            if fallback.model_ref.is_empty() {
                return Err("fallbacks[].modelRef cannot be empty".to_string());
            }
        }
        for rule in &self.egress {
            rule.validate()?;
        }
        Ok(())
    }
}
