//! Agent code synthesis collaborator
//!
//! The operator does not generate code itself. A [`Synthesizer`] turns an
//! agent's instructions into source text; the agent controller stores the
//! result in the `{name}-code` ConfigMap and only calls back when one of the
//! input hashes changes.

use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;

use langop_common::crd::ExecutionMode;
use langop_common::Error;

/// Annotation on the code ConfigMap: hash of the merged instructions
pub const INSTRUCTIONS_HASH_ANNOTATION: &str = "langop.io/instructions-hash";
/// Annotation on the code ConfigMap: hash of the referenced tools
pub const TOOLS_HASH_ANNOTATION: &str = "langop.io/tools-hash";
/// Annotation on the code ConfigMap: hash of the referenced models
pub const MODELS_HASH_ANNOTATION: &str = "langop.io/models-hash";
/// Annotation on the code ConfigMap: hash of the persona
pub const PERSONA_HASH_ANNOTATION: &str = "langop.io/persona-hash";

/// Everything a synthesizer needs to produce agent code
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SynthesisRequest {
    /// Agent name
    pub agent: String,
    /// Agent namespace
    pub namespace: String,
    /// Instructions, already merged with persona guidance
    pub instructions: String,
    /// Optional high-level goal
    pub goal: Option<String>,
    /// Names of tools the agent may call
    pub tools: Vec<String>,
    /// Names of models the agent may call
    pub models: Vec<String>,
    /// Persona system prompt, when one resolved
    pub persona: Option<String>,
}

/// Output of a synthesis run
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SynthesisResult {
    /// Generated source
    pub code: String,
    /// SHA-256 hex of `code`
    pub content_hash: String,
    /// Model that generated the code
    pub model: Option<String>,
    /// Wall-clock time spent
    pub duration: Duration,
}

/// Code synthesis seam
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Synthesizer: Send + Sync {
    /// Generate agent code from a request
    async fn synthesize(&self, request: &SynthesisRequest) -> Result<SynthesisResult, Error>;
}

/// Mode and schedule declared inside synthesized code
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeclaredMode {
    /// `mode :<name>` declaration
    pub mode: Option<ExecutionMode>,
    /// `schedule "<cron>"` declaration
    pub schedule: Option<String>,
}

fn mode_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(?m)^\s*mode\s+:([a-z_]+)").expect("valid regex"))
}

fn schedule_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r#"(?m)^\s*schedule\s+["']([^"']+)["']"#).expect("valid regex")
    })
}

/// Read the execution mode and schedule declared in generated code
///
/// Unknown mode names are ignored. Symbols use underscores, so
/// `:event_driven` maps to [`ExecutionMode::EventDriven`].
pub fn parse_declared_mode(code: &str) -> DeclaredMode {
    let mode = mode_pattern()
        .captures(code)
        .and_then(|c| c.get(1))
        .and_then(|m| match m.as_str() {
            "autonomous" => Some(ExecutionMode::Autonomous),
            "interactive" => Some(ExecutionMode::Interactive),
            "event_driven" => Some(ExecutionMode::EventDriven),
            "scheduled" => Some(ExecutionMode::Scheduled),
            _ => None,
        });
    let schedule = schedule_pattern()
        .captures(code)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string());
    DeclaredMode { mode, schedule }
}
