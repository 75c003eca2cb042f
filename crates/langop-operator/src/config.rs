//! Operator configuration
//!
//! Every setting can come from a flag or an environment variable so the
//! operator Deployment can configure it either way.

use std::time::Duration;

use clap::Args;

use langop_common::SYSTEM_NAMESPACE;

/// Default image of the model proxy container
pub const DEFAULT_MODEL_PROXY_IMAGE: &str = "ghcr.io/language-operator/model:latest";

/// Settings shared by every controller
#[derive(Args, Clone, Debug)]
pub struct OperatorConfig {
    /// Namespace scanned for CNI signatures and running cluster DNS
    #[arg(long, env = "LANGOP_SYSTEM_NAMESPACE", default_value = SYSTEM_NAMESPACE)]
    pub system_namespace: String,

    /// Deadline for each DNS lookup, in seconds
    #[arg(long, env = "LANGOP_DNS_TIMEOUT_SECS", default_value_t = 5)]
    pub dns_timeout_secs: u64,

    /// Deadline for CNI detection, in seconds
    #[arg(long, env = "LANGOP_CNI_TIMEOUT_SECS", default_value_t = 10)]
    pub cni_timeout_secs: u64,

    /// Requeue interval after a clean pass; re-resolves DNS peers and re-detects the CNI
    #[arg(long, env = "LANGOP_RESYNC_SECS", default_value_t = 300)]
    pub resync_secs: u64,

    /// Consecutive transient failures tolerated before a resource is marked Failed
    #[arg(long, env = "LANGOP_TRANSIENT_THRESHOLD", default_value_t = 5)]
    pub transient_threshold: u32,

    /// Image of the LanguageModel proxy
    #[arg(long, env = "LANGOP_MODEL_PROXY_IMAGE", default_value = DEFAULT_MODEL_PROXY_IMAGE)]
    pub model_proxy_image: String,

    /// Namespace of the OpenTelemetry collector agents and models export to
    #[arg(long, env = "LANGOP_TELEMETRY_NAMESPACE")]
    pub telemetry_namespace: Option<String>,

    /// Drop the implicit rules admitting traffic between pods of one namespace
    #[arg(long, env = "LANGOP_RESTRICT_INTRA_GROUP")]
    pub restrict_intra_group: bool,
}

impl OperatorConfig {
    /// DNS lookup deadline
    pub fn dns_timeout(&self) -> Duration {
        Duration::from_secs(self.dns_timeout_secs)
    }

    /// CNI detection deadline
    pub fn cni_timeout(&self) -> Duration {
        Duration::from_secs(self.cni_timeout_secs)
    }

    /// Requeue interval after a clean pass
    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.resync_secs)
    }

    /// Whether compiled policies carry the implicit intra-group rules
    pub fn allow_intra_group(&self) -> bool {
        !self.restrict_intra_group
    }
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            system_namespace: SYSTEM_NAMESPACE.to_string(),
            dns_timeout_secs: 5,
            cni_timeout_secs: 10,
            resync_secs: 300,
            transient_threshold: 5,
            model_proxy_image: DEFAULT_MODEL_PROXY_IMAGE.to_string(),
            telemetry_namespace: None,
            restrict_intra_group: false,
        }
    }
}
