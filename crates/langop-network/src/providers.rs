//! Well-known model API providers
//!
//! A model that names a recognized provider but no endpoint gets an implicit
//! egress rule to the provider's canonical host.

use langop_common::crd::{NetworkPeer, NetworkPort, NetworkRule};

/// Canonical API host of a provider
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProviderEndpoint {
    /// Provider identifier as written in the model spec (lowercase)
    pub provider: String,
    /// API hostname
    pub host: String,
    /// API port
    pub port: u16,
}

/// Provider lookup table
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProviderRegistry {
    providers: Vec<ProviderEndpoint>,
}

impl ProviderRegistry {
    /// Registry from an explicit list
    pub fn new(providers: Vec<ProviderEndpoint>) -> Self {
        Self { providers }
    }

    /// Canonical endpoint of a provider (case-insensitive)
    pub fn lookup(&self, provider: &str) -> Option<&ProviderEndpoint> {
        self.providers
            .iter()
            .find(|p| p.provider.eq_ignore_ascii_case(provider))
    }

    /// Implicit egress rule for a provider, when it is known
    pub fn egress_rule(&self, provider: &str) -> Option<NetworkRule> {
        self.lookup(provider).map(|p| {
            NetworkRule::egress(NetworkPeer::dns([p.host.clone()]), vec![NetworkPort::tcp(p.port)])
                .described(format!("{} API", p.provider))
        })
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new(vec![
            ProviderEndpoint {
                provider: "openai".to_string(),
                host: "api.openai.com".to_string(),
                port: 443,
            },
            ProviderEndpoint {
                provider: "anthropic".to_string(),
                host: "api.anthropic.com".to_string(),
                port: 443,
            },
        ])
    }
}
