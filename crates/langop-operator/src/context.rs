//! Shared controller context

use std::sync::Arc;

use dashmap::DashMap;
use kube::Client;

use langop_network::{
    CniRegistry, ClusterInspector, CompilerConfig, DnsResolver, ProviderRegistry, ServiceLookup,
    SystemResolver,
};

use crate::client::{KubeClient, KubeClientImpl};
use crate::config::OperatorConfig;
use crate::synthesis::Synthesizer;

/// Controller context shared by every reconcile of every kind
pub struct Context {
    /// Kubernetes client for API operations (trait object for testability)
    pub kube: Arc<dyn KubeClient>,
    /// Reads used by CNI detection
    pub inspector: Arc<dyn ClusterInspector>,
    /// Service reads used by service peers
    pub services: Arc<dyn ServiceLookup>,
    /// Resolver for DNS peers
    pub dns: Arc<dyn DnsResolver>,
    /// Agent code synthesizer; agents skip synthesis when unset
    pub synthesizer: Option<Arc<dyn Synthesizer>>,
    /// Operator settings
    pub config: OperatorConfig,
    /// Known CNI signatures
    pub cni_registry: CniRegistry,
    /// Well-known model providers
    pub providers: ProviderRegistry,
    /// Consecutive transient failures per `{kind}/{namespace}/{name}`
    failures: DashMap<String, u32>,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(client: Client) -> ContextBuilder {
        ContextBuilder::new(client)
    }

    /// Create a context for unit tests with mock clients
    #[cfg(test)]
    pub fn for_testing(
        kube: Arc<dyn KubeClient>,
        inspector: Arc<dyn ClusterInspector>,
        services: Arc<dyn ServiceLookup>,
        dns: Arc<dyn DnsResolver>,
    ) -> Self {
        Self {
            kube,
            inspector,
            services,
            dns,
            synthesizer: None,
            config: OperatorConfig::default(),
            cni_registry: CniRegistry::default(),
            providers: ProviderRegistry::default(),
            failures: DashMap::new(),
        }
    }

    /// Attach a synthesizer (tests)
    #[cfg(test)]
    pub fn with_synthesizer(mut self, synthesizer: Arc<dyn Synthesizer>) -> Self {
        self.synthesizer = Some(synthesizer);
        self
    }

    /// Policy compiler settings derived from the operator config
    pub fn compiler_config(&self) -> CompilerConfig {
        CompilerConfig {
            dns_namespace: self.config.system_namespace.clone(),
            telemetry_namespace: self.config.telemetry_namespace.clone(),
        }
    }

    /// Record a transient failure and return the new count
    pub fn record_failure(&self, key: &str) -> u32 {
        let mut count = self.failures.entry(key.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    /// Clear the failure count after a clean pass
    pub fn reset_failures(&self, key: &str) {
        self.failures.remove(key);
    }

    /// Current failure count
    pub fn failure_count(&self, key: &str) -> u32 {
        self.failures.get(key).map(|c| *c).unwrap_or(0)
    }
}

/// Builder for constructing [`Context`] instances
///
/// ```text
/// let ctx = Context::builder(client)
///     .config(config)
///     .build();
/// ```
pub struct ContextBuilder {
    client: Client,
    kube: Option<Arc<dyn KubeClient>>,
    dns: Option<Arc<dyn DnsResolver>>,
    synthesizer: Option<Arc<dyn Synthesizer>>,
    config: OperatorConfig,
    cni_registry: CniRegistry,
    providers: ProviderRegistry,
}

impl ContextBuilder {
    fn new(client: Client) -> Self {
        Self {
            client,
            kube: None,
            dns: None,
            synthesizer: None,
            config: OperatorConfig::default(),
            cni_registry: CniRegistry::default(),
            providers: ProviderRegistry::default(),
        }
    }

    /// Operator settings
    pub fn config(mut self, config: OperatorConfig) -> Self {
        self.config = config;
        self
    }

    /// Override the Kubernetes client
    pub fn kube_client(mut self, kube: Arc<dyn KubeClient>) -> Self {
        self.kube = Some(kube);
        self
    }

    /// Override the DNS resolver
    pub fn dns_resolver(mut self, dns: Arc<dyn DnsResolver>) -> Self {
        self.dns = Some(dns);
        self
    }

    /// Enable agent code synthesis
    pub fn synthesizer(mut self, synthesizer: Arc<dyn Synthesizer>) -> Self {
        self.synthesizer = Some(synthesizer);
        self
    }

    /// Replace the CNI signature registry
    pub fn cni_registry(mut self, registry: CniRegistry) -> Self {
        self.cni_registry = registry;
        self
    }

    /// Replace the provider registry
    pub fn providers(mut self, providers: ProviderRegistry) -> Self {
        self.providers = providers;
        self
    }

    /// Build the Context
    pub fn build(self) -> Context {
        let real = Arc::new(KubeClientImpl::new(self.client));
        let dns_timeout = self.config.dns_timeout();
        Context {
            kube: self
                .kube
                .unwrap_or_else(|| real.clone() as Arc<dyn KubeClient>),
            inspector: real.clone(),
            services: real,
            dns: self
                .dns
                .unwrap_or_else(|| Arc::new(SystemResolver::new(dns_timeout)) as Arc<dyn DnsResolver>),
            synthesizer: self.synthesizer,
            config: self.config,
            cni_registry: self.cni_registry,
            providers: self.providers,
            failures: DashMap::new(),
        }
    }
}
