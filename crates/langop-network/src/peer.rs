//! Network peer resolution
//!
//! Translates one declarative [`NetworkPeer`] into NetworkPolicy peers.
//! Selectors pass through untouched since the enforcement layer evaluates
//! them live. DNS names and Service references are looked up now, and a
//! failed lookup omits only that alternative.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::networking::v1::{IPBlock, NetworkPolicyPeer};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use tracing::{debug, warn};

use langop_common::crd::{NetworkPeer, ServiceReference};
use langop_common::{Error, LABEL_GROUP};

use crate::dns::{resolve_to_cidrs, DnsResolver};

/// Reason recorded when a service peer names no Service
pub const REASON_SERVICE_NOT_FOUND: &str = "ServiceNotFound";
/// Reason recorded when a service peer's Service selects no pods
pub const REASON_SERVICE_WITHOUT_SELECTOR: &str = "ServiceWithoutSelector";

/// Well-known label carrying a namespace's name
pub const NAMESPACE_NAME_LABEL: &str = "kubernetes.io/metadata.name";

/// Service reads needed for service peers
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ServiceLookup: Send + Sync {
    /// Get a Service, `None` when it does not exist
    async fn get_service(&self, name: &str, namespace: &str) -> Result<Option<Service>, Error>;
}

/// Outcome of resolving one peer
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PeerResolution {
    /// Concrete peers, one per alternative
    pub peers: Vec<NetworkPolicyPeer>,
    /// Alternatives that could not be resolved this pass
    pub unresolved: Vec<String>,
}

impl PeerResolution {
    fn push(&mut self, peer: NetworkPolicyPeer) {
        self.peers.push(peer);
    }

    fn omit(&mut self, what: String, error: &Error) {
        warn!(peer = %what, error = %error, "omitting unresolved network peer");
        self.unresolved.push(what);
    }
}

/// Resolves peers for resources in one namespace
pub struct PeerResolver<'a> {
    dns: &'a dyn DnsResolver,
    services: &'a dyn ServiceLookup,
    namespace: &'a str,
}

impl<'a> PeerResolver<'a> {
    /// Resolver for peers declared by a resource in `namespace`
    pub fn new(dns: &'a dyn DnsResolver, services: &'a dyn ServiceLookup, namespace: &'a str) -> Self {
        Self {
            dns,
            services,
            namespace,
        }
    }

    /// Resolve every populated field of `peer` into its own policy peer
    ///
    /// The namespace and pod selectors are the exception: they share one peer.
    pub async fn resolve(&self, peer: &NetworkPeer) -> PeerResolution {
        let mut out = PeerResolution::default();

        if let Some(group) = &peer.group {
            out.push(pod_selector_peer(BTreeMap::from([(
                LABEL_GROUP.to_string(),
                group.clone(),
            )])));
        }

        if let Some(cidr) = &peer.cidr {
            out.push(ip_block_peer(cidr.clone()));
        }

        for name in &peer.dns {
            match resolve_to_cidrs(self.dns, name).await {
                Ok(cidrs) => cidrs.into_iter().for_each(|c| out.push(ip_block_peer(c))),
                Err(e) => out.omit(format!("dns:{}", name), &e),
            }
        }

        if let Some(service) = &peer.service {
            match self.resolve_service(service).await {
                Ok(p) => out.push(p),
                Err(e) => out.omit(
                    format!(
                        "service:{}/{}",
                        service.resolve_namespace(self.namespace),
                        service.name
                    ),
                    &e,
                ),
            }
        }

        // Both selectors set means pods matching both, as in a Kubernetes peer
        if peer.namespace_selector.is_some() || peer.pod_selector.is_some() {
            out.push(NetworkPolicyPeer {
                namespace_selector: peer.namespace_selector.clone(),
                pod_selector: peer.pod_selector.clone(),
                ..Default::default()
            });
        }

        out
    }

    /// Service peer: the Service's own selector scoped to its namespace
    ///
    /// A missing Service, or one without a selector, fails: admitting its
    /// whole namespace instead would widen the rule.
    async fn resolve_service(&self, service: &ServiceReference) -> Result<NetworkPolicyPeer, Error> {
        let namespace = service.resolve_namespace(self.namespace);
        let Some(svc) = self.services.get_service(&service.name, namespace).await? else {
            return Err(Error::configuration(
                REASON_SERVICE_NOT_FOUND,
                format!("service {}/{} not found", namespace, service.name),
            ));
        };
        let selector = svc
            .spec
            .and_then(|s| s.selector)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                Error::configuration(
                    REASON_SERVICE_WITHOUT_SELECTOR,
                    format!("service {}/{} has no pod selector", namespace, service.name),
                )
            })?;
        debug!(service = %service.name, namespace = %namespace, "resolved service peer");

        Ok(NetworkPolicyPeer {
            namespace_selector: Some(namespace_name_selector(namespace)),
            pod_selector: Some(LabelSelector {
                match_labels: Some(selector),
                ..Default::default()
            }),
            ..Default::default()
        })
    }
}

/// Selector matching a namespace by name
pub fn namespace_name_selector(namespace: &str) -> LabelSelector {
    LabelSelector {
        match_labels: Some(BTreeMap::from([(
            NAMESPACE_NAME_LABEL.to_string(),
            namespace.to_string(),
        )])),
        ..Default::default()
    }
}

/// Peer matching pods in the policy's namespace by labels
pub fn pod_selector_peer(labels: BTreeMap<String, String>) -> NetworkPolicyPeer {
    NetworkPolicyPeer {
        pod_selector: Some(LabelSelector {
            match_labels: Some(labels),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Peer matching a CIDR block
pub fn ip_block_peer(cidr: String) -> NetworkPolicyPeer {
    NetworkPolicyPeer {
        ip_block: Some(IPBlock { cidr, except: None }),
        ..Default::default()
    }
}
