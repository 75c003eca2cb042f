//! Network policy compiler
//!
//! Assembles exactly one NetworkPolicy per resource from three sources:
//! implicit rules (cluster DNS, intra-group traffic), auto-derived rules
//! (provider hosts, endpoint URLs, telemetry collector) and the user's
//! declared rules. Rules are concatenated in that order without
//! de-duplication; NetworkPolicy rules are a union, so overlap is harmless.

use std::collections::BTreeMap;

use k8s_openapi::api::networking::v1::{
    NetworkPolicy, NetworkPolicyEgressRule, NetworkPolicyIngressRule, NetworkPolicyPeer,
    NetworkPolicyPort, NetworkPolicySpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use tracing::{debug, warn};

use langop_common::crd::{NetworkPeer, NetworkPort, NetworkRule, Protocol, RuleDirection};
use langop_common::kube_utils::ChildMeta;
use langop_common::{Error, SYSTEM_NAMESPACE};

use crate::dns::DnsResolver;
use crate::peer::{namespace_name_selector, PeerResolver, ServiceLookup};

/// Reason recorded for malformed user rules
pub const REASON_INVALID_NETWORK_RULE: &str = "InvalidNetworkRule";

/// OTLP gRPC port
pub const OTLP_GRPC_PORT: u16 = 4317;

/// OTLP HTTP port
pub const OTLP_HTTP_PORT: u16 = 4318;

const DNS_PORT: u16 = 53;
const KUBE_DNS_LABEL: (&str, &str) = ("k8s-app", "kube-dns");

/// Cluster-wide compiler settings
#[derive(Clone, Debug)]
pub struct CompilerConfig {
    /// Namespace running cluster DNS
    pub dns_namespace: String,
    /// Namespace of the telemetry collector, when agents export traces
    pub telemetry_namespace: Option<String>,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            dns_namespace: SYSTEM_NAMESPACE.to_string(),
            telemetry_namespace: None,
        }
    }
}

/// Everything known about the resource whose policy is compiled
#[derive(Clone, Debug, Default)]
pub struct PolicyRequest {
    /// Policy name (the owning resource's name)
    pub name: String,
    /// Namespace of the owner and its pods
    pub namespace: String,
    /// Labels set on the policy object itself
    pub labels: BTreeMap<String, String>,
    /// Labels selecting the owner's pods
    pub pod_selector: BTreeMap<String, String>,
    /// Allow traffic to and from any pod in the namespace
    pub allow_intra_group: bool,
    /// Provider and endpoint rules derived from the spec
    pub auto_rules: Vec<NetworkRule>,
    /// Ingress rules the owning kind always needs (e.g. from agents)
    pub implicit_ingress: Vec<NetworkRule>,
    /// User-declared rules
    pub rules: Vec<NetworkRule>,
}

/// A compiled policy plus what could not be resolved on this pass
#[derive(Clone, Debug)]
pub struct CompiledPolicy {
    /// The policy to apply
    pub policy: NetworkPolicy,
    /// Peers omitted because resolution failed (`dns:host`, `service:ns/name`)
    pub unresolved: Vec<String>,
    /// Rules dropped because none of their peers resolved
    pub dropped_rules: usize,
}

impl CompiledPolicy {
    /// True when every declared peer made it into the policy
    pub fn fully_resolved(&self) -> bool {
        self.unresolved.is_empty()
    }
}

/// Compiles [`PolicyRequest`]s against live DNS and Service state
pub struct PolicyCompiler<'a> {
    config: &'a CompilerConfig,
    dns: &'a dyn DnsResolver,
    services: &'a dyn ServiceLookup,
}

impl<'a> PolicyCompiler<'a> {
    /// Create a compiler
    pub fn new(
        config: &'a CompilerConfig,
        dns: &'a dyn DnsResolver,
        services: &'a dyn ServiceLookup,
    ) -> Self {
        Self {
            config,
            dns,
            services,
        }
    }

    /// Compile the policy for one resource
    ///
    /// Malformed user rules are a configuration error. Resolution failures
    /// are not: the affected peer is omitted and reported in
    /// [`CompiledPolicy::unresolved`].
    pub async fn compile(&self, request: &PolicyRequest) -> Result<CompiledPolicy, Error> {
        for rule in &request.rules {
            rule.validate().map_err(|msg| {
                Error::configuration_for(&request.name, REASON_INVALID_NETWORK_RULE, msg)
            })?;
        }

        let resolver = PeerResolver::new(self.dns, self.services, &request.namespace);
        let mut unresolved = Vec::new();
        let mut dropped_rules = 0;

        let mut egress = vec![self.dns_rule()];
        if request.allow_intra_group {
            egress.push(NetworkPolicyEgressRule {
                to: Some(vec![same_namespace_peer()]),
                ports: None,
            });
        }

        let mut ingress = Vec::new();
        if request.allow_intra_group {
            ingress.push(NetworkPolicyIngressRule {
                from: Some(vec![same_namespace_peer()]),
                ports: None,
            });
        }

        let telemetry = self.telemetry_rule();
        let derived = request.auto_rules.iter().chain(telemetry.iter());
        let declared = request.implicit_ingress.iter().chain(request.rules.iter());

        for rule in derived.chain(declared) {
            let (direction, peer) = match rule.direction() {
                Ok(d) => d,
                Err(msg) => {
                    return Err(Error::configuration_for(
                        &request.name,
                        REASON_INVALID_NETWORK_RULE,
                        msg,
                    ))
                }
            };

            let resolution = resolver.resolve(peer).await;
            unresolved.extend(resolution.unresolved.iter().cloned());

            // An empty peer list would allow everything
            if resolution.peers.is_empty() {
                warn!(
                    policy = %request.name,
                    rule = rule.description.as_deref().unwrap_or(""),
                    "dropping rule with no resolvable peers"
                );
                dropped_rules += 1;
                continue;
            }

            let ports = policy_ports(&rule.ports);
            match direction {
                RuleDirection::Egress => egress.push(NetworkPolicyEgressRule {
                    to: Some(resolution.peers),
                    ports,
                }),
                RuleDirection::Ingress => ingress.push(NetworkPolicyIngressRule {
                    from: Some(resolution.peers),
                    ports,
                }),
            }
        }

        debug!(
            policy = %request.name,
            egress = egress.len(),
            ingress = ingress.len(),
            unresolved = unresolved.len(),
            "compiled network policy"
        );

        let policy = NetworkPolicy {
            metadata: ChildMeta::new(&request.name, &request.namespace)
                .labels(request.labels.clone())
                .build(),
            spec: Some(NetworkPolicySpec {
                pod_selector: LabelSelector {
                    match_labels: Some(request.pod_selector.clone()),
                    ..Default::default()
                },
                policy_types: Some(vec!["Ingress".to_string(), "Egress".to_string()]),
                egress: Some(egress),
                ingress: Some(ingress),
            }),
        };

        Ok(CompiledPolicy {
            policy,
            unresolved,
            dropped_rules,
        })
    }

    fn dns_rule(&self) -> NetworkPolicyEgressRule {
        NetworkPolicyEgressRule {
            to: Some(vec![NetworkPolicyPeer {
                namespace_selector: Some(namespace_name_selector(&self.config.dns_namespace)),
                pod_selector: Some(LabelSelector {
                    match_labels: Some(BTreeMap::from([(
                        KUBE_DNS_LABEL.0.to_string(),
                        KUBE_DNS_LABEL.1.to_string(),
                    )])),
                    ..Default::default()
                }),
                ..Default::default()
            }]),
            ports: policy_ports(&[
                NetworkPort {
                    protocol: Protocol::Udp,
                    port: DNS_PORT,
                },
                NetworkPort::tcp(DNS_PORT),
            ]),
        }
    }

    fn telemetry_rule(&self) -> Option<NetworkRule> {
        let namespace = self.config.telemetry_namespace.as_ref()?;
        let peer = NetworkPeer {
            namespace_selector: Some(namespace_name_selector(namespace)),
            ..Default::default()
        };
        Some(
            NetworkRule::egress(
                peer,
                vec![
                    NetworkPort::tcp(OTLP_GRPC_PORT),
                    NetworkPort::tcp(OTLP_HTTP_PORT),
                ],
            )
            .described("telemetry collector"),
        )
    }
}

fn same_namespace_peer() -> NetworkPolicyPeer {
    NetworkPolicyPeer {
        pod_selector: Some(LabelSelector::default()),
        ..Default::default()
    }
}

fn policy_ports(ports: &[NetworkPort]) -> Option<Vec<NetworkPolicyPort>> {
    if ports.is_empty() {
        return None;
    }
    Some(
        ports
            .iter()
            .map(|p| NetworkPolicyPort {
                protocol: Some(p.protocol.as_str().to_string()),
                port: Some(IntOrString::Int(i32::from(p.port))),
                end_port: None,
            })
            .collect(),
    )
}
