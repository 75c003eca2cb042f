//! Declarative network rules shared by every workload-bearing resource
//!
//! A [`NetworkRule`] names *who* may talk to the resource (`from`) or *where*
//! the resource may connect (`to`). Peers are intent, not enforcement: the
//! policy compiler turns them into concrete NetworkPolicy peers.

use std::net::IpAddr;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A single network policy rule
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NetworkRule {
    /// Human-readable description of the rule
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Source peer (ingress rule)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<NetworkPeer>,

    /// Destination peer (egress rule)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<NetworkPeer>,

    /// Ports allowed by this rule (all ports when empty)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<NetworkPort>,
}

/// Source or destination of network traffic
///
/// Every populated field is an alternative: traffic matching any of them is
/// allowed.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NetworkPeer {
    /// Pods labelled with this `langop.io/group`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,

    /// CIDR block
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cidr: Option<String>,

    /// DNS names, resolved at reconcile time (`*` and `*.domain` allowed)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dns: Vec<String>,

    /// Kubernetes Service reference
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<ServiceReference>,

    /// Namespace selector
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace_selector: Option<LabelSelector>,

    /// Pod selector, within the resource's namespace unless combined
    /// with `namespace_selector`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_selector: Option<LabelSelector>,
}

/// Identifies a Kubernetes Service
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct ServiceReference {
    /// Service name
    pub name: String,

    /// Service namespace (defaults to the resource's namespace)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl ServiceReference {
    /// Resolve namespace using a default
    pub fn resolve_namespace<'a>(&'a self, default_namespace: &'a str) -> &'a str {
        self.namespace.as_deref().unwrap_or(default_namespace)
    }
}

/// Transport protocol of a port
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    /// TCP (default)
    #[default]
    Tcp,
    /// UDP
    Udp,
    /// SCTP
    Sctp,
}

impl Protocol {
    /// Kubernetes wire value
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tcp => "TCP",
            Self::Udp => "UDP",
            Self::Sctp => "SCTP",
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A port and protocol
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct NetworkPort {
    /// Protocol (defaults to TCP)
    #[serde(default)]
    pub protocol: Protocol,

    /// Port number
    pub port: u16,
}

impl NetworkPort {
    /// TCP port shorthand
    pub fn tcp(port: u16) -> Self {
        Self {
            protocol: Protocol::Tcp,
            port,
        }
    }
}

/// Traffic direction a rule applies to
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RuleDirection {
    /// Rule populates `from`
    Ingress,
    /// Rule populates `to`
    Egress,
}

impl NetworkRule {
    /// Egress rule to a peer
    pub fn egress(to: NetworkPeer, ports: Vec<NetworkPort>) -> Self {
        Self {
            description: None,
            from: None,
            to: Some(to),
            ports,
        }
    }

    /// Ingress rule from a peer
    pub fn ingress(from: NetworkPeer, ports: Vec<NetworkPort>) -> Self {
        Self {
            description: None,
            from: Some(from),
            to: None,
            ports,
        }
    }

    /// Attach a description
    pub fn described(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Direction and peer of the rule, or an error when both or neither
    /// of `from`/`to` are set.
    pub fn direction(&self) -> Result<(RuleDirection, &NetworkPeer), String> {
        match (&self.from, &self.to) {
            (Some(peer), None) => Ok((RuleDirection::Ingress, peer)),
            (None, Some(peer)) => Ok((RuleDirection::Egress, peer)),
            (Some(_), Some(_)) => Err(format!(
                "{}: exactly one of from/to may be set",
                self.label()
            )),
            (None, None) => Err(format!("{}: one of from/to is required", self.label())),
        }
    }

    /// Validate the rule
    pub fn validate(&self) -> Result<(), String> {
        let (_, peer) = self.direction()?;
        peer.validate().map_err(|e| format!("{}: {}", self.label(), e))?;
        for port in &self.ports {
            if port.port == 0 {
                return Err(format!("{}: port must be between 1 and 65535", self.label()));
            }
        }
        Ok(())
    }

    fn label(&self) -> String {
        match &self.description {
            Some(d) => format!("rule '{}'", d),
            None => "rule".to_string(),
        }
    }
}

impl NetworkPeer {
    /// DNS peer shorthand
    pub fn dns(names: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            dns: names.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    /// CIDR peer shorthand
    pub fn cidr(cidr: impl Into<String>) -> Self {
        Self {
            cidr: Some(cidr.into()),
            ..Default::default()
        }
    }

    /// True when no field is populated
    pub fn is_empty(&self) -> bool {
        self.group.is_none()
            && self.cidr.is_none()
            && self.dns.is_empty()
            && self.service.is_none()
            && self.namespace_selector.is_none()
            && self.pod_selector.is_none()
    }

    /// Validate the peer
    pub fn validate(&self) -> Result<(), String> {
        if self.is_empty() {
            return Err("peer must set at least one of group, cidr, dns, service, namespaceSelector, podSelector".to_string());
        }
        if let Some(cidr) = &self.cidr {
            validate_cidr(cidr)?;
        }
        if self.dns.iter().any(|name| name.trim().is_empty()) {
            return Err("dns names cannot be empty".to_string());
        }
        if let Some(group) = &self.group {
            if group.is_empty() {
                return Err("group cannot be empty".to_string());
            }
        }
        if let Some(service) = &self.service {
            if service.name.is_empty() {
                return Err("service name cannot be empty".to_string());
            }
        }
        Ok(())
    }
}

/// Validate an `address/prefix` CIDR block
pub fn validate_cidr(cidr: &str) -> Result<(), String> {
    let (addr, prefix) = cidr
        .split_once('/')
        .ok_or_else(|| format!("invalid CIDR '{}': missing prefix length", cidr))?;
    let addr: IpAddr = addr
        .parse()
        .map_err(|_| format!("invalid CIDR '{}': bad address", cidr))?;
    let prefix: u8 = prefix
        .parse()
        .map_err(|_| format!("invalid CIDR '{}': bad prefix length", cidr))?;
    let max = if addr.is_ipv4() { 32 } else { 128 };
    if prefix > max {
        return Err(format!(
            "invalid CIDR '{}': prefix length exceeds {}",
            cidr, max
        ));
    }
    Ok(())
}
