//! Network isolation for langop workloads
//!
//! Detects whether the cluster's CNI enforces NetworkPolicy and compiles
//! declarative egress/ingress intent into concrete NetworkPolicy objects.

#![deny(missing_docs)]

pub mod cni;
pub mod compiler;
pub mod dns;
pub mod endpoint;
pub mod peer;
pub mod providers;

pub use cni::{
    detect_network_policy_support, detect_with_timeout, enforcement_condition, CniCapabilities,
    CniRegistry, CniSignature, ClusterInspector, DetectError, EnforcementCondition,
};
pub use compiler::{CompiledPolicy, CompilerConfig, PolicyCompiler, PolicyRequest};
pub use dns::{DnsResolver, StaticResolver, SystemResolver};
pub use endpoint::endpoint_egress_rule;
pub use peer::{PeerResolver, ServiceLookup};
pub use providers::{ProviderEndpoint, ProviderRegistry};
