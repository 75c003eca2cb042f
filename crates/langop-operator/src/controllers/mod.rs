//! Per-kind controllers
//!
//! Each submodule implements [`Reconcilable`](crate::reconciler::Reconcilable)
//! for one langop kind. Helpers shared between kinds live here.

pub mod agent;
pub mod cluster;
pub mod model;
pub mod persona;
pub mod tool;

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;

use langop_common::conditions::CONDITION_EGRESS_RESOLVED;
use langop_common::crd::{ConditionStatus, LanguageCluster, NetworkPeer, NetworkPort, NetworkRule};
use langop_common::kube_utils::is_owned_by;
use langop_common::{Error, LABEL_KIND};
use langop_network::{
    detect_with_timeout, enforcement_condition, EnforcementCondition, PolicyCompiler, PolicyRequest,
};
use tracing::{debug, info};

use crate::client::{parse_object, ResourceKind};
use crate::context::Context;
use crate::reconciler::Pass;
use crate::sync::{ChildKind, ChildResource};

/// Reason recorded when a clusterRef cannot be used
pub const REASON_CLUSTER_NOT_READY: &str = "ClusterNotReady";
/// Reason recorded when a spec fails validation
pub const REASON_INVALID_SPEC: &str = "InvalidSpec";

/// Compile and apply the resource's NetworkPolicy, then record
/// `EgressResolved` and `NetworkPolicyEnforced`
pub(crate) async fn sync_network_policy(
    ctx: &Context,
    pass: &mut Pass,
    request: PolicyRequest,
) -> Result<(), Error> {
    let config = ctx.compiler_config();
    let compiler = PolicyCompiler::new(&config, ctx.dns.as_ref(), ctx.services.as_ref());
    let compiled = compiler.compile(&request).await?;

    if compiled.fully_resolved() {
        pass.set_condition(
            CONDITION_EGRESS_RESOLVED,
            ConditionStatus::True,
            "AllPeersResolved",
            "every network peer resolved",
        );
    } else {
        let message = format!(
            "omitted unresolved peers: {} ({} rules dropped)",
            compiled.unresolved.join(", "),
            compiled.dropped_rules
        );
        pass.set_condition(
            CONDITION_EGRESS_RESOLVED,
            ConditionStatus::False,
            "PeersUnresolved",
            &message,
        );
    }

    pass.sync(ctx, ChildResource::NetworkPolicy(compiled.policy))
        .await?;
    record_enforcement(ctx, pass).await;
    Ok(())
}

/// Re-detect the CNI and record `NetworkPolicyEnforced`
///
/// A failed lookup leaves the previous condition in place.
pub(crate) async fn record_enforcement(ctx: &Context, pass: &mut Pass) {
    let result = detect_with_timeout(
        ctx.inspector.as_ref(),
        &ctx.cni_registry,
        &ctx.config.system_namespace,
        ctx.config.cni_timeout(),
    )
    .await;
    if let Some(condition) = enforcement_condition(&result) {
        pass.set_condition(
            EnforcementCondition::TYPE,
            condition.status,
            condition.reason,
            &condition.message,
        );
    }
}

/// Ingress rule admitting agent pods from any namespace on `port`
pub(crate) fn ingress_from_agents(port: u16) -> NetworkRule {
    let agents = NetworkPeer {
        namespace_selector: Some(LabelSelector::default()),
        pod_selector: Some(LabelSelector {
            match_labels: Some(BTreeMap::from([(
                LABEL_KIND.to_string(),
                ResourceKind::Agent.as_str().to_string(),
            )])),
            ..Default::default()
        }),
        ..Default::default()
    };
    NetworkRule::ingress(agents, vec![NetworkPort::tcp(port)]).described("langop agents")
}

/// Require that `cluster_ref` names an existing, Ready cluster
pub(crate) async fn require_ready_cluster(
    ctx: &Context,
    owner: &str,
    namespace: &str,
    cluster_ref: &str,
) -> Result<(), Error> {
    let raw = ctx
        .kube
        .get_object(ResourceKind::Cluster, namespace, cluster_ref)
        .await?
        .ok_or_else(|| {
            Error::configuration_for(
                owner,
                REASON_CLUSTER_NOT_READY,
                format!("cluster {} not found", cluster_ref),
            )
        })?;
    let cluster: LanguageCluster = parse_object(raw)?;
    if !cluster.is_ready() {
        return Err(Error::configuration_for(
            owner,
            REASON_CLUSTER_NOT_READY,
            format!("cluster {} is not ready", cluster_ref),
        ));
    }
    debug!(cluster = %cluster_ref, "cluster is ready");
    Ok(())
}

/// Delete a child this owner created under a different workload shape
///
/// Children not owned by `owner_uid` are left alone.
pub(crate) async fn remove_owned_child(
    ctx: &Context,
    owner_uid: &str,
    kind: ChildKind,
    namespace: &str,
    name: &str,
) -> Result<(), Error> {
    if let Some(live) = ctx.kube.get_child(kind, namespace, name).await? {
        if is_owned_by(live.meta(), owner_uid) {
            ctx.kube.delete_child(kind, namespace, name).await?;
            info!(kind = %kind, child = %name, "removed superseded child");
        }
    }
    Ok(())
}

/// Cluster-local URL of a Service
pub(crate) fn service_url(name: &str, namespace: &str, port: u16) -> String {
    format!("http://{}.{}.svc.cluster.local:{}", name, namespace, port)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_ingress_selects_agent_pods_in_any_namespace() {
        let rule = ingress_from_agents(4000);
        let peer = rule.from.unwrap();
        assert_eq!(peer.namespace_selector, Some(LabelSelector::default()));
        let selector = peer.pod_selector.unwrap();
        assert_eq!(
            selector.match_labels.unwrap()["langop.io/kind"],
            "LanguageAgent"
        );
        assert_eq!(rule.ports, vec![NetworkPort::tcp(4000)]);
    }

    #[test]
    fn service_urls_are_cluster_local() {
        assert_eq!(
            service_url("gpt4", "agents", 8000),
            "http://gpt4.agents.svc.cluster.local:8000"
        );
    }
}
