//! LanguageCluster controller

use async_trait::async_trait;
use kube::ResourceExt;
use tracing::info;

use langop_common::conditions::CONDITION_DNS_CONFIGURED;
use langop_common::crd::{validate_domain, ConditionStatus, LanguageAgent, LanguageCluster, LanguageTool};
use langop_common::Error;

use crate::client::{parse_object, ResourceKind};
use crate::context::Context;
use crate::reconciler::{Pass, Reconcilable};
use crate::sync::ChildKind;

/// Reason recorded when the domain is not a valid DNS name
pub const REASON_INVALID_DOMAIN: &str = "InvalidDomain";

/// Names of members of `kind` in the cluster's namespace that reference it
async fn cluster_members(
    cluster: &LanguageCluster,
    ctx: &Context,
    kind: ResourceKind,
) -> Result<Vec<String>, Error> {
    let namespace = cluster.namespace().unwrap_or_default();
    let name = cluster.name_any();
    let mut members = Vec::new();
    for raw in ctx.kube.list_objects(kind, &namespace).await? {
        let cluster_ref = match kind {
            ResourceKind::Agent => parse_object::<LanguageAgent>(raw.clone())?.spec.cluster_ref,
            ResourceKind::Tool => parse_object::<LanguageTool>(raw.clone())?.spec.cluster_ref,
            _ => None,
        };
        if cluster_ref.as_deref() == Some(name.as_str()) {
            members.push(raw.name_any());
        }
    }
    Ok(members)
}

#[async_trait]
impl Reconcilable for LanguageCluster {
    const KIND: ResourceKind = ResourceKind::Cluster;

    fn config_artifacts(&self) -> Vec<(ChildKind, String)> {
        Vec::new()
    }

    fn ready_message(&self) -> String {
        match &self.spec.domain {
            Some(domain) => format!("Cluster is ready with domain {}", domain),
            None => "Cluster is ready".to_string(),
        }
    }

    async fn cleanup(&self, ctx: &Context) -> Result<(), Error> {
        let namespace = self.namespace().unwrap_or_default();
        for kind in [ResourceKind::Agent, ResourceKind::Tool] {
            for member in cluster_members(self, ctx, kind).await? {
                ctx.kube.delete_object(kind, &namespace, &member).await?;
                info!(kind = %kind, member = %member, "deleted cluster member");
            }
        }
        Ok(())
    }

    async fn synchronize(&self, _ctx: &Context, pass: &mut Pass) -> Result<(), Error> {
        let Some(domain) = self.spec.domain.as_deref() else {
            return Ok(());
        };
        match validate_domain(domain) {
            Ok(()) => {
                pass.set_condition(
                    CONDITION_DNS_CONFIGURED,
                    ConditionStatus::True,
                    "DomainValid",
                    &format!("domain {} is valid", domain),
                );
                Ok(())
            }
            Err(msg) => {
                pass.set_condition(
                    CONDITION_DNS_CONFIGURED,
                    ConditionStatus::False,
                    REASON_INVALID_DOMAIN,
                    &msg,
                );
                Err(Error::configuration_for(
                    self.name_any(),
                    REASON_INVALID_DOMAIN,
                    msg,
                ))
            }
        }
    }
}
