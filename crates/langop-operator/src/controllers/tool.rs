//! LanguageTool controller

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Container, ContainerPort};
use kube::ResourceExt;
use tracing::instrument;

use langop_common::crd::{DeploymentMode, LanguageTool};
use langop_common::kube_utils::{child_name, member_labels};
use langop_common::Error;
use langop_network::PolicyRequest;

use super::{
    ingress_from_agents, remove_owned_child, require_ready_cluster, service_url,
    sync_network_policy, REASON_INVALID_SPEC,
};
use crate::client::ResourceKind;
use crate::context::Context;
use crate::reconciler::{Pass, Reconcilable};
use crate::sync::{ChildKind, ChildResource};
use crate::workload::{
    cluster_service, config_map, config_volume, deployment, http_port, memory_volume, pod_template,
    read_only_mount, restricted_security_context, writable_mount, CONFIG_MOUNT_PATH,
    CONFIG_VOLUME, TMP_VOLUME,
};

const CONFIG_SUFFIX: &str = "tool";

fn config_data(tool: &LanguageTool, namespace: &str) -> Result<BTreeMap<String, String>, Error> {
    let mut data = BTreeMap::from([
        ("tool.json".to_string(), serde_json::to_string(&tool.spec)?),
        ("name".to_string(), tool.name_any()),
        ("namespace".to_string(), namespace.to_string()),
    ]);
    if let Some(type_) = &tool.spec.type_ {
        data.insert("type".to_string(), type_.clone());
    }
    Ok(data)
}

fn tool_container(tool: &LanguageTool) -> Container {
    Container {
        name: "tool".to_string(),
        image: Some(tool.spec.image.clone()),
        ports: Some(vec![http_port(tool.spec.port_or_default() as i32)]),
        env: (!tool.spec.env.is_empty()).then(|| tool.spec.env.clone()),
        resources: tool.spec.resources.clone(),
        volume_mounts: Some(vec![
            read_only_mount(CONFIG_VOLUME, CONFIG_MOUNT_PATH),
            writable_mount(TMP_VOLUME, "/tmp"),
        ]),
        security_context: Some(restricted_security_context()),
        ..Default::default()
    }
}

/// Container injected into agent pods for a sidecar tool
pub(crate) fn sidecar_container(tool: &LanguageTool) -> Container {
    Container {
        name: format!("tool-{}", tool.name_any()),
        image: Some(tool.spec.image.clone()),
        ports: Some(vec![ContainerPort {
            container_port: tool.spec.port_or_default() as i32,
            protocol: Some("TCP".to_string()),
            ..Default::default()
        }]),
        env: (!tool.spec.env.is_empty()).then(|| tool.spec.env.clone()),
        resources: tool.spec.resources.clone(),
        volume_mounts: Some(vec![writable_mount(TMP_VOLUME, "/tmp")]),
        security_context: Some(restricted_security_context()),
        ..Default::default()
    }
}

/// Replica counts reported from the live Deployment
fn record_replicas(pass: &mut Pass, live: Option<&Deployment>) -> Result<(), Error> {
    let status = live.and_then(|d| d.status.as_ref());
    pass.set_field(
        "readyReplicas",
        status.and_then(|s| s.ready_replicas).unwrap_or(0),
    )?;
    pass.set_field(
        "availableReplicas",
        status.and_then(|s| s.available_replicas).unwrap_or(0),
    )?;
    pass.set_field(
        "updatedReplicas",
        status.and_then(|s| s.updated_replicas).unwrap_or(0),
    )?;
    pass.set_field(
        "unavailableReplicas",
        status.and_then(|s| s.unavailable_replicas).unwrap_or(0),
    )?;
    Ok(())
}

#[async_trait]
impl Reconcilable for LanguageTool {
    const KIND: ResourceKind = ResourceKind::Tool;

    fn config_artifacts(&self) -> Vec<(ChildKind, String)> {
        vec![(ChildKind::ConfigMap, child_name(&self.name_any(), CONFIG_SUFFIX))]
    }

    fn ready_message(&self) -> String {
        match self.spec.deployment_mode {
            DeploymentMode::Service => "Tool server is ready".to_string(),
            DeploymentMode::Sidecar => "Tool is ready for sidecar injection".to_string(),
        }
    }

    #[instrument(skip(self, ctx, pass), fields(tool = %self.name_any()))]
    async fn synchronize(&self, ctx: &Context, pass: &mut Pass) -> Result<(), Error> {
        let name = self.name_any();
        let namespace = pass.namespace().to_string();
        let port = self.spec.port_or_default();

        self.spec
            .validate()
            .map_err(|msg| Error::configuration_for(&name, REASON_INVALID_SPEC, msg))?;
        if let Some(cluster) = self.spec.cluster_ref.as_deref() {
            require_ready_cluster(ctx, &name, &namespace, cluster).await?;
        }

        let labels = member_labels(
            &name,
            ResourceKind::Tool.as_str(),
            self.spec.cluster_ref.as_deref(),
        );
        let config_name = child_name(&name, CONFIG_SUFFIX);
        pass.sync(
            ctx,
            config_map(&config_name, &namespace, labels.clone(), config_data(self, &namespace)?),
        )
        .await?;

        match self.spec.deployment_mode {
            DeploymentMode::Service => {
                let template = pod_template(
                    labels.clone(),
                    vec![tool_container(self)],
                    vec![config_volume(&config_name), memory_volume(TMP_VOLUME)],
                    None,
                );
                let live = pass
                    .sync(
                        ctx,
                        deployment(
                            &name,
                            &namespace,
                            labels.clone(),
                            self.spec.replicas_or_default(),
                            template,
                        ),
                    )
                    .await?;
                let live = match &live {
                    ChildResource::Deployment(d) => Some(d),
                    _ => None,
                };
                record_replicas(pass, live)?;

                pass.sync(
                    ctx,
                    cluster_service(&name, &namespace, labels.clone(), port as i32, port as i32),
                )
                .await?;
                pass.set_field("endpoint", service_url(&name, &namespace, port))?;
            }
            DeploymentMode::Sidecar => {
                let uid = self.uid().unwrap_or_default();
                remove_owned_child(ctx, &uid, ChildKind::Deployment, &namespace, &name).await?;
                remove_owned_child(ctx, &uid, ChildKind::Service, &namespace, &name).await?;
                record_replicas(pass, None)?;
                pass.set_field("endpoint", format!("http://localhost:{}", port))?;
            }
        }

        let request = PolicyRequest {
            name: name.clone(),
            namespace,
            labels: labels.clone(),
            pod_selector: labels,
            allow_intra_group: ctx.config.allow_intra_group(),
            auto_rules: Vec::new(),
            implicit_ingress: vec![ingress_from_agents(port)],
            rules: self.spec.egress.clone(),
        };
        sync_network_policy(ctx, pass, request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{converge, resource_meta, test_context, FakeKube, StaticInspector};
    use k8s_openapi::api::apps::v1::DeploymentStatus;
    use langop_common::conditions::{find_condition, CONDITION_READY};
    use langop_common::crd::{
        LanguageCluster, LanguageClusterSpec, LanguageClusterStatus, LanguageToolSpec,
        ResourcePhase,
    };
    use langop_common::LABEL_CLUSTER;
    use langop_network::StaticResolver;
    use std::sync::Arc;

    fn tool(mode: DeploymentMode, cluster_ref: Option<&str>) -> LanguageTool {
        let mut spec: LanguageToolSpec = serde_json::from_value(serde_json::json!({
            "image": "ghcr.io/example/web-fetch:1.0",
            "type": "mcp",
            "port": 9000
        }))
        .unwrap();
        spec.deployment_mode = mode;
        spec.cluster_ref = cluster_ref.map(str::to_string);
        LanguageTool {
            metadata: resource_meta("fetch", "agents"),
            spec,
            status: None,
        }
    }

    fn cluster(phase: ResourcePhase) -> LanguageCluster {
        LanguageCluster {
            metadata: resource_meta("prod", "agents"),
            spec: LanguageClusterSpec::default(),
            status: Some(LanguageClusterStatus {
                phase,
                ..Default::default()
            }),
        }
    }

    fn stored(fake: &FakeKube) -> LanguageTool {
        fake.object(ResourceKind::Tool, "agents", "fetch").unwrap()
    }

    #[tokio::test]
    async fn service_mode_creates_server_and_reports_endpoint() {
        let fake = Arc::new(FakeKube::new());
        fake.insert(ResourceKind::Tool, &tool(DeploymentMode::Service, None));
        let ctx = test_context(fake.clone(), StaticInspector::default(), StaticResolver::new());

        converge::<LanguageTool>(&fake, &ctx, "agents", "fetch").await.unwrap();

        let Some(ChildResource::Deployment(d)) = fake.child(ChildKind::Deployment, "agents", "fetch") else {
            panic!("expected deployment");
        };
        let container = &d.spec.unwrap().template.spec.unwrap().containers[0];
        assert_eq!(container.name, "tool");
        assert_eq!(container.ports.as_ref().unwrap()[0].container_port, 9000);
        assert!(fake.child(ChildKind::Service, "agents", "fetch").is_some());

        let status = stored(&fake).status.unwrap();
        assert_eq!(status.phase, ResourcePhase::Ready);
        assert_eq!(
            status.endpoint.as_deref(),
            Some("http://fetch.agents.svc.cluster.local:9000")
        );
    }

    #[tokio::test]
    async fn replica_counts_come_from_live_deployment() {
        let fake = Arc::new(FakeKube::new());
        fake.insert(ResourceKind::Tool, &tool(DeploymentMode::Service, None));
        let ctx = test_context(fake.clone(), StaticInspector::default(), StaticResolver::new());
        converge::<LanguageTool>(&fake, &ctx, "agents", "fetch").await.unwrap();

        let Some(ChildResource::Deployment(mut d)) = fake.child(ChildKind::Deployment, "agents", "fetch") else {
            panic!("expected deployment");
        };
        d.status = Some(DeploymentStatus {
            ready_replicas: Some(1),
            available_replicas: Some(1),
            updated_replicas: Some(1),
            ..Default::default()
        });
        fake.put_child(ChildResource::Deployment(d));

        converge::<LanguageTool>(&fake, &ctx, "agents", "fetch").await.unwrap();
        let status = stored(&fake).status.unwrap();
        assert_eq!(status.ready_replicas, 1);
        assert_eq!(status.available_replicas, 1);
        assert_eq!(status.unavailable_replicas, 0);
    }

    #[tokio::test]
    async fn sidecar_mode_skips_deployment_and_service() {
        let fake = Arc::new(FakeKube::new());
        fake.insert(ResourceKind::Tool, &tool(DeploymentMode::Sidecar, None));
        let ctx = test_context(fake.clone(), StaticInspector::default(), StaticResolver::new());

        converge::<LanguageTool>(&fake, &ctx, "agents", "fetch").await.unwrap();

        assert!(fake.child(ChildKind::Deployment, "agents", "fetch").is_none());
        assert!(fake.child(ChildKind::Service, "agents", "fetch").is_none());
        assert!(fake.child(ChildKind::ConfigMap, "agents", "fetch-tool").is_some());
        assert!(fake.child(ChildKind::NetworkPolicy, "agents", "fetch").is_some());
        assert_eq!(
            stored(&fake).status.unwrap().endpoint.as_deref(),
            Some("http://localhost:9000")
        );
    }

    /// Story: moving a tool into agent pods tears down its standalone server
    #[tokio::test]
    async fn story_switch_to_sidecar_removes_server() {
        let fake = Arc::new(FakeKube::new());
        fake.insert(ResourceKind::Tool, &tool(DeploymentMode::Service, None));
        let ctx = test_context(fake.clone(), StaticInspector::default(), StaticResolver::new());
        converge::<LanguageTool>(&fake, &ctx, "agents", "fetch").await.unwrap();
        assert!(fake.child(ChildKind::Deployment, "agents", "fetch").is_some());

        let mut edited = stored(&fake);
        edited.spec.deployment_mode = DeploymentMode::Sidecar;
        fake.insert(ResourceKind::Tool, &edited);
        fake.bump_generation(ResourceKind::Tool, "agents", "fetch");
        converge::<LanguageTool>(&fake, &ctx, "agents", "fetch").await.unwrap();

        assert!(fake.child(ChildKind::Deployment, "agents", "fetch").is_none());
        assert!(fake.child(ChildKind::Service, "agents", "fetch").is_none());
        let status = stored(&fake).status.unwrap();
        assert_eq!(status.phase, ResourcePhase::Ready);
        assert_eq!(status.ready_replicas, 0);
        assert_eq!(status.observed_generation, Some(2));
    }

    #[tokio::test]
    async fn cluster_ref_must_be_ready() {
        let fake = Arc::new(FakeKube::new());
        fake.insert(ResourceKind::Tool, &tool(DeploymentMode::Service, Some("prod")));
        fake.insert(ResourceKind::Cluster, &cluster(ResourcePhase::Pending));
        let ctx = test_context(fake.clone(), StaticInspector::default(), StaticResolver::new());

        converge::<LanguageTool>(&fake, &ctx, "agents", "fetch").await.unwrap();
        let status = stored(&fake).status.unwrap();
        assert_eq!(status.phase, ResourcePhase::Failed);
        assert_eq!(
            find_condition(&status.conditions, CONDITION_READY).unwrap().reason,
            "ClusterNotReady"
        );

        fake.insert(ResourceKind::Cluster, &cluster(ResourcePhase::Ready));
        converge::<LanguageTool>(&fake, &ctx, "agents", "fetch").await.unwrap();
        assert_eq!(stored(&fake).status.unwrap().phase, ResourcePhase::Ready);

        let Some(ChildResource::Deployment(d)) = fake.child(ChildKind::Deployment, "agents", "fetch") else {
            panic!("expected deployment");
        };
        assert_eq!(d.metadata.labels.unwrap()[LABEL_CLUSTER], "prod");
    }
}
