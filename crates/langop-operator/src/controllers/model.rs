//! LanguageModel controller
//!
//! A model becomes a proxy Deployment in front of the provider API, a
//! Service agents call, a ConfigMap with the proxy configuration and a
//! NetworkPolicy that only lets the proxy reach its provider.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Container;
use kube::ResourceExt;
use tracing::{debug, instrument};

use langop_common::crd::{LanguageModel, LanguageModelSpec, NetworkRule};
use langop_common::kube_utils::{child_name, common_labels};
use langop_common::Error;
use langop_network::{endpoint_egress_rule, PolicyRequest};

use super::{ingress_from_agents, service_url, sync_network_policy, REASON_INVALID_SPEC};
use crate::client::ResourceKind;
use crate::context::Context;
use crate::reconciler::{Pass, Reconcilable};
use crate::sync::ChildKind;
use crate::workload::{
    cluster_service, config_map, config_volume, deployment, http_port, http_probe, memory_volume,
    pod_template, read_only_mount, restricted_security_context, secret_volume, writable_mount,
    CONFIG_MOUNT_PATH, CONFIG_VOLUME, SECRETS_MOUNT_PATH, SECRETS_VOLUME, TMP_VOLUME,
};

/// Port the proxy listens on
pub const PROXY_PORT: u16 = 4000;
/// Port the model Service exposes
pub const SERVICE_PORT: u16 = 8000;
/// Reason recorded when the API key secret does not exist
pub const REASON_SECRET_NOT_FOUND: &str = "SecretNotFound";

const CONFIG_SUFFIX: &str = "model";

/// Proxy configuration files
fn config_data(spec: &LanguageModelSpec) -> Result<BTreeMap<String, String>, Error> {
    let mut data = BTreeMap::from([
        ("model.json".to_string(), serde_json::to_string(spec)?),
        ("provider".to_string(), spec.provider.clone()),
        ("modelName".to_string(), spec.model_name.clone()),
    ]);
    if let Some(endpoint) = &spec.endpoint {
        data.insert("endpoint".to_string(), endpoint.clone());
    }
    if let Some(timeout) = &spec.timeout {
        data.insert("timeout".to_string(), timeout.clone());
    }
    if let Some(secret) = &spec.api_key_secret_ref {
        data.insert(
            "apiKeySecretRef.json".to_string(),
            serde_json::to_string(secret)?,
        );
    }
    if let Some(limits) = &spec.rate_limits {
        data.insert("rateLimits.json".to_string(), serde_json::to_string(limits)?);
    }
    if !spec.fallbacks.is_empty() {
        data.insert(
            "fallbacks.json".to_string(),
            serde_json::to_string(&spec.fallbacks)?,
        );
    }
    Ok(data)
}

fn proxy_container(model: &LanguageModel, image: &str) -> Container {
    let mut mounts = vec![
        read_only_mount(CONFIG_VOLUME, CONFIG_MOUNT_PATH),
        writable_mount(TMP_VOLUME, "/tmp"),
    ];
    if model.spec.api_key_secret_ref.is_some() {
        mounts.push(read_only_mount(SECRETS_VOLUME, SECRETS_MOUNT_PATH));
    }

    Container {
        name: "proxy".to_string(),
        image: Some(image.to_string()),
        ports: Some(vec![http_port(PROXY_PORT as i32)]),
        volume_mounts: Some(mounts),
        liveness_probe: Some(http_probe("/health", PROXY_PORT as i32, 10)),
        readiness_probe: Some(http_probe("/health", PROXY_PORT as i32, 5)),
        resources: model.spec.resources.clone(),
        security_context: Some(restricted_security_context()),
        ..Default::default()
    }
}

/// Egress derived from the spec: the explicit endpoint, else the provider's host
fn auto_rules(ctx: &Context, name: &str, spec: &LanguageModelSpec) -> Result<Vec<NetworkRule>, Error> {
    match &spec.endpoint {
        Some(endpoint) => {
            let rule = endpoint_egress_rule(endpoint).map_err(|e| match e {
                Error::Configuration { reason, message, .. } => {
                    Error::configuration_for(name, reason, message)
                }
                other => other,
            })?;
            Ok(vec![rule])
        }
        None => {
            let rule = ctx.providers.egress_rule(&spec.provider);
            if rule.is_none() {
                debug!(provider = %spec.provider, "no well-known host for provider");
            }
            Ok(rule.into_iter().collect())
        }
    }
}

#[async_trait]
impl Reconcilable for LanguageModel {
    const KIND: ResourceKind = ResourceKind::Model;

    fn config_artifacts(&self) -> Vec<(ChildKind, String)> {
        vec![(ChildKind::ConfigMap, child_name(&self.name_any(), CONFIG_SUFFIX))]
    }

    fn ready_message(&self) -> String {
        "Model proxy is ready".to_string()
    }

    #[instrument(skip(self, ctx, pass), fields(model = %self.name_any()))]
    async fn synchronize(&self, ctx: &Context, pass: &mut Pass) -> Result<(), Error> {
        let name = self.name_any();
        let namespace = pass.namespace().to_string();

        self.spec
            .validate()
            .map_err(|msg| Error::configuration_for(&name, REASON_INVALID_SPEC, msg))?;

        if let Some(secret) = &self.spec.api_key_secret_ref {
            let secret_ns = secret.resolve_namespace(&namespace);
            if !ctx.kube.secret_exists(secret_ns, &secret.name).await? {
                return Err(Error::configuration_for(
                    &name,
                    REASON_SECRET_NOT_FOUND,
                    format!("secret {}/{} not found", secret_ns, secret.name),
                ));
            }
        }

        let labels = common_labels(&name, ResourceKind::Model.as_str());
        let config_name = child_name(&name, CONFIG_SUFFIX);

        pass.sync(
            ctx,
            config_map(&config_name, &namespace, labels.clone(), config_data(&self.spec)?),
        )
        .await?;

        let mut volumes = vec![config_volume(&config_name), memory_volume(TMP_VOLUME)];
        if let Some(secret) = &self.spec.api_key_secret_ref {
            volumes.push(secret_volume(secret));
        }
        let template = pod_template(
            labels.clone(),
            vec![proxy_container(self, &ctx.config.model_proxy_image)],
            volumes,
            None,
        );
        pass.sync(ctx, deployment(&name, &namespace, labels.clone(), 1, template))
            .await?;

        pass.sync(
            ctx,
            cluster_service(
                &name,
                &namespace,
                labels.clone(),
                SERVICE_PORT as i32,
                PROXY_PORT as i32,
            ),
        )
        .await?;

        let request = PolicyRequest {
            name: name.clone(),
            namespace: namespace.clone(),
            labels: labels.clone(),
            pod_selector: labels,
            allow_intra_group: ctx.config.allow_intra_group(),
            auto_rules: auto_rules(ctx, &name, &self.spec)?,
            implicit_ingress: vec![ingress_from_agents(PROXY_PORT)],
            rules: self.spec.egress.clone(),
        };
        sync_network_policy(ctx, pass, request).await?;

        pass.set_field("endpoint", service_url(&name, &namespace, SERVICE_PORT))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconciler::REASON_RECONCILE_SUCCESS;
    use crate::sync::ChildResource;
    use crate::testing::{converge, resource_meta, test_context, FakeKube, StaticInspector};
    use k8s_openapi::api::networking::v1::NetworkPolicy;
    use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
    use langop_common::conditions::{
        find_condition, CONDITION_EGRESS_RESOLVED, CONDITION_NETWORK_POLICY_ENFORCED,
        CONDITION_READY,
    };
    use langop_common::crd::{ConditionStatus, ResourcePhase, SecretReference};
    use langop_network::StaticResolver;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::Arc;

    fn model(provider: &str, endpoint: Option<&str>) -> LanguageModel {
        LanguageModel {
            metadata: resource_meta("gpt4", "agents"),
            spec: LanguageModelSpec {
                provider: provider.to_string(),
                model_name: "gpt-4o".to_string(),
                endpoint: endpoint.map(str::to_string),
                api_key_secret_ref: Some(SecretReference {
                    name: "openai".to_string(),
                    namespace: None,
                    key: None,
                }),
                rate_limits: None,
                timeout: Some("30s".to_string()),
                fallbacks: Vec::new(),
                resources: None,
                egress: Vec::new(),
            },
            status: None,
        }
    }

    fn openai_dns() -> StaticResolver {
        StaticResolver::new().with_host("api.openai.com", &[IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4))])
    }

    fn policy(fake: &FakeKube) -> NetworkPolicy {
        match fake.child(ChildKind::NetworkPolicy, "agents", "gpt4") {
            Some(ChildResource::NetworkPolicy(p)) => p,
            other => panic!("expected network policy, got {:?}", other),
        }
    }

    fn egress_cidrs(policy: &NetworkPolicy) -> Vec<(String, i32)> {
        let mut out = Vec::new();
        for rule in policy.spec.as_ref().unwrap().egress.as_ref().unwrap() {
            let port = rule
                .ports
                .as_ref()
                .and_then(|p| p.first())
                .and_then(|p| p.port.clone());
            for peer in rule.to.as_ref().unwrap() {
                if let (Some(block), Some(IntOrString::Int(port))) = (&peer.ip_block, &port) {
                    out.push((block.cidr.clone(), *port));
                }
            }
        }
        out
    }

    /// Story: an OpenAI model comes up behind a flannel cluster
    #[tokio::test]
    async fn story_openai_model_on_flannel() {
        let fake = Arc::new(FakeKube::new());
        fake.insert(ResourceKind::Model, &model("openai", None));
        fake.add_secret("agents", "openai");
        let ctx = test_context(
            fake.clone(),
            StaticInspector::with_daemonset("kube-flannel-ds-amd64", "docker.io/flannel/flannel:v0.21.0"),
            openai_dns(),
        );

        converge::<LanguageModel>(&fake, &ctx, "agents", "gpt4").await.unwrap();

        for (kind, name) in [
            (ChildKind::ConfigMap, "gpt4-model"),
            (ChildKind::Deployment, "gpt4"),
            (ChildKind::Service, "gpt4"),
            (ChildKind::NetworkPolicy, "gpt4"),
        ] {
            assert!(fake.child(kind, "agents", name).is_some(), "missing {} {}", kind, name);
        }
        assert!(egress_cidrs(&policy(&fake)).contains(&("1.2.3.4/32".to_string(), 443)));

        let stored: LanguageModel = fake.object(ResourceKind::Model, "agents", "gpt4").unwrap();
        let status = stored.status.unwrap();
        assert_eq!(status.phase, ResourcePhase::Ready);
        assert_eq!(
            status.endpoint.as_deref(),
            Some("http://gpt4.agents.svc.cluster.local:8000")
        );
        let ready = find_condition(&status.conditions, CONDITION_READY).unwrap();
        assert_eq!(ready.reason, REASON_RECONCILE_SUCCESS);
        let enforced = find_condition(&status.conditions, CONDITION_NETWORK_POLICY_ENFORCED).unwrap();
        assert_eq!(enforced.status, ConditionStatus::False);
        assert_eq!(enforced.reason, "IncompatibleCNI");
    }

    #[tokio::test]
    async fn literal_endpoint_becomes_host_cidr() {
        let fake = Arc::new(FakeKube::new());
        fake.insert(
            ResourceKind::Model,
            &model("openai-compatible", Some("http://192.168.68.54:1234")),
        );
        fake.add_secret("agents", "openai");
        let ctx = test_context(fake.clone(), StaticInspector::default(), StaticResolver::new());

        converge::<LanguageModel>(&fake, &ctx, "agents", "gpt4").await.unwrap();

        assert!(egress_cidrs(&policy(&fake)).contains(&("192.168.68.54/32".to_string(), 1234)));
        let stored: LanguageModel = fake.object(ResourceKind::Model, "agents", "gpt4").unwrap();
        let enforced = find_condition(
            &stored.status.unwrap().conditions,
            CONDITION_NETWORK_POLICY_ENFORCED,
        )
        .cloned()
        .unwrap();
        assert_eq!(enforced.status, ConditionStatus::Unknown);
        assert_eq!(enforced.reason, "CNINotDetected");
    }

    #[tokio::test]
    async fn restricted_intra_group_admits_only_agents() {
        let fake = Arc::new(FakeKube::new());
        fake.insert(ResourceKind::Model, &model("openai", None));
        fake.add_secret("agents", "openai");
        let mut ctx = Context::for_testing(
            fake.clone(),
            Arc::new(StaticInspector::default()),
            fake.clone(),
            Arc::new(openai_dns()),
        );
        ctx.config.restrict_intra_group = true;
        let ctx = Arc::new(ctx);

        converge::<LanguageModel>(&fake, &ctx, "agents", "gpt4").await.unwrap();

        let spec = policy(&fake).spec.unwrap();
        let ingress = spec.ingress.unwrap();
        assert_eq!(ingress.len(), 1);
        let agents = &ingress[0].from.as_ref().unwrap()[0];
        assert_eq!(
            agents.pod_selector.as_ref().unwrap().match_labels.as_ref().unwrap()["langop.io/kind"],
            "LanguageAgent"
        );
        // DNS plus the provider host, no same-namespace egress
        let egress = spec.egress.unwrap();
        assert_eq!(egress.len(), 2);
        assert!(egress[1].to.as_ref().unwrap()[0].ip_block.is_some());
    }

    #[tokio::test]
    async fn missing_secret_fails_with_reason() {
        let fake = Arc::new(FakeKube::new());
        fake.insert(ResourceKind::Model, &model("openai", None));
        let ctx = test_context(fake.clone(), StaticInspector::default(), openai_dns());

        converge::<LanguageModel>(&fake, &ctx, "agents", "gpt4").await.unwrap();

        let stored: LanguageModel = fake.object(ResourceKind::Model, "agents", "gpt4").unwrap();
        let status = stored.status.unwrap();
        assert_eq!(status.phase, ResourcePhase::Failed);
        let ready = find_condition(&status.conditions, CONDITION_READY).unwrap();
        assert_eq!(ready.reason, REASON_SECRET_NOT_FOUND);
        assert_eq!(fake.child_count(), 0);
    }

    #[tokio::test]
    async fn unresolvable_provider_host_is_reported_not_fatal() {
        let fake = Arc::new(FakeKube::new());
        fake.insert(ResourceKind::Model, &model("openai", None));
        fake.add_secret("agents", "openai");
        let ctx = test_context(fake.clone(), StaticInspector::default(), StaticResolver::new());

        converge::<LanguageModel>(&fake, &ctx, "agents", "gpt4").await.unwrap();

        let stored: LanguageModel = fake.object(ResourceKind::Model, "agents", "gpt4").unwrap();
        let status = stored.status.unwrap();
        assert_eq!(status.phase, ResourcePhase::Ready);
        let egress = find_condition(&status.conditions, CONDITION_EGRESS_RESOLVED).unwrap();
        assert_eq!(egress.status, ConditionStatus::False);
        assert!(egress.message.contains("dns:api.openai.com"));
    }

    #[tokio::test]
    async fn invalid_endpoint_is_a_configuration_error() {
        let fake = Arc::new(FakeKube::new());
        fake.insert(ResourceKind::Model, &model("openai", Some("not a url")));
        fake.add_secret("agents", "openai");
        let ctx = test_context(fake.clone(), StaticInspector::default(), StaticResolver::new());

        converge::<LanguageModel>(&fake, &ctx, "agents", "gpt4").await.unwrap();

        let stored: LanguageModel = fake.object(ResourceKind::Model, "agents", "gpt4").unwrap();
        let ready = find_condition(&stored.status.unwrap().conditions, CONDITION_READY)
            .cloned()
            .unwrap();
        assert_eq!(ready.reason, "InvalidEndpoint");
    }

    #[test]
    fn config_data_carries_optional_files() {
        let data = config_data(&model("openai", Some("https://api.example.com")).spec).unwrap();
        assert_eq!(data["provider"], "openai");
        assert_eq!(data["modelName"], "gpt-4o");
        assert_eq!(data["endpoint"], "https://api.example.com");
        assert_eq!(data["timeout"], "30s");
        assert!(data.contains_key("apiKeySecretRef.json"));
        assert!(!data.contains_key("fallbacks.json"));
    }
}
