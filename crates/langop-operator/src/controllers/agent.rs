//! LanguageAgent controller
//!
//! An agent pulls its models, tools and persona together into one workload.
//! With a synthesizer configured, the agent's instructions are turned into
//! code stored next to the agent config; that code may also declare the
//! execution mode when the spec leaves it unset.
//!
//! Child order on each pass:
//!
//! ```text
//! {name}-code ─► {name}-agent ─► {name}-workspace ─► Service ─► NetworkPolicy ─► Deployment | CronJob
//! ```

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::core::v1::{ConfigMap, ConfigMapVolumeSource, Container, EnvVar, Volume};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{Resource, ResourceExt};
use serde::de::DeserializeOwned;
use tracing::{debug, info, instrument, warn};

use langop_common::conditions::CONDITION_SYNTHESIZED;
use langop_common::crd::{
    ConditionStatus, DeploymentMode, ExecutionMode, LanguageAgent, LanguageModel, LanguagePersona,
    LanguageTool, NetworkPeer, NetworkPort, NetworkRule, ResourcePhase, ResourceRef,
    ServiceReference, SynthesisInfo, DEFAULT_WORKSPACE_MOUNT_PATH,
};
use langop_common::kube_utils::{child_name, content_hash, member_labels, ChildMeta};
use langop_common::Error;
use langop_network::PolicyRequest;

use super::model::PROXY_PORT;
use super::tool::sidecar_container;
use super::{
    remove_owned_child, require_ready_cluster, service_url, sync_network_policy,
    REASON_INVALID_SPEC,
};
use crate::client::{parse_object, ResourceKind};
use crate::context::Context;
use crate::reconciler::{Pass, Reconcilable};
use crate::sync::{ChildKind, ChildResource};
use crate::synthesis::{
    parse_declared_mode, SynthesisRequest, INSTRUCTIONS_HASH_ANNOTATION, MODELS_HASH_ANNOTATION,
    PERSONA_HASH_ANNOTATION, TOOLS_HASH_ANNOTATION,
};
use crate::workload::{
    claim_volume, cluster_service, config_map, config_volume, cron_job, deployment, http_port,
    memory_volume, pod_template, read_only_mount, restricted_security_context, workspace_claim,
    writable_mount, CONFIG_MOUNT_PATH, CONFIG_VOLUME, TMP_VOLUME,
};

/// Port the agent runtime listens on
pub const AGENT_PORT: u16 = 8080;
/// Port the agent Service exposes
pub const SERVICE_PORT: u16 = 80;
/// Key of the synthesized source in the code ConfigMap
pub const CODE_KEY: &str = "agent.rb";

/// Reason recorded when a modelRef names no model
pub const REASON_MODEL_NOT_FOUND: &str = "ModelNotFound";
/// Reason recorded when a toolRef names no tool
pub const REASON_TOOL_NOT_FOUND: &str = "ToolNotFound";
/// Reason recorded when a scheduled agent has no schedule
pub const REASON_MISSING_SCHEDULE: &str = "MissingSchedule";
/// Synthesized condition reason after new code was stored
pub const REASON_CODE_GENERATED: &str = "CodeGenerated";
/// Synthesized condition reason when the synthesizer failed
pub const REASON_SYNTHESIS_FAILED: &str = "SynthesisFailed";

const CONFIG_SUFFIX: &str = "agent";
const CODE_SUFFIX: &str = "code";
const WORKSPACE_SUFFIX: &str = "workspace";
const CODE_VOLUME: &str = "code";
const CODE_MOUNT_PATH: &str = "/etc/langop-code";
const WORKSPACE_VOLUME: &str = "workspace";

/// Resources an agent references, fetched on this pass
#[derive(Debug, Default)]
struct References {
    models: Vec<LanguageModel>,
    tools: Vec<LanguageTool>,
    persona: Option<LanguagePersona>,
}

impl References {
    fn model_names(&self) -> Vec<String> {
        self.models.iter().map(ResourceExt::name_any).collect()
    }

    fn tool_names(&self) -> Vec<String> {
        self.tools.iter().map(ResourceExt::name_any).collect()
    }
}

async fn fetch<K>(
    ctx: &Context,
    kind: ResourceKind,
    namespace: &str,
    reference: &ResourceRef,
) -> Result<Option<K>, Error>
where
    K: Resource<DynamicType = ()> + DeserializeOwned,
{
    let namespace = reference.resolve_namespace(namespace);
    match ctx.kube.get_object(kind, namespace, &reference.name).await? {
        Some(raw) => parse_object(raw).map(Some),
        None => Ok(None),
    }
}

/// Hashes of the synthesis inputs, stored as annotations on the code ConfigMap
#[derive(Clone, Debug, PartialEq, Eq)]
struct InputHashes {
    instructions: String,
    tools: String,
    models: String,
    persona: String,
}

impl InputHashes {
    fn compute(instructions: &str, refs: &References) -> Self {
        let persona = refs
            .persona
            .as_ref()
            .map(ResourceExt::name_any)
            .unwrap_or_default();
        Self {
            instructions: content_hash(instructions),
            tools: content_hash(&refs.tool_names().join(",")),
            models: content_hash(&refs.model_names().join(",")),
            persona: content_hash(&persona),
        }
    }

    fn annotations(&self) -> [(&'static str, &str); 4] {
        [
            (INSTRUCTIONS_HASH_ANNOTATION, self.instructions.as_str()),
            (TOOLS_HASH_ANNOTATION, self.tools.as_str()),
            (MODELS_HASH_ANNOTATION, self.models.as_str()),
            (PERSONA_HASH_ANNOTATION, self.persona.as_str()),
        ]
    }

    /// True when every stored hash equals the computed one
    fn matches(&self, meta: &ObjectMeta) -> bool {
        let Some(stored) = meta.annotations.as_ref() else {
            return false;
        };
        self.annotations()
            .iter()
            .all(|(key, value)| stored.get(*key).map(String::as_str) == Some(*value))
    }
}

fn code_config_map(
    name: &str,
    namespace: &str,
    labels: BTreeMap<String, String>,
    code: &str,
    hashes: &InputHashes,
) -> ChildResource {
    let meta = hashes
        .annotations()
        .iter()
        .fold(ChildMeta::new(name, namespace).labels(labels), |meta, (k, v)| {
            meta.with_annotation(*k, *v)
        });
    ChildResource::ConfigMap(ConfigMap {
        metadata: meta.build(),
        data: Some(BTreeMap::from([(CODE_KEY.to_string(), code.to_string())])),
        ..Default::default()
    })
}

fn env_var(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        value_from: None,
    }
}

fn tool_endpoint(tool: &LanguageTool, namespace: &str) -> String {
    let port = tool.spec.port_or_default();
    match tool.spec.deployment_mode {
        DeploymentMode::Sidecar => format!("http://localhost:{}", port),
        DeploymentMode::Service => service_url(
            &tool.name_any(),
            tool.namespace().as_deref().unwrap_or(namespace),
            port,
        ),
    }
}

fn model_endpoint(model: &LanguageModel, namespace: &str) -> String {
    service_url(
        &model.name_any(),
        model.namespace().as_deref().unwrap_or(namespace),
        super::model::SERVICE_PORT,
    )
}

/// Egress from the agent to each referenced model proxy and tool server
fn reference_rules(refs: &References, namespace: &str) -> Vec<NetworkRule> {
    let service_peer = |name: String, ns: Option<String>| NetworkPeer {
        service: Some(ServiceReference {
            name,
            namespace: Some(ns.unwrap_or_else(|| namespace.to_string())),
        }),
        ..Default::default()
    };

    let models = refs.models.iter().map(|model| {
        NetworkRule::egress(
            service_peer(model.name_any(), model.namespace()),
            vec![NetworkPort::tcp(PROXY_PORT)],
        )
        .described(format!("model {}", model.name_any()))
    });
    let tools = refs
        .tools
        .iter()
        .filter(|tool| tool.spec.deployment_mode == DeploymentMode::Service)
        .map(|tool| {
            NetworkRule::egress(
                service_peer(tool.name_any(), tool.namespace()),
                vec![NetworkPort::tcp(tool.spec.port_or_default())],
            )
            .described(format!("tool {}", tool.name_any()))
        });
    models.chain(tools).collect()
}

/// Fetch models, tools and the first usable persona
///
/// Missing models or tools are configuration errors. Personas that are
/// missing or not Ready are skipped.
async fn resolve_references(agent: &LanguageAgent, ctx: &Context, namespace: &str) -> Result<References, Error> {
    let name = agent.name_any();
    let mut refs = References::default();

    for reference in &agent.spec.model_refs {
        let model = fetch::<LanguageModel>(ctx, ResourceKind::Model, namespace, reference)
            .await?
            .ok_or_else(|| {
                Error::configuration_for(
                    &name,
                    REASON_MODEL_NOT_FOUND,
                    format!(
                        "model {}/{} not found",
                        reference.resolve_namespace(namespace),
                        reference.name
                    ),
                )
            })?;
        refs.models.push(model);
    }

    for reference in &agent.spec.tool_refs {
        let tool = fetch::<LanguageTool>(ctx, ResourceKind::Tool, namespace, reference)
            .await?
            .ok_or_else(|| {
                Error::configuration_for(
                    &name,
                    REASON_TOOL_NOT_FOUND,
                    format!(
                        "tool {}/{} not found",
                        reference.resolve_namespace(namespace),
                        reference.name
                    ),
                )
            })?;
        refs.tools.push(tool);
    }

    for reference in &agent.spec.persona_refs {
        match fetch::<LanguagePersona>(ctx, ResourceKind::Persona, namespace, reference).await? {
            Some(persona)
                if persona
                    .status
                    .as_ref()
                    .is_some_and(|s| s.phase == ResourcePhase::Ready) =>
            {
                refs.persona = Some(persona);
                break;
            }
            Some(_) => debug!(persona = %reference.name, "persona not ready, skipping"),
            None => debug!(persona = %reference.name, "persona not found, skipping"),
        }
    }

    Ok(refs)
}

/// Agent instructions merged with the persona, if any
fn merged_instructions(agent: &LanguageAgent, refs: &References) -> Option<String> {
    match &refs.persona {
        Some(persona) => Some(persona.spec.merge_instructions(agent.spec.instructions.as_deref())),
        None => agent.spec.instructions.clone().filter(|i| !i.is_empty()),
    }
}

/// Keep the code ConfigMap current, returning the code to run
///
/// The synthesizer is only called when an input hash differs from the
/// live ConfigMap's annotations. If it fails while earlier code exists,
/// the earlier code keeps running.
async fn reconcile_code(
    agent: &LanguageAgent,
    ctx: &Context,
    pass: &mut Pass,
    labels: &BTreeMap<String, String>,
    refs: &References,
    instructions: &str,
) -> Result<Option<String>, Error> {
    let Some(synthesizer) = ctx.synthesizer.as_ref() else {
        return Ok(None);
    };
    let name = agent.name_any();
    let namespace = pass.namespace().to_string();
    let code_name = child_name(&name, CODE_SUFFIX);
    let hashes = InputHashes::compute(instructions, refs);

    let live = match ctx
        .kube
        .get_child(ChildKind::ConfigMap, &namespace, &code_name)
        .await?
    {
        Some(ChildResource::ConfigMap(cm)) => Some(cm),
        _ => None,
    };
    let live_code = live
        .as_ref()
        .and_then(|cm| cm.data.as_ref())
        .and_then(|data| data.get(CODE_KEY))
        .cloned();

    if let (Some(cm), Some(code)) = (&live, &live_code) {
        if hashes.matches(&cm.metadata) {
            debug!(child = %code_name, "synthesis inputs unchanged, reusing code");
            pass.sync(
                ctx,
                code_config_map(&code_name, &namespace, labels.clone(), code, &hashes),
            )
            .await?;
            return Ok(Some(code.clone()));
        }
    }

    let request = SynthesisRequest {
        agent: name.clone(),
        namespace: namespace.clone(),
        instructions: instructions.to_string(),
        goal: agent.spec.goal.clone(),
        tools: refs.tool_names(),
        models: refs.models.iter().map(|m| m.spec.model_name.clone()).collect(),
        persona: refs.persona.as_ref().map(|p| p.spec.system_prompt.clone()),
    };
    match synthesizer.synthesize(&request).await {
        Ok(result) => {
            let code_hash = if result.content_hash.is_empty() {
                content_hash(&result.code)
            } else {
                result.content_hash.clone()
            };
            pass.sync(
                ctx,
                code_config_map(&code_name, &namespace, labels.clone(), &result.code, &hashes),
            )
            .await?;
            info!(
                agent = %name,
                duration_ms = result.duration.as_millis() as u64,
                "stored synthesized agent code"
            );
            pass.set_condition(
                CONDITION_SYNTHESIZED,
                ConditionStatus::True,
                REASON_CODE_GENERATED,
                "agent code synthesized from instructions",
            );
            pass.set_field(
                "synthesis",
                SynthesisInfo {
                    code_hash,
                    instructions_hash: hashes.instructions.clone(),
                    model: result.model.clone(),
                    duration_seconds: result.duration.as_secs_f64(),
                    last_synthesis_time: Some(Utc::now()),
                },
            )?;
            Ok(Some(result.code))
        }
        Err(e) => {
            pass.set_condition(
                CONDITION_SYNTHESIZED,
                ConditionStatus::False,
                REASON_SYNTHESIS_FAILED,
                &e.to_string(),
            );
            match live_code {
                Some(code) => {
                    warn!(error = %e, "synthesis failed, keeping previous code");
                    Ok(Some(code))
                }
                None => Err(e),
            }
        }
    }
}

/// Execution mode and schedule after applying declarations in `code`
///
/// The spec wins over the code; autonomous is the fallback.
fn effective_mode(agent: &LanguageAgent, code: Option<&str>) -> (ExecutionMode, Option<String>) {
    let declared = code.map(parse_declared_mode).unwrap_or_default();
    let mode = agent
        .spec
        .execution_mode
        .or(declared.mode)
        .unwrap_or(ExecutionMode::Autonomous);
    let schedule = agent
        .spec
        .schedule
        .clone()
        .filter(|s| !s.trim().is_empty())
        .or(declared.schedule);
    (mode, schedule)
}

fn agent_config_data(
    agent: &LanguageAgent,
    namespace: &str,
    mode: ExecutionMode,
    instructions: Option<&str>,
    refs: &References,
) -> Result<BTreeMap<String, String>, Error> {
    let mut data = BTreeMap::from([
        ("agent.json".to_string(), serde_json::to_string(&agent.spec)?),
        ("name".to_string(), agent.name_any()),
        ("namespace".to_string(), namespace.to_string()),
        ("mode".to_string(), mode.to_string()),
    ]);
    if let Some(goal) = &agent.spec.goal {
        data.insert("goal".to_string(), goal.clone());
    }
    if let Some(instructions) = instructions {
        data.insert("instructions".to_string(), instructions.to_string());
    }
    if let Some(persona) = &refs.persona {
        data.insert("persona".to_string(), persona.name_any());
    }
    Ok(data)
}

fn agent_env(agent: &LanguageAgent, namespace: &str, mode: ExecutionMode, refs: &References) -> Vec<EnvVar> {
    let name = agent.name_any();
    let mut env = vec![
        env_var("AGENT_NAME", name.as_str()),
        env_var("AGENT_NAMESPACE", namespace),
        env_var("AGENT_MODE", mode.as_str()),
        env_var("OTEL_SERVICE_NAME", format!("langop-agent-{}", name)),
    ];
    if !refs.models.is_empty() {
        let endpoints: Vec<String> = refs
            .models
            .iter()
            .map(|m| model_endpoint(m, namespace))
            .collect();
        env.push(env_var("MODEL_ENDPOINTS", endpoints.join(",")));
        let names: Vec<&str> = refs.models.iter().map(|m| m.spec.model_name.as_str()).collect();
        env.push(env_var("LLM_MODEL", names.join(",")));
    }
    if !refs.tools.is_empty() {
        let endpoints: Vec<String> = refs
            .tools
            .iter()
            .map(|t| tool_endpoint(t, namespace))
            .collect();
        env.push(env_var("TOOL_ENDPOINTS", endpoints.join(",")));
    }
    if let Some(goal) = &agent.spec.goal {
        env.push(env_var("AGENT_GOAL", goal.as_str()));
    }
    env.extend(agent.spec.env.iter().cloned());
    env
}

#[async_trait]
impl Reconcilable for LanguageAgent {
    const KIND: ResourceKind = ResourceKind::Agent;

    fn config_artifacts(&self) -> Vec<(ChildKind, String)> {
        let name = self.name_any();
        vec![
            (ChildKind::ConfigMap, child_name(&name, CONFIG_SUFFIX)),
            (ChildKind::ConfigMap, child_name(&name, CODE_SUFFIX)),
        ]
    }

    fn ready_message(&self) -> String {
        "Agent workload is ready".to_string()
    }

    #[instrument(skip(self, ctx, pass), fields(agent = %self.name_any()))]
    async fn synchronize(&self, ctx: &Context, pass: &mut Pass) -> Result<(), Error> {
        let name = self.name_any();
        let namespace = pass.namespace().to_string();
        let uid = self.uid().unwrap_or_default();

        self.spec
            .validate()
            .map_err(|msg| Error::configuration_for(&name, REASON_INVALID_SPEC, msg))?;
        if let Some(cluster) = self.spec.cluster_ref.as_deref() {
            require_ready_cluster(ctx, &name, &namespace, cluster).await?;
        }

        let labels = member_labels(
            &name,
            ResourceKind::Agent.as_str(),
            self.spec.cluster_ref.as_deref(),
        );
        let refs = resolve_references(self, ctx, &namespace).await?;
        let instructions = merged_instructions(self, &refs);

        let code = match instructions.as_deref() {
            Some(text) if self.spec.wants_synthesis() => {
                reconcile_code(self, ctx, pass, &labels, &refs, text).await?
            }
            _ => None,
        };

        let (mode, schedule) = effective_mode(self, code.as_deref());
        if mode == ExecutionMode::Scheduled && schedule.is_none() {
            return Err(Error::configuration_for(
                &name,
                REASON_MISSING_SCHEDULE,
                "scheduled agents need a schedule in the spec or the synthesized code",
            ));
        }
        pass.set_field("effectiveMode", mode)?;

        let config_name = child_name(&name, CONFIG_SUFFIX);
        pass.sync(
            ctx,
            config_map(
                &config_name,
                &namespace,
                labels.clone(),
                agent_config_data(self, &namespace, mode, instructions.as_deref(), &refs)?,
            ),
        )
        .await?;

        let mut volumes = vec![config_volume(&config_name), memory_volume(TMP_VOLUME)];
        let mut mounts = vec![
            read_only_mount(CONFIG_VOLUME, CONFIG_MOUNT_PATH),
            writable_mount(TMP_VOLUME, "/tmp"),
        ];
        if code.is_some() {
            volumes.push(Volume {
                name: CODE_VOLUME.to_string(),
                config_map: Some(ConfigMapVolumeSource {
                    name: child_name(&name, CODE_SUFFIX),
                    ..Default::default()
                }),
                ..Default::default()
            });
            mounts.push(read_only_mount(CODE_VOLUME, CODE_MOUNT_PATH));
        }
        if let Some(workspace) = self.spec.enabled_workspace() {
            let claim = child_name(&name, WORKSPACE_SUFFIX);
            pass.sync(
                ctx,
                workspace_claim(&claim, &namespace, labels.clone(), workspace),
            )
            .await?;
            volumes.push(claim_volume(WORKSPACE_VOLUME, &claim));
            mounts.push(writable_mount(
                WORKSPACE_VOLUME,
                workspace
                    .mount_path
                    .as_deref()
                    .unwrap_or(DEFAULT_WORKSPACE_MOUNT_PATH),
            ));
        }

        pass.sync(
            ctx,
            cluster_service(
                &name,
                &namespace,
                labels.clone(),
                SERVICE_PORT as i32,
                AGENT_PORT as i32,
            ),
        )
        .await?;

        let request = PolicyRequest {
            name: name.clone(),
            namespace: namespace.clone(),
            labels: labels.clone(),
            pod_selector: labels.clone(),
            allow_intra_group: ctx.config.allow_intra_group(),
            auto_rules: reference_rules(&refs, &namespace),
            implicit_ingress: Vec::new(),
            rules: self.spec.egress.clone(),
        };
        sync_network_policy(ctx, pass, request).await?;

        let agent = Container {
            name: "agent".to_string(),
            image: Some(self.spec.image.clone()),
            ports: Some(vec![http_port(AGENT_PORT as i32)]),
            env: Some(agent_env(self, &namespace, mode, &refs)),
            resources: self.spec.resources.clone(),
            volume_mounts: Some(mounts),
            security_context: Some(restricted_security_context()),
            ..Default::default()
        };
        let mut containers = vec![agent];
        containers.extend(
            refs.tools
                .iter()
                .filter(|t| t.spec.deployment_mode == DeploymentMode::Sidecar)
                .map(sidecar_container),
        );

        match (mode, schedule) {
            (ExecutionMode::Scheduled, Some(schedule)) => {
                let template = pod_template(labels.clone(), containers, volumes, Some("OnFailure"));
                pass.sync(ctx, cron_job(&name, &namespace, labels, &schedule, template))
                    .await?;
                remove_owned_child(ctx, &uid, ChildKind::Deployment, &namespace, &name).await?;
            }
            _ => {
                let template = pod_template(labels.clone(), containers, volumes, None);
                pass.sync(
                    ctx,
                    deployment(
                        &name,
                        &namespace,
                        labels,
                        self.spec.replicas_or_default(),
                        template,
                    ),
                )
                .await?;
                remove_owned_child(ctx, &uid, ChildKind::CronJob, &namespace, &name).await?;
            }
        }
        Ok(())
    }
}
