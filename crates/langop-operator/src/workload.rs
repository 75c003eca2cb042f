//! Workload building blocks shared by the per-kind controllers
//!
//! Containers run under the restricted Pod Security Standard: non-root,
//! read-only root filesystem, no privilege escalation, all capabilities
//! dropped, RuntimeDefault seccomp. Writable paths come from in-memory
//! `emptyDir` volumes.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::batch::v1::{CronJob, CronJobSpec, JobSpec, JobTemplateSpec};
use k8s_openapi::api::core::v1::{
    Capabilities, ConfigMap, ConfigMapVolumeSource, Container, ContainerPort, EmptyDirVolumeSource,
    HTTPGetAction, KeyToPath, PersistentVolumeClaim, PersistentVolumeClaimSpec,
    PersistentVolumeClaimVolumeSource, PodSecurityContext, PodSpec, PodTemplateSpec, Probe,
    SeccompProfile, SecretVolumeSource, SecurityContext, Service, ServicePort, ServiceSpec, Volume,
    VolumeMount, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use langop_common::crd::{SecretReference, WorkspaceSpec, DEFAULT_WORKSPACE_SIZE};
use langop_common::kube_utils::ChildMeta;

use crate::sync::ChildResource;

/// Name of the config volume
pub const CONFIG_VOLUME: &str = "config";
/// Name of the secrets volume
pub const SECRETS_VOLUME: &str = "secrets";
/// Name of the scratch volume
pub const TMP_VOLUME: &str = "tmp";
/// Mount path of config artifacts
pub const CONFIG_MOUNT_PATH: &str = "/etc/langop";
/// Mount path of secret files
pub const SECRETS_MOUNT_PATH: &str = "/etc/secrets";

const RUNTIME_DEFAULT: &str = "RuntimeDefault";
const NON_ROOT_UID: i64 = 1000;

/// Container security context under the restricted profile
pub fn restricted_security_context() -> SecurityContext {
    SecurityContext {
        allow_privilege_escalation: Some(false),
        capabilities: Some(Capabilities {
            add: None,
            drop: Some(vec!["ALL".to_string()]),
        }),
        read_only_root_filesystem: Some(true),
        run_as_non_root: Some(true),
        run_as_user: Some(NON_ROOT_UID),
        run_as_group: Some(NON_ROOT_UID),
        seccomp_profile: Some(SeccompProfile {
            type_: RUNTIME_DEFAULT.to_string(),
            localhost_profile: None,
        }),
        ..Default::default()
    }
}

/// Pod security context matching [`restricted_security_context`]
pub fn restricted_pod_security_context() -> PodSecurityContext {
    PodSecurityContext {
        run_as_non_root: Some(true),
        run_as_user: Some(NON_ROOT_UID),
        run_as_group: Some(NON_ROOT_UID),
        fs_group: Some(NON_ROOT_UID),
        seccomp_profile: Some(SeccompProfile {
            type_: RUNTIME_DEFAULT.to_string(),
            localhost_profile: None,
        }),
        ..Default::default()
    }
}

/// ConfigMap child with string data
pub fn config_map(
    name: &str,
    namespace: &str,
    labels: BTreeMap<String, String>,
    data: BTreeMap<String, String>,
) -> ChildResource {
    ChildResource::ConfigMap(ConfigMap {
        metadata: ChildMeta::new(name, namespace).labels(labels).build(),
        data: Some(data),
        ..Default::default()
    })
}

/// ClusterIP Service forwarding `port` to the named `http` container port
pub fn cluster_service(
    name: &str,
    namespace: &str,
    labels: BTreeMap<String, String>,
    port: i32,
    target_port: i32,
) -> ChildResource {
    ChildResource::Service(Service {
        metadata: ChildMeta::new(name, namespace).labels(labels.clone()).build(),
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".to_string()),
            selector: Some(labels),
            ports: Some(vec![ServicePort {
                name: Some("http".to_string()),
                port,
                target_port: Some(IntOrString::Int(target_port)),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// Container port named `http`
pub fn http_port(port: i32) -> ContainerPort {
    ContainerPort {
        name: Some("http".to_string()),
        container_port: port,
        protocol: Some("TCP".to_string()),
        ..Default::default()
    }
}

/// HTTP GET probe against `path` on `port`
pub fn http_probe(path: &str, port: i32, initial_delay_seconds: i32) -> Probe {
    Probe {
        http_get: Some(HTTPGetAction {
            path: Some(path.to_string()),
            port: IntOrString::Int(port),
            ..Default::default()
        }),
        initial_delay_seconds: Some(initial_delay_seconds),
        period_seconds: Some(10),
        ..Default::default()
    }
}

/// Volume projecting a ConfigMap
pub fn config_volume(config_map: &str) -> Volume {
    Volume {
        name: CONFIG_VOLUME.to_string(),
        config_map: Some(ConfigMapVolumeSource {
            name: config_map.to_string(),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Volume projecting one secret key to `{secret}/{key}`
pub fn secret_volume(secret: &SecretReference) -> Volume {
    Volume {
        name: SECRETS_VOLUME.to_string(),
        secret: Some(SecretVolumeSource {
            secret_name: Some(secret.name.clone()),
            items: Some(vec![KeyToPath {
                key: secret.key_or_default().to_string(),
                path: format!("{}/{}", secret.name, secret.key_or_default()),
                mode: None,
            }]),
            default_mode: Some(0o400),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// In-memory scratch volume
pub fn memory_volume(name: &str) -> Volume {
    Volume {
        name: name.to_string(),
        empty_dir: Some(EmptyDirVolumeSource {
            medium: Some("Memory".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Read-only mount of a volume
pub fn read_only_mount(volume: &str, path: &str) -> VolumeMount {
    VolumeMount {
        name: volume.to_string(),
        mount_path: path.to_string(),
        read_only: Some(true),
        ..Default::default()
    }
}

/// Writable mount of a volume
pub fn writable_mount(volume: &str, path: &str) -> VolumeMount {
    VolumeMount {
        name: volume.to_string(),
        mount_path: path.to_string(),
        ..Default::default()
    }
}

/// Pod template running `containers` with the restricted pod context
pub fn pod_template(
    labels: BTreeMap<String, String>,
    containers: Vec<Container>,
    volumes: Vec<Volume>,
    restart_policy: Option<&str>,
) -> PodTemplateSpec {
    PodTemplateSpec {
        metadata: Some(ObjectMeta {
            labels: Some(labels),
            ..Default::default()
        }),
        spec: Some(PodSpec {
            containers,
            volumes: (!volumes.is_empty()).then_some(volumes),
            security_context: Some(restricted_pod_security_context()),
            automount_service_account_token: Some(false),
            restart_policy: restart_policy.map(str::to_string),
            ..Default::default()
        }),
    }
}

/// Deployment selecting pods by `labels`
pub fn deployment(
    name: &str,
    namespace: &str,
    labels: BTreeMap<String, String>,
    replicas: i32,
    template: PodTemplateSpec,
) -> ChildResource {
    ChildResource::Deployment(Deployment {
        metadata: ChildMeta::new(name, namespace).labels(labels.clone()).build(),
        spec: Some(DeploymentSpec {
            replicas: Some(replicas),
            selector: LabelSelector {
                match_labels: Some(labels),
                ..Default::default()
            },
            template,
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// CronJob running `template` on `schedule`, one run at a time
pub fn cron_job(
    name: &str,
    namespace: &str,
    labels: BTreeMap<String, String>,
    schedule: &str,
    template: PodTemplateSpec,
) -> ChildResource {
    ChildResource::CronJob(CronJob {
        metadata: ChildMeta::new(name, namespace).labels(labels.clone()).build(),
        spec: Some(CronJobSpec {
            schedule: schedule.to_string(),
            concurrency_policy: Some("Forbid".to_string()),
            successful_jobs_history_limit: Some(3),
            failed_jobs_history_limit: Some(1),
            job_template: JobTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(JobSpec {
                    backoff_limit: Some(2),
                    template,
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// ReadWriteOnce claim backing an agent workspace
pub fn workspace_claim(
    name: &str,
    namespace: &str,
    labels: BTreeMap<String, String>,
    workspace: &WorkspaceSpec,
) -> ChildResource {
    let size = workspace.size.as_deref().unwrap_or(DEFAULT_WORKSPACE_SIZE);
    ChildResource::PersistentVolumeClaim(PersistentVolumeClaim {
        metadata: ChildMeta::new(name, namespace).labels(labels).build(),
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            storage_class_name: workspace.storage_class_name.clone(),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".to_string(),
                    Quantity(size.to_string()),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// Volume mounting a persistent claim
pub fn claim_volume(volume: &str, claim: &str) -> Volume {
    Volume {
        name: volume.to_string(),
        persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
            claim_name: claim.to_string(),
            read_only: None,
        }),
        ..Default::default()
    }
}
