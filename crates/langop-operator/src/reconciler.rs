//! Generic reconcile state machine
//!
//! Every langop kind walks the same path:
//!
//! ```text
//! NotFound ──► stop
//! Deleting ──► delete config artifacts ──► cleanup ──► release finalizer
//! FinalizerMissing ──► add finalizer ──► requeue now
//! Synchronizing ──► Ready (requeue after resync)
//!               └─► Failed (configuration error, or transient threshold hit)
//! ```
//!
//! Kinds only describe their children through [`Reconcilable`]; the
//! transitions, status bookkeeping and retry accounting live here.

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use k8s_openapi::NamespaceResourceScope;
use kube::runtime::controller::Action;
use kube::{Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::{debug, info, instrument, warn};

use langop_common::conditions::{set_condition, CONDITION_READY};
use langop_common::crd::{Condition, ConditionStatus, HasConditions, ResourcePhase};
use langop_common::finalizer::{
    add_finalizer, finalizers_patch, has_finalizer, remove_finalizer, FINALIZER,
};
use langop_common::kube_utils::controller_owner_ref;
use langop_common::Error;

use crate::client::{parse_object, ResourceKind};
use crate::context::Context;
use crate::sync::{sync_child, ChildKind, ChildResource};

/// Ready reason after a clean pass
pub const REASON_RECONCILE_SUCCESS: &str = "ReconcileSuccess";
/// Ready reason once transient failures reach the threshold
pub const REASON_TRANSIENT_THRESHOLD: &str = "TransientErrorThresholdExceeded";

/// First retry delay after a failed reconcile
pub const BACKOFF_BASE: Duration = Duration::from_secs(5);
/// Upper bound for retry delays
pub const BACKOFF_MAX: Duration = Duration::from_secs(300);

/// A langop kind driven by the generic reconciler
#[async_trait]
pub trait Reconcilable:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + HasConditions
    + Clone
    + Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
    /// Kind handled by this implementation
    const KIND: ResourceKind;

    /// Config artifacts deleted explicitly before the finalizer is released
    fn config_artifacts(&self) -> Vec<(ChildKind, String)>;

    /// Message recorded on the Ready condition after a clean pass
    fn ready_message(&self) -> String {
        format!("{} is ready", Self::KIND)
    }

    /// Extra teardown run after config artifacts are deleted
    async fn cleanup(&self, _ctx: &Context) -> Result<(), Error> {
        Ok(())
    }

    /// Converge every child toward the spec
    async fn synchronize(&self, ctx: &Context, pass: &mut Pass) -> Result<(), Error>;
}

// =============================================================================
// Pass
// =============================================================================

/// State accumulated during one synchronization pass
#[derive(Clone, Debug)]
pub struct Pass {
    owner: OwnerReference,
    name: String,
    namespace: String,
    generation: i64,
    conditions: Vec<Condition>,
    fields: Map<String, Value>,
    failed_step: Option<ChildKind>,
}

impl Pass {
    fn new<K: Reconcilable>(obj: &K) -> Result<Self, Error> {
        Ok(Self {
            owner: controller_owner_ref(obj)?,
            name: obj.name_any(),
            namespace: obj.namespace().unwrap_or_default(),
            generation: obj.meta().generation.unwrap_or(0),
            conditions: obj.conditions().to_vec(),
            fields: Map::new(),
            failed_step: None,
        })
    }

    /// Name of the resource being reconciled
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Namespace of the resource being reconciled
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Generation this pass observes
    pub fn generation(&self) -> i64 {
        self.generation
    }

    /// Conditions as they stand in this pass
    pub fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    /// Synchronize one child, remembering which step failed
    pub async fn sync(&mut self, ctx: &Context, child: ChildResource) -> Result<ChildResource, Error> {
        let kind = child.kind();
        match sync_child(ctx.kube.as_ref(), &self.owner, child).await {
            Ok((_, live)) => Ok(live),
            Err(e) => {
                self.failed_step = Some(kind);
                Err(e)
            }
        }
    }

    /// Upsert a condition at this pass's generation
    pub fn set_condition(&mut self, type_: &str, status: ConditionStatus, reason: &str, message: &str) {
        set_condition(
            &mut self.conditions,
            type_,
            status,
            reason,
            message,
            self.generation,
        );
    }

    /// Set a kind-specific status field
    pub fn set_field(&mut self, key: &str, value: impl Serialize) -> Result<(), Error> {
        let value = serde_json::to_value(value)?;
        self.fields.insert(key.to_string(), value);
        Ok(())
    }

    /// Remove a kind-specific status field
    pub fn clear_field(&mut self, key: &str) {
        self.fields.insert(key.to_string(), Value::Null);
    }

    fn failure_reason(&self, error: &Error) -> String {
        match (error, self.failed_step) {
            (Error::Configuration { reason, .. }, _) => reason.clone(),
            (_, Some(step)) => format!("{}Error", step),
            _ => error.reason().to_string(),
        }
    }

    fn finish(&mut self, phase: ResourcePhase, reason: &str, message: &str) -> Value {
        let ready = if phase == ResourcePhase::Ready {
            ConditionStatus::True
        } else {
            ConditionStatus::False
        };
        self.set_condition(CONDITION_READY, ready, reason, message);

        let mut status = self.fields.clone();
        status.insert("phase".to_string(), json!(phase));
        status.insert("observedGeneration".to_string(), json!(self.generation));
        status.insert("conditions".to_string(), json!(self.conditions));
        status.insert("message".to_string(), json!(message));
        Value::Object(status)
    }
}

// =============================================================================
// State machine
// =============================================================================

fn failure_key<K: Reconcilable>(namespace: &str, name: &str) -> String {
    format!("{}/{}/{}", K::KIND, namespace, name)
}

/// Apply a JSON merge patch in place (`null` deletes)
pub(crate) fn merge_json(target: &mut Value, patch: &Value) {
    match (target.as_object_mut(), patch.as_object()) {
        (Some(target), Some(patch)) => {
            for (k, v) in patch {
                if v.is_null() {
                    target.remove(k);
                } else if v.is_object() && target.get(k).is_some_and(Value::is_object) {
                    if let Some(inner) = target.get_mut(k) {
                        merge_json(inner, v);
                    }
                } else {
                    target.insert(k.clone(), v.clone());
                }
            }
        }
        _ => *target = patch.clone(),
    }
}

/// Persist a status patch unless it would change nothing
async fn persist_status<K: Reconcilable>(obj: &K, ctx: &Context, status: Value) -> Result<(), Error> {
    let current = serde_json::to_value(obj)?
        .get("status")
        .cloned()
        .unwrap_or_else(|| json!({}));
    let mut merged = current.clone();
    merge_json(&mut merged, &status);
    if merged == current {
        debug!("status unchanged, skipping write");
        return Ok(());
    }

    ctx.kube
        .patch_status(
            K::KIND,
            &obj.namespace().unwrap_or_default(),
            &obj.name_any(),
            status,
        )
        .await
}

/// Reconcile one langop resource
#[instrument(skip(obj, ctx), fields(kind = %K::KIND, name = %obj.name_any()))]
pub async fn reconcile<K: Reconcilable>(obj: Arc<K>, ctx: Arc<Context>) -> Result<Action, Error> {
    let name = obj.name_any();
    let namespace = obj.namespace().unwrap_or_default();

    // The watch cache may lag; act on the live object
    let Some(raw) = ctx.kube.get_object(K::KIND, &namespace, &name).await? else {
        debug!("resource no longer exists");
        return Ok(Action::await_change());
    };
    let obj: K = parse_object(raw)?;
    let key = failure_key::<K>(&namespace, &name);

    if obj.meta().deletion_timestamp.is_some() {
        return finalize(&obj, &ctx, &key).await;
    }

    let mut meta = obj.meta().clone();
    if add_finalizer(&mut meta, FINALIZER) {
        ctx.kube
            .patch_metadata(K::KIND, &namespace, &name, finalizers_patch(&meta))
            .await?;
        info!("added finalizer");
        return Ok(Action::requeue(Duration::ZERO));
    }

    let mut pass = Pass::new(&obj)?;
    match obj.synchronize(&ctx, &mut pass).await {
        Ok(()) => {
            ctx.reset_failures(&key);
            let status = pass.finish(
                ResourcePhase::Ready,
                REASON_RECONCILE_SUCCESS,
                &obj.ready_message(),
            );
            persist_status(&obj, &ctx, status).await?;
            debug!("reconcile complete");
            Ok(Action::requeue(ctx.config.resync_interval()))
        }
        Err(e) if e.is_retryable() => {
            let failures = ctx.record_failure(&key);
            warn!(error = %e, failures, "transient reconcile failure");
            if failures >= ctx.config.transient_threshold {
                let message = format!("{} consecutive transient failures: {}", failures, e);
                let status = pass.finish(ResourcePhase::Failed, REASON_TRANSIENT_THRESHOLD, &message);
                if let Err(pe) = persist_status(&obj, &ctx, status).await {
                    warn!(error = %pe, "failed to record transient failure threshold");
                }
            }
            Err(e)
        }
        Err(e) => {
            let reason = pass.failure_reason(&e);
            warn!(error = %e, reason = %reason, "reconcile failed");
            let status = pass.finish(ResourcePhase::Failed, &reason, &e.to_string());
            persist_status(&obj, &ctx, status).await?;
            Ok(Action::requeue(ctx.config.resync_interval()))
        }
    }
}

/// Deleting: remove config artifacts, run kind cleanup, then release the finalizer
async fn finalize<K: Reconcilable>(obj: &K, ctx: &Context, key: &str) -> Result<Action, Error> {
    if !has_finalizer(obj.meta(), FINALIZER) {
        return Ok(Action::await_change());
    }
    let name = obj.name_any();
    let namespace = obj.namespace().unwrap_or_default();

    for (kind, child) in obj.config_artifacts() {
        ctx.kube.delete_child(kind, &namespace, &child).await?;
        debug!(kind = %kind, child = %child, "deleted config artifact");
    }
    obj.cleanup(ctx).await?;

    let mut meta = obj.meta().clone();
    if remove_finalizer(&mut meta, FINALIZER) {
        ctx.kube
            .patch_metadata(K::KIND, &namespace, &name, finalizers_patch(&meta))
            .await?;
    }
    ctx.reset_failures(key);
    info!("released finalizer");
    Ok(Action::await_change())
}

/// Retry delay after the given number of consecutive failures
pub fn backoff_delay(failures: u32) -> Duration {
    let exponent = failures.saturating_sub(1).min(16);
    BACKOFF_BASE
        .saturating_mul(1u32 << exponent)
        .min(BACKOFF_MAX)
}

/// Error policy shared by every controller
pub fn error_policy<K: Reconcilable>(obj: Arc<K>, error: &Error, ctx: Arc<Context>) -> Action {
    let key = failure_key::<K>(&obj.namespace().unwrap_or_default(), &obj.name_any());
    let delay = backoff_delay(ctx.failure_count(&key).max(1));
    warn!(
        kind = %K::KIND,
        name = %obj.name_any(),
        error = %error,
        retry_in_secs = delay.as_secs(),
        "reconcile error, requeueing"
    );
    Action::requeue(delay)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MockKubeClient;
    use crate::testing::{api_error, resource_meta, FakeKube, NoServices, StaticInspector};
    use langop_common::conditions::find_condition;
    use langop_common::crd::{LanguagePersona, LanguagePersonaSpec};
    use langop_network::StaticResolver;
    use mockall::Sequence;

    fn persona() -> LanguagePersona {
        LanguagePersona {
            metadata: resource_meta("helpful", "agents"),
            spec: LanguagePersonaSpec {
                display_name: "Helpful".to_string(),
                system_prompt: "You are helpful.".to_string(),
                ..Default::default()
            },
            status: None,
        }
    }

    fn ctx_with(kube: Arc<dyn crate::client::KubeClient>) -> Context {
        Context::for_testing(
            kube,
            Arc::new(StaticInspector::default()),
            Arc::new(NoServices),
            Arc::new(StaticResolver::new()),
        )
    }

    fn stored(fake: &FakeKube) -> LanguagePersona {
        fake.object(ResourceKind::Persona, "agents", "helpful").unwrap()
    }

    async fn run(fake: &Arc<FakeKube>, ctx: &Arc<Context>) -> Result<Action, Error> {
        reconcile(Arc::new(stored(fake)), ctx.clone()).await
    }

    /// Story: a new resource gets its finalizer before any child exists
    #[tokio::test]
    async fn story_finalizer_is_persisted_before_children() {
        let fake = Arc::new(FakeKube::new());
        fake.insert(ResourceKind::Persona, &persona());
        let ctx = Arc::new(ctx_with(fake.clone()));

        let action = run(&fake, &ctx).await.unwrap();
        assert_eq!(action, Action::requeue(Duration::ZERO));
        assert_eq!(fake.child_count(), 0);
        assert!(has_finalizer(stored(&fake).meta(), FINALIZER));

        let action = run(&fake, &ctx).await.unwrap();
        assert_eq!(action, Action::requeue(ctx.config.resync_interval()));
        assert_eq!(fake.child_count(), 1);

        let status = stored(&fake).status.unwrap();
        assert_eq!(status.phase, ResourcePhase::Ready);
        assert_eq!(status.observed_generation, Some(1));
        let ready = find_condition(&status.conditions, CONDITION_READY).unwrap();
        assert_eq!(ready.status, ConditionStatus::True);
        assert_eq!(ready.reason, REASON_RECONCILE_SUCCESS);
    }

    /// Story: reconciling an unchanged resource writes nothing at all
    #[tokio::test]
    async fn story_steady_state_is_write_free() {
        let fake = Arc::new(FakeKube::new());
        fake.insert(ResourceKind::Persona, &persona());
        let ctx = Arc::new(ctx_with(fake.clone()));
        run(&fake, &ctx).await.unwrap();
        run(&fake, &ctx).await.unwrap();
        let first = stored(&fake).status.unwrap();

        fake.clear_ops();
        run(&fake, &ctx).await.unwrap();

        assert!(fake.ops().is_empty(), "unexpected writes: {:?}", fake.ops());
        assert_eq!(stored(&fake).status.unwrap(), first);
    }

    #[tokio::test]
    async fn new_generation_is_observed() {
        let fake = Arc::new(FakeKube::new());
        fake.insert(ResourceKind::Persona, &persona());
        let ctx = Arc::new(ctx_with(fake.clone()));
        run(&fake, &ctx).await.unwrap();
        run(&fake, &ctx).await.unwrap();

        fake.bump_generation(ResourceKind::Persona, "agents", "helpful");
        run(&fake, &ctx).await.unwrap();

        let status = stored(&fake).status.unwrap();
        assert_eq!(status.observed_generation, Some(2));
        assert_eq!(status.conditions[0].observed_generation, 2);
    }

    #[tokio::test]
    async fn missing_resource_is_not_an_error() {
        let fake = Arc::new(FakeKube::new());
        let ctx = Arc::new(ctx_with(fake.clone()));
        let action = reconcile(Arc::new(persona()), ctx).await.unwrap();
        assert_eq!(action, Action::await_change());
        assert!(fake.ops().is_empty());
    }

    /// Story: the config artifact is deleted before the finalizer is released
    #[tokio::test]
    async fn story_deletion_removes_artifact_before_finalizer() {
        let mut deleting = persona();
        deleting.metadata.finalizers = Some(vec![FINALIZER.to_string()]);
        deleting.metadata.deletion_timestamp = Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(
            chrono::Utc::now(),
        ));
        let raw: kube::api::DynamicObject =
            serde_json::from_value(serde_json::to_value(&deleting).unwrap()).unwrap();

        let mut mock = MockKubeClient::new();
        let mut seq = Sequence::new();
        mock.expect_get_object()
            .times(1)
            .in_sequence(&mut seq)
            .returning(move |_, _, _| Ok(Some(raw.clone())));
        mock.expect_delete_child()
            .withf(|kind, ns, name| {
                *kind == ChildKind::ConfigMap && ns == "agents" && name == "helpful-persona"
            })
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Ok(()));
        mock.expect_patch_metadata()
            .withf(|kind, _, name, patch| {
                *kind == ResourceKind::Persona
                    && name == "helpful"
                    && patch["metadata"]["finalizers"] == json!([])
            })
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _, _| Ok(()));

        let ctx = Arc::new(ctx_with(Arc::new(mock)));
        let action = reconcile(Arc::new(deleting), ctx).await.unwrap();
        assert_eq!(action, Action::await_change());
    }

    #[tokio::test]
    async fn deletion_keeps_finalizer_when_artifact_delete_fails() {
        let mut deleting = persona();
        deleting.metadata.finalizers = Some(vec![FINALIZER.to_string()]);
        deleting.metadata.deletion_timestamp = Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(
            chrono::Utc::now(),
        ));
        let raw: kube::api::DynamicObject =
            serde_json::from_value(serde_json::to_value(&deleting).unwrap()).unwrap();

        let mut mock = MockKubeClient::new();
        mock.expect_get_object()
            .returning(move |_, _, _| Ok(Some(raw.clone())));
        mock.expect_delete_child()
            .returning(|_, _, _| Err(api_error(503)));
        mock.expect_patch_metadata().never();

        let ctx = Arc::new(ctx_with(Arc::new(mock)));
        assert!(reconcile(Arc::new(deleting), ctx).await.is_err());
    }

    /// Story: transient failures stay invisible until the threshold
    #[tokio::test]
    async fn story_transient_failures_surface_at_threshold() {
        let fake = Arc::new(FakeKube::new());
        fake.insert(ResourceKind::Persona, &persona());
        let mut ctx = ctx_with(fake.clone());
        ctx.config.transient_threshold = 2;
        let ctx = Arc::new(ctx);
        run(&fake, &ctx).await.unwrap();

        fake.fail_child(ChildKind::ConfigMap, 503);
        assert!(run(&fake, &ctx).await.is_err());
        assert!(stored(&fake).status.is_none());

        assert!(run(&fake, &ctx).await.is_err());
        let status = stored(&fake).status.unwrap();
        assert_eq!(status.phase, ResourcePhase::Failed);
        let ready = find_condition(&status.conditions, CONDITION_READY).unwrap();
        assert_eq!(ready.reason, REASON_TRANSIENT_THRESHOLD);

        fake.heal_child(ChildKind::ConfigMap);
        run(&fake, &ctx).await.unwrap();
        assert_eq!(stored(&fake).status.unwrap().phase, ResourcePhase::Ready);
        assert_eq!(ctx.failure_count("LanguagePersona/agents/helpful"), 0);
    }

    #[tokio::test]
    async fn permanent_child_error_names_the_failed_step() {
        let fake = Arc::new(FakeKube::new());
        fake.insert(ResourceKind::Persona, &persona());
        let ctx = Arc::new(ctx_with(fake.clone()));
        run(&fake, &ctx).await.unwrap();

        fake.fail_child(ChildKind::ConfigMap, 422);
        let action = run(&fake, &ctx).await.unwrap();
        assert_eq!(action, Action::requeue(ctx.config.resync_interval()));

        let status = stored(&fake).status.unwrap();
        assert_eq!(status.phase, ResourcePhase::Failed);
        let ready = find_condition(&status.conditions, CONDITION_READY).unwrap();
        assert_eq!(ready.status, ConditionStatus::False);
        assert_eq!(ready.reason, "ConfigMapError");
        assert!(ready.message.contains("422"));
    }

    #[test]
    fn backoff_grows_and_caps() {
        assert_eq!(backoff_delay(1), Duration::from_secs(5));
        assert_eq!(backoff_delay(2), Duration::from_secs(10));
        assert_eq!(backoff_delay(4), Duration::from_secs(40));
        assert_eq!(backoff_delay(10), BACKOFF_MAX);
        assert_eq!(backoff_delay(u32::MAX), BACKOFF_MAX);
    }

    #[test]
    fn error_policy_uses_failure_count() {
        let ctx = Arc::new(ctx_with(Arc::new(MockKubeClient::new())));
        ctx.record_failure("LanguagePersona/agents/helpful");
        ctx.record_failure("LanguagePersona/agents/helpful");
        ctx.record_failure("LanguagePersona/agents/helpful");
        let action = error_policy(Arc::new(persona()), &api_error(503), ctx);
        assert_eq!(action, Action::requeue(Duration::from_secs(20)));
    }

    #[test]
    fn merge_json_deletes_nulls_and_recurses() {
        let mut target = json!({ "a": 1, "b": { "c": 2, "d": 3 } });
        merge_json(&mut target, &json!({ "a": null, "b": { "c": 4 } }));
        assert_eq!(target, json!({ "b": { "c": 4, "d": 3 } }));
    }
}
