//! Controller runner - builds one controller future per langop kind
//!
//! Construction is kept separate from `main` so the caller decides how the
//! futures are driven.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::batch::v1::CronJob;
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Service};
use k8s_openapi::api::networking::v1::NetworkPolicy;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client};

use langop_common::crd::{LanguageAgent, LanguageCluster, LanguageModel, LanguagePersona, LanguageTool};

use crate::context::Context;
use crate::reconciler::{error_policy, reconcile, Reconcilable};

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
/// This forces the API server to close the watch before the client times out,
/// preventing "body read timed out" errors on idle watches.
const WATCH_TIMEOUT_SECS: u32 = 25;

type ControllerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

fn watcher_config() -> WatcherConfig {
    WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS)
}

fn controller<K: Reconcilable>(client: &Client) -> Controller<K> {
    Controller::new(Api::<K>::all(client.clone()), watcher_config())
}

fn run<K: Reconcilable>(controller: Controller<K>, ctx: Arc<Context>) -> ControllerFuture {
    Box::pin(
        controller
            .shutdown_on_signal()
            .run(reconcile::<K>, error_policy::<K>, ctx)
            .for_each(log_reconcile_result(K::KIND.as_str())),
    )
}

/// Build the controller futures for every langop kind
///
/// Each controller also watches the child kinds it owns, so edits or
/// deletions of children trigger a reconcile of their owner.
pub fn build_controllers(client: Client, ctx: Arc<Context>) -> Vec<ControllerFuture> {
    let agents = controller::<LanguageAgent>(&client)
        .owns(Api::<ConfigMap>::all(client.clone()), watcher_config())
        .owns(Api::<Deployment>::all(client.clone()), watcher_config())
        .owns(Api::<CronJob>::all(client.clone()), watcher_config())
        .owns(Api::<Service>::all(client.clone()), watcher_config())
        .owns(Api::<NetworkPolicy>::all(client.clone()), watcher_config())
        .owns(Api::<PersistentVolumeClaim>::all(client.clone()), watcher_config());

    let models = controller::<LanguageModel>(&client)
        .owns(Api::<ConfigMap>::all(client.clone()), watcher_config())
        .owns(Api::<Deployment>::all(client.clone()), watcher_config())
        .owns(Api::<Service>::all(client.clone()), watcher_config())
        .owns(Api::<NetworkPolicy>::all(client.clone()), watcher_config());

    let tools = controller::<LanguageTool>(&client)
        .owns(Api::<ConfigMap>::all(client.clone()), watcher_config())
        .owns(Api::<Deployment>::all(client.clone()), watcher_config())
        .owns(Api::<Service>::all(client.clone()), watcher_config())
        .owns(Api::<NetworkPolicy>::all(client.clone()), watcher_config());

    let personas = controller::<LanguagePersona>(&client)
        .owns(Api::<ConfigMap>::all(client.clone()), watcher_config());

    let clusters = controller::<LanguageCluster>(&client);

    tracing::info!("- LanguageAgent controller");
    tracing::info!("- LanguageModel controller");
    tracing::info!("- LanguageTool controller");
    tracing::info!("- LanguagePersona controller");
    tracing::info!("- LanguageCluster controller");

    vec![
        run(agents, ctx.clone()),
        run(models, ctx.clone()),
        run(tools, ctx.clone()),
        run(personas, ctx.clone()),
        run(clusters, ctx),
    ]
}

/// Creates a closure for logging reconciliation results.
fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
