//! kube runtime controller driving [`Reconciler`] for every proxy resource

use std::future::Future;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Service;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher;
use kube::{Api, Client, ResourceExt};
use tracing::{debug, info, warn};

use crate::config::OperatorConfig;
use crate::crd::VirtualPartitionProxy;
use crate::error::Error;
use crate::kube_cluster::KubeCluster;
use crate::reconciler::{requeue_after_error, Reconciler};

pub struct Context {
    reconciler: Reconciler,
}

async fn reconcile(proxy: Arc<VirtualPartitionProxy>, ctx: Arc<Context>) -> Result<Action, Error> {
    let outcome = ctx.reconciler.reconcile(&proxy).await?;
    Ok(Action::requeue(outcome.requeue_after))
}

fn error_policy(proxy: Arc<VirtualPartitionProxy>, error: &Error, _ctx: Arc<Context>) -> Action {
    let delay = requeue_after_error(error);
    warn!(
        name = %proxy.name_any(),
        namespace = %proxy.namespace().unwrap_or_default(),
        error = %error,
        retry_secs = delay.as_secs(),
        "Reconcile failed, requeueing"
    );
    Action::requeue(delay)
}

/// Watch proxy resources in every namespace until `shutdown` completes.
///
/// Changes to the owned Deployments and Services trigger a pass for their
/// owner, so drift is corrected without waiting for the requeue.
pub async fn run<F>(client: Client, config: OperatorConfig, shutdown: F)
where
    F: Future<Output = ()> + Send + Sync + 'static,
{
    let proxies: Api<VirtualPartitionProxy> = Api::all(client.clone());
    let deployments: Api<Deployment> = Api::all(client.clone());
    let services: Api<Service> = Api::all(client.clone());

    let ctx = Arc::new(Context {
        reconciler: Reconciler::new(
            Arc::new(KubeCluster::new(client)),
            config.proxy_image.clone(),
        ),
    });

    info!(default_image = %config.proxy_image, "Starting VirtualPartitionProxy controller");

    Controller::new(proxies, watcher::Config::default().any_semantic())
        .owns(deployments, watcher::Config::default())
        .owns(services, watcher::Config::default())
        .graceful_shutdown_on(shutdown)
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((object, _)) => debug!(object = %object.name, "Reconcile pass finished"),
                Err(e) => debug!(error = %e, "Controller event failed"),
            }
        })
        .await;

    info!("VirtualPartitionProxy controller stopped");
}
