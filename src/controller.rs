//! kube-runtime controller wiring.

use std::{sync::Arc, time::Duration};

use backoff::{backoff::Backoff, ExponentialBackoff, ExponentialBackoffBuilder};
use dashmap::DashMap;
use futures::StreamExt;
use k8s_openapi::api::{apps::v1::StatefulSet, core::v1::Service};
use kube::{
    runtime::{controller::Action, watcher, Controller},
    Api, Client,
};
use rco_mesh::{ConvergenceEngine, RedisConnector};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    config::OperatorConfig,
    crd::RedisCluster,
    desired_state::{KubeDesiredStateStore, ObjectKey},
    error::{OperatorError, OperatorResult},
    instance_group::KubeInstanceGroup,
    reconciler::{Reconciler, Requeue, RequeuePolicy},
};

/// Per-object exponential back-off for hard failures, reset on success.
pub struct BackoffTracker {
    initial: Duration,
    max: Duration,
    entries: DashMap<ObjectKey, ExponentialBackoff>,
}

impl BackoffTracker {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            entries: DashMap::new(),
        }
    }

    pub fn from_policy(policy: &RequeuePolicy) -> Self {
        Self::new(policy.backoff_initial, policy.backoff_max)
    }

    fn fresh(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.initial)
            .with_max_interval(self.max)
            .with_max_elapsed_time(None)
            .build()
    }

    pub fn next_delay(&self, key: &ObjectKey) -> Duration {
        let mut entry = self
            .entries
            .entry(key.clone())
            .or_insert_with(|| self.fresh());
        entry.next_backoff().unwrap_or(self.max)
    }

    pub fn reset(&self, key: &ObjectKey) {
        self.entries.remove(key);
    }

    pub fn tracked(&self) -> usize {
        self.entries.len()
    }
}

pub struct Context {
    pub reconciler: Reconciler,
    pub backoff: BackoffTracker,
    /// Cancelled on shutdown; each reconcile runs under a child token.
    pub shutdown: CancellationToken,
}

impl Context {
    pub fn new(reconciler: Reconciler, shutdown: CancellationToken) -> Self {
        let backoff = BackoffTracker::from_policy(reconciler.policy());
        Self {
            reconciler,
            backoff,
            shutdown,
        }
    }
}

pub fn to_action(requeue: Requeue) -> Action {
    match requeue {
        Requeue::Never => Action::await_change(),
        Requeue::After(delay) => Action::requeue(delay),
    }
}

/// Requeue decision for a failed reconcile.
pub fn error_action(err: &OperatorError, key: &ObjectKey, ctx: &Context) -> Action {
    match err {
        OperatorError::InvalidSpec(_) => Action::await_change(),
        OperatorError::Orchestration(_) => {
            Action::requeue(ctx.reconciler.policy().orchestration_retry)
        }
        _ => Action::requeue(ctx.backoff.next_delay(key)),
    }
}

async fn reconcile(cluster: Arc<RedisCluster>, ctx: Arc<Context>) -> Result<Action, OperatorError> {
    let key = ObjectKey::of(&cluster);
    let cancel = ctx.shutdown.child_token();
    let outcome = ctx.reconciler.reconcile(&key, &cancel).await?;
    ctx.backoff.reset(&key);
    debug!(cluster = %key, phase = outcome.phase.as_str(), "Reconciled");
    Ok(to_action(outcome.requeue))
}

fn error_policy(cluster: Arc<RedisCluster>, err: &OperatorError, ctx: Arc<Context>) -> Action {
    let key = ObjectKey::of(&cluster);
    let action = error_action(err, &key, &ctx);
    warn!(cluster = %key, kind = err.kind(), error = %err, ?action, "Reconcile failed");
    action
}

/// Build the production reconciler from configuration.
pub fn build_reconciler(client: Client, config: &OperatorConfig) -> Reconciler {
    Reconciler::new(
        Arc::new(KubeDesiredStateStore::new(client.clone())),
        Arc::new(KubeInstanceGroup::new(
            client,
            config.image_repository.clone(),
            config.redis_port,
        )),
        Arc::new(RedisConnector::new(config.node_options())),
        ConvergenceEngine::new(config.convergence()),
        config.requeue_policy(),
    )
}

/// Run the controller until `shutdown` is cancelled.
pub async fn run(
    client: Client,
    config: &OperatorConfig,
    shutdown: CancellationToken,
) -> OperatorResult<()> {
    let (clusters, statefulsets, services) = match &config.namespace {
        Some(ns) => (
            Api::<RedisCluster>::namespaced(client.clone(), ns),
            Api::<StatefulSet>::namespaced(client.clone(), ns),
            Api::<Service>::namespaced(client.clone(), ns),
        ),
        None => (
            Api::<RedisCluster>::all(client.clone()),
            Api::<StatefulSet>::all(client.clone()),
            Api::<Service>::all(client.clone()),
        ),
    };

    // fail fast when the CRD is not installed
    clusters
        .list(&kube::api::ListParams::default().limit(1))
        .await
        .map_err(|e| OperatorError::Config(format!("RedisCluster CRD is not queryable: {e}")))?;

    let ctx = Arc::new(Context::new(
        build_reconciler(client, config),
        shutdown.clone(),
    ));
    info!(namespace = ?config.namespace, "Starting RedisCluster controller");

    Controller::new(clusters, watcher::Config::default())
        .owns(statefulsets, watcher::Config::default())
        .owns(services, watcher::Config::default())
        .graceful_shutdown_on(shutdown.cancelled_owned())
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            if let Err(err) = result {
                match err {
                    kube::runtime::controller::Error::ReconcilerFailed(..) => {}
                    other => error!(error = %other, "Controller error"),
                }
            }
        })
        .await;

    info!("Controller stopped");
    Ok(())
}
