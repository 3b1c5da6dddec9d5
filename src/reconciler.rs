//! Level-triggered reconciliation of one `RedisCluster`.
//!
//! Each call reads current desired and live state, applies the instance group,
//! converges the topology of ready instances and returns a requeue hint. Nothing is
//! remembered between calls.

use std::{sync::Arc, time::Duration};

use chrono::{SecondsFormat, Utc};
use rco_mesh::{
    connect_all, ConvergenceEngine, ConvergenceOutcome, ConvergenceReport, MeshError,
    NodeConnector,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::{
    crd::RedisCluster,
    desired_state::{DesiredStateStore, ObjectKey},
    error::{OperatorError, OperatorResult},
    instance_group::InstanceGroup,
    status::{next_status, PassObservation, Phase},
};

/// Requeue delays for each kind of pass result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequeuePolicy {
    /// Fewer ready instances than desired.
    pub not_ready: Duration,
    /// Topology still split after the pass budget.
    pub not_converged: Duration,
    /// Periodic re-check of a healthy cluster.
    pub resync: Duration,
    /// Instance group could not be applied or listed.
    pub orchestration_retry: Duration,
    /// Exponential back-off bounds for other hard failures.
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
}

impl Default for RequeuePolicy {
    fn default() -> Self {
        Self {
            not_ready: Duration::from_secs(10),
            not_converged: Duration::from_secs(5),
            resync: Duration::from_secs(300),
            orchestration_retry: Duration::from_secs(30),
            backoff_initial: Duration::from_millis(500),
            backoff_max: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requeue {
    /// Wait for the next change event.
    Never,
    After(Duration),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub requeue: Requeue,
    pub phase: Phase,
    /// Absent when no convergence run happened.
    pub report: Option<ConvergenceReport>,
}

pub struct Reconciler {
    store: Arc<dyn DesiredStateStore>,
    group: Arc<dyn InstanceGroup>,
    connector: Arc<dyn NodeConnector>,
    engine: ConvergenceEngine,
    policy: RequeuePolicy,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn DesiredStateStore>,
        group: Arc<dyn InstanceGroup>,
        connector: Arc<dyn NodeConnector>,
        engine: ConvergenceEngine,
        policy: RequeuePolicy,
    ) -> Self {
        Self {
            store,
            group,
            connector,
            engine,
            policy,
        }
    }

    pub fn policy(&self) -> &RequeuePolicy {
        &self.policy
    }

    #[instrument(skip_all, fields(cluster = %key))]
    pub async fn reconcile(
        &self,
        key: &ObjectKey,
        cancel: &CancellationToken,
    ) -> OperatorResult<ReconcileOutcome> {
        let Some(cluster) = self.store.get(key).await? else {
            info!("Cluster no longer exists, nothing to do");
            return Ok(ReconcileOutcome {
                requeue: Requeue::Never,
                phase: Phase::Deleted,
                report: None,
            });
        };

        let desired = cluster.spec.replicas;
        if desired < 1 {
            return Err(OperatorError::InvalidSpec(format!(
                "replicas must be at least 1, got {desired}"
            )));
        }

        let group = self.group.ensure(&cluster).await?;
        let addresses = self.group.ready_instances(&cluster).await?;
        let ready = i32::try_from(addresses.len()).unwrap_or(i32::MAX);

        if addresses.is_empty() {
            debug!(desired, "No ready instances yet");
            let observation = PassObservation {
                generation: cluster.metadata.generation,
                desired,
                ready: 0,
                known_nodes: 0,
                components: 0,
                converged: false,
                phase: Phase::Provisioning,
            };
            self.publish(key, &cluster, &observation).await?;
            return Ok(ReconcileOutcome {
                requeue: Requeue::After(self.policy.not_ready),
                phase: Phase::Provisioning,
                report: None,
            });
        }

        let (handles, failures) = connect_all(self.connector.as_ref(), &addresses, cancel).await;
        if cancel.is_cancelled() {
            return Ok(self.cancelled(None));
        }
        if handles.is_empty() {
            return Err(OperatorError::NoReachableInstances {
                ready: addresses.len(),
            });
        }

        let mut report = match self.engine.converge(&handles, cancel).await {
            Ok(report) => report,
            Err(MeshError::NoReachableNodes(_)) => {
                return Err(OperatorError::NoReachableInstances {
                    ready: addresses.len(),
                })
            }
            Err(err) => return Err(err.into()),
        };

        report
            .unreachable
            .extend(failures.into_iter().map(|(address, _)| address));
        report.unreachable.sort();
        report.unreachable.dedup();

        let phase = match report.outcome {
            ConvergenceOutcome::Cancelled => return Ok(self.cancelled(Some(report))),
            ConvergenceOutcome::Converged
                if ready == desired
                    && group.is_settled(desired)
                    && report.live_nodes == addresses.len() =>
            {
                Phase::Ready
            }
            ConvergenceOutcome::Converged => Phase::Provisioning,
            ConvergenceOutcome::Incomplete { .. } => Phase::Converging,
        };
        let requeue = match phase {
            Phase::Ready => self.policy.resync,
            Phase::Provisioning => self.policy.not_ready,
            _ => self.policy.not_converged,
        };

        match phase {
            Phase::Ready => info!(
                replicas = desired,
                meets = report.meets_attempted,
                "Cluster ready"
            ),
            Phase::Converging => warn!(
                components = report.components,
                passes = report.passes,
                "Topology not converged, will retry"
            ),
            _ => debug!(
                desired,
                ready,
                group_ready = group.ready,
                live = report.live_nodes,
                unreachable = report.unreachable.len(),
                "Cluster still provisioning"
            ),
        }

        let observation = PassObservation {
            generation: cluster.metadata.generation,
            desired,
            ready,
            known_nodes: u32::try_from(report.known_nodes).unwrap_or(u32::MAX),
            components: u32::try_from(report.components).unwrap_or(u32::MAX),
            converged: report.is_converged(),
            phase,
        };
        self.publish(key, &cluster, &observation).await?;

        Ok(ReconcileOutcome {
            requeue: Requeue::After(requeue),
            phase,
            report: Some(report),
        })
    }

    fn cancelled(&self, report: Option<ConvergenceReport>) -> ReconcileOutcome {
        debug!("Reconcile cancelled");
        ReconcileOutcome {
            requeue: Requeue::After(self.policy.not_converged),
            phase: Phase::Converging,
            report,
        }
    }

    /// Write status only when it differs from what the object already carries.
    async fn publish(
        &self,
        key: &ObjectKey,
        cluster: &RedisCluster,
        observation: &PassObservation,
    ) -> OperatorResult<()> {
        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        let next = next_status(cluster.status.as_ref(), observation, &now);
        if cluster.status.as_ref() == Some(&next) {
            return Ok(());
        }
        self.store.publish_status(key, &next).await
    }
}
