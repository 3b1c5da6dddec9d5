//! Topology convergence: merge every connected component into one.
//!
//! Each pass rebuilds the graph, picks one representative per live component and has
//! the representative of the largest component meet the others (at most n-1 meets).
//! Server gossip then spreads the new links; the next pass verifies.
//!
//! A failed meet is retried from the other side. A node whose own meets failed is not
//! used as the anchor again for the rest of the run.

use std::{collections::BTreeSet, time::Duration};

use futures::{stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    address::NodeAddress,
    error::{MeshError, MeshResult},
    graph::{GraphBuilder, MembershipGraph},
    node::NodeHandle,
};

pub const DEFAULT_MAX_PASSES: u32 = 3;
pub const DEFAULT_PASS_DELAY: Duration = Duration::from_secs(2);
pub const DEFAULT_MAX_CONCURRENT_MEETS: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvergenceConfig {
    /// Passes that may issue meets before giving up for this run.
    pub max_passes: u32,
    /// Pause after a pass so gossip can propagate before re-inspection.
    pub pass_delay: Duration,
    pub max_concurrent_meets: usize,
}

impl Default for ConvergenceConfig {
    fn default() -> Self {
        Self {
            max_passes: DEFAULT_MAX_PASSES,
            pass_delay: DEFAULT_PASS_DELAY,
            max_concurrent_meets: DEFAULT_MAX_CONCURRENT_MEETS,
        }
    }
}

/// A single planned meet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeetPlan {
    /// Index of the handle issuing the meet.
    pub from: usize,
    pub from_id: String,
    /// Dialed address of the issuing node, target of the reverse meet.
    pub from_address: NodeAddress,
    /// Handle of the target, used to retry the meet in the other direction.
    pub to: Option<usize>,
    pub to_id: String,
    pub target: NodeAddress,
}

/// Representative of a live component: a healthy master if any, else the lowest id.
///
/// Ids in `avoid` are skipped unless the whole component is made of them.
fn representative<'a>(
    graph: &MembershipGraph,
    component: &'a BTreeSet<String>,
    avoid: &BTreeSet<String>,
) -> Option<&'a str> {
    let mut candidates = component.iter().filter(|id| !avoid.contains(*id)).peekable();
    let first = candidates.peek().copied();
    candidates
        .find(|id| {
            graph
                .vertex(id)
                .is_some_and(|node| node.is_master() && !node.is_failing())
        })
        .or(first)
        .or_else(|| component.first())
        .map(String::as_str)
}

/// Meets that merge every live component into the largest one. Empty when converged.
pub fn plan_meets(graph: &MembershipGraph) -> Vec<MeetPlan> {
    plan_meets_avoiding(graph, &BTreeSet::new())
}

/// Like [`plan_meets`], but never anchors on an id in `avoid` while another live node
/// can issue the meets. The anchor comes from the largest component that has a usable
/// node, so the plan still holds one meet per other component.
pub fn plan_meets_avoiding(graph: &MembershipGraph, avoid: &BTreeSet<String>) -> Vec<MeetPlan> {
    let components = graph.live_components();
    let anchor_at = components
        .iter()
        .position(|c| c.iter().any(|id| !avoid.contains(id)))
        .unwrap_or(0);
    let Some(anchor) = components
        .get(anchor_at)
        .and_then(|c| representative(graph, c, avoid))
    else {
        return Vec::new();
    };
    let (Some(from), Some(from_address)) = (graph.handle_for(anchor), graph.address_for(anchor))
    else {
        return Vec::new();
    };

    components
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != anchor_at)
        .filter_map(|(_, component)| {
            let to = representative(graph, component, avoid)?;
            let target = graph.address_for(to)?.clone();
            Some(MeetPlan {
                from,
                from_id: anchor.to_string(),
                from_address: from_address.clone(),
                to: graph.handle_for(to),
                to_id: to.to_string(),
                target,
            })
        })
        .collect()
}

/// What one pass of meets achieved.
#[derive(Debug, Default)]
struct PassResult {
    /// Planned meets that failed in both directions.
    failed: usize,
    /// Issuers whose own meet command failed this pass.
    failing_sources: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConvergenceOutcome {
    /// One component spans every reachable target.
    Converged,
    /// Pass budget spent with more than one component left. Retriable.
    Incomplete { components: usize },
    /// Stopped early by the caller.
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvergenceReport {
    pub outcome: ConvergenceOutcome,
    /// Passes that issued meets.
    pub passes: u32,
    pub meets_attempted: usize,
    pub meets_failed: usize,
    pub live_nodes: usize,
    /// Distinct ids seen in any table on the last build.
    pub known_nodes: usize,
    /// Live components on the last build.
    pub components: usize,
    pub unreachable: Vec<NodeAddress>,
}

impl ConvergenceReport {
    pub fn is_converged(&self) -> bool {
        self.outcome == ConvergenceOutcome::Converged
    }

    fn observe(&mut self, graph: &MembershipGraph) {
        self.live_nodes = graph.live_count();
        self.known_nodes = graph.vertices().len();
        self.components = graph.live_components().len();
        self.unreachable = graph
            .unreachable()
            .iter()
            .map(|u| u.address.clone())
            .collect();
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConvergenceEngine {
    config: ConvergenceConfig,
}

impl ConvergenceEngine {
    pub fn new(config: ConvergenceConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ConvergenceConfig {
        &self.config
    }

    /// Drive `handles` into one component.
    ///
    /// Returns `NoReachableNodes` when no handle answers. Non-convergence and
    /// cancellation are reported through [`ConvergenceOutcome`], never as success.
    pub async fn converge(
        &self,
        handles: &[NodeHandle],
        cancel: &CancellationToken,
    ) -> MeshResult<ConvergenceReport> {
        let mut report = ConvergenceReport {
            outcome: ConvergenceOutcome::Cancelled,
            passes: 0,
            meets_attempted: 0,
            meets_failed: 0,
            live_nodes: 0,
            known_nodes: 0,
            components: 0,
            unreachable: Vec::new(),
        };
        let mut avoid = BTreeSet::new();

        loop {
            let graph = match GraphBuilder::build(handles, cancel).await {
                Ok(graph) => graph,
                Err(MeshError::Cancelled) => return Ok(report),
                Err(err) => return Err(err),
            };
            if graph.live_count() == 0 {
                return Err(MeshError::NoReachableNodes(handles.len()));
            }
            report.observe(&graph);

            if graph.is_converged() {
                info!(
                    passes = report.passes,
                    meets = report.meets_attempted,
                    live = report.live_nodes,
                    "Topology converged"
                );
                report.outcome = ConvergenceOutcome::Converged;
                return Ok(report);
            }
            if report.passes >= self.config.max_passes {
                warn!(
                    passes = report.passes,
                    components = report.components,
                    "Topology not converged within pass budget"
                );
                report.outcome = ConvergenceOutcome::Incomplete {
                    components: report.components,
                };
                return Ok(report);
            }

            let plan = plan_meets_avoiding(&graph, &avoid);
            report.passes += 1;
            debug!(
                pass = report.passes,
                components = report.components,
                meets = plan.len(),
                avoided = avoid.len(),
                "Merging components"
            );
            let result = self.execute(handles, &plan, cancel).await;
            report.meets_attempted += plan.len();
            report.meets_failed += result.failed;
            avoid.extend(result.failing_sources);

            if cancel.is_cancelled() {
                return Ok(report);
            }
            tokio::select! {
                _ = cancel.cancelled() => return Ok(report),
                _ = tokio::time::sleep(self.config.pass_delay) => {}
            }
        }
    }

    /// Run the planned meets with bounded concurrency.
    ///
    /// A meet that fails is retried once from the target towards the issuer, since a
    /// meet links both nodes whichever side sends it.
    async fn execute(
        &self,
        handles: &[NodeHandle],
        plan: &[MeetPlan],
        cancel: &CancellationToken,
    ) -> PassResult {
        let concurrency = self.config.max_concurrent_meets.max(1);
        stream::iter(plan)
            .map(|meet| async move {
                let Some(handle) = handles.get(meet.from) else {
                    return (meet, false, false);
                };
                match handle.meet(&meet.target, cancel).await {
                    Ok(()) => return (meet, true, true),
                    Err(MeshError::Cancelled) => return (meet, true, false),
                    Err(err) => warn!(
                        from = %meet.from_id,
                        to = %meet.to_id,
                        target = %meet.target,
                        error = %err,
                        "Meet failed"
                    ),
                }

                let Some(reverse) = meet.to.and_then(|to| handles.get(to)) else {
                    return (meet, false, false);
                };
                match reverse.meet(&meet.from_address, cancel).await {
                    Ok(()) => {
                        debug!(from = %meet.to_id, to = %meet.from_id, "Reverse meet succeeded");
                        (meet, false, true)
                    }
                    Err(MeshError::Cancelled) => (meet, false, false),
                    Err(err) => {
                        warn!(
                            from = %meet.to_id,
                            to = %meet.from_id,
                            error = %err,
                            "Reverse meet failed"
                        );
                        (meet, false, false)
                    }
                }
            })
            .buffer_unordered(concurrency)
            .boxed()
            .fold(PassResult::default(), |mut result, (meet, source_ok, joined)| {
                if !source_ok {
                    result.failing_sources.insert(meet.from_id.clone());
                }
                if !joined {
                    result.failed += 1;
                }
                std::future::ready(result)
            })
            .await
    }
}
