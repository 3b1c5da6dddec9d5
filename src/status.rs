//! Status derivation.
//!
//! Status is a pure function of the previous status and the current pass. Condition
//! transition times only move when a condition's truth value flips, so an unchanged
//! cluster produces a byte-identical status.

use crate::crd::{ClusterCondition, RedisClusterStatus};

pub const CONDITION_READY: &str = "Ready";
pub const CONDITION_CONVERGED: &str = "Converged";

/// Coarse state of one reconcile pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// The object no longer exists.
    Deleted,
    /// Fewer ready instances than desired.
    Provisioning,
    /// Instances are up but still split into several components.
    Converging,
    /// All desired instances ready and meshed.
    Ready,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Deleted => "Deleted",
            Self::Provisioning => "Provisioning",
            Self::Converging => "Converging",
            Self::Ready => "Ready",
        }
    }
}

/// What one pass observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassObservation {
    pub generation: Option<i64>,
    pub desired: i32,
    pub ready: i32,
    pub known_nodes: u32,
    pub components: u32,
    pub converged: bool,
    pub phase: Phase,
}

fn bool_status(value: bool) -> &'static str {
    if value {
        "True"
    } else {
        "False"
    }
}

fn condition(
    previous: Option<&RedisClusterStatus>,
    type_: &str,
    value: bool,
    reason: &str,
    message: String,
    now: &str,
) -> ClusterCondition {
    let status = bool_status(value);
    let last_transition_time = previous
        .and_then(|p| p.condition(type_))
        .filter(|c| c.status == status)
        .map(|c| c.last_transition_time.clone())
        .unwrap_or_else(|| now.to_string());
    ClusterCondition {
        type_: type_.to_string(),
        status: status.to_string(),
        reason: reason.to_string(),
        message,
        last_transition_time,
    }
}

pub fn next_status(
    previous: Option<&RedisClusterStatus>,
    observed: &PassObservation,
    now: &str,
) -> RedisClusterStatus {
    let ready = observed.phase == Phase::Ready;
    let ready_reason = match observed.phase {
        Phase::Ready => "ClusterReady",
        Phase::Provisioning => "InstancesNotReady",
        Phase::Converging => "TopologyNotConverged",
        Phase::Deleted => "Deleted",
    };
    let ready_message = format!("{}/{} instances ready", observed.ready, observed.desired);

    let (converged_reason, converged_message) = if observed.ready == 0 {
        ("NoInstances", "no ready instances to inspect".to_string())
    } else if observed.converged {
        ("SingleComponent", "all reachable instances share one topology".to_string())
    } else {
        (
            "MultipleComponents",
            format!("{} components among reachable instances", observed.components),
        )
    };

    RedisClusterStatus {
        ready_replicas: observed.ready,
        known_nodes: observed.known_nodes,
        components: observed.components,
        converged: observed.converged,
        observed_generation: observed.generation,
        conditions: vec![
            condition(previous, CONDITION_READY, ready, ready_reason, ready_message, now),
            condition(
                previous,
                CONDITION_CONVERGED,
                observed.converged,
                converged_reason,
                converged_message,
                now,
            ),
        ],
    }
}
