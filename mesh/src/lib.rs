//! Redis Cluster membership and topology convergence
//!
//! This crate inspects how a set of cluster-mode servers see each other and drives
//! them into a single fully-connected cluster:
//! - Membership table parsing (`CLUSTER NODES` lines)
//! - Per-node handles for self/friends queries and `CLUSTER MEET`
//! - Membership graphs with union-find connected components
//! - A bounded, cancellable convergence engine issuing at most n-1 meets per pass

pub mod address;
pub mod attributes;
pub mod connector;
pub mod convergence;
pub mod error;
pub mod graph;
pub mod node;

#[cfg(any(test, feature = "test-util"))]
pub mod test_utils;

#[cfg(test)]
mod tests;

// Re-export commonly used types
pub use address::NodeAddress;
pub use attributes::{parse_membership_table, LinkState, NodeAttributes, ParseMode};
pub use connector::{connect_all, NodeConnector, RedisConnector, RedisNodeClient};
pub use convergence::{
    plan_meets, plan_meets_avoiding, ConvergenceConfig, ConvergenceEngine, ConvergenceOutcome,
    ConvergenceReport, MeetPlan,
};
pub use error::{MeshError, MeshResult, ParseError};
pub use graph::{GraphBuilder, MembershipGraph, Observation, Unreachable};
pub use node::{MembershipView, NodeClient, NodeHandle, NodeOptions, DEFAULT_NODE_TIMEOUT};
