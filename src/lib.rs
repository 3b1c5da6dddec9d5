//! Kubernetes operator that keeps Redis Cluster instances meshed into one topology.
//!
//! The topology logic lives in the `rco-mesh` crate; this crate supplies the
//! `RedisCluster` resource, the StatefulSet-backed instance group, the reconciler
//! and the controller runtime wiring.

pub mod config;
pub mod controller;
pub mod crd;
pub mod desired_state;
pub mod error;
pub mod instance_group;
pub mod logging;
pub mod reconciler;
pub mod status;

pub use config::OperatorConfig;
pub use crd::{ClusterCondition, RedisCluster, RedisClusterSpec, RedisClusterStatus};
pub use desired_state::{DesiredStateStore, KubeDesiredStateStore, ObjectKey};
pub use error::{OperatorError, OperatorResult};
pub use instance_group::{GroupStatus, InstanceGroup, KubeInstanceGroup};
pub use reconciler::{ReconcileOutcome, Reconciler, Requeue, RequeuePolicy};
pub use status::Phase;
