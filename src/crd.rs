//! `RedisCluster` custom resource.

use kube::CustomResource;
use serde::{Deserialize, Serialize};

pub const DEFAULT_REPLICAS: i32 = 3;
pub const DEFAULT_VERSION: &str = "7.2";

fn default_replicas() -> i32 {
    DEFAULT_REPLICAS
}

fn default_version() -> String {
    DEFAULT_VERSION.to_string()
}

/// Desired state of a Redis Cluster.
#[derive(CustomResource, Debug, Clone, PartialEq, Deserialize, Serialize)]
#[kube(
    group = "redis.containersolutions.com",
    version = "v1alpha1",
    kind = "RedisCluster",
    plural = "redisclusters",
    shortname = "rdc",
    namespaced,
    status = "RedisClusterStatus",
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct RedisClusterSpec {
    /// Number of server instances.
    #[serde(default = "default_replicas")]
    pub replicas: i32,
    /// Image tag; combined with the operator's image repository unless `image` is set.
    #[serde(default = "default_version")]
    pub version: String,
    /// Full image reference overriding repository and version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

impl Default for RedisClusterSpec {
    fn default() -> Self {
        Self {
            replicas: DEFAULT_REPLICAS,
            version: default_version(),
            image: None,
        }
    }
}

impl RedisClusterSpec {
    pub fn image_ref(&self, repository: &str) -> String {
        match &self.image {
            Some(image) => image.clone(),
            None => format!("{repository}:{}", self.version),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RedisClusterStatus {
    #[serde(default)]
    pub ready_replicas: i32,
    /// Distinct node ids known across all membership tables.
    #[serde(default)]
    pub known_nodes: u32,
    /// Connected components among reachable instances.
    #[serde(default)]
    pub components: u32,
    #[serde(default)]
    pub converged: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<ClusterCondition>,
}

impl RedisClusterStatus {
    pub fn condition(&self, type_: &str) -> Option<&ClusterCondition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterCondition {
    #[serde(rename = "type")]
    pub type_: String,
    /// "True" or "False".
    pub status: String,
    pub reason: String,
    #[serde(default)]
    pub message: String,
    /// RFC 3339, changed only when `status` flips.
    pub last_transition_time: String,
}
