//! Access to the declared `RedisCluster` objects.

use std::fmt;

use async_trait::async_trait;
use kube::{
    api::{Patch, PatchParams},
    Api, Client, ResourceExt,
};
use serde_json::json;
use tracing::debug;

use crate::{
    crd::{RedisCluster, RedisClusterStatus},
    error::OperatorResult,
};

/// Namespace and name of a `RedisCluster`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn of(cluster: &RedisCluster) -> Self {
        Self::new(
            cluster.namespace().unwrap_or_else(|| "default".to_string()),
            cluster.name_any(),
        )
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Read access to desired state plus the status subresource.
#[async_trait]
pub trait DesiredStateStore: Send + Sync {
    /// `None` when the object no longer exists.
    async fn get(&self, key: &ObjectKey) -> OperatorResult<Option<RedisCluster>>;

    async fn publish_status(&self, key: &ObjectKey, status: &RedisClusterStatus)
        -> OperatorResult<()>;
}

#[derive(Clone)]
pub struct KubeDesiredStateStore {
    client: Client,
}

impl KubeDesiredStateStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, key: &ObjectKey) -> Api<RedisCluster> {
        Api::namespaced(self.client.clone(), &key.namespace)
    }
}

#[async_trait]
impl DesiredStateStore for KubeDesiredStateStore {
    async fn get(&self, key: &ObjectKey) -> OperatorResult<Option<RedisCluster>> {
        Ok(self.api(key).get_opt(&key.name).await?)
    }

    async fn publish_status(
        &self,
        key: &ObjectKey,
        status: &RedisClusterStatus,
    ) -> OperatorResult<()> {
        let patch = json!({ "status": status });
        self.api(key)
            .patch_status(&key.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        debug!(cluster = %key, "Published status");
        Ok(())
    }
}
