//! Dialing live instances.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use redis::aio::MultiplexedConnection;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{
    address::NodeAddress,
    error::{MeshError, MeshResult},
    node::{bounded, NodeClient, NodeHandle, NodeOptions},
};

/// Opens a [`NodeHandle`] to an instance address.
#[async_trait]
pub trait NodeConnector: Send + Sync {
    async fn connect(
        &self,
        address: &NodeAddress,
        cancel: &CancellationToken,
    ) -> MeshResult<NodeHandle>;
}

#[async_trait]
impl<T: NodeConnector + ?Sized> NodeConnector for Arc<T> {
    async fn connect(
        &self,
        address: &NodeAddress,
        cancel: &CancellationToken,
    ) -> MeshResult<NodeHandle> {
        (**self).connect(address, cancel).await
    }
}

/// Cluster commands over a multiplexed Redis connection.
pub struct RedisNodeClient {
    address: NodeAddress,
    conn: MultiplexedConnection,
}

impl RedisNodeClient {
    fn error(&self, err: redis::RedisError) -> MeshError {
        MeshError::communication(self.address.to_string(), err.to_string())
    }
}

#[async_trait]
impl NodeClient for RedisNodeClient {
    async fn cluster_nodes(&self) -> MeshResult<String> {
        let mut conn = self.conn.clone();
        redis::cmd("CLUSTER")
            .arg("NODES")
            .query_async::<String>(&mut conn)
            .await
            .map_err(|e| self.error(e))
    }

    async fn cluster_meet(&self, target: &NodeAddress) -> MeshResult<()> {
        let mut conn = self.conn.clone();
        redis::cmd("CLUSTER")
            .arg("MEET")
            .arg(target.host())
            .arg(target.port())
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| self.error(e))
    }
}

#[derive(Debug, Clone, Default)]
pub struct RedisConnector {
    options: NodeOptions,
}

impl RedisConnector {
    pub fn new(options: NodeOptions) -> Self {
        Self { options }
    }
}

#[async_trait]
impl NodeConnector for RedisConnector {
    async fn connect(
        &self,
        address: &NodeAddress,
        cancel: &CancellationToken,
    ) -> MeshResult<NodeHandle> {
        let client = redis::Client::open((address.host().to_string(), address.port()))
            .map_err(|e| MeshError::communication(address.to_string(), e.to_string()))?;
        let conn = bounded(address, "connect", self.options.timeout, cancel, async {
            client
                .get_multiplexed_async_connection()
                .await
                .map_err(|e| MeshError::communication(address.to_string(), e.to_string()))
        })
        .await?;
        debug!(node = %address, "Connected");

        Ok(NodeHandle::new(
            address.clone(),
            Box::new(RedisNodeClient {
                address: address.clone(),
                conn,
            }),
            self.options.clone(),
        ))
    }
}

/// Connect to every address concurrently. Failures are reported per address and
/// never abort the others.
pub async fn connect_all<C>(
    connector: &C,
    addresses: &[NodeAddress],
    cancel: &CancellationToken,
) -> (Vec<NodeHandle>, Vec<(NodeAddress, MeshError)>)
where
    C: NodeConnector + ?Sized,
{
    let attempts = addresses.iter().map(|address| async move {
        (address.clone(), connector.connect(address, cancel).await)
    });

    let mut handles = Vec::with_capacity(addresses.len());
    let mut failures = Vec::new();
    for (address, result) in join_all(attempts).await {
        match result {
            Ok(handle) => handles.push(handle),
            Err(err) => {
                if !err.is_cancelled() {
                    warn!(node = %address, error = %err, "Failed to connect");
                }
                failures.push((address, err));
            }
        }
    }
    (handles, failures)
}
