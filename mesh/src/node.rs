//! Per-instance handle: "who am I", "who do I know" and "meet that instance".
//!
//! The wire transport sits behind [`NodeClient`] so the handle logic (deadlines,
//! cancellation, table interpretation) is shared by the real Redis client and test doubles.

use std::{fmt, future::Future, time::Duration};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{
    address::NodeAddress,
    attributes::{parse_membership_table, NodeAttributes, ParseMode},
    error::{MeshError, MeshResult},
};

/// Default deadline for a single round-trip to one node
pub const DEFAULT_NODE_TIMEOUT: Duration = Duration::from_secs(5);

/// Raw cluster commands against one server.
#[async_trait]
pub trait NodeClient: Send + Sync {
    /// `CLUSTER NODES`, returned verbatim.
    async fn cluster_nodes(&self) -> MeshResult<String>;

    /// `CLUSTER MEET <host> <port>`. Any non-error reply is success.
    async fn cluster_meet(&self, target: &NodeAddress) -> MeshResult<()>;
}

#[derive(Debug, Clone)]
pub struct NodeOptions {
    /// Deadline applied to every connect, query and meet.
    pub timeout: Duration,
    pub parse_mode: ParseMode,
}

impl Default for NodeOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_NODE_TIMEOUT,
            parse_mode: ParseMode::Lenient,
        }
    }
}

/// A node's membership table split into its own entry and its friends
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembershipView {
    pub myself: NodeAttributes,
    pub friends: Vec<NodeAttributes>,
}

impl MembershipView {
    /// Split a parsed table. Exactly the `myself` entry becomes `myself`.
    pub fn from_table(node: &NodeAddress, table: Vec<NodeAttributes>) -> MeshResult<Self> {
        let (mut selves, friends): (Vec<_>, Vec<_>) =
            table.into_iter().partition(NodeAttributes::is_self);
        let myself = selves.pop().ok_or_else(|| {
            MeshError::protocol(node.to_string(), "no membership entry flagged myself")
        })?;
        if !selves.is_empty() {
            return Err(MeshError::protocol(
                node.to_string(),
                format!("{} membership entries flagged myself", selves.len() + 1),
            ));
        }
        Ok(Self { myself, friends })
    }
}

/// Connection to one live instance, owned for the duration of a reconciliation pass.
pub struct NodeHandle {
    address: NodeAddress,
    client: Box<dyn NodeClient>,
    options: NodeOptions,
}

impl fmt::Debug for NodeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeHandle")
            .field("address", &self.address)
            .field("options", &self.options)
            .finish()
    }
}

impl NodeHandle {
    pub fn new(address: NodeAddress, client: Box<dyn NodeClient>, options: NodeOptions) -> Self {
        Self {
            address,
            client,
            options,
        }
    }

    /// Address this handle dialed. Used as the meet target because a node that has
    /// not met anyone yet reports an empty host for itself.
    #[inline]
    pub fn address(&self) -> &NodeAddress {
        &self.address
    }

    pub fn options(&self) -> &NodeOptions {
        &self.options
    }

    /// Full membership table in server order, self included.
    pub async fn get_membership_table(
        &self,
        cancel: &CancellationToken,
    ) -> MeshResult<Vec<NodeAttributes>> {
        let raw = bounded(
            &self.address,
            "CLUSTER NODES",
            self.options.timeout,
            cancel,
            self.client.cluster_nodes(),
        )
        .await?;
        let table = parse_membership_table(&raw, self.options.parse_mode)?;
        debug!(node = %self.address, entries = table.len(), "Read membership table");
        Ok(table)
    }

    /// One round-trip returning both the self entry and the friends.
    pub async fn membership_view(&self, cancel: &CancellationToken) -> MeshResult<MembershipView> {
        let table = self.get_membership_table(cancel).await?;
        MembershipView::from_table(&self.address, table)
    }

    pub async fn get_self_attributes(
        &self,
        cancel: &CancellationToken,
    ) -> MeshResult<NodeAttributes> {
        let table = self.get_membership_table(cancel).await?;
        table
            .into_iter()
            .find(NodeAttributes::is_self)
            .ok_or_else(|| {
                MeshError::protocol(self.address.to_string(), "no membership entry flagged myself")
            })
    }

    /// Every known peer. Empty when the node has not met anyone.
    pub async fn get_friends(&self, cancel: &CancellationToken) -> MeshResult<Vec<NodeAttributes>> {
        let table = self.get_membership_table(cancel).await?;
        Ok(table.into_iter().filter(|node| !node.is_self()).collect())
    }

    /// Ask this node to open a gossip link to `other`. Meeting a known node is a no-op.
    pub async fn meet(&self, other: &NodeAddress, cancel: &CancellationToken) -> MeshResult<()> {
        bounded(
            &self.address,
            "CLUSTER MEET",
            self.options.timeout,
            cancel,
            self.client.cluster_meet(other),
        )
        .await?;
        debug!(node = %self.address, target = %other, "Issued cluster meet");
        Ok(())
    }

    pub async fn meet_node(&self, other: &NodeHandle, cancel: &CancellationToken) -> MeshResult<()> {
        self.meet(other.address(), cancel).await
    }
}

/// Run `fut` under a deadline, giving up early on cancellation.
pub(crate) async fn bounded<T, F>(
    node: &NodeAddress,
    operation: &str,
    timeout: Duration,
    cancel: &CancellationToken,
    fut: F,
) -> MeshResult<T>
where
    F: Future<Output = MeshResult<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(MeshError::Cancelled),
        result = tokio::time::timeout(timeout, fut) => match result {
            Ok(result) => result,
            Err(_) => Err(MeshError::communication(
                node.to_string(),
                format!("{operation} timed out after {timeout:?}"),
            )),
        },
    }
}
