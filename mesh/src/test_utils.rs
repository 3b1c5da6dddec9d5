//! In-memory simulated cluster for tests.
//!
//! Each simulated node keeps the set of peers it knows. `CLUSTER NODES` is rendered
//! from that set in the server's wire format, and `CLUSTER MEET` links the two nodes
//! (and, with gossip enabled, the whole merged component).

use std::{
    collections::{BTreeSet, VecDeque},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::{
    address::NodeAddress,
    connector::NodeConnector,
    error::{MeshError, MeshResult},
    node::{bounded, NodeClient, NodeHandle, NodeOptions},
};

pub const SIM_PORT: u16 = 6379;

#[derive(Debug, Clone)]
struct SimNode {
    id: String,
    address: NodeAddress,
    known: BTreeSet<usize>,
    reachable: bool,
    meet_fails: bool,
}

#[derive(Debug, Default)]
struct SimState {
    nodes: Vec<SimNode>,
    gossip: bool,
    meets: usize,
    delay: Option<Duration>,
}

impl SimState {
    fn index_of(&self, address: &NodeAddress) -> Option<usize> {
        self.nodes.iter().position(|n| &n.address == address)
    }

    fn link(&mut self, a: usize, b: usize) {
        if a == b {
            return;
        }
        self.nodes[a].known.insert(b);
        self.nodes[b].known.insert(a);
        if self.gossip {
            self.spread(a);
        }
    }

    /// Everyone reachable from `start` learns about everyone else in its component.
    fn spread(&mut self, start: usize) {
        let mut seen = BTreeSet::from([start]);
        let mut queue = VecDeque::from([start]);
        while let Some(i) = queue.pop_front() {
            for &j in &self.nodes[i].known {
                if seen.insert(j) {
                    queue.push_back(j);
                }
            }
        }
        for &i in &seen {
            self.nodes[i].known = seen.iter().copied().filter(|&j| j != i).collect();
        }
    }

    fn render(&self, index: usize) -> String {
        let node = &self.nodes[index];
        let mut out = String::new();
        // a node that has not met anyone does not know its own address yet
        let own_host = if node.known.is_empty() {
            ""
        } else {
            node.address.host()
        };
        out.push_str(&format!(
            "{} {}:{}@{} myself,master - 0 0 0 connected\n",
            node.id,
            own_host,
            node.address.port(),
            node.address.port() + 10000
        ));
        for &peer in &node.known {
            let peer = &self.nodes[peer];
            out.push_str(&format!(
                "{} {}:{}@{} master - 0 0 0 connected\n",
                peer.id,
                peer.address.host(),
                peer.address.port(),
                peer.address.port() + 10000
            ));
        }
        out
    }
}

/// Shared handle to a simulated cluster. Clones observe the same state.
#[derive(Debug, Clone)]
pub struct SimCluster {
    state: Arc<Mutex<SimState>>,
    options: NodeOptions,
}

impl SimCluster {
    /// `n` isolated nodes with gossip propagation enabled.
    pub fn new(n: usize) -> Self {
        let nodes = (0..n)
            .map(|i| SimNode {
                id: format!("{:040x}", i + 1),
                address: NodeAddress::new(format!("10.244.0.{}", i + 1), SIM_PORT),
                known: BTreeSet::new(),
                reachable: true,
                meet_fails: false,
            })
            .collect();
        Self {
            state: Arc::new(Mutex::new(SimState {
                nodes,
                gossip: true,
                meets: 0,
                delay: None,
            })),
            options: NodeOptions::default(),
        }
    }

    /// `n` nodes that already form a full mesh.
    pub fn meshed(n: usize) -> Self {
        let sim = Self::new(n);
        {
            let mut state = sim.state.lock();
            for (i, node) in state.nodes.iter_mut().enumerate() {
                node.known = (0..n).filter(|&j| j != i).collect();
            }
        }
        sim
    }

    pub fn with_options(mut self, options: NodeOptions) -> Self {
        self.options = options;
        self
    }

    pub fn len(&self) -> usize {
        self.state.lock().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn addresses(&self) -> Vec<NodeAddress> {
        self.state
            .lock()
            .nodes
            .iter()
            .map(|n| n.address.clone())
            .collect()
    }

    pub fn ids(&self) -> Vec<String> {
        self.state.lock().nodes.iter().map(|n| n.id.clone()).collect()
    }

    /// Add a node and return its address.
    pub fn add_node(&self) -> NodeAddress {
        let mut state = self.state.lock();
        let i = state.nodes.len();
        let address = NodeAddress::new(format!("10.244.0.{}", i + 1), SIM_PORT);
        state.nodes.push(SimNode {
            id: format!("{:040x}", i + 1),
            address: address.clone(),
            known: BTreeSet::new(),
            reachable: true,
            meet_fails: false,
        });
        address
    }

    /// Mutually introduce two nodes by index.
    pub fn link(&self, a: usize, b: usize) {
        self.state.lock().link(a, b);
    }

    pub fn set_gossip(&self, enabled: bool) {
        self.state.lock().gossip = enabled;
    }

    pub fn set_unreachable(&self, address: &NodeAddress, unreachable: bool) {
        let mut state = self.state.lock();
        if let Some(i) = state.index_of(address) {
            state.nodes[i].reachable = !unreachable;
        }
    }

    pub fn set_meet_failure(&self, address: &NodeAddress, fails: bool) {
        let mut state = self.state.lock();
        if let Some(i) = state.index_of(address) {
            state.nodes[i].meet_fails = fails;
        }
    }

    /// Delay applied before every reply.
    pub fn set_delay(&self, delay: Option<Duration>) {
        self.state.lock().delay = delay;
    }

    /// Successful meets that changed or confirmed a link.
    pub fn meet_count(&self) -> usize {
        self.state.lock().meets
    }

    /// Number of peers node `index` knows.
    pub fn known_by(&self, index: usize) -> usize {
        self.state.lock().nodes[index].known.len()
    }

    /// Raw `CLUSTER NODES` reply of node `index`.
    pub fn render(&self, index: usize) -> String {
        self.state.lock().render(index)
    }

    /// Whether every node knows every other node.
    pub fn is_full_mesh(&self) -> bool {
        let state = self.state.lock();
        let n = state.nodes.len();
        state.nodes.iter().all(|node| node.known.len() + 1 == n)
    }
}

struct SimClient {
    state: Arc<Mutex<SimState>>,
    index: usize,
}

impl SimClient {
    async fn pause(&self) {
        let delay = self.state.lock().delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    fn unreachable(&self, state: &SimState) -> Option<MeshError> {
        let node = &state.nodes[self.index];
        (!node.reachable)
            .then(|| MeshError::communication(node.address.to_string(), "connection refused"))
    }
}

#[async_trait]
impl NodeClient for SimClient {
    async fn cluster_nodes(&self) -> MeshResult<String> {
        self.pause().await;
        let state = self.state.lock();
        if let Some(err) = self.unreachable(&state) {
            return Err(err);
        }
        Ok(state.render(self.index))
    }

    async fn cluster_meet(&self, target: &NodeAddress) -> MeshResult<()> {
        self.pause().await;
        let mut state = self.state.lock();
        if let Some(err) = self.unreachable(&state) {
            return Err(err);
        }
        let source = &state.nodes[self.index];
        if source.meet_fails {
            return Err(MeshError::communication(
                source.address.to_string(),
                "ERR meet rejected",
            ));
        }
        let Some(peer) = state.index_of(target) else {
            return Err(MeshError::communication(
                state.nodes[self.index].address.to_string(),
                format!("ERR Invalid node address specified: {target}"),
            ));
        };
        state.meets += 1;
        state.link(self.index, peer);
        Ok(())
    }
}

#[async_trait]
impl NodeConnector for SimCluster {
    async fn connect(
        &self,
        address: &NodeAddress,
        cancel: &CancellationToken,
    ) -> MeshResult<NodeHandle> {
        let state = self.state.clone();
        let index = bounded(address, "connect", self.options.timeout, cancel, async {
            let state = state.lock();
            match state.index_of(address) {
                Some(i) if state.nodes[i].reachable => Ok(i),
                _ => Err(MeshError::communication(
                    address.to_string(),
                    "connection refused",
                )),
            }
        })
        .await?;

        Ok(NodeHandle::new(
            address.clone(),
            Box::new(SimClient {
                state: self.state.clone(),
                index,
            }),
            self.options.clone(),
        ))
    }
}
