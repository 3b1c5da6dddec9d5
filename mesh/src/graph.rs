//! Membership graph built from the tables reported by every live handle.
//!
//! Vertices are node ids seen anywhere, edges are "reporter lists peer as connected",
//! and components are taken over the undirected closure. The graph is rebuilt from
//! scratch on every pass.

use std::{
    collections::{BTreeMap, BTreeSet},
    time::Instant,
};

use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{
    address::NodeAddress,
    attributes::NodeAttributes,
    error::{MeshError, MeshResult},
    node::{MembershipView, NodeHandle},
};

/// One handle's answer (or failure) for a single build.
#[derive(Debug, Clone)]
pub struct Observation {
    /// Index of the reporting handle in the slice passed to the builder.
    pub handle: usize,
    pub address: NodeAddress,
    pub observed_at: Instant,
    pub result: MeshResult<MembershipView>,
}

/// A target that could not be queried this pass.
#[derive(Debug, Clone)]
pub struct Unreachable {
    pub address: NodeAddress,
    pub error: MeshError,
}

/// Union-find over dense indices with path halving and union by size.
struct DisjointSet {
    parent: Vec<usize>,
    size: Vec<usize>,
}

impl DisjointSet {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
            size: vec![1; n],
        }
    }

    fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }

    fn union(&mut self, a: usize, b: usize) {
        let (mut a, mut b) = (self.find(a), self.find(b));
        if a == b {
            return;
        }
        if self.size[a] < self.size[b] {
            std::mem::swap(&mut a, &mut b);
        }
        self.parent[b] = a;
        self.size[a] += self.size[b];
    }
}

#[derive(Debug, Clone, Default)]
pub struct MembershipGraph {
    vertices: BTreeMap<String, NodeAttributes>,
    edges: BTreeSet<(String, String)>,
    /// Self id of each reachable handle -> handle index.
    live: BTreeMap<String, usize>,
    live_addresses: BTreeMap<String, NodeAddress>,
    unreachable: Vec<Unreachable>,
    /// Largest first, ties broken by smallest member id.
    components: Vec<BTreeSet<String>>,
}

impl MembershipGraph {
    /// Assemble a graph from per-handle observations. When several records share an
    /// id, the one from the most recent observation wins.
    pub fn from_observations(mut observations: Vec<Observation>) -> Self {
        observations.sort_by_key(|o| o.observed_at);

        let mut graph = Self::default();
        for observation in observations {
            let view = match observation.result {
                Ok(view) => view,
                Err(error) => {
                    graph.unreachable.push(Unreachable {
                        address: observation.address,
                        error,
                    });
                    continue;
                }
            };

            let reporter = view.myself.id().to_string();
            if graph.live.contains_key(&reporter) {
                warn!(
                    id = %reporter,
                    node = %observation.address,
                    "Two targets report the same node id, keeping the first"
                );
            } else {
                graph.live.insert(reporter.clone(), observation.handle);
                graph
                    .live_addresses
                    .insert(reporter.clone(), observation.address);
            }

            for friend in &view.friends {
                if friend.is_connected() && friend.id() != reporter {
                    graph.edges.insert((reporter.clone(), friend.id().to_string()));
                }
            }
            graph.vertices.insert(reporter, view.myself);
            for friend in view.friends {
                graph.vertices.insert(friend.id().to_string(), friend);
            }
        }

        graph.unreachable.sort_by(|a, b| a.address.cmp(&b.address));
        graph.components = graph.compute_components();
        graph
    }

    fn compute_components(&self) -> Vec<BTreeSet<String>> {
        let index: BTreeMap<&str, usize> = self
            .vertices
            .keys()
            .enumerate()
            .map(|(i, id)| (id.as_str(), i))
            .collect();
        let mut sets = DisjointSet::new(index.len());
        for (from, to) in &self.edges {
            if let (Some(&a), Some(&b)) = (index.get(from.as_str()), index.get(to.as_str())) {
                sets.union(a, b);
            }
        }

        let mut groups: BTreeMap<usize, BTreeSet<String>> = BTreeMap::new();
        for (id, &i) in &index {
            let root = sets.find(i);
            groups.entry(root).or_default().insert((*id).to_string());
        }
        let mut components: Vec<BTreeSet<String>> = groups.into_values().collect();
        components.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.first().cmp(&b.first())));
        components
    }

    pub fn vertices(&self) -> &BTreeMap<String, NodeAttributes> {
        &self.vertices
    }

    pub fn vertex(&self, id: &str) -> Option<&NodeAttributes> {
        self.vertices.get(id)
    }

    pub fn edges(&self) -> &BTreeSet<(String, String)> {
        &self.edges
    }

    pub fn has_edge(&self, from: &str, to: &str) -> bool {
        self.edges.contains(&(from.to_string(), to.to_string()))
    }

    /// Every connected component, including ones made only of ids known second-hand.
    pub fn components(&self) -> &[BTreeSet<String>] {
        &self.components
    }

    pub fn unreachable(&self) -> &[Unreachable] {
        &self.unreachable
    }

    /// Ids of nodes answered by a handle this pass.
    pub fn live_ids(&self) -> impl Iterator<Item = &str> {
        self.live.keys().map(String::as_str)
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    pub fn is_live(&self, id: &str) -> bool {
        self.live.contains_key(id)
    }

    /// Index of the handle whose self id is `id`.
    pub fn handle_for(&self, id: &str) -> Option<usize> {
        self.live.get(id).copied()
    }

    /// Address the handle for `id` was dialed on.
    pub fn address_for(&self, id: &str) -> Option<&NodeAddress> {
        self.live_addresses.get(id)
    }

    /// Components restricted to live ids, dropping components with no live member.
    /// Same order as [`components`](Self::components).
    pub fn live_components(&self) -> Vec<BTreeSet<String>> {
        self.components
            .iter()
            .map(|component| {
                component
                    .iter()
                    .filter(|id| self.live.contains_key(id.as_str()))
                    .cloned()
                    .collect::<BTreeSet<_>>()
            })
            .filter(|component| !component.is_empty())
            .collect()
    }

    /// One component spans every reachable target.
    pub fn is_converged(&self) -> bool {
        self.live_components().len() <= 1
    }
}

/// Queries every handle concurrently and assembles a [`MembershipGraph`].
#[derive(Debug, Clone, Copy, Default)]
pub struct GraphBuilder;

impl GraphBuilder {
    pub async fn build(
        handles: &[NodeHandle],
        cancel: &CancellationToken,
    ) -> MeshResult<MembershipGraph> {
        let queries = handles.iter().enumerate().map(|(i, handle)| async move {
            let result = handle.membership_view(cancel).await;
            Observation {
                handle: i,
                address: handle.address().clone(),
                observed_at: Instant::now(),
                result,
            }
        });
        let observations = join_all(queries).await;

        if cancel.is_cancelled() {
            return Err(MeshError::Cancelled);
        }
        for observation in &observations {
            if let Err(err) = &observation.result {
                warn!(node = %observation.address, error = %err, "Node unreachable this pass");
            }
        }

        let graph = MembershipGraph::from_observations(observations);
        debug!(
            vertices = graph.vertices().len(),
            edges = graph.edges().len(),
            live = graph.live_count(),
            unreachable = graph.unreachable().len(),
            components = graph.components().len(),
            "Built membership graph"
        );
        Ok(graph)
    }
}
