//! Shared fixtures for operator integration tests.

#![allow(dead_code)]

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Once,
    },
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use rco::{
    DesiredStateStore, GroupStatus, InstanceGroup, ObjectKey, OperatorError, OperatorResult,
    Reconciler, RedisCluster, RedisClusterSpec, RedisClusterStatus, RequeuePolicy,
};
use rco_mesh::{test_utils::SimCluster, ConvergenceConfig, ConvergenceEngine, NodeAddress};
use tracing_subscriber::{
    filter::LevelFilter, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter,
};

static INIT: Once = Once::new();

pub fn init_test_logging() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::registry()
            .with(tracing_subscriber::fmt::layer().with_test_writer())
            .with(
                EnvFilter::builder()
                    .with_default_directive(LevelFilter::INFO.into())
                    .from_env_lossy(),
            )
            .try_init();
    });
}

pub const NAMESPACE: &str = "default";
pub const NAME: &str = "redis-cluster";

pub fn key() -> ObjectKey {
    ObjectKey::new(NAMESPACE, NAME)
}

pub fn cluster(replicas: i32) -> RedisCluster {
    let mut cluster = RedisCluster::new(
        NAME,
        RedisClusterSpec {
            replicas,
            ..Default::default()
        },
    );
    cluster.metadata.namespace = Some(NAMESPACE.to_string());
    cluster.metadata.uid = Some("3c1d7f0e-5a7b-4f1e-8b1a-0d9e6c2b4a11".to_string());
    cluster.metadata.generation = Some(1);
    cluster
}

/// In-memory desired-state store that applies published status to the object.
#[derive(Default)]
pub struct FakeStore {
    object: Mutex<Option<RedisCluster>>,
    published: Mutex<Vec<RedisClusterStatus>>,
}

impl FakeStore {
    pub fn with(cluster: RedisCluster) -> Self {
        Self {
            object: Mutex::new(Some(cluster)),
            published: Mutex::new(Vec::new()),
        }
    }

    pub fn published(&self) -> Vec<RedisClusterStatus> {
        self.published.lock().clone()
    }

    pub fn current_status(&self) -> Option<RedisClusterStatus> {
        self.object.lock().as_ref().and_then(|c| c.status.clone())
    }

    pub fn set_replicas(&self, replicas: i32) {
        if let Some(cluster) = self.object.lock().as_mut() {
            cluster.spec.replicas = replicas;
            cluster.metadata.generation = cluster.metadata.generation.map(|g| g + 1);
        }
    }
}

#[async_trait]
impl DesiredStateStore for FakeStore {
    async fn get(&self, key: &ObjectKey) -> OperatorResult<Option<RedisCluster>> {
        let object = self.object.lock();
        Ok(object
            .as_ref()
            .filter(|c| c.metadata.name.as_deref() == Some(key.name.as_str()))
            .cloned())
    }

    async fn publish_status(
        &self,
        _key: &ObjectKey,
        status: &RedisClusterStatus,
    ) -> OperatorResult<()> {
        if let Some(cluster) = self.object.lock().as_mut() {
            cluster.status = Some(status.clone());
        }
        self.published.lock().push(status.clone());
        Ok(())
    }
}

/// Instance group whose ready set is a prefix of the simulated cluster.
pub struct FakeGroup {
    sim: SimCluster,
    ready: Mutex<Option<usize>>,
    group_ready: Mutex<Option<i32>>,
    fail_ensure: Mutex<bool>,
    fail_list: Mutex<bool>,
    ensure_calls: AtomicUsize,
}

impl FakeGroup {
    pub fn new(sim: SimCluster) -> Self {
        Self {
            sim,
            ready: Mutex::new(None),
            group_ready: Mutex::new(None),
            fail_ensure: Mutex::new(false),
            fail_list: Mutex::new(false),
            ensure_calls: AtomicUsize::new(0),
        }
    }

    /// Only the first `n` instances are ready. `None` means all.
    pub fn set_ready(&self, n: Option<usize>) {
        *self.ready.lock() = n;
    }

    /// Ready count the group controller reports. `None` means all desired replicas.
    pub fn set_group_ready(&self, ready: Option<i32>) {
        *self.group_ready.lock() = ready;
    }

    pub fn set_fail_ensure(&self, fail: bool) {
        *self.fail_ensure.lock() = fail;
    }

    pub fn set_fail_list(&self, fail: bool) {
        *self.fail_list.lock() = fail;
    }

    pub fn ensure_calls(&self) -> usize {
        self.ensure_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl InstanceGroup for FakeGroup {
    async fn ensure(&self, cluster: &RedisCluster) -> OperatorResult<GroupStatus> {
        self.ensure_calls.fetch_add(1, Ordering::SeqCst);
        if *self.fail_ensure.lock() {
            return Err(OperatorError::orchestration("statefulset apply rejected"));
        }
        Ok(GroupStatus {
            desired: cluster.spec.replicas,
            ready: self.group_ready.lock().unwrap_or(cluster.spec.replicas),
        })
    }

    async fn ready_instances(&self, _cluster: &RedisCluster) -> OperatorResult<Vec<NodeAddress>> {
        if *self.fail_list.lock() {
            return Err(OperatorError::enumeration("pods is forbidden"));
        }
        let mut addresses = self.sim.addresses();
        if let Some(n) = *self.ready.lock() {
            addresses.truncate(n);
        }
        Ok(addresses)
    }
}

pub fn policy() -> RequeuePolicy {
    RequeuePolicy::default()
}

pub fn engine() -> ConvergenceEngine {
    ConvergenceEngine::new(ConvergenceConfig {
        max_passes: 3,
        pass_delay: Duration::from_millis(100),
        max_concurrent_meets: 4,
    })
}

pub struct Harness {
    pub store: Arc<FakeStore>,
    pub group: Arc<FakeGroup>,
    pub sim: SimCluster,
    pub reconciler: Reconciler,
}

impl Harness {
    pub fn new(cluster: Option<RedisCluster>, sim: SimCluster) -> Self {
        init_test_logging();
        let store = Arc::new(match cluster {
            Some(cluster) => FakeStore::with(cluster),
            None => FakeStore::default(),
        });
        let group = Arc::new(FakeGroup::new(sim.clone()));
        let reconciler = Reconciler::new(
            store.clone(),
            group.clone(),
            Arc::new(sim.clone()),
            engine(),
            policy(),
        );
        Self {
            store,
            group,
            sim,
            reconciler,
        }
    }
}
