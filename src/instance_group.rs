//! Backing instance group: one StatefulSet and headless Service per cluster.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::{
    apps::v1::StatefulSet,
    core::v1::{Pod, Service},
};
use kube::{
    api::{ListParams, Patch, PatchParams},
    Api, Client, Resource, ResourceExt,
};
use rco_mesh::NodeAddress;
use serde_json::{json, Value};
use tracing::debug;

use crate::{
    crd::RedisCluster,
    error::{OperatorError, OperatorResult},
};

pub const FIELD_MANAGER: &str = "redis-cluster-operator";
pub const NAME_LABEL: &str = "app.kubernetes.io/name";
pub const INSTANCE_LABEL: &str = "app.kubernetes.io/instance";
pub const APP_NAME: &str = "redis-cluster";

const CLUSTER_BUS_OFFSET: u16 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupStatus {
    pub desired: i32,
    /// Ready count as reported by the group controller; may lag pod readiness.
    pub ready: i32,
}

impl GroupStatus {
    /// The group controller has caught up with `desired` replicas.
    pub fn is_settled(&self, desired: i32) -> bool {
        self.desired == desired && self.ready >= desired
    }
}

/// Creates or adjusts the instances backing a cluster.
#[async_trait]
pub trait InstanceGroup: Send + Sync {
    async fn ensure(&self, cluster: &RedisCluster) -> OperatorResult<GroupStatus>;

    /// Addresses of instances that are ready to serve, in a stable order.
    async fn ready_instances(&self, cluster: &RedisCluster) -> OperatorResult<Vec<NodeAddress>>;
}

pub fn labels(cluster: &RedisCluster) -> BTreeMap<String, String> {
    BTreeMap::from([
        (NAME_LABEL.to_string(), APP_NAME.to_string()),
        (INSTANCE_LABEL.to_string(), cluster.name_any()),
    ])
}

pub fn label_selector(cluster: &RedisCluster) -> String {
    labels(cluster)
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

fn owner_reference(cluster: &RedisCluster) -> OperatorResult<Value> {
    let owner = cluster
        .controller_owner_ref(&())
        .ok_or_else(|| OperatorError::InvalidSpec("cluster object has no uid".to_string()))?;
    Ok(serde_json::to_value(owner)?)
}

pub fn statefulset_manifest(
    cluster: &RedisCluster,
    image_repository: &str,
    port: u16,
) -> OperatorResult<Value> {
    let name = cluster.name_any();
    let labels = labels(cluster);
    let bus_port = port + CLUSTER_BUS_OFFSET;

    Ok(json!({
        "apiVersion": "apps/v1",
        "kind": "StatefulSet",
        "metadata": {
            "name": name,
            "namespace": cluster.namespace(),
            "labels": labels,
            "ownerReferences": [owner_reference(cluster)?],
        },
        "spec": {
            "serviceName": name,
            "replicas": cluster.spec.replicas,
            "podManagementPolicy": "Parallel",
            "selector": { "matchLabels": labels },
            "template": {
                "metadata": { "labels": labels },
                "spec": {
                    "containers": [{
                        "name": "redis",
                        "image": cluster.spec.image_ref(image_repository),
                        "command": ["redis-server"],
                        "args": [
                            "--port", port.to_string(),
                            "--cluster-enabled", "yes",
                            "--cluster-config-file", "nodes.conf",
                            "--cluster-node-timeout", "5000",
                        ],
                        "ports": [
                            { "name": "redis", "containerPort": port },
                            { "name": "cluster-bus", "containerPort": bus_port },
                        ],
                        "readinessProbe": {
                            "tcpSocket": { "port": port },
                            "periodSeconds": 5,
                        },
                    }],
                },
            },
        },
    }))
}

/// Headless service giving the StatefulSet's pods stable DNS names.
pub fn service_manifest(cluster: &RedisCluster, port: u16) -> OperatorResult<Value> {
    let labels = labels(cluster);
    Ok(json!({
        "apiVersion": "v1",
        "kind": "Service",
        "metadata": {
            "name": cluster.name_any(),
            "namespace": cluster.namespace(),
            "labels": labels,
            "ownerReferences": [owner_reference(cluster)?],
        },
        "spec": {
            "clusterIP": "None",
            "publishNotReadyAddresses": true,
            "selector": labels,
            "ports": [
                { "name": "redis", "port": port },
                { "name": "cluster-bus", "port": port + CLUSTER_BUS_OFFSET },
            ],
        },
    }))
}

/// Client address of a pod that is Ready and has an IP.
pub fn pod_address(pod: &Pod, port: u16) -> Option<NodeAddress> {
    if pod.metadata.deletion_timestamp.is_some() {
        return None;
    }
    let status = pod.status.as_ref()?;
    let ready = status
        .conditions
        .as_ref()?
        .iter()
        .any(|c| c.type_ == "Ready" && c.status == "True");
    if !ready {
        return None;
    }
    let ip = status.pod_ip.as_deref().filter(|ip| !ip.is_empty())?;
    Some(NodeAddress::new(ip, port))
}

#[derive(Clone)]
pub struct KubeInstanceGroup {
    client: Client,
    image_repository: String,
    port: u16,
}

impl KubeInstanceGroup {
    pub fn new(client: Client, image_repository: impl Into<String>, port: u16) -> Self {
        Self {
            client,
            image_repository: image_repository.into(),
            port,
        }
    }

    fn namespace(cluster: &RedisCluster) -> String {
        cluster.namespace().unwrap_or_else(|| "default".to_string())
    }
}

#[async_trait]
impl InstanceGroup for KubeInstanceGroup {
    async fn ensure(&self, cluster: &RedisCluster) -> OperatorResult<GroupStatus> {
        let namespace = Self::namespace(cluster);
        let name = cluster.name_any();
        let params = PatchParams::apply(FIELD_MANAGER).force();

        let service = service_manifest(cluster, self.port)?;
        Api::<Service>::namespaced(self.client.clone(), &namespace)
            .patch(&name, &params, &Patch::Apply(&service))
            .await
            .map_err(OperatorError::orchestration)?;

        let manifest = statefulset_manifest(cluster, &self.image_repository, self.port)?;
        let applied = Api::<StatefulSet>::namespaced(self.client.clone(), &namespace)
            .patch(&name, &params, &Patch::Apply(&manifest))
            .await
            .map_err(OperatorError::orchestration)?;

        let ready = applied
            .status
            .as_ref()
            .and_then(|s| s.ready_replicas)
            .unwrap_or(0);
        debug!(
            cluster = %name,
            namespace = %namespace,
            desired = cluster.spec.replicas,
            ready,
            "Applied instance group"
        );
        Ok(GroupStatus {
            desired: cluster.spec.replicas,
            ready,
        })
    }

    async fn ready_instances(&self, cluster: &RedisCluster) -> OperatorResult<Vec<NodeAddress>> {
        let namespace = Self::namespace(cluster);
        let params = ListParams::default().labels(&label_selector(cluster));
        let mut pods = Api::<Pod>::namespaced(self.client.clone(), &namespace)
            .list(&params)
            .await
            .map_err(OperatorError::enumeration)?
            .items;
        pods.sort_by_key(|pod| pod.name_any());

        let total = pods.len();
        let ready: Vec<NodeAddress> = pods
            .iter()
            .filter_map(|pod| pod_address(pod, self.port))
            .collect();
        debug!(cluster = %cluster.name_any(), pods = total, ready = ready.len(), "Listed instances");
        Ok(ready)
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::{
        api::core::v1::{PodCondition, PodStatus},
        apimachinery::pkg::apis::meta::v1::ObjectMeta,
    };

    use super::*;
    use crate::crd::RedisClusterSpec;

    fn cluster() -> RedisCluster {
        let mut cluster = RedisCluster::new(
            "redis-cluster",
            RedisClusterSpec {
                replicas: 6,
                ..Default::default()
            },
        );
        cluster.metadata.namespace = Some("default".to_string());
        cluster.metadata.uid = Some("0b5e5b44-8f1a-4d4e-9d7e-2f1c3a6b9c01".to_string());
        cluster
    }

    fn pod(name: &str, ip: Option<&str>, ready: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            status: Some(PodStatus {
                pod_ip: ip.map(str::to_string),
                conditions: Some(vec![PodCondition {
                    type_: "Ready".to_string(),
                    status: ready.to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_statefulset_manifest() {
        let manifest = statefulset_manifest(&cluster(), "redis", 6379).unwrap();
        assert_eq!(manifest["metadata"]["name"], "redis-cluster");
        assert_eq!(manifest["spec"]["replicas"], 6);
        assert_eq!(
            manifest["spec"]["selector"]["matchLabels"][INSTANCE_LABEL],
            "redis-cluster"
        );
        assert_eq!(manifest["metadata"]["ownerReferences"][0]["kind"], "RedisCluster");
        assert_eq!(manifest["metadata"]["ownerReferences"][0]["controller"], true);

        let container = &manifest["spec"]["template"]["spec"]["containers"][0];
        assert_eq!(container["image"], "redis:7.2");
        let args: Vec<&str> = container["args"]
            .as_array()
            .unwrap()
            .iter()
            .map(|a| a.as_str().unwrap())
            .collect();
        assert!(args.windows(2).any(|w| w == ["--cluster-enabled", "yes"]));
        assert_eq!(container["ports"][1]["containerPort"], 16379);
    }

    #[test]
    fn test_manifest_requires_uid() {
        let mut cluster = cluster();
        cluster.metadata.uid = None;
        let err = statefulset_manifest(&cluster, "redis", 6379).unwrap_err();
        assert!(matches!(err, OperatorError::InvalidSpec(_)));
    }

    #[test]
    fn test_group_settles_once_controller_catches_up() {
        let lagging = GroupStatus {
            desired: 6,
            ready: 4,
        };
        assert!(!lagging.is_settled(6));
        let stale_spec = GroupStatus {
            desired: 3,
            ready: 3,
        };
        assert!(!stale_spec.is_settled(6));
        let settled = GroupStatus {
            desired: 6,
            ready: 6,
        };
        assert!(settled.is_settled(6));
    }

    #[test]
    fn test_service_is_headless() {
        let manifest = service_manifest(&cluster(), 6379).unwrap();
        assert_eq!(manifest["spec"]["clusterIP"], "None");
        assert_eq!(manifest["spec"]["selector"][NAME_LABEL], APP_NAME);
    }

    #[test]
    fn test_label_selector() {
        assert_eq!(
            label_selector(&cluster()),
            "app.kubernetes.io/instance=redis-cluster,app.kubernetes.io/name=redis-cluster"
        );
    }

    #[test]
    fn test_pod_readiness_filter() {
        assert_eq!(
            pod_address(&pod("redis-cluster-0", Some("10.244.0.156"), "True"), 6379),
            Some(NodeAddress::new("10.244.0.156", 6379))
        );
        assert_eq!(pod_address(&pod("redis-cluster-1", Some("10.244.0.218"), "False"), 6379), None);
        assert_eq!(pod_address(&pod("redis-cluster-2", None, "True"), 6379), None);

        let mut terminating = pod("redis-cluster-3", Some("10.244.0.160"), "True");
        terminating.metadata.deletion_timestamp =
            Some(serde_json::from_value(serde_json::json!("2024-05-12T16:41:56Z")).unwrap());
        assert_eq!(pod_address(&terminating, 6379), None);
    }
}
