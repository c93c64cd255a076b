//! Kubernetes workload sampler
//!
//! A client is built lazily from in-cluster credentials (empty config path)
//! or from a kubeconfig file, and reused until the configured path changes.
//! Pods are cross-referenced with `metrics.k8s.io/v1beta1` PodMetrics to
//! produce one row per container; Deployments, DaemonSets and StatefulSets
//! are flattened into uniform controller rows.

use chrono::{DateTime, Utc};
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{Container, Pod};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::api::{Api, ApiResource, DynamicObject, GroupVersionKind, ListParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::SamplerError;

const NO_CONTROLLER: &str = "none";

/// One row of the `k8s` source
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerResource {
    pub namespace: String,
    pub pod_name: String,
    pub controller_name: String,
    pub container: String,
    pub limit_cpu: f64,
    pub limit_memory: i64,
    pub request_cpu: f64,
    pub request_memory: i64,
    pub use_cpu: f64,
    pub use_memory: i64,
    pub restart_count: i32,
    /// Minutes since the previous instance terminated, 0 under one minute
    pub last_termination_time: i64,
}

/// One row of the `k8sController` source
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ControllerResource {
    pub namespace: String,
    /// Controller object name
    pub container: String,
    #[serde(rename = "controllerType")]
    pub controller_type: String,
    pub replicas: i32,
    #[serde(rename = "status_replicas_available")]
    pub available: i32,
    #[serde(rename = "status_replicas_unavailable")]
    pub unavailable: i32,
}

#[derive(Debug, Deserialize)]
struct PodMetricsData {
    #[serde(default)]
    containers: Vec<ContainerMetrics>,
}

#[derive(Debug, Deserialize)]
struct ContainerMetrics {
    name: String,
    #[serde(default)]
    usage: BTreeMap<String, Quantity>,
}

/// Live usage keyed by (namespace, pod, container): (cores, bytes)
pub type UsageIndex = HashMap<(String, String, String), (f64, i64)>;

/// Parse a Kubernetes quantity (`250m`, `1.5`, `512Mi`, `1e3`, `2G`) into base units
pub fn parse_quantity(quantity: &str) -> Option<f64> {
    let s = quantity.trim();
    if s.is_empty() || !s.is_ascii() {
        return None;
    }

    const BINARY: [(&str, f64); 6] = [
        ("Ki", 1024.0),
        ("Mi", 1_048_576.0),
        ("Gi", 1_073_741_824.0),
        ("Ti", 1_099_511_627_776.0),
        ("Pi", 1_125_899_906_842_624.0),
        ("Ei", 1_152_921_504_606_846_976.0),
    ];
    for (suffix, multiplier) in BINARY {
        if let Some(number) = s.strip_suffix(suffix) {
            return number.parse::<f64>().ok().map(|v| v * multiplier);
        }
    }

    // Plain numbers and decimal exponents ("1e3")
    if let Ok(value) = s.parse::<f64>() {
        return Some(value);
    }

    let (number, suffix) = s.split_at(s.len() - 1);
    let multiplier = match suffix {
        "n" => 1e-9,
        "u" => 1e-6,
        "m" => 1e-3,
        "k" => 1e3,
        "M" => 1e6,
        "G" => 1e9,
        "T" => 1e12,
        "P" => 1e15,
        "E" => 1e18,
        _ => return None,
    };
    number.parse::<f64>().ok().map(|v| v * multiplier)
}

fn cores(quantity: Option<&Quantity>) -> f64 {
    quantity.and_then(|q| parse_quantity(&q.0)).unwrap_or(0.0)
}

fn bytes(quantity: Option<&Quantity>) -> i64 {
    quantity
        .and_then(|q| parse_quantity(&q.0))
        .map(|v| v.round() as i64)
        .unwrap_or(0)
}

fn controller_name(pod: &Pod) -> String {
    pod.metadata
        .owner_references
        .iter()
        .flatten()
        .find(|owner| matches!(owner.kind.as_str(), "ReplicaSet" | "Deployment" | "StatefulSet"))
        .map(|owner| owner.name.clone())
        .unwrap_or_else(|| NO_CONTROLLER.to_string())
}

fn container_row(pod: &Pod, container: &Container, usage: &UsageIndex, now: DateTime<Utc>) -> ContainerResource {
    let namespace = pod.metadata.namespace.clone().unwrap_or_default();
    let pod_name = pod.metadata.name.clone().unwrap_or_default();

    let resources = container.resources.as_ref();
    let limits = resources.and_then(|r| r.limits.as_ref());
    let requests = resources.and_then(|r| r.requests.as_ref());

    let (use_cpu, use_memory) = usage
        .get(&(namespace.clone(), pod_name.clone(), container.name.clone()))
        .copied()
        .unwrap_or((0.0, 0));

    let status = pod
        .status
        .as_ref()
        .and_then(|s| s.container_statuses.as_ref())
        .and_then(|statuses| statuses.iter().find(|s| s.name == container.name));

    let restart_count = status.map(|s| s.restart_count).unwrap_or(0);
    let last_termination_time = status
        .and_then(|s| s.last_state.as_ref())
        .and_then(|state| state.terminated.as_ref())
        .and_then(|terminated| terminated.finished_at.as_ref())
        .map(|finished| (now - finished.0).num_minutes().max(0))
        .unwrap_or(0);

    ContainerResource {
        namespace,
        pod_name,
        controller_name: controller_name(pod),
        container: container.name.clone(),
        limit_cpu: cores(limits.and_then(|l| l.get("cpu"))),
        limit_memory: bytes(limits.and_then(|l| l.get("memory"))),
        request_cpu: cores(requests.and_then(|r| r.get("cpu"))),
        request_memory: bytes(requests.and_then(|r| r.get("memory"))),
        use_cpu,
        use_memory,
        restart_count,
        last_termination_time,
    }
}

/// One row per container across every pod
pub fn container_rows(pods: &[Pod], usage: &UsageIndex, now: DateTime<Utc>) -> Vec<ContainerResource> {
    pods.iter()
        .flat_map(|pod| {
            pod.spec
                .iter()
                .flat_map(|spec| spec.containers.iter())
                .map(move |container| container_row(pod, container, usage, now))
        })
        .collect()
}

fn object_key(metadata: &k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta) -> (String, String) {
    (
        metadata.namespace.clone().unwrap_or_default(),
        metadata.name.clone().unwrap_or_default(),
    )
}

pub fn deployment_row(deployment: &Deployment) -> ControllerResource {
    let (namespace, name) = object_key(&deployment.metadata);
    let replicas = deployment.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
    let status = deployment.status.as_ref();
    let available = status.and_then(|s| s.available_replicas).unwrap_or(0);
    let unavailable = status
        .and_then(|s| s.unavailable_replicas)
        .unwrap_or_else(|| (replicas - available).max(0));
    ControllerResource {
        namespace,
        container: name,
        controller_type: "Deployment".to_string(),
        replicas,
        available,
        unavailable,
    }
}

pub fn daemon_set_row(daemon_set: &DaemonSet) -> ControllerResource {
    let (namespace, name) = object_key(&daemon_set.metadata);
    let status = daemon_set.status.as_ref();
    let replicas = status.map(|s| s.desired_number_scheduled).unwrap_or(0);
    let available = status.and_then(|s| s.number_available).unwrap_or(0);
    let unavailable = status
        .and_then(|s| s.number_unavailable)
        .unwrap_or_else(|| (replicas - available).max(0));
    ControllerResource {
        namespace,
        container: name,
        controller_type: "DaemonSet".to_string(),
        replicas,
        available,
        unavailable,
    }
}

pub fn stateful_set_row(stateful_set: &StatefulSet) -> ControllerResource {
    let (namespace, name) = object_key(&stateful_set.metadata);
    let replicas = stateful_set.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
    let status = stateful_set.status.as_ref();
    let ready = status.and_then(|s| s.ready_replicas).unwrap_or(0);
    let current = status.map(|s| s.replicas).unwrap_or(0);
    ControllerResource {
        namespace,
        container: name,
        controller_type: "StatefulSet".to_string(),
        replicas,
        available: ready,
        unavailable: (current - ready).max(0),
    }
}

/// Cluster client cached per kubeconfig path
#[derive(Default)]
pub struct KubeClients {
    cached: RwLock<Option<(String, Client)>>,
}

impl KubeClients {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn client(&self, config_path: &str) -> Result<Client, SamplerError> {
        if let Some((path, client)) = self.cached.read().await.as_ref() {
            if path == config_path {
                return Ok(client.clone());
            }
        }

        let mut cached = self.cached.write().await;
        if let Some((path, client)) = cached.as_ref() {
            if path == config_path {
                return Ok(client.clone());
            }
        }

        let client = build_client(config_path).await?;
        info!(
            config_path = if config_path.is_empty() { "<in-cluster>" } else { config_path },
            "Kubernetes client initialized"
        );
        *cached = Some((config_path.to_string(), client.clone()));
        Ok(client)
    }
}

async fn build_client(config_path: &str) -> Result<Client, SamplerError> {
    let config = if config_path.is_empty() {
        Config::incluster().map_err(|e| SamplerError::KubeConfig(e.to_string()))?
    } else {
        let kubeconfig = Kubeconfig::read_from(config_path).map_err(|e| SamplerError::KubeConfig(e.to_string()))?;
        Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .map_err(|e| SamplerError::KubeConfig(e.to_string()))?
    };
    Ok(Client::try_from(config)?)
}

async fn pod_usage(client: Client) -> Result<UsageIndex, SamplerError> {
    let gvk = GroupVersionKind::gvk("metrics.k8s.io", "v1beta1", "PodMetrics");
    let resource = ApiResource::from_gvk_with_plural(&gvk, "pods");
    let api: Api<DynamicObject> = Api::all_with(client, &resource);

    let mut index = UsageIndex::new();
    for object in api.list(&ListParams::default()).await?.items {
        let namespace = object.metadata.namespace.clone().unwrap_or_default();
        let pod = object.metadata.name.clone().unwrap_or_default();
        let data: PodMetricsData = serde_json::from_value(object.data)
            .map_err(|e| SamplerError::Format(format!("PodMetrics {namespace}/{pod}: {e}")))?;
        for container in data.containers {
            let usage = (cores(container.usage.get("cpu")), bytes(container.usage.get("memory")));
            index.insert((namespace.clone(), pod.clone(), container.name), usage);
        }
    }
    Ok(index)
}

pub async fn collect_containers(client: Client) -> Result<Vec<ContainerResource>, SamplerError> {
    let pods = Api::<Pod>::all(client.clone()).list(&ListParams::default()).await?;
    let usage = pod_usage(client).await?;
    let rows = container_rows(&pods.items, &usage, Utc::now());
    debug!(pods = pods.items.len(), rows = rows.len(), "Container resources collected");
    Ok(rows)
}

pub async fn collect_controllers(client: Client) -> Result<Vec<ControllerResource>, SamplerError> {
    let params = ListParams::default();
    let deployments = Api::<Deployment>::all(client.clone()).list(&params).await?;
    let daemon_sets = Api::<DaemonSet>::all(client.clone()).list(&params).await?;
    let stateful_sets = Api::<StatefulSet>::all(client).list(&params).await?;

    let rows: Vec<ControllerResource> = deployments
        .items
        .iter()
        .map(deployment_row)
        .chain(daemon_sets.items.iter().map(daemon_set_row))
        .chain(stateful_sets.items.iter().map(stateful_set_row))
        .collect();
    debug!(rows = rows.len(), "Controller resources collected");
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn test_parse_quantity() {
        assert_eq!(parse_quantity("250m"), Some(0.25));
        assert_eq!(parse_quantity("2"), Some(2.0));
        assert_eq!(parse_quantity("1.5"), Some(1.5));
        assert_eq!(parse_quantity("512Mi"), Some(536_870_912.0));
        assert_eq!(parse_quantity("1Gi"), Some(1_073_741_824.0));
        assert_eq!(parse_quantity("2G"), Some(2e9));
        assert_eq!(parse_quantity("1e3"), Some(1000.0));
        assert_eq!(parse_quantity("1E"), Some(1e18));
        assert!((parse_quantity("150000000n").unwrap() - 0.15).abs() < 1e-12);
        assert_eq!(parse_quantity(""), None);
        assert_eq!(parse_quantity("12Q"), None);
    }

    #[test]
    fn test_deployment_flattening() {
        let deployment: Deployment = serde_json::from_value(json!({
            "metadata": { "name": "api", "namespace": "prod" },
            "spec": {
                "replicas": 3,
                "selector": {},
                "template": {}
            },
            "status": { "availableReplicas": 2 }
        }))
        .unwrap();

        assert_eq!(
            deployment_row(&deployment),
            ControllerResource {
                namespace: "prod".into(),
                container: "api".into(),
                controller_type: "Deployment".into(),
                replicas: 3,
                available: 2,
                unavailable: 1,
            }
        );
    }

    #[test]
    fn test_deployment_prefers_reported_unavailable() {
        let deployment: Deployment = serde_json::from_value(json!({
            "metadata": { "name": "api", "namespace": "prod" },
            "spec": { "replicas": 3, "selector": {}, "template": {} },
            "status": { "availableReplicas": 2, "unavailableReplicas": 2 }
        }))
        .unwrap();
        assert_eq!(deployment_row(&deployment).unavailable, 2);
    }

    #[test]
    fn test_daemon_set_and_stateful_set_rows() {
        let daemon_set: DaemonSet = serde_json::from_value(json!({
            "metadata": { "name": "node-exporter", "namespace": "monitoring" },
            "status": {
                "desiredNumberScheduled": 5,
                "numberAvailable": 4,
                "currentNumberScheduled": 5,
                "numberMisscheduled": 0,
                "numberReady": 4
            }
        }))
        .unwrap();
        let row = daemon_set_row(&daemon_set);
        assert_eq!((row.replicas, row.available, row.unavailable), (5, 4, 1));
        assert_eq!(row.controller_type, "DaemonSet");

        let stateful_set: StatefulSet = serde_json::from_value(json!({
            "metadata": { "name": "db", "namespace": "data" },
            "spec": { "replicas": 3, "selector": {}, "serviceName": "db", "template": {} },
            "status": { "replicas": 3, "readyReplicas": 1 }
        }))
        .unwrap();
        let row = stateful_set_row(&stateful_set);
        assert_eq!((row.replicas, row.available, row.unavailable), (3, 1, 2));
    }

    #[test]
    fn test_container_rows_join_usage() {
        let pod: Pod = serde_json::from_value(json!({
            "metadata": {
                "name": "api-7d9f-abcde",
                "namespace": "prod",
                "ownerReferences": [{
                    "apiVersion": "apps/v1",
                    "kind": "ReplicaSet",
                    "name": "api-7d9f",
                    "uid": "1234"
                }]
            },
            "spec": {
                "containers": [
                    {
                        "name": "app",
                        "resources": {
                            "limits": { "cpu": "500m", "memory": "256Mi" },
                            "requests": { "cpu": "250m", "memory": "128Mi" }
                        }
                    },
                    { "name": "sidecar" }
                ]
            },
            "status": {
                "containerStatuses": [{
                    "name": "app",
                    "image": "app:1",
                    "imageID": "",
                    "ready": true,
                    "restartCount": 4,
                    "lastState": {
                        "terminated": {
                            "exitCode": 137,
                            "finishedAt": "2026-01-01T00:00:00Z"
                        }
                    }
                }]
            }
        }))
        .unwrap();

        let mut usage = UsageIndex::new();
        usage.insert(("prod".into(), "api-7d9f-abcde".into(), "app".into()), (0.12, 100_000_000));

        let now = Utc.with_ymd_and_hms(2026, 1, 1, 0, 10, 30).unwrap();
        let rows = container_rows(&[pod], &usage, now);

        assert_eq!(rows.len(), 2);
        let app = &rows[0];
        assert_eq!(app.controller_name, "api-7d9f");
        assert_eq!(app.limit_cpu, 0.5);
        assert_eq!(app.limit_memory, 268_435_456);
        assert_eq!(app.request_cpu, 0.25);
        assert_eq!(app.request_memory, 134_217_728);
        assert_eq!(app.use_cpu, 0.12);
        assert_eq!(app.use_memory, 100_000_000);
        assert_eq!(app.restart_count, 4);
        assert_eq!(app.last_termination_time, 10);

        let sidecar = &rows[1];
        assert_eq!(sidecar.limit_cpu, 0.0);
        assert_eq!(sidecar.use_memory, 0);
        assert_eq!(sidecar.restart_count, 0);
        assert_eq!(sidecar.last_termination_time, 0);
    }

    #[test]
    fn test_pod_without_owner_has_no_controller() {
        let pod: Pod = serde_json::from_value(json!({
            "metadata": { "name": "debug", "namespace": "default" },
            "spec": { "containers": [{ "name": "shell" }] }
        }))
        .unwrap();
        let rows = container_rows(&[pod], &UsageIndex::new(), Utc::now());
        assert_eq!(rows[0].controller_name, NO_CONTROLLER);
    }

    #[test]
    fn test_controller_row_json_keys() {
        let row = ControllerResource {
            namespace: "prod".into(),
            container: "api".into(),
            controller_type: "Deployment".into(),
            replicas: 3,
            available: 2,
            unavailable: 1,
        };
        let json = serde_json::to_value(&row).unwrap();
        assert_eq!(json["controllerType"], "Deployment");
        assert_eq!(json["status_replicas_available"], 2);
        assert_eq!(json["status_replicas_unavailable"], 1);
    }
}
