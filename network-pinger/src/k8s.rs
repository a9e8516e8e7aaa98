//! Kubernetes control-plane access.
//!
//! The probing code only sees the [`ControlPlane`] trait; [`KubeControlPlane`]
//! backs it with a `kube` client talking to the apiserver.

use std::{path::Path, time::Duration};

use anyhow::{Context, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::{
    Api, Client,
    api::ListParams,
    config::{KubeConfigOptions, Kubeconfig},
};
use log::info;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
const NODE_INTERNAL_IP: &str = "InternalIP";

/// Addresses of this instance's own pod.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SelfPod {
    pub addresses: Vec<String>,
    /// Readiness of the first container.
    pub ready: bool,
}

/// A peer pinger pod.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerPod {
    pub name: String,
    pub addresses: Vec<String>,
    pub host_ip: String,
    pub node_name: String,
}

/// A cluster node with its internal addresses.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerNode {
    pub name: String,
    pub internal_ips: Vec<String>,
}

#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Lightweight apiserver round trip. Returns the reported git version.
    async fn server_version(&self) -> Result<String>;

    async fn self_pod(&self, namespace: &str, name: &str) -> Result<SelfPod>;

    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<PeerPod>>;

    async fn list_nodes(&self) -> Result<Vec<PeerNode>>;
}

/// Build a client from `kubeconfig`, or from the in-cluster service account
/// when no path is given.
pub async fn connect(kubeconfig: Option<&Path>) -> Result<Client> {
    let mut config = match kubeconfig {
        None => kube::Config::incluster().context("use in cluster config failed")?,
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path)
                .with_context(|| format!("use --kubeconfig {} failed", path.display()))?;
            kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .with_context(|| format!("use --kubeconfig {} failed", path.display()))?
        }
    };
    config.connect_timeout = Some(REQUEST_TIMEOUT);
    config.read_timeout = Some(REQUEST_TIMEOUT);

    info!("Connecting to apiserver at {}", config.cluster_url);
    Client::try_from(config).context("init kubernetes client failed")
}

#[derive(Clone)]
pub struct KubeControlPlane {
    client: Client,
}

impl KubeControlPlane {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ControlPlane for KubeControlPlane {
    async fn server_version(&self) -> Result<String> {
        let info = self
            .client
            .apiserver_version()
            .await
            .context("failed to connect to apiserver")?;
        Ok(info.git_version)
    }

    async fn self_pod(&self, namespace: &str, name: &str) -> Result<SelfPod> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let pod = api
            .get(name)
            .await
            .with_context(|| format!("failed to get pod {}/{}", namespace, name))?;

        let ready = pod
            .status
            .as_ref()
            .and_then(|status| status.container_statuses.as_ref())
            .and_then(|statuses| statuses.first())
            .map(|cs| cs.ready)
            .unwrap_or(false);

        Ok(SelfPod {
            addresses: pod_ips(&pod),
            ready,
        })
    }

    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<PeerPod>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let mut params = ListParams::default();
        if !label_selector.is_empty() {
            params = params.labels(label_selector);
        }
        let pods = api
            .list(&params)
            .await
            .with_context(|| format!("failed to list peer pods in {}", namespace))?;

        Ok(pods
            .items
            .iter()
            .map(|pod| PeerPod {
                name: pod.metadata.name.clone().unwrap_or_default(),
                addresses: pod_ips(pod),
                host_ip: pod
                    .status
                    .as_ref()
                    .and_then(|status| status.host_ip.clone())
                    .unwrap_or_default(),
                node_name: pod
                    .spec
                    .as_ref()
                    .and_then(|spec| spec.node_name.clone())
                    .unwrap_or_default(),
            })
            .collect())
    }

    async fn list_nodes(&self) -> Result<Vec<PeerNode>> {
        let api: Api<Node> = Api::all(self.client.clone());
        let nodes = api
            .list(&ListParams::default())
            .await
            .context("failed to list nodes")?;

        Ok(nodes
            .items
            .iter()
            .map(|node| PeerNode {
                name: node.metadata.name.clone().unwrap_or_default(),
                internal_ips: node
                    .status
                    .as_ref()
                    .and_then(|status| status.addresses.as_ref())
                    .map(|addresses| {
                        addresses
                            .iter()
                            .filter(|addr| addr.type_ == NODE_INTERNAL_IP)
                            .map(|addr| addr.address.clone())
                            .collect()
                    })
                    .unwrap_or_default(),
            })
            .collect())
    }
}

/// All pod IPs, falling back to the legacy single `podIP` field.
fn pod_ips(pod: &Pod) -> Vec<String> {
    let Some(status) = &pod.status else {
        return Vec::new();
    };

    let ips: Vec<String> = status
        .pod_ips
        .iter()
        .flatten()
        .map(|pod_ip| pod_ip.ip.clone())
        .filter(|ip| !ip.is_empty())
        .collect();

    if ips.is_empty() {
        status.pod_ip.iter().filter(|ip| !ip.is_empty()).cloned().collect()
    } else {
        ips
    }
}
