//! Target discovery. Nothing here is cached: every cycle asks the control
//! plane again, since peers come and go.

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use log::{debug, info, warn};
use network_pinger_common::{AddressFamily, classify};

use crate::{
    error::BootstrapError,
    k8s::ControlPlane,
    probes::{ProbeKind, ProbeTarget},
    settings::Settings,
};

pub const SELF_DISCOVERY_ATTEMPTS: u32 = 3;
pub const SELF_DISCOVERY_BACKOFF: Duration = Duration::from_secs(1);

/// This instance's own addresses and the families they cover.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalIdentity {
    pub addresses: Vec<String>,
    pub protocols: Vec<AddressFamily>,
}

/// Fetch the addresses of pod `namespace/name`, waiting for them to be
/// assigned.
///
/// Control-plane errors are returned at once. A pod that is ready but has no
/// IPs will not get any, so that fails at once too.
pub async fn discover_self(
    control_plane: &dyn ControlPlane,
    namespace: &str,
    name: &str,
) -> Result<LocalIdentity, BootstrapError> {
    for attempt in 1..=SELF_DISCOVERY_ATTEMPTS {
        let pod = control_plane
            .self_pod(namespace, name)
            .await
            .map_err(|cause| BootstrapError::ControlPlane {
                namespace: namespace.to_string(),
                name: name.to_string(),
                cause,
            })?;

        if !pod.addresses.is_empty() {
            let protocols = pod.addresses.iter().map(|addr| classify(addr)).collect();
            info!("pod {}/{} has IPs {:?}", namespace, name, pod.addresses);
            return Ok(LocalIdentity {
                addresses: pod.addresses,
                protocols,
            });
        }

        if pod.ready {
            return Err(BootstrapError::ReadyWithoutAddresses {
                namespace: namespace.to_string(),
                name: name.to_string(),
            });
        }

        if attempt < SELF_DISCOVERY_ATTEMPTS {
            warn!("cannot get Pod IPs now, waiting Pod to be ready");
            tokio::time::sleep(SELF_DISCOVERY_BACKOFF).await;
        }
    }

    Err(BootstrapError::Exhausted {
        namespace: namespace.to_string(),
        name: name.to_string(),
        attempts: SELF_DISCOVERY_ATTEMPTS,
    })
}

/// Builds the per-cycle target lists.
#[derive(Clone)]
pub struct ProbeCatalog {
    control_plane: Arc<dyn ControlPlane>,
    settings: Arc<Settings>,
}

impl ProbeCatalog {
    pub fn new(control_plane: Arc<dyn ControlPlane>, settings: Arc<Settings>) -> Self {
        Self {
            control_plane,
            settings,
        }
    }

    /// One target per compatible address of every matching pod.
    pub async fn discover_peer_pods(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<ProbeTarget>> {
        let pods = self
            .control_plane
            .list_pods(namespace, label_selector)
            .await?;

        Ok(pods
            .into_iter()
            .flat_map(|pod| {
                pod.addresses
                    .iter()
                    .map(|address| ProbeTarget {
                        kind: ProbeKind::PeerPod,
                        address: address.clone(),
                        display_name: pod.name.clone(),
                        owner_node_name: pod.node_name.clone(),
                        owner_node_ip: pod.host_ip.clone(),
                    })
                    .collect::<Vec<_>>()
            })
            .filter(|target| self.is_compatible(target))
            .collect())
    }

    /// One target per compatible internal IP of every node.
    pub async fn discover_peer_nodes(&self) -> Result<Vec<ProbeTarget>> {
        let nodes = self.control_plane.list_nodes().await?;

        Ok(nodes
            .into_iter()
            .flat_map(|node| {
                node.internal_ips
                    .iter()
                    .map(|address| ProbeTarget {
                        kind: ProbeKind::PeerNode,
                        address: address.clone(),
                        display_name: node.name.clone(),
                        owner_node_name: node.name.clone(),
                        owner_node_ip: address.clone(),
                    })
                    .collect::<Vec<_>>()
            })
            .filter(|target| self.is_compatible(target))
            .collect())
    }

    /// Compatible entries of `--external-address`, which may list several
    /// comma separated addresses.
    pub fn external_targets(&self) -> Vec<ProbeTarget> {
        let Some(external) = &self.settings.external_address else {
            return Vec::new();
        };

        external
            .split(',')
            .map(str::trim)
            .filter(|address| !address.is_empty())
            .map(|address| ProbeTarget {
                kind: ProbeKind::ExternalAddress,
                address: address.to_string(),
                display_name: address.to_string(),
                owner_node_name: String::new(),
                owner_node_ip: String::new(),
            })
            .filter(|target| self.is_compatible(target))
            .collect()
    }

    fn is_compatible(&self, target: &ProbeTarget) -> bool {
        let family = classify(&target.address);
        let supported = family.is_supported_by(&self.settings.pod_protocols);
        if !supported {
            debug!(
                "skip {} {} {}: {} not supported by local families {:?}",
                target.kind, target.display_name, target.address, family, self.settings.pod_protocols
            );
        }
        supported
    }
}
