//! In-memory collaborators for tests.

use std::{
    collections::HashMap,
    net::IpAddr,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use clap::Parser;
use network_pinger_common::AddressFamily;

use crate::{
    error::ProbeError,
    k8s::{ControlPlane, PeerNode, PeerPod, SelfPod},
    probes::{Collaborators, NameResolver, PingProfile, PingStatistics, Pinger},
    settings::{Args, Identity, Settings},
    telemetry::PingerMetrics,
};

pub(crate) fn identity() -> Identity {
    Identity {
        pod_ip: "10.16.0.5".to_string(),
        host_ip: "192.168.0.10".to_string(),
        node_name: "node-1".to_string(),
        pod_name: "network-pinger-abcde".to_string(),
    }
}

/// Settings for an IPv4-only instance, with extra flags applied.
pub(crate) fn settings(flags: &[&str]) -> Settings {
    let mut argv = vec!["network-pinger"];
    argv.extend_from_slice(flags);
    let args = Args::try_parse_from(argv).expect("Failed to parse args");
    Settings::new(args, identity()).with_pod_protocols(vec![AddressFamily::IPv4])
}

/// Value of the first sample of `metric` whose labels contain every
/// fragment in `labels`.
pub(crate) fn sample_value(text: &str, metric: &str, labels: &[&str]) -> Option<f64> {
    let prefix = format!("{}{{", metric);
    text.lines()
        .filter(|line| line.starts_with(&prefix))
        .find(|line| labels.iter().all(|label| line.contains(label)))
        .and_then(|line| line.rsplit(' ').next())
        .and_then(|value| value.parse().ok())
}

pub(crate) fn peer_pod(name: &str, node: &str, node_ip: &str, addresses: &[&str]) -> PeerPod {
    PeerPod {
        name: name.to_string(),
        addresses: addresses.iter().map(|a| a.to_string()).collect(),
        host_ip: node_ip.to_string(),
        node_name: node.to_string(),
    }
}

pub(crate) fn peer_node(name: &str, internal_ips: &[&str]) -> PeerNode {
    PeerNode {
        name: name.to_string(),
        internal_ips: internal_ips.iter().map(|a| a.to_string()).collect(),
    }
}

pub(crate) struct FakeControlPlane {
    pub apiserver_up: bool,
    /// `server_version` never returns.
    pub apiserver_hangs: bool,
    /// One response per call; the last one repeats.
    pub self_pod: Vec<Result<SelfPod, String>>,
    pub pods: Result<Vec<PeerPod>, String>,
    pub nodes: Result<Vec<PeerNode>, String>,
    pub server_version_calls: AtomicUsize,
    pub self_pod_calls: AtomicUsize,
    pub list_pods_calls: Mutex<Vec<(String, String)>>,
}

impl Default for FakeControlPlane {
    fn default() -> Self {
        Self {
            apiserver_up: true,
            apiserver_hangs: false,
            self_pod: vec![Ok(SelfPod {
                addresses: vec!["10.16.0.5".to_string()],
                ready: true,
            })],
            pods: Ok(Vec::new()),
            nodes: Ok(Vec::new()),
            server_version_calls: AtomicUsize::new(0),
            self_pod_calls: AtomicUsize::new(0),
            list_pods_calls: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl ControlPlane for FakeControlPlane {
    async fn server_version(&self) -> Result<String> {
        self.server_version_calls.fetch_add(1, Ordering::SeqCst);
        if self.apiserver_hangs {
            std::future::pending::<()>().await;
        }
        if self.apiserver_up {
            Ok("v1.32.0".to_string())
        } else {
            Err(anyhow!("connection refused"))
        }
    }

    async fn self_pod(&self, _namespace: &str, _name: &str) -> Result<SelfPod> {
        let call = self.self_pod_calls.fetch_add(1, Ordering::SeqCst);
        let response = self
            .self_pod
            .get(call)
            .or(self.self_pod.last())
            .expect("FakeControlPlane needs at least one self pod response");
        response.clone().map_err(|e| anyhow!(e))
    }

    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<PeerPod>> {
        self.list_pods_calls
            .lock()
            .unwrap()
            .push((namespace.to_string(), label_selector.to_string()));
        self.pods.clone().map_err(|e| anyhow!(e))
    }

    async fn list_nodes(&self) -> Result<Vec<PeerNode>> {
        self.nodes.clone().map_err(|e| anyhow!(e))
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum FakePing {
    Reply { sent: u32, received: u32 },
    SetupError,
}

/// Answers every address with a full reply unless configured otherwise.
#[derive(Default)]
pub(crate) struct FakePinger {
    pub responses: HashMap<String, FakePing>,
    pub delay: Duration,
    pub calls: Mutex<Vec<(String, PingProfile)>>,
    pub in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
}

impl FakePinger {
    pub fn with(mut self, address: &str, response: FakePing) -> Self {
        self.responses.insert(address.to_string(), response);
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl Pinger for FakePinger {
    async fn ping(
        &self,
        address: &str,
        profile: &PingProfile,
    ) -> Result<PingStatistics, ProbeError> {
        self.calls
            .lock()
            .unwrap()
            .push((address.to_string(), *profile));

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        match self
            .responses
            .get(address)
            .copied()
            .unwrap_or(FakePing::Reply { sent: 3, received: 3 })
        {
            FakePing::Reply { sent, received } => Ok(PingStatistics::from_round_trips(
                sent,
                &vec![Duration::from_micros(500); received as usize],
            )),
            FakePing::SetupError => Err(ProbeError::Setup {
                address: address.to_string(),
                source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
            }),
        }
    }
}

#[derive(Default)]
pub(crate) struct FakeResolver {
    pub healthy: bool,
    /// `resolve` never returns.
    pub hangs: bool,
}

#[async_trait]
impl NameResolver for FakeResolver {
    async fn resolve(&self, name: &str) -> Result<Vec<IpAddr>> {
        if self.hangs {
            std::future::pending::<()>().await;
        }
        if self.healthy {
            Ok(vec![IpAddr::from([10, 96, 0, 1])])
        } else {
            Err(anyhow!("failed to resolve dns {}", name))
        }
    }
}

pub(crate) fn collaborators(
    control_plane: Arc<FakeControlPlane>,
    pinger: Arc<FakePinger>,
    dns_healthy: bool,
) -> Collaborators {
    Collaborators {
        control_plane,
        pinger,
        resolver: Arc::new(FakeResolver {
            healthy: dns_healthy,
            ..Default::default()
        }),
        metrics: Arc::new(PingerMetrics::new(&identity(), None).expect("Failed to build metrics")),
    }
}
