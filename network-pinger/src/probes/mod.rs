//! Connectivity probes and their per-cycle results.
//!
//! ## Categories
//! - **ApiServer**: one `version` round trip to the control plane
//! - **InternalDns** / **ExternalDns**: name resolution with a bounded timeout
//! - **PeerPod** / **PeerNode**: ICMP echo to every compatible peer address
//! - **ExternalAddress**: ICMP echo to a configured address outside the cluster

use std::fmt;

pub mod catalog;
pub mod dns;
pub mod ping;
pub mod scheduler;

pub use catalog::{LocalIdentity, ProbeCatalog};
pub use dns::{NameResolver, SystemResolver};
pub use ping::{IcmpPinger, PingProfile, PingStatistics, Pinger};
pub use scheduler::{Collaborators, ProbeScheduler};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProbeKind {
    ApiServer,
    InternalDns,
    ExternalDns,
    PeerPod,
    PeerNode,
    ExternalAddress,
}

impl fmt::Display for ProbeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ProbeKind::ApiServer => "apiserver",
            ProbeKind::InternalDns => "internal dns",
            ProbeKind::ExternalDns => "external dns",
            ProbeKind::PeerPod => "pod",
            ProbeKind::PeerNode => "node",
            ProbeKind::ExternalAddress => "external address",
        })
    }
}

/// Something probed during a cycle. Rebuilt from discovery every cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeTarget {
    pub kind: ProbeKind,
    pub address: String,
    pub display_name: String,
    pub owner_node_name: String,
    pub owner_node_ip: String,
}

impl ProbeTarget {
    /// A target addressed by name only (apiserver, DNS names).
    pub fn named(kind: ProbeKind, name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            kind,
            address: name.clone(),
            display_name: name,
            owner_node_name: String::new(),
            owner_node_ip: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProbeOutcome {
    pub target: ProbeTarget,
    pub success: bool,
    /// Present on success, or on partial success of a ping.
    pub latency_ms: Option<f64>,
    pub packets_sent: u32,
    pub packets_received: u32,
    /// Why the probe failed or could not run.
    pub error: Option<String>,
}

impl ProbeOutcome {
    pub fn passed(target: ProbeTarget, latency_ms: f64) -> Self {
        Self {
            target,
            success: true,
            latency_ms: Some(latency_ms),
            packets_sent: 0,
            packets_received: 0,
            error: None,
        }
    }

    pub fn failed(target: ProbeTarget, error: impl fmt::Display) -> Self {
        Self {
            target,
            success: false,
            latency_ms: None,
            packets_sent: 0,
            packets_received: 0,
            error: Some(error.to_string()),
        }
    }

    pub fn from_statistics(target: ProbeTarget, stats: &PingStatistics) -> Self {
        let lost = stats.lost();
        Self {
            target,
            success: stats.packets_sent > 0 && lost == 0,
            latency_ms: (stats.packets_received > 0).then(|| stats.avg_rtt_ms()),
            packets_sent: stats.packets_sent,
            packets_received: stats.packets_received,
            error: (lost != 0).then(|| format!("lost {} of {} packets", lost, stats.packets_sent)),
        }
    }
}

/// All outcomes of one probe category.
#[derive(Debug, Clone, PartialEq)]
pub struct CategoryResult {
    pub kind: ProbeKind,
    pub outcomes: Vec<ProbeOutcome>,
    /// Set when the target list itself could not be fetched.
    pub discovery_error: Option<String>,
}

impl CategoryResult {
    pub fn from_outcomes(kind: ProbeKind, outcomes: Vec<ProbeOutcome>) -> Self {
        Self {
            kind,
            outcomes,
            discovery_error: None,
        }
    }

    pub fn discovery_failed(kind: ProbeKind, error: &anyhow::Error) -> Self {
        Self {
            kind,
            outcomes: Vec::new(),
            discovery_error: Some(format!("{:#}", error)),
        }
    }

    pub fn failed(&self) -> bool {
        self.discovery_error.is_some() || self.outcomes.iter().any(|o| !o.success)
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct CycleResult {
    pub categories: Vec<CategoryResult>,
}

impl CycleResult {
    /// Any failure in any category.
    pub fn failed(&self) -> bool {
        self.categories.iter().any(CategoryResult::failed)
    }

    pub fn category(&self, kind: ProbeKind) -> Option<&CategoryResult> {
        self.categories.iter().find(|c| c.kind == kind)
    }

    pub fn failed_kinds(&self) -> Vec<ProbeKind> {
        self.categories
            .iter()
            .filter(|c| c.failed())
            .map(|c| c.kind)
            .collect()
    }
}
