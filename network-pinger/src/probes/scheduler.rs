//! One probe cycle: every category runs concurrently, pings within a
//! category run through a bounded pool, and each outcome is recorded as soon
//! as it is known.

use std::{future::Future, sync::Arc, time::Duration};

use anyhow::{Result, anyhow};
use futures::{StreamExt, stream};
use log::{error, info, warn};
use tokio::time::{self, Instant};

use crate::{
    k8s::ControlPlane,
    probes::{
        CategoryResult, CycleResult, NameResolver, PingProfile, Pinger, ProbeCatalog, ProbeKind,
        ProbeOutcome, ProbeTarget,
    },
    settings::Settings,
    telemetry::{PingSample, PingerMetrics},
};

const APISERVER_TIMEOUT: Duration = Duration::from_secs(15);
const DNS_TIMEOUT: Duration = Duration::from_secs(10);

/// External services a cycle talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub control_plane: Arc<dyn ControlPlane>,
    pub pinger: Arc<dyn Pinger>,
    pub resolver: Arc<dyn NameResolver>,
    pub metrics: Arc<PingerMetrics>,
}

pub struct ProbeScheduler {
    settings: Arc<Settings>,
    catalog: ProbeCatalog,
    collaborators: Collaborators,
}

impl ProbeScheduler {
    pub fn new(settings: Arc<Settings>, collaborators: Collaborators) -> Self {
        Self {
            catalog: ProbeCatalog::new(collaborators.control_plane.clone(), settings.clone()),
            settings,
            collaborators,
        }
    }

    pub async fn run_cycle(&self) -> CycleResult {
        let (apiserver, internal_dns, external_dns, pods, nodes, external_address) = tokio::join!(
            self.check_apiserver(),
            self.check_dns(ProbeKind::InternalDns, &self.settings.internal_dns),
            self.check_external_dns(),
            self.ping_peer_pods(),
            self.ping_peer_nodes(),
            self.ping_external_addresses(),
        );

        let mut categories = vec![apiserver, internal_dns, pods, nodes];
        categories.extend(external_dns);
        categories.extend(external_address);

        let cycle = CycleResult { categories };
        if cycle.failed() {
            warn!("check failed in: {:?}", cycle.failed_kinds());
        }
        cycle
    }

    async fn check_apiserver(&self) -> CategoryResult {
        let target = ProbeTarget::named(ProbeKind::ApiServer, "apiserver");
        let node_name = &self.settings.identity.node_name;
        let metrics = &self.collaborators.metrics;

        let (result, elapsed_ms) =
            timed(APISERVER_TIMEOUT, self.collaborators.control_plane.server_version()).await;
        let outcome = match result {
            Ok(version) => {
                info!(
                    "ping apiserver success, version {}, time elapsed {:.2}ms",
                    version, elapsed_ms
                );
                metrics.set_apiserver_healthy(node_name, elapsed_ms);
                ProbeOutcome::passed(target, elapsed_ms)
            }
            Err(e) => {
                error!("failed to connect to apiserver: {:#}", e);
                metrics.set_apiserver_unhealthy(node_name);
                ProbeOutcome::failed(target, format!("{:#}", e))
            }
        };
        CategoryResult::from_outcomes(ProbeKind::ApiServer, vec![outcome])
    }

    async fn check_external_dns(&self) -> Option<CategoryResult> {
        let name = self.settings.external_dns.as_deref()?;
        Some(self.check_dns(ProbeKind::ExternalDns, name).await)
    }

    async fn check_dns(&self, kind: ProbeKind, name: &str) -> CategoryResult {
        let target = ProbeTarget::named(kind, name);
        let node_name = &self.settings.identity.node_name;
        let metrics = &self.collaborators.metrics;

        let (result, elapsed_ms) = timed(DNS_TIMEOUT, self.collaborators.resolver.resolve(name)).await;
        let outcome = match result {
            Ok(addrs) => {
                info!("resolve dns {} to {:?} in {:.2}ms", name, addrs, elapsed_ms);
                match kind {
                    ProbeKind::ExternalDns => metrics.set_external_dns_healthy(node_name, elapsed_ms),
                    _ => metrics.set_internal_dns_healthy(node_name, elapsed_ms),
                }
                ProbeOutcome::passed(target, elapsed_ms)
            }
            Err(e) => {
                error!("failed to resolve dns {}: {:#}", name, e);
                match kind {
                    ProbeKind::ExternalDns => metrics.set_external_dns_unhealthy(node_name),
                    _ => metrics.set_internal_dns_unhealthy(node_name),
                }
                ProbeOutcome::failed(target, format!("{:#}", e))
            }
        };
        CategoryResult::from_outcomes(kind, vec![outcome])
    }

    async fn ping_peer_pods(&self) -> CategoryResult {
        let targets = self
            .catalog
            .discover_peer_pods(self.settings.peer_namespace(), &self.settings.match_labels)
            .await;
        self.ping_category(ProbeKind::PeerPod, targets, &PingProfile::POD)
            .await
    }

    async fn ping_peer_nodes(&self) -> CategoryResult {
        let targets = self.catalog.discover_peer_nodes().await;
        self.ping_category(ProbeKind::PeerNode, targets, &PingProfile::NODE)
            .await
    }

    async fn ping_external_addresses(&self) -> Option<CategoryResult> {
        self.settings.external_address.as_ref()?;
        let targets = self.catalog.external_targets();
        Some(
            self.ping_category(ProbeKind::ExternalAddress, Ok(targets), &PingProfile::POD)
                .await,
        )
    }

    /// A failed listing fails the whole category; nothing from it is pinged.
    async fn ping_category(
        &self,
        kind: ProbeKind,
        targets: Result<Vec<ProbeTarget>>,
        profile: &PingProfile,
    ) -> CategoryResult {
        match targets {
            Ok(targets) => {
                let outcomes = stream::iter(targets)
                    .map(|target| self.ping_target(target, profile))
                    .buffer_unordered(self.settings.ping_concurrency)
                    .collect::<Vec<_>>()
                    .await;
                CategoryResult::from_outcomes(kind, outcomes)
            }
            Err(e) => {
                error!("failed to list {} targets: {:#}", kind, e);
                CategoryResult::discovery_failed(kind, &e)
            }
        }
    }

    async fn ping_target(&self, target: ProbeTarget, profile: &PingProfile) -> ProbeOutcome {
        let stats = match self.collaborators.pinger.ping(&target.address, profile).await {
            Ok(stats) => stats,
            Err(e) => {
                error!("ping {} {} skipped: {}", target.kind, target.display_name, e);
                return ProbeOutcome::failed(target, e);
            }
        };

        let lost = stats.lost();
        info!(
            "ping {} {} {}, count {}, loss count {}, average rtt {:.2}ms",
            target.kind,
            target.display_name,
            target.address,
            stats.packets_sent,
            lost,
            stats.avg_rtt_ms()
        );

        let outcome = ProbeOutcome::from_statistics(target, &stats);
        let sample = PingSample {
            latency_ms: outcome.latency_ms,
            lost: u64::from(lost),
            total: u64::from(stats.packets_sent),
        };
        self.record_ping(&outcome.target, sample);
        outcome
    }

    fn record_ping(&self, target: &ProbeTarget, sample: PingSample) {
        let metrics = &self.collaborators.metrics;
        match target.kind {
            ProbeKind::PeerPod => metrics.record_pod_ping(
                &target.owner_node_name,
                &target.owner_node_ip,
                &target.address,
                sample,
            ),
            ProbeKind::PeerNode => {
                metrics.record_node_ping(&target.owner_node_name, &target.owner_node_ip, sample)
            }
            ProbeKind::ExternalAddress => metrics.record_ip_ping(&target.address, sample),
            ProbeKind::ApiServer | ProbeKind::InternalDns | ProbeKind::ExternalDns => {}
        }
    }
}

/// Run `fut` under `limit`, returning its result and the elapsed time in ms.
async fn timed<T>(limit: Duration, fut: impl Future<Output = Result<T>>) -> (Result<T>, f64) {
    let start = Instant::now();
    let result = match time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(anyhow!("timed out after {:?}", limit)),
    };
    (result, start.elapsed().as_secs_f64() * 1000.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{
        self, FakeControlPlane, FakePing, FakePinger, FakeResolver, peer_node, peer_pod,
        sample_value,
    };
    use std::sync::atomic::Ordering;

    fn scheduler(
        flags: &[&str],
        cp: FakeControlPlane,
        pinger: FakePinger,
        dns_healthy: bool,
    ) -> (ProbeScheduler, Arc<FakePinger>, Arc<PingerMetrics>) {
        let pinger = Arc::new(pinger);
        let collaborators = testing::collaborators(Arc::new(cp), pinger.clone(), dns_healthy);
        let metrics = collaborators.metrics.clone();
        let scheduler = ProbeScheduler::new(Arc::new(testing::settings(flags)), collaborators);
        (scheduler, pinger, metrics)
    }

    #[tokio::test]
    async fn test_loss_is_accounted_and_fails_cycle() {
        let cp = FakeControlPlane {
            pods: Ok(vec![peer_pod("pinger-b", "node-2", "192.168.0.11", &["10.16.0.7"])]),
            ..Default::default()
        };
        let pinger = FakePinger::default().with("10.16.0.7", FakePing::Reply { sent: 3, received: 1 });
        let (scheduler, _, metrics) = scheduler(&[], cp, pinger, true);

        let cycle = scheduler.run_cycle().await;

        assert!(cycle.failed());
        assert_eq!(cycle.failed_kinds(), vec![ProbeKind::PeerPod]);
        let text = metrics.render().unwrap();
        let labels = ["target_node_name=\"node-2\"", "target_pod_ip=\"10.16.0.7\""];
        assert_eq!(sample_value(&text, "pinger_pod_ping_lost_total", &labels), Some(2.0));
        assert_eq!(sample_value(&text, "pinger_pod_ping_count_total", &labels), Some(3.0));
    }

    #[tokio::test]
    async fn test_setup_error_does_not_abort_category() {
        let cp = FakeControlPlane {
            pods: Ok(vec![
                peer_pod("pinger-a", "node-1", "192.168.0.10", &["10.16.0.6"]),
                peer_pod("pinger-b", "node-2", "192.168.0.11", &["10.16.0.7"]),
                peer_pod("pinger-c", "node-3", "192.168.0.12", &["10.16.0.8"]),
            ]),
            ..Default::default()
        };
        let pinger = FakePinger::default().with("10.16.0.7", FakePing::SetupError);
        let (scheduler, pinger, metrics) = scheduler(&[], cp, pinger, true);

        let cycle = scheduler.run_cycle().await;

        let pods = cycle.category(ProbeKind::PeerPod).unwrap();
        assert_eq!(pods.outcomes.len(), 3);
        assert_eq!(pods.outcomes.iter().filter(|o| o.success).count(), 2);
        assert_eq!(pinger.call_count(), 3);
        assert!(cycle.failed());

        let text = metrics.render().unwrap();
        let count = |ip: &str| {
            let label = format!("target_pod_ip=\"{}\"", ip);
            sample_value(&text, "pinger_pod_ping_count_total", &[label.as_str()])
        };
        assert_eq!(count("10.16.0.6"), Some(3.0));
        assert_eq!(count("10.16.0.7"), None);
        assert_eq!(count("10.16.0.8"), Some(3.0));
    }

    #[tokio::test]
    async fn test_apiserver_failure_is_isolated() {
        let cp = FakeControlPlane {
            apiserver_up: false,
            ..Default::default()
        };
        let (scheduler, _, metrics) = scheduler(&[], cp, FakePinger::default(), true);

        let cycle = scheduler.run_cycle().await;

        assert_eq!(cycle.failed_kinds(), vec![ProbeKind::ApiServer]);
        let text = metrics.render().unwrap();
        let node = ["nodeName=\"node-1\""];
        assert_eq!(sample_value(&text, "pinger_apiserver_unhealthy", &node), Some(1.0));
        assert_eq!(sample_value(&text, "pinger_internal_dns_healthy", &node), Some(1.0));
    }

    #[tokio::test]
    async fn test_discovery_error_fails_category() {
        let cp = FakeControlPlane {
            pods: Err("forbidden".to_string()),
            nodes: Ok(vec![peer_node("node-2", &["192.168.0.11"])]),
            ..Default::default()
        };
        let (scheduler, pinger, _) = scheduler(&[], cp, FakePinger::default(), true);

        let cycle = scheduler.run_cycle().await;

        let pods = cycle.category(ProbeKind::PeerPod).unwrap();
        assert!(pods.discovery_error.as_deref().unwrap().contains("forbidden"));
        assert!(pods.outcomes.is_empty());
        assert_eq!(cycle.failed_kinds(), vec![ProbeKind::PeerPod]);

        let calls = pinger.calls.lock().unwrap();
        assert_eq!(calls.as_slice(), &[("192.168.0.11".to_string(), PingProfile::NODE)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fan_out_is_bounded() {
        let addresses: Vec<String> = (10..20).map(|i| format!("10.16.0.{}", i)).collect();
        let cp = FakeControlPlane {
            pods: Ok(addresses
                .iter()
                .map(|addr| peer_pod("pinger", "node-2", "192.168.0.11", &[addr.as_str()]))
                .collect()),
            ..Default::default()
        };
        let pinger = FakePinger {
            delay: Duration::from_millis(100),
            ..Default::default()
        };
        let (scheduler, pinger, _) = scheduler(&["--ping-concurrency", "2"], cp, pinger, true);

        let cycle = scheduler.run_cycle().await;

        assert!(!cycle.failed());
        assert_eq!(cycle.category(ProbeKind::PeerPod).unwrap().outcomes.len(), 10);
        assert_eq!(pinger.max_in_flight.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_external_checks() {
        let (scheduler, _, metrics) = scheduler(
            &["--external-dns", "example.com", "--external-address", "1.1.1.1"],
            FakeControlPlane::default(),
            FakePinger::default().with("1.1.1.1", FakePing::Reply { sent: 3, received: 0 }),
            true,
        );

        let cycle = scheduler.run_cycle().await;

        assert!(cycle.category(ProbeKind::ExternalDns).is_some());
        assert_eq!(cycle.failed_kinds(), vec![ProbeKind::ExternalAddress]);
        let text = metrics.render().unwrap();
        let target = ["target_ip=\"1.1.1.1\""];
        assert_eq!(sample_value(&text, "pinger_ip_ping_lost_total", &target), Some(3.0));
        assert_eq!(
            sample_value(&text, "pinger_external_dns_healthy", &["nodeName=\"node-1\""]),
            Some(1.0)
        );
    }

    #[tokio::test]
    async fn test_optional_categories_skipped_when_unset() {
        let (scheduler, _, _) =
            scheduler(&[], FakeControlPlane::default(), FakePinger::default(), false);

        let cycle = scheduler.run_cycle().await;

        assert!(cycle.category(ProbeKind::ExternalDns).is_none());
        assert!(cycle.category(ProbeKind::ExternalAddress).is_none());
        assert_eq!(cycle.failed_kinds(), vec![ProbeKind::InternalDns]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_resolver_is_bounded() {
        let mut collaborators = testing::collaborators(
            Arc::new(FakeControlPlane::default()),
            Arc::new(FakePinger::default()),
            true,
        );
        collaborators.resolver = Arc::new(FakeResolver {
            healthy: true,
            hangs: true,
        });
        let metrics = collaborators.metrics.clone();
        let scheduler = ProbeScheduler::new(Arc::new(testing::settings(&[])), collaborators);

        let start = Instant::now();
        let cycle = scheduler.run_cycle().await;

        assert_eq!(start.elapsed(), DNS_TIMEOUT);
        assert_eq!(cycle.failed_kinds(), vec![ProbeKind::InternalDns]);
        let text = metrics.render().unwrap();
        let node = ["nodeName=\"node-1\""];
        assert_eq!(sample_value(&text, "pinger_internal_dns_unhealthy", &node), Some(1.0));
        assert_eq!(sample_value(&text, "pinger_apiserver_healthy", &node), Some(1.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_apiserver_is_bounded() {
        let cp = FakeControlPlane {
            apiserver_hangs: true,
            ..Default::default()
        };
        let (scheduler, _, metrics) = scheduler(&[], cp, FakePinger::default(), true);

        let start = Instant::now();
        let cycle = scheduler.run_cycle().await;

        assert_eq!(start.elapsed(), APISERVER_TIMEOUT);
        assert_eq!(cycle.failed_kinds(), vec![ProbeKind::ApiServer]);
        let outcome = &cycle.category(ProbeKind::ApiServer).unwrap().outcomes[0];
        assert!(outcome.error.as_deref().unwrap().contains("timed out"));
        let text = metrics.render().unwrap();
        let node = ["nodeName=\"node-1\""];
        assert_eq!(sample_value(&text, "pinger_apiserver_unhealthy", &node), Some(1.0));
        assert_eq!(sample_value(&text, "pinger_internal_dns_healthy", &node), Some(1.0));
    }
}
