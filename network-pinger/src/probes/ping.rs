//! ICMP echo exchanges.

use std::{
    net::IpAddr,
    sync::atomic::{AtomicU16, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use log::{debug, warn};
use surge_ping::{Client, Config, ICMP, PingIdentifier, PingSequence};

use crate::error::ProbeError;

const PAYLOAD: [u8; 56] = [0; 56];

static NEXT_IDENTIFIER: AtomicU16 = AtomicU16::new(0);

/// How many echo requests to send and how long to wait for them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PingProfile {
    pub count: u16,
    pub per_ping_timeout: Duration,
    pub interval: Duration,
    /// Upper bound for the whole exchange.
    pub overall_timeout: Option<Duration>,
}

impl PingProfile {
    pub const POD: Self = Self {
        count: 3,
        per_ping_timeout: Duration::from_secs(1),
        interval: Duration::from_millis(100),
        overall_timeout: None,
    };

    /// Node paths may cross more hops, so replies get a longer budget.
    pub const NODE: Self = Self {
        count: 3,
        per_ping_timeout: Duration::from_secs(10),
        interval: Duration::from_millis(100),
        overall_timeout: Some(Duration::from_secs(30)),
    };
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PingStatistics {
    pub packets_sent: u32,
    pub packets_received: u32,
    pub avg_rtt: Duration,
}

impl PingStatistics {
    pub fn from_round_trips(packets_sent: u32, round_trips: &[Duration]) -> Self {
        let packets_received = round_trips.len() as u32;
        let avg_rtt = if packets_received == 0 {
            Duration::ZERO
        } else {
            round_trips.iter().sum::<Duration>() / packets_received
        };
        Self {
            packets_sent,
            packets_received,
            avg_rtt,
        }
    }

    /// `sent - received`. More replies than requests is a bookkeeping bug,
    /// logged and reported as no loss.
    pub fn lost(&self) -> u32 {
        match self.packets_sent.checked_sub(self.packets_received) {
            Some(lost) => lost,
            None => {
                warn!(
                    "received {} replies for {} requests; reporting no loss",
                    self.packets_received, self.packets_sent
                );
                0
            }
        }
    }

    pub fn avg_rtt_ms(&self) -> f64 {
        self.avg_rtt.as_nanos() as f64 / 1_000_000.0
    }
}

#[async_trait]
pub trait Pinger: Send + Sync {
    /// Run one exchange against `address`. Timeouts only lower
    /// `packets_received`; errors mean nothing could be sent at all.
    async fn ping(
        &self,
        address: &str,
        profile: &PingProfile,
    ) -> Result<PingStatistics, ProbeError>;
}

/// Pinger backed by ICMP sockets. Needs `CAP_NET_RAW` or an unprivileged
/// ICMP socket range covering the process group.
#[derive(Debug, Clone, Copy, Default)]
pub struct IcmpPinger;

#[async_trait]
impl Pinger for IcmpPinger {
    async fn ping(
        &self,
        address: &str,
        profile: &PingProfile,
    ) -> Result<PingStatistics, ProbeError> {
        let ip: IpAddr = address
            .parse()
            .map_err(|_| ProbeError::InvalidAddress(address.to_string()))?;

        let config = match ip {
            IpAddr::V4(_) => Config::default(),
            IpAddr::V6(_) => Config::builder().kind(ICMP::V6).build(),
        };
        let client = Client::new(&config).map_err(|source| ProbeError::Setup {
            address: address.to_string(),
            source,
        })?;
        let mut pinger = client.pinger(ip, next_identifier()).await;
        pinger.timeout(profile.per_ping_timeout);

        let mut sent = 0u32;
        let mut round_trips = Vec::with_capacity(profile.count as usize);
        let exchange = echo_exchange(&mut pinger, profile, &mut sent, &mut round_trips);
        match profile.overall_timeout {
            Some(limit) => {
                if tokio::time::timeout(limit, exchange).await.is_err() {
                    debug!("ping {} hit overall timeout {:?}", address, limit);
                }
            }
            None => exchange.await,
        }

        Ok(PingStatistics::from_round_trips(sent, &round_trips))
    }
}

async fn echo_exchange(
    pinger: &mut surge_ping::Pinger,
    profile: &PingProfile,
    sent: &mut u32,
    round_trips: &mut Vec<Duration>,
) {
    for seq in 0..profile.count {
        if seq > 0 {
            tokio::time::sleep(profile.interval).await;
        }
        *sent += 1;
        match pinger.ping(PingSequence(seq), &PAYLOAD).await {
            Ok((_, rtt)) => round_trips.push(rtt),
            Err(e) => debug!("icmp_seq={} no reply: {}", seq, e),
        }
    }
}

fn next_identifier() -> PingIdentifier {
    let offset = NEXT_IDENTIFIER.fetch_add(1, Ordering::Relaxed);
    PingIdentifier((std::process::id() as u16).wrapping_add(offset))
}
