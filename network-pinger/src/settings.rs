use std::{path::PathBuf, time::Duration};

use clap::{ArgAction, Parser, ValueEnum};
use config::{Config, ConfigError, Environment};
use network_pinger_common::AddressFamily;
use serde::Deserialize;

const DEFAULT_PING_CONCURRENCY: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Mode {
    /// Run cycles until shutdown and serve metrics.
    #[value(alias = "daemon")]
    Server,
    /// Run a single cycle, then exit.
    Job,
}

/// Command line flags.
#[derive(Debug, Clone, Parser)]
#[command(name = "network-pinger", version, about = "Cluster network connectivity checker")]
pub struct Args {
    /// metrics port
    #[arg(long, default_value_t = 8080)]
    pub port: u16,

    /// Path to kubeconfig file with authorization and master location information.
    /// If not set use the in-cluster token.
    #[arg(long, default_value = "")]
    pub kubeconfig: String,

    /// network-pinger daemonset namespace
    #[arg(long, default_value = "kube-system")]
    pub ds_namespace: String,

    /// Ping peer pods in this namespace instead of the daemonset namespace
    #[arg(long, default_value = "")]
    pub dest_namespace: String,

    /// Label selector matching peer pinger pods
    #[arg(long, default_value = "app=network-pinger")]
    pub match_labels: String,

    /// interval seconds between consecutive pings
    #[arg(long, default_value_t = 5)]
    pub interval: u64,

    /// server or job mode
    #[arg(long, value_enum, default_value_t = Mode::Server)]
    pub mode: Mode,

    /// exit code when failure happens
    #[arg(long, default_value_t = 0)]
    pub exit_code: i32,

    /// check dns from pod
    #[arg(long, default_value = "kubernetes.default")]
    pub internal_dns: String,

    /// check external dns resolve from pod
    #[arg(long, default_value = "")]
    pub external_dns: String,

    /// check ping connection to an external address
    #[arg(long, default_value = "")]
    pub external_address: String,

    /// external subnet reachable from the cluster
    #[arg(long, default_value = "172.18.11.0/24")]
    pub external_subnet: String,

    /// The cni plugin the current cluster uses
    #[arg(long, default_value = "kube-ovn")]
    pub network_mode: String,

    /// Whether to support metrics query
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    pub enable_metrics: bool,

    /// Maximum number of targets pinged at the same time
    #[arg(long, default_value_t = DEFAULT_PING_CONCURRENCY)]
    pub ping_concurrency: usize,

    /// Verbose output
    #[arg(short, long)]
    pub verbose: bool,
}

/// Identity injected through the downward API.
#[derive(Debug, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct Identity {
    #[serde(default)]
    pub pod_ip: String,
    #[serde(default)]
    pub host_ip: String,
    #[serde(default)]
    pub node_name: String,
    #[serde(default)]
    pub pod_name: String,
}

impl Identity {
    /// Reads `POD_IP`, `HOST_IP`, `NODE_NAME` and `POD_NAME`.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let s = Config::builder()
            .add_source(Environment::default())
            .build()?;

        s.try_deserialize()
    }
}

/// Process configuration. Built once at startup and shared read-only.
#[derive(Debug, Clone)]
pub struct Settings {
    pub port: u16,
    pub kubeconfig: Option<PathBuf>,
    pub ds_namespace: String,
    pub dest_namespace: Option<String>,
    pub match_labels: String,
    pub interval: Duration,
    pub mode: Mode,
    pub exit_code: i32,
    pub internal_dns: String,
    pub external_dns: Option<String>,
    pub external_address: Option<String>,
    pub external_subnet: String,
    pub network_mode: String,
    pub enable_metrics: bool,
    pub ping_concurrency: usize,
    pub identity: Identity,
    /// Families of this pod's own addresses, filled in by bootstrap.
    pub pod_protocols: Vec<AddressFamily>,
}

impl Settings {
    /// Flags plus the identity found in the environment.
    pub fn load(args: Args) -> Result<Self, ConfigError> {
        Ok(Self::new(args, Identity::from_env()?))
    }

    pub fn new(args: Args, identity: Identity) -> Self {
        Self {
            port: args.port,
            kubeconfig: non_empty(args.kubeconfig).map(PathBuf::from),
            ds_namespace: args.ds_namespace,
            dest_namespace: non_empty(args.dest_namespace),
            match_labels: args.match_labels,
            interval: Duration::from_secs(args.interval.max(1)),
            mode: args.mode,
            exit_code: args.exit_code,
            internal_dns: args.internal_dns,
            external_dns: non_empty(args.external_dns),
            external_address: non_empty(args.external_address),
            external_subnet: args.external_subnet,
            network_mode: args.network_mode,
            enable_metrics: args.enable_metrics,
            ping_concurrency: args.ping_concurrency.max(1),
            identity,
            pod_protocols: Vec::new(),
        }
    }

    pub fn with_pod_protocols(mut self, pod_protocols: Vec<AddressFamily>) -> Self {
        self.pod_protocols = pod_protocols;
        self
    }

    /// Namespace listed for peer pods.
    pub fn peer_namespace(&self) -> &str {
        self.dest_namespace.as_deref().unwrap_or(&self.ds_namespace)
    }

    pub fn serves_metrics(&self) -> bool {
        self.mode == Mode::Server && self.enable_metrics
    }
}

fn non_empty(value: String) -> Option<String> {
    if value.is_empty() { None } else { Some(value) }
}
