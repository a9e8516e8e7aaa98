use thiserror::Error;

/// Exit code used when the process cannot learn its own pod addresses.
pub const FATAL_STARTUP_EXIT_CODE: i32 = 255;

/// Per-target failures. These never abort a cycle; the target is skipped
/// and counted as failed.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("invalid probe address {0:?}")]
    InvalidAddress(String),

    #[error("failed to init pinger for {address}: {source}")]
    Setup {
        address: String,
        #[source]
        source: std::io::Error,
    },
}

/// Fatal conditions while resolving this instance's own pod addresses.
#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("failed to get self pod {namespace}/{name}: {cause:#}")]
    ControlPlane {
        namespace: String,
        name: String,
        cause: anyhow::Error,
    },

    #[error("pod {namespace}/{name} is ready but has no IPs")]
    ReadyWithoutAddresses { namespace: String, name: String },

    #[error("failed to get IPs of pod {namespace}/{name} after {attempts} attempts")]
    Exhausted {
        namespace: String,
        name: String,
        attempts: u32,
    },
}
