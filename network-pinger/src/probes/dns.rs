use std::net::IpAddr;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;

#[async_trait]
pub trait NameResolver: Send + Sync {
    /// Resolve `name` to at least one address.
    async fn resolve(&self, name: &str) -> Result<Vec<IpAddr>>;
}

/// Resolves through the system resolver (`/etc/resolv.conf` inside the pod).
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemResolver;

#[async_trait]
impl NameResolver for SystemResolver {
    async fn resolve(&self, name: &str) -> Result<Vec<IpAddr>> {
        let addrs: Vec<IpAddr> = tokio::net::lookup_host((name, 0))
            .await
            .with_context(|| format!("failed to resolve dns {}", name))?
            .map(|addr| addr.ip())
            .collect();

        if addrs.is_empty() {
            bail!("dns {} resolved to no addresses", name);
        }
        Ok(addrs)
    }
}
