use std::net::IpAddr;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use hickory_resolver::{
    config::{ResolverConfig, ResolverOpts},
    TokioAsyncResolver,
};
use tracing::debug;

use crate::utils::network::trim_fqdn;

/// Reverse-resolves hop addresses to host names.
#[async_trait]
pub trait NameResolver: Send + Sync {
    /// Host name for `addr`, or `None` when the lookup fails or has no answer.
    async fn reverse(&self, addr: IpAddr) -> Option<String>;
}

/// System-configured DNS resolver.
#[derive(Clone)]
pub struct HickoryResolver {
    resolver: TokioAsyncResolver,
}

impl HickoryResolver {
    pub fn new() -> Self {
        let resolver = TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default());
        Self { resolver }
    }

    /// Resolve a target given as an address literal or a host name.
    pub async fn lookup_target(&self, target: &str) -> Result<IpAddr> {
        if let Ok(ip) = target.parse::<IpAddr>() {
            return Ok(ip);
        }

        let response = self
            .resolver
            .lookup_ip(target)
            .await
            .with_context(|| format!("failed to resolve {target}"))?;
        response
            .iter()
            .next()
            .ok_or_else(|| anyhow!("no addresses found for {target}"))
    }
}

impl Default for HickoryResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NameResolver for HickoryResolver {
    async fn reverse(&self, addr: IpAddr) -> Option<String> {
        match self.resolver.reverse_lookup(addr).await {
            Ok(names) => names
                .iter()
                .next()
                .map(|name| trim_fqdn(&name.to_string()))
                .filter(|name| !name.is_empty()),
            Err(e) => {
                debug!("Reverse lookup for {} failed: {}", addr, e);
                None
            }
        }
    }
}
