use crate::error::{FilterError, Result};
use async_trait::async_trait;
use hickory_resolver::config::{NameServerConfigGroup, ResolverConfig, ResolverOpts};
use hickory_resolver::error::ResolveErrorKind;
use hickory_resolver::TokioAsyncResolver;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

/// The three DNS operations the blocklist resolver needs. Every call names
/// the servers to ask, since the authoritative set is discovered at runtime.
#[async_trait]
pub trait DnsTransport: Send + Sync {
    /// NS records of `zone`.
    async fn name_servers(
        &self,
        servers: &[IpAddr],
        zone: &str,
        timeout: Duration,
    ) -> Result<Vec<String>>;

    /// A/AAAA addresses of `host`.
    async fn host_addresses(
        &self,
        servers: &[IpAddr],
        host: &str,
        timeout: Duration,
    ) -> Result<Vec<IpAddr>>;

    /// A records of `name`. A non-existent name yields an empty answer.
    async fn query_a(
        &self,
        servers: &[IpAddr],
        name: &str,
        timeout: Duration,
    ) -> Result<Vec<Ipv4Addr>>;
}

/// `hickory-resolver` pointed at explicit name servers, caching disabled.
#[derive(Default)]
pub struct HickoryTransport;

impl HickoryTransport {
    pub fn new() -> Self {
        HickoryTransport
    }

    fn resolver(servers: &[IpAddr], timeout: Duration) -> TokioAsyncResolver {
        let group = NameServerConfigGroup::from_ips_clear(servers, 53, true);
        let config = ResolverConfig::from_parts(None, vec![], group);

        let mut opts = ResolverOpts::default();
        opts.timeout = timeout;
        opts.attempts = 1;
        opts.cache_size = 0;
        opts.use_hosts_file = false;

        TokioAsyncResolver::tokio(config, opts)
    }
}

fn fully_qualified(name: &str) -> String {
    if name.ends_with('.') {
        name.to_string()
    } else {
        format!("{name}.")
    }
}

#[async_trait]
impl DnsTransport for HickoryTransport {
    async fn name_servers(
        &self,
        servers: &[IpAddr],
        zone: &str,
        timeout: Duration,
    ) -> Result<Vec<String>> {
        let resolver = Self::resolver(servers, timeout);
        let lookup = resolver.ns_lookup(fully_qualified(zone));

        match tokio::time::timeout(timeout, lookup).await {
            Ok(Ok(response)) => Ok(response.iter().map(|ns| ns.0.to_utf8()).collect()),
            Ok(Err(e)) => match e.kind() {
                ResolveErrorKind::NoRecordsFound { .. } => Ok(Vec::new()),
                _ => Err(FilterError::Connectivity(format!(
                    "NS lookup for {zone} failed: {e}"
                ))),
            },
            Err(_) => Err(FilterError::Connectivity(format!(
                "NS lookup for {zone} timed out"
            ))),
        }
    }

    async fn host_addresses(
        &self,
        servers: &[IpAddr],
        host: &str,
        timeout: Duration,
    ) -> Result<Vec<IpAddr>> {
        let resolver = Self::resolver(servers, timeout);
        let lookup = resolver.lookup_ip(fully_qualified(host));

        match tokio::time::timeout(timeout, lookup).await {
            Ok(Ok(response)) => Ok(response.iter().collect()),
            Ok(Err(e)) => match e.kind() {
                ResolveErrorKind::NoRecordsFound { .. } => Ok(Vec::new()),
                _ => Err(FilterError::Connectivity(format!(
                    "Address lookup for {host} failed: {e}"
                ))),
            },
            Err(_) => Err(FilterError::Connectivity(format!(
                "Address lookup for {host} timed out"
            ))),
        }
    }

    async fn query_a(
        &self,
        servers: &[IpAddr],
        name: &str,
        timeout: Duration,
    ) -> Result<Vec<Ipv4Addr>> {
        let resolver = Self::resolver(servers, timeout);
        let lookup = resolver.ipv4_lookup(fully_qualified(name));

        match tokio::time::timeout(timeout, lookup).await {
            Ok(Ok(response)) => Ok(response.iter().map(|a| a.0).collect()),
            Ok(Err(e)) => match e.kind() {
                // NXDOMAIN: the address is not listed
                ResolveErrorKind::NoRecordsFound { .. } => Ok(Vec::new()),
                _ => Err(FilterError::Connectivity(format!(
                    "Blocklist query {name} failed: {e}"
                ))),
            },
            Err(_) => Err(FilterError::Connectivity(format!(
                "Blocklist query {name} timed out"
            ))),
        }
    }
}
