//! DNS blocklist lookups with a longest-prefix cache in front.

pub mod ip_tree;
pub mod transport;

pub use ip_tree::{IpTree, ReputationStore};
pub use transport::{DnsTransport, HickoryTransport};

use crate::config::ReputationConfig;
use crate::error::{FilterError, Result};
use async_trait::async_trait;
use ipnet::IpNet;
use lazy_static::lazy_static;
use regex::Regex;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

lazy_static! {
    static ref FEED_LINE: Regex = Regex::new(r"^(.*)/([0-9]+) ; (.*)").unwrap();
}

/// Cache value for addresses the blocklist does not know.
pub const NOT_LISTED: &str = "NL";

const KNOWN_CODES: &[(u8, &str)] = &[
    (2, "SBL"),
    (3, "SBLCSS"),
    (4, "XBL"),
    (9, "DROP"),
    (10, "PBL_ISP"),
    (11, "PBL"),
];

/// Bitwise OR of the last octets of a blocklist answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListingCode(pub u8);

impl ListingCode {
    pub fn from_answers(answers: &[Ipv4Addr]) -> Self {
        ListingCode(answers.iter().fold(0, |code, a| code | a.octets()[3]))
    }

    pub fn is_listed(&self) -> bool {
        self.0 != 0
    }

    /// Known list names covered by the code. An exact match yields one
    /// name; otherwise every maximal known code contained in the bitmask.
    pub fn identifiers(&self) -> Vec<String> {
        if !self.is_listed() {
            return Vec::new();
        }
        if let Some((_, name)) = KNOWN_CODES.iter().find(|(code, _)| *code == self.0) {
            return vec![name.to_string()];
        }

        let contained: Vec<u8> = KNOWN_CODES
            .iter()
            .map(|(code, _)| *code)
            .filter(|code| code & self.0 == *code)
            .collect();

        let names: Vec<String> = KNOWN_CODES
            .iter()
            .filter(|(code, _)| contained.contains(code))
            .filter(|(code, _)| {
                !contained
                    .iter()
                    .any(|other| other != code && other & code == *code)
            })
            .map(|(_, name)| name.to_string())
            .collect();

        if names.is_empty() {
            vec![format!("CODE{}", self.0)]
        } else {
            names
        }
    }
}

/// Reverse-lookup name of `ip` below `zone`.
pub fn dnsbl_query_name(ip: IpAddr, zone: &str) -> String {
    let labels: Vec<String> = match ip {
        IpAddr::V4(v4) => v4.octets().iter().rev().map(|o| o.to_string()).collect(),
        IpAddr::V6(v6) => v6
            .octets()
            .iter()
            .rev()
            .flat_map(|byte| [format!("{:x}", byte & 0x0f), format!("{:x}", byte >> 4)])
            .collect(),
    };
    format!("{}.{}", labels.join("."), zone.trim_end_matches('.'))
}

/// What the classifier needs from a reputation source.
#[async_trait]
pub trait ReputationLookup: Send + Sync {
    /// Blocklist identifiers for `ip`; empty when not listed or unknown.
    async fn look_up(&self, ip: IpAddr) -> Result<Vec<String>>;
}

pub struct ReputationResolver {
    config: ReputationConfig,
    transport: Box<dyn DnsTransport>,
    store: RwLock<Box<dyn ReputationStore>>,
    authoritative_v4: RwLock<Vec<IpAddr>>,
    authoritative_v6: RwLock<Vec<IpAddr>>,
}

impl ReputationResolver {
    pub fn new(config: ReputationConfig) -> Self {
        Self::with_transport(config, Box::new(HickoryTransport::new()))
    }

    pub fn with_transport(config: ReputationConfig, transport: Box<dyn DnsTransport>) -> Self {
        ReputationResolver {
            config,
            transport,
            store: RwLock::new(Box::new(IpTree::new())),
            authoritative_v4: RwLock::new(Vec::new()),
            authoritative_v6: RwLock::new(Vec::new()),
        }
    }

    pub fn with_store(mut self, store: Box<dyn ReputationStore>) -> Self {
        self.store = RwLock::new(store);
        self
    }

    pub fn config(&self) -> &ReputationConfig {
        &self.config
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.config.query_timeout_seconds)
    }

    fn read_store(&self) -> RwLockReadGuard<'_, Box<dyn ReputationStore>> {
        self.store.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_store(&self) -> RwLockWriteGuard<'_, Box<dyn ReputationStore>> {
        self.store.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn cached_entries(&self) -> usize {
        self.read_store().len()
    }

    /// Servers answering blocklist queries: v6 when enabled and known.
    pub fn authoritative_servers(&self) -> Vec<IpAddr> {
        let v6 = self
            .authoritative_v6
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if self.config.use_ipv6 && !v6.is_empty() {
            return v6;
        }
        self.authoritative_v4
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn bootstrap_servers(&self) -> &[IpAddr] {
        if self.config.use_ipv6 && !self.config.bootstrap_v6.is_empty() {
            &self.config.bootstrap_v6
        } else {
            &self.config.bootstrap_v4
        }
    }

    /// Discover the authoritative name servers of the blocklist zone.
    pub async fn initialize(&self) -> Result<()> {
        match self.discover_name_servers().await {
            Ok(()) => Ok(()),
            Err(e) if self.config.quiet_mode => {
                log::warn!(
                    "Could not discover name servers for {}: {e}",
                    self.config.zone
                );
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn discover_name_servers(&self) -> Result<()> {
        let bootstrap = self.bootstrap_servers();
        let timeout = self.timeout();

        let names = self
            .transport
            .name_servers(bootstrap, &self.config.zone, timeout)
            .await?;
        if names.is_empty() {
            log::warn!("No NS records found for {}", self.config.zone);
            return Ok(());
        }

        let chosen = &names[pick_index(names.len())];
        log::debug!("Using {chosen} as authoritative server for {}", self.config.zone);

        let addresses = self
            .transport
            .host_addresses(bootstrap, chosen, timeout)
            .await?;
        let (v6, v4): (Vec<IpAddr>, Vec<IpAddr>) =
            addresses.into_iter().partition(|ip| ip.is_ipv6());

        if !v4.is_empty() {
            *self
                .authoritative_v4
                .write()
                .unwrap_or_else(PoisonError::into_inner) = v4;
        }
        if !v6.is_empty() {
            *self
                .authoritative_v6
                .write()
                .unwrap_or_else(PoisonError::into_inner) = v6;
        }
        Ok(())
    }

    /// Blocklist identifier(s) of `ip`, comma separated, or `None`.
    pub async fn is_blocked(&self, ip: IpAddr) -> Result<Option<String>> {
        match self.resolve(ip).await {
            Ok(listing) => Ok(listing),
            Err(e) if self.config.quiet_mode => {
                let degraded = FilterError::ResolutionDegraded(ip, e.to_string());
                log::debug!("{degraded}");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn resolve(&self, ip: IpAddr) -> Result<Option<String>> {
        if self.config.use_cache {
            if let Some(identifier) = self.read_store().get(ip) {
                return Ok(Some(identifier).filter(|id| id != NOT_LISTED));
            }
        }

        if self.authoritative_servers().is_empty() {
            self.initialize().await?;
        }
        let servers = self.authoritative_servers();
        if servers.is_empty() {
            return Ok(None);
        }

        let query = dnsbl_query_name(ip, &self.config.zone);
        let answers = self
            .transport
            .query_a(&servers, &query, self.timeout())
            .await?;
        let code = ListingCode::from_answers(&answers);
        let identifiers = code.identifiers();
        log::debug!("{query} -> code {}", code.0);

        let value = if identifiers.is_empty() {
            NOT_LISTED.to_string()
        } else {
            identifiers.join(",")
        };
        if self.config.use_cache {
            self.write_store().set(IpNet::from(ip), value.clone());
        }

        Ok(Some(value).filter(|v| v != NOT_LISTED))
    }

    pub fn add_network(&self, network: IpAddr, prefix_len: u8, identifier: &str) -> Result<()> {
        let network = IpNet::new(network, prefix_len)
            .map_err(|e| FilterError::Parse(format!("{network}/{prefix_len}: {e}")))?;
        self.write_store()
            .set(network.trunc(), identifier.to_string());
        Ok(())
    }

    pub fn add_ip_address(&self, ip: IpAddr, identifier: &str) {
        self.write_store().set(IpNet::from(ip), identifier.to_string());
    }

    /// Load `network/mask ; identifier` lines. Returns the number of entries.
    pub fn add_feed(&self, text: &str) -> Result<usize> {
        let mut added = 0;

        for line in text.lines().map(str::trim) {
            if line.is_empty() || line.starts_with(';') {
                continue;
            }
            let Some(caps) = FEED_LINE.captures(line) else {
                log::debug!("Ignoring feed line: {line}");
                continue;
            };
            let result = caps[1]
                .trim()
                .parse::<IpAddr>()
                .map_err(|e| {
                    FilterError::Parse(format!("Invalid network in feed line '{line}': {e}"))
                })
                .and_then(|network| {
                    let prefix_len = caps[2].parse::<u8>().map_err(|e| {
                        FilterError::Parse(format!("Invalid mask in feed line '{line}': {e}"))
                    })?;
                    self.add_network(network, prefix_len, caps[3].trim())
                });

            match result {
                Ok(()) => added += 1,
                Err(e) if self.config.quiet_mode => log::warn!("Skipping feed entry: {e}"),
                Err(e) => return Err(e),
            }
        }

        Ok(added)
    }

    /// Load a feed from a file path or an `http(s)` URL.
    pub async fn add_feed_source(&self, source: &str) -> Result<usize> {
        let text = match url::Url::parse(source) {
            Ok(url) if url.scheme() == "http" || url.scheme() == "https" => {
                fetch_feed(url).await?
            }
            _ => tokio::fs::read_to_string(source).await?,
        };
        let added = self.add_feed(&text)?;
        log::info!("Loaded {added} blocklist entries from {source}");
        Ok(added)
    }

    /// Load every configured feed; failures are logged and skipped in quiet mode.
    pub async fn load_configured_feeds(&self) -> Result<()> {
        for source in &self.config.feeds {
            match self.add_feed_source(source).await {
                Ok(_) => {}
                Err(e) if self.config.quiet_mode => {
                    log::warn!("Failed to load blocklist feed {source}: {e}")
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ReputationLookup for ReputationResolver {
    async fn look_up(&self, ip: IpAddr) -> Result<Vec<String>> {
        Ok(self
            .is_blocked(ip)
            .await?
            .map(|ids| ids.split(',').map(str::to_string).collect())
            .unwrap_or_default())
    }
}

async fn fetch_feed(url: url::Url) -> Result<String> {
    let response = reqwest::get(url.clone())
        .await
        .and_then(|r| r.error_for_status())
        .map_err(|e| FilterError::Connectivity(format!("Failed to fetch {url}: {e}")))?;
    response
        .text()
        .await
        .map_err(|e| FilterError::Connectivity(format!("Failed to read {url}: {e}")))
}

fn pick_index(len: usize) -> usize {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos() as usize)
        .unwrap_or(0);
    nanos % len
}
