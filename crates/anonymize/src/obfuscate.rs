//! Archive-wide obfuscation of the cluster base domain and IPv4 addresses.

use anyhow::Result;
use harvest_core::Marshaller;
use once_cell::sync::Lazy;
use regex::bytes::{NoExpand, Regex as BytesRegex};
use regex::Regex;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::warn;

pub const CLUSTER_BASE_DOMAIN_PLACEHOLDER: &str = "<CLUSTER_BASE_DOMAIN>";

static IPV4: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"((25[0-5]|2[0-4][0-9]|[01]?[0-9][0-9]?)\.){3}(25[0-5]|2[0-4][0-9]|[01]?[0-9][0-9]?)")
        .expect("static ipv4 pattern")
});

/// An IPv4 network in CIDR form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Net {
    base: Ipv4Addr,
    prefix: u8,
}

impl Ipv4Net {
    pub fn parse(cidr: &str) -> Option<Self> {
        let (addr, prefix) = cidr.trim().split_once('/')?;
        let addr: Ipv4Addr = addr.parse().ok()?;
        let prefix: u8 = prefix.parse().ok().filter(|p| *p <= 32)?;
        let base = Ipv4Addr::from(u32::from(addr) & Self::mask(prefix));
        Some(Self { base, prefix })
    }

    fn mask(prefix: u8) -> u32 {
        if prefix == 0 { 0 } else { u32::MAX << (32 - u32::from(prefix)) }
    }

    pub fn base(&self) -> Ipv4Addr { self.base }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        u32::from(ip) & Self::mask(self.prefix) == u32::from(self.base)
    }
}

/// Replaces the base domain with a placeholder and IPv4 addresses with
/// their network address (or `0.0.0.0` when no known network matches).
#[derive(Debug, Clone, Default)]
pub struct Obfuscator {
    base_domain: Option<String>,
    /// Literal matcher for the base domain in non-UTF-8 bodies.
    domain_bytes: Option<BytesRegex>,
    networks: Vec<Ipv4Net>,
}

impl Obfuscator {
    /// Unparsable CIDRs are skipped with a warning; loopback is always known.
    pub fn new(base_domain: Option<&str>, cidrs: &[String]) -> Self {
        let mut networks: Vec<Ipv4Net> = cidrs
            .iter()
            .filter_map(|c| {
                let n = Ipv4Net::parse(c);
                if n.is_none() {
                    warn!(cidr = %c, "obfuscation: skipping unparsable network");
                }
                n
            })
            .collect();
        if let Some(lo) = Ipv4Net::parse("127.0.0.1/8") {
            networks.push(lo);
        }
        let base_domain = base_domain.map(str::trim).filter(|d| !d.is_empty()).map(str::to_string);
        let domain_bytes = base_domain.as_deref().and_then(|d| match BytesRegex::new(&regex::escape(d)) {
            Ok(re) => Some(re),
            Err(e) => {
                warn!(domain = %d, error = %e, "obfuscation: binary bodies keep the base domain");
                None
            }
        });
        Self { base_domain, domain_bytes, networks }
    }

    pub fn base_domain(&self) -> Option<&str> { self.base_domain.as_deref() }
    pub fn networks(&self) -> &[Ipv4Net] { &self.networks }

    pub fn name(&self, name: &str) -> String {
        match &self.base_domain {
            Some(d) => name.replace(d.as_str(), CLUSTER_BASE_DOMAIN_PLACEHOLDER),
            None => name.to_string(),
        }
    }

    fn ip(&self, found: &str) -> String {
        let Ok(ip) = found.parse::<Ipv4Addr>() else { return found.to_string() };
        self.networks
            .iter()
            .find(|n| n.contains(ip))
            .map(|n| n.base().to_string())
            .unwrap_or_else(|| Ipv4Addr::UNSPECIFIED.to_string())
    }

    /// Non-UTF-8 bodies only get the base domain replaced.
    pub fn body(&self, data: &[u8]) -> Vec<u8> {
        match std::str::from_utf8(data) {
            Ok(text) => {
                let text = self.name(text);
                IPV4.replace_all(&text, |c: &regex::Captures| self.ip(&c[0])).into_owned().into_bytes()
            }
            Err(_) => match &self.domain_bytes {
                Some(re) => re.replace_all(data, NoExpand(CLUSTER_BASE_DOMAIN_PLACEHOLDER.as_bytes())).into_owned(),
                None => data.to_vec(),
            },
        }
    }
}

/// Wraps a marshaller and obfuscates what it produces.
pub struct ObfuscatingMarshaller {
    pub inner: Arc<dyn Marshaller>,
    pub obfuscator: Arc<Obfuscator>,
}

impl Marshaller for ObfuscatingMarshaller {
    fn marshal(&self) -> Result<Vec<u8>> {
        Ok(self.obfuscator.body(&self.inner.marshal()?))
    }
    fn extension(&self) -> &'static str { self.inner.extension() }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ob() -> Obfuscator {
        Obfuscator::new(Some("openshift.example.com"), &["10.128.0.0/14".into(), "172.30.0.0/16".into(), "bogus".into()])
    }

    #[test]
    fn ips_map_to_first_matching_network() {
        let o = ob();
        let out = String::from_utf8(o.body(b"a 10.128.0.1 b 10.129.3.4 c 172.30.0.5 d 127.0.0.1 e 10.0.134.130")).expect("utf8");
        assert_eq!(out, "a 10.128.0.0 b 10.128.0.0 c 172.30.0.0 d 127.0.0.0 e 0.0.0.0");
    }

    #[test]
    fn base_domain_replaced_in_names_and_bodies() {
        let o = ob();
        assert_eq!(o.name("config/host/api.openshift.example.com"), "config/host/api.<CLUSTER_BASE_DOMAIN>");
        let out = o.body(b"\xff cluster-api.openshift.example.com");
        assert_eq!(out, b"\xff cluster-api.<CLUSTER_BASE_DOMAIN>".to_vec());
    }

    #[test]
    fn domain_is_matched_literally_in_binary_bodies() {
        let o = Obfuscator::new(Some("a.b$1"), &[]);
        let out = o.body(b"\xfe a.b$1a.b$1 axb$1 a.b$");
        assert_eq!(out, b"\xfe <CLUSTER_BASE_DOMAIN><CLUSTER_BASE_DOMAIN> axb$1 a.b$".to_vec());
        assert_eq!(Obfuscator::new(Some("  "), &[]).body(b"\xfe  "), b"\xfe  ".to_vec());
    }

    #[test]
    fn cidr_parse_masks_base() {
        let n = Ipv4Net::parse("127.0.0.1/8").expect("net");
        assert_eq!(n.base(), Ipv4Addr::new(127, 0, 0, 0));
        assert!(n.contains(Ipv4Addr::new(127, 9, 9, 9)));
        assert!(Ipv4Net::parse("1.2.3.4/33").is_none());
        assert!(Ipv4Net::parse("0.0.0.0/0").is_some_and(|n| n.contains(Ipv4Addr::new(8, 8, 8, 8))));
    }
}
