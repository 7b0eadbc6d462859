//! Thin client for the Keenetic router's local RCI endpoint.
//!
//! Strictly a hint source: interface descriptors refine egress selection and
//! the router's DNS servers seed the resolver drop-in. Every failure here
//! degrades to "no hints" with a warning, never to a reconciliation error.

use serde::Deserialize;
use thiserror::Error;
use url::Url;

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;

pub const DEFAULT_BASE_URL: &str = "http://localhost:79/rci/";

const RCI_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum Error {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("URL error: {0}")]
    Url(#[from] url::ParseError),
}

/// Interface descriptor as reported by `show/interface`.
#[derive(Clone, Debug, Deserialize)]
pub struct Interface {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default, rename = "interface-name")]
    pub interface_name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub link: Option<String>,
    #[serde(default)]
    pub connected: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub address: Option<IpAddr>,
    #[serde(default)]
    pub mask: Option<IpAddr>,
}

impl Interface {
    /// The router's own view: usable iff the link is up and connected.
    pub fn is_connected(&self) -> bool {
        self.link.as_deref() == Some("up") && self.connected.as_deref() == Some("yes")
    }
}

/// Interfaces keyed by their `address/prefix` notation, the form local link
/// addresses are matched against.
pub type InterfaceMap = HashMap<String, Interface>;

#[derive(Deserialize)]
struct NameServerList {
    #[serde(default)]
    server: Vec<NameServer>,
}

#[derive(Deserialize)]
struct NameServer {
    address: String,
    #[serde(default)]
    domain: Option<String>,
}

#[derive(Clone, Debug)]
pub struct Client {
    http: reqwest::Client,
    base: Url,
}

impl Client {
    pub fn new() -> Result<Self, Error> {
        Self::with_base(DEFAULT_BASE_URL)
    }

    pub fn with_base(base: &str) -> Result<Self, Error> {
        Ok(Client {
            http: reqwest::Client::builder().timeout(RCI_TIMEOUT).build()?,
            base: Url::parse(base)?,
        })
    }

    /// Interface snapshot keyed by CIDR, from `show/interface`.
    pub async fn interfaces(&self) -> Result<InterfaceMap, Error> {
        let url = self.base.join("show/interface")?;
        let raw: HashMap<String, Interface> = self
            .http
            .get(url.clone())
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        tracing::debug!(%url, interfaces = raw.len(), "fetched interface snapshot");
        Ok(keyed_by_cidr(raw))
    }

    /// Upstream DNS servers from `show/ip/name-server`, already in the form
    /// a dnsmasq `server=` directive accepts (`ip` or `/domain/ip`).
    pub async fn dns_servers(&self) -> Result<Vec<String>, Error> {
        let url = self.base.join("show/ip/name-server")?;
        let list: NameServerList = self
            .http
            .get(url.clone())
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        tracing::debug!(%url, servers = list.server.len(), "fetched router DNS servers");
        Ok(list.server.iter().map(server_directive).collect())
    }
}

fn keyed_by_cidr(raw: HashMap<String, Interface>) -> InterfaceMap {
    raw.into_values()
        .filter_map(|iface| {
            let addr = iface.address?;
            let mask = iface.mask?;
            Some((format!("{}/{}", addr, mask_to_prefix(&mask)), iface))
        })
        .collect()
}

fn mask_to_prefix(mask: &IpAddr) -> u8 {
    match mask {
        IpAddr::V4(m) => u32::from(*m).count_ones() as u8,
        IpAddr::V6(m) => u128::from(*m).count_ones() as u8,
    }
}

fn server_directive(server: &NameServer) -> String {
    match server.domain.as_deref() {
        Some(domain) if !domain.is_empty() => format!("/{}/{}", domain, server.address),
        _ => server.address.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_is_keyed_by_cidr() {
        let raw: HashMap<String, Interface> = serde_json::from_str(
            r#####"
{
  "Wireguard1": {
    "id": "Wireguard1",
    "interface-name": "nwg1",
    "link": "up",
    "connected": "yes",
    "address": "172.16.1.2",
    "mask": "255.255.255.0"
  },
  "GigabitEthernet1": {
    "id": "GigabitEthernet1",
    "link": "up",
    "connected": "yes"
  }
}
"#####,
        )
        .expect("fixture must parse");

        let map = keyed_by_cidr(raw);
        assert_eq!(map.len(), 1, "interfaces without an address are skipped");
        let iface = map.get("172.16.1.2/24").expect("cidr key present");
        assert!(iface.is_connected());
    }

    #[test]
    fn disconnected_interface_is_reported() {
        let iface: Interface =
            serde_json::from_str(r#"{"id": "Wireguard1", "link": "up", "connected": "no"}"#).expect("parse");
        assert!(!iface.is_connected());

        let iface: Interface = serde_json::from_str(r#"{"id": "Wireguard1"}"#).expect("parse");
        assert!(!iface.is_connected(), "missing fields mean not connected");
    }

    #[test]
    fn mask_conversion_handles_both_families() {
        assert_eq!(mask_to_prefix(&"255.255.255.0".parse().unwrap()), 24);
        assert_eq!(mask_to_prefix(&"255.255.0.0".parse().unwrap()), 16);
        assert_eq!(mask_to_prefix(&"ffff:ffff:ffff:ffff::".parse().unwrap()), 64);
    }

    #[test]
    fn dns_directives_support_scoped_domains() {
        let list: NameServerList = serde_json::from_str(
            r#####"
{
  "server": [
    {"address": "1.1.1.1"},
    {"address": "10.1.1.1", "domain": "corp.local"}
  ]
}
"#####,
        )
        .expect("fixture must parse");

        let directives: Vec<String> = list.server.iter().map(server_directive).collect();
        assert_eq!(directives, vec!["1.1.1.1".to_string(), "/corp.local/10.1.1.1".to_string()]);
    }
}
