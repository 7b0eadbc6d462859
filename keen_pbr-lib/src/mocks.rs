//! Stateful mocks for the kernel-facing trait abstractions.
//!
//! These mocks track actual state (routes, rules, sets that exist) rather
//! than just verifying call sequences. This lets tests assert on the
//! system's _state_ after a reconciliation pass, not just which calls
//! happened. A small operation log is kept where ordering matters.
//!
//! All mocks use `Arc<Mutex<_>>` for interior mutability in async contexts.

#![cfg(test)]

use async_trait::async_trait;
use cidr::IpCidr;

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};

use crate::config::{IpFamily, Ipset};
use crate::ipset::{self, ImportStats, IpsetOps};
use crate::routing::Error;
use crate::routing::iptables_ops::IptablesOps;
use crate::routing::netlink_ops::{AddrInfo, LinkInfo, NetlinkOps, RouteSpec, RuleSpec};

// ============================================================================
// MockNetlinkOps
// ============================================================================

#[derive(Debug, Default)]
pub struct NetlinkState {
    pub routes: Vec<RouteSpec>,
    pub rules: Vec<RuleSpec>,
    pub links: Vec<LinkInfo>,
    pub addrs: Vec<AddrInfo>,
    /// chronological log of mutating operations, for ordering assertions
    pub ops: Vec<String>,
    /// Map of operation name -> error message. If set, the operation fails.
    pub fail_on: HashMap<String, String>,
}

impl NetlinkState {
    fn check_fail(&self, op: &str) -> Result<(), Error> {
        if let Some(msg) = self.fail_on.get(op) {
            Err(Error::General(msg.clone()))
        } else {
            Ok(())
        }
    }
}

fn route_tag(route: &RouteSpec) -> String {
    let kind = if route.blackhole {
        "blackhole"
    } else if route.is_default() {
        "default"
    } else {
        "net"
    };
    format!("{kind} table {}", route.table_id)
}

#[derive(Clone)]
pub struct MockNetlinkOps {
    pub state: Arc<Mutex<NetlinkState>>,
}

impl MockNetlinkOps {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(NetlinkState::default())),
        }
    }

    pub fn with_state(state: NetlinkState) -> Self {
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }
}

#[async_trait]
impl NetlinkOps for MockNetlinkOps {
    async fn route_add(&self, route: &RouteSpec) -> Result<(), Error> {
        let mut s = self.state.lock().unwrap();
        s.check_fail("route_add")?;

        let exists = s.routes.iter().any(|r| {
            r.family == route.family
                && r.destination == route.destination
                && r.prefix_len == route.prefix_len
                && r.table_id == route.table_id
                && r.blackhole == route.blackhole
        });
        if exists {
            return Err(Error::General(format!(
                "route already exists: {}/{} table {}",
                route.destination, route.prefix_len, route.table_id
            )));
        }
        s.ops.push(format!("route_add {}", route_tag(route)));
        s.routes.push(*route);
        Ok(())
    }

    async fn route_del(&self, route: &RouteSpec) -> Result<(), Error> {
        let mut s = self.state.lock().unwrap();
        s.check_fail("route_del")?;

        let before = s.routes.len();
        s.routes.retain(|r| {
            !(r.family == route.family
                && r.destination == route.destination
                && r.prefix_len == route.prefix_len
                && r.table_id == route.table_id
                && r.blackhole == route.blackhole)
        });
        if s.routes.len() == before {
            return Err(Error::General("route not found".into()));
        }
        s.ops.push(format!("route_del {}", route_tag(route)));
        Ok(())
    }

    async fn route_list(&self, family: IpFamily, table_id: u32) -> Result<Vec<RouteSpec>, Error> {
        let s = self.state.lock().unwrap();
        s.check_fail("route_list")?;
        Ok(s.routes
            .iter()
            .filter(|r| r.family == family && r.table_id == table_id)
            .copied()
            .collect())
    }

    async fn rule_add(&self, rule: &RuleSpec) -> Result<(), Error> {
        let mut s = self.state.lock().unwrap();
        s.check_fail("rule_add")?;

        let exists = s
            .rules
            .iter()
            .any(|r| r.family == rule.family && r.fw_mark == rule.fw_mark && r.table_id == rule.table_id);
        if exists {
            return Err(Error::General(format!("rule already exists: fwmark {}", rule.fw_mark)));
        }
        s.ops.push(format!("rule_add fwmark {}", rule.fw_mark));
        s.rules.push(*rule);
        Ok(())
    }

    async fn rule_del(&self, rule: &RuleSpec) -> Result<(), Error> {
        let mut s = self.state.lock().unwrap();
        s.check_fail("rule_del")?;

        let before = s.rules.len();
        s.rules
            .retain(|r| !(r.family == rule.family && r.fw_mark == rule.fw_mark && r.table_id == rule.table_id));
        if s.rules.len() == before {
            return Err(Error::General("rule not found".into()));
        }
        s.ops.push(format!("rule_del fwmark {}", rule.fw_mark));
        Ok(())
    }

    async fn rule_list(&self, family: IpFamily) -> Result<Vec<RuleSpec>, Error> {
        let s = self.state.lock().unwrap();
        s.check_fail("rule_list")?;
        Ok(s.rules.iter().filter(|r| r.family == family).copied().collect())
    }

    async fn link_list(&self) -> Result<Vec<LinkInfo>, Error> {
        let s = self.state.lock().unwrap();
        s.check_fail("link_list")?;
        Ok(s.links.clone())
    }

    async fn addr_list(&self) -> Result<Vec<AddrInfo>, Error> {
        let s = self.state.lock().unwrap();
        s.check_fail("addr_list")?;
        Ok(s.addrs.clone())
    }
}

// ============================================================================
// MockIptablesOps
// ============================================================================

#[derive(Debug, Default)]
pub struct IptablesState {
    /// installed rules as (family, table, chain, rule)
    pub rules: Vec<(IpFamily, String, String, String)>,
    pub fail_on: HashMap<String, String>,
}

impl IptablesState {
    fn check_fail(&self, op: &str) -> Result<(), Error> {
        if let Some(msg) = self.fail_on.get(op) {
            Err(Error::IpTables(msg.clone()))
        } else {
            Ok(())
        }
    }
}

pub struct MockIptablesOps {
    pub state: Arc<Mutex<IptablesState>>,
}

impl MockIptablesOps {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(IptablesState::default())),
        }
    }
}

impl IptablesOps for MockIptablesOps {
    fn exists(&self, family: IpFamily, table: &str, chain: &str, rule: &str) -> Result<bool, Error> {
        let s = self.state.lock().unwrap();
        s.check_fail("exists")?;
        Ok(s.rules
            .iter()
            .any(|(f, t, c, r)| *f == family && t == table && c == chain && r == rule))
    }

    fn append(&self, family: IpFamily, table: &str, chain: &str, rule: &str) -> Result<(), Error> {
        let mut s = self.state.lock().unwrap();
        s.check_fail("append")?;
        s.rules
            .push((family, table.to_string(), chain.to_string(), rule.to_string()));
        Ok(())
    }

    fn delete(&self, family: IpFamily, table: &str, chain: &str, rule: &str) -> Result<(), Error> {
        let mut s = self.state.lock().unwrap();
        s.check_fail("delete")?;
        let before = s.rules.len();
        s.rules
            .retain(|(f, t, c, r)| !(*f == family && t == table && c == chain && r == rule));
        if s.rules.len() == before {
            return Err(Error::IpTables("rule not found".into()));
        }
        Ok(())
    }
}

// ============================================================================
// MockIpsetOps
// ============================================================================

#[derive(Debug, Default)]
pub struct IpsetState {
    /// set name -> (family, member networks)
    pub sets: HashMap<String, (IpFamily, Vec<IpCidr>)>,
    pub flush_count: usize,
    pub fail_on: HashMap<String, String>,
}

impl IpsetState {
    fn check_fail(&self, op: &str) -> Result<(), ipset::Error> {
        if let Some(msg) = self.fail_on.get(op) {
            Err(ipset::Error::IO(std::io::Error::other(msg.clone())))
        } else {
            Ok(())
        }
    }
}

#[derive(Clone)]
pub struct MockIpsetOps {
    pub state: Arc<Mutex<IpsetState>>,
}

impl MockIpsetOps {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(IpsetState::default())),
        }
    }
}

#[async_trait]
impl IpsetOps for MockIpsetOps {
    async fn create(&self, name: &str, family: IpFamily) -> Result<(), ipset::Error> {
        let mut s = self.state.lock().unwrap();
        s.check_fail("create")?;
        s.sets.entry(name.to_string()).or_insert((family, Vec::new()));
        Ok(())
    }

    async fn flush(&self, name: &str) -> Result<(), ipset::Error> {
        let mut s = self.state.lock().unwrap();
        s.check_fail("flush")?;
        s.flush_count += 1;
        if let Some((_, nets)) = s.sets.get_mut(name) {
            nets.clear();
        }
        Ok(())
    }

    async fn exists(&self, name: &str) -> Result<bool, ipset::Error> {
        let s = self.state.lock().unwrap();
        s.check_fail("exists")?;
        Ok(s.sets.contains_key(name))
    }

    async fn import(&self, ipset: &Ipset, networks: &[IpCidr]) -> Result<ImportStats, ipset::Error> {
        let mut s = self.state.lock().unwrap();
        s.check_fail("import")?;

        let (family, nets) = s
            .sets
            .entry(ipset.ipset_name.clone())
            .or_insert((ipset.ip_version, Vec::new()));
        let family = *family;
        if ipset.flush_before_applying {
            nets.clear();
        }

        let mut stats = ImportStats::default();
        for net in networks {
            let matches = matches!(
                (family, net),
                (IpFamily::V4, IpCidr::V4(_)) | (IpFamily::V6, IpCidr::V6(_))
            );
            if !matches {
                stats.discarded += 1;
                continue;
            }
            if !nets.contains(net) {
                nets.push(*net);
            }
            stats.added += 1;
        }
        Ok(stats)
    }

    async fn test(&self, name: &str, addr: IpAddr) -> Result<bool, ipset::Error> {
        let s = self.state.lock().unwrap();
        s.check_fail("test")?;
        Ok(s.sets
            .get(name)
            .is_some_and(|(_, nets)| nets.iter().any(|net| net.contains(&addr))))
    }
}
