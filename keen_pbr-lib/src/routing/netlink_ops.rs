//! Abstraction over rtnetlink operations for testability.
//!
//! Defines [`NetlinkOps`] and domain types ([`RouteSpec`], [`RuleSpec`],
//! [`LinkInfo`], [`AddrInfo`]) that decouple the reconciliation logic from
//! the raw netlink wire format.
//!
//! Production code uses [`RealNetlinkOps`] which wraps `rtnetlink::Handle`.
//! Tests use stateful mocks (see the crate's `mocks` module).

use async_trait::async_trait;
use futures::TryStreamExt;
use netlink_packet_route::link::LinkFlags;
use netlink_packet_route::route::{
    RouteAddress, RouteAttribute, RouteMessage, RouteType,
};
use netlink_packet_route::rule::{RuleAction, RuleAttribute};
use netlink_packet_route::AddressFamily;
use rtnetlink::Error::NetlinkError;
use rtnetlink::{IpVersion, RouteMessageBuilder};

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use super::Error;
use crate::config::IpFamily;

/// Metric of the per-table default route towards the chosen interface.
pub const DEFAULT_ROUTE_METRIC: u32 = 100;
/// Metric of the kill-switch blackhole route.
pub const BLACKHOLE_METRIC: u32 = 200;

// ============================================================================
// Domain Types
// ============================================================================

/// Route specification decoupled from the rtnetlink wire format.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RouteSpec {
    pub family: IpFamily,
    pub destination: IpAddr,
    pub prefix_len: u8,
    /// output device, absent for blackhole routes
    pub if_index: Option<u32>,
    pub table_id: u32,
    pub metric: Option<u32>,
    pub blackhole: bool,
}

impl RouteSpec {
    /// `default dev <if_index> table <table_id> metric 100`
    pub fn default_route(family: IpFamily, if_index: u32, table_id: u32) -> Self {
        RouteSpec {
            family,
            destination: family.unspecified(),
            prefix_len: 0,
            if_index: Some(if_index),
            table_id,
            metric: Some(DEFAULT_ROUTE_METRIC),
            blackhole: false,
        }
    }

    /// `blackhole default table <table_id> metric 200`
    pub fn blackhole(family: IpFamily, table_id: u32) -> Self {
        RouteSpec {
            family,
            destination: family.unspecified(),
            prefix_len: 0,
            if_index: None,
            table_id,
            metric: Some(BLACKHOLE_METRIC),
            blackhole: true,
        }
    }

    pub fn is_default(&self) -> bool {
        self.prefix_len == 0
    }
}

/// Policy routing rule specification: fwmark lookup into a numbered table.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RuleSpec {
    pub family: IpFamily,
    pub fw_mark: u32,
    pub table_id: u32,
    pub priority: u32,
}

/// Network link (interface) information.
#[derive(Debug, Clone)]
pub struct LinkInfo {
    pub index: u32,
    pub name: String,
    /// administratively up (IFF_UP)
    pub up: bool,
}

/// Address assigned to an interface.
#[derive(Debug, Clone)]
pub struct AddrInfo {
    pub if_index: u32,
    pub addr: IpAddr,
    pub prefix_len: u8,
}

impl AddrInfo {
    /// The `address/prefix` notation the router RPC keys its snapshot on.
    pub fn cidr_key(&self) -> String {
        format!("{}/{}", self.addr, self.prefix_len)
    }
}

// ============================================================================
// Trait
// ============================================================================

/// Abstraction over netlink route/rule/link/address operations.
///
/// Implementors must be cheaply cloneable (e.g. via `Arc` or because the
/// underlying handle is already reference-counted). All mutations are
/// tolerant of "already exists" and "does not exist" kernel answers.
#[async_trait]
pub trait NetlinkOps: Send + Sync + Clone {
    async fn route_add(&self, route: &RouteSpec) -> Result<(), Error>;
    async fn route_del(&self, route: &RouteSpec) -> Result<(), Error>;
    /// Routes of one family within one table.
    async fn route_list(&self, family: IpFamily, table_id: u32) -> Result<Vec<RouteSpec>, Error>;

    async fn rule_add(&self, rule: &RuleSpec) -> Result<(), Error>;
    async fn rule_del(&self, rule: &RuleSpec) -> Result<(), Error>;
    async fn rule_list(&self, family: IpFamily) -> Result<Vec<RuleSpec>, Error>;

    async fn link_list(&self) -> Result<Vec<LinkInfo>, Error>;
    async fn addr_list(&self) -> Result<Vec<AddrInfo>, Error>;
}

// ============================================================================
// Real Implementation
// ============================================================================

/// Production [`NetlinkOps`] backed by an `rtnetlink::Handle`.
#[derive(Clone)]
pub struct RealNetlinkOps {
    handle: rtnetlink::Handle,
}

impl RealNetlinkOps {
    pub fn new(handle: rtnetlink::Handle) -> Self {
        Self { handle }
    }

    fn build_route_message(spec: &RouteSpec) -> RouteMessage {
        let mut msg = match (spec.family, spec.destination) {
            (IpFamily::V4, IpAddr::V4(dst)) => RouteMessageBuilder::<Ipv4Addr>::new()
                .destination_prefix(dst, spec.prefix_len)
                .table_id(spec.table_id)
                .build(),
            (_, dst) => {
                let dst = match dst {
                    IpAddr::V6(v6) => v6,
                    IpAddr::V4(v4) => v4.to_ipv6_mapped(),
                };
                RouteMessageBuilder::<Ipv6Addr>::new()
                    .destination_prefix(dst, spec.prefix_len)
                    .table_id(spec.table_id)
                    .build()
            }
        };
        if let Some(if_index) = spec.if_index {
            msg.attributes.push(RouteAttribute::Oif(if_index));
        }
        if let Some(metric) = spec.metric {
            msg.attributes.push(RouteAttribute::Priority(metric));
        }
        if spec.blackhole {
            msg.header.kind = RouteType::BlackHole;
        }
        msg
    }

    fn route_message_to_spec(msg: &RouteMessage) -> Option<RouteSpec> {
        let family = match msg.header.address_family {
            AddressFamily::Inet => IpFamily::V4,
            AddressFamily::Inet6 => IpFamily::V6,
            _ => return None,
        };

        let destination = msg
            .attributes
            .iter()
            .find_map(|a| match a {
                RouteAttribute::Destination(RouteAddress::Inet(ip)) => Some(IpAddr::V4(*ip)),
                RouteAttribute::Destination(RouteAddress::Inet6(ip)) => Some(IpAddr::V6(*ip)),
                _ => None,
            })
            .unwrap_or(family.unspecified());

        let if_index = msg.attributes.iter().find_map(|a| match a {
            RouteAttribute::Oif(idx) => Some(*idx),
            _ => None,
        });

        let metric = msg.attributes.iter().find_map(|a| match a {
            RouteAttribute::Priority(metric) => Some(*metric),
            _ => None,
        });

        Some(RouteSpec {
            family,
            destination,
            prefix_len: msg.header.destination_prefix_length,
            if_index,
            table_id: table_id_from_message(msg),
            metric,
            blackhole: msg.header.kind == RouteType::BlackHole,
        })
    }
}

fn table_id_from_message(msg: &RouteMessage) -> u32 {
    msg.attributes
        .iter()
        .find_map(|a| match a {
            RouteAttribute::Table(table) => Some(*table),
            _ => None,
        })
        .unwrap_or(msg.header.table as u32)
}

fn ip_version(family: IpFamily) -> IpVersion {
    match family {
        IpFamily::V4 => IpVersion::V4,
        IpFamily::V6 => IpVersion::V6,
    }
}

/// `EEXIST` answers to additions are expected during reconciliation.
fn tolerate_exists(res: Result<(), rtnetlink::Error>) -> Result<(), Error> {
    match res {
        Ok(()) => Ok(()),
        Err(NetlinkError(e)) if e.raw_code() == -libc::EEXIST => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// `ENOENT`/`ESRCH` answers to deletions mean the object is already gone.
fn tolerate_missing(res: Result<(), rtnetlink::Error>) -> Result<(), Error> {
    match res {
        Ok(()) => Ok(()),
        Err(NetlinkError(e)) if e.raw_code() == -libc::ENOENT || e.raw_code() == -libc::ESRCH => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl NetlinkOps for RealNetlinkOps {
    async fn route_add(&self, route: &RouteSpec) -> Result<(), Error> {
        let msg = Self::build_route_message(route);
        tolerate_exists(self.handle.route().add(msg).execute().await)
    }

    async fn route_del(&self, route: &RouteSpec) -> Result<(), Error> {
        let msg = Self::build_route_message(route);
        tolerate_missing(self.handle.route().del(msg).execute().await)
    }

    async fn route_list(&self, family: IpFamily, table_id: u32) -> Result<Vec<RouteSpec>, Error> {
        let dump = match family {
            IpFamily::V4 => RouteMessageBuilder::<Ipv4Addr>::new().build(),
            IpFamily::V6 => RouteMessageBuilder::<Ipv6Addr>::new().build(),
        };
        let routes: Vec<RouteMessage> = self.handle.route().get(dump).execute().try_collect().await?;

        Ok(routes
            .iter()
            .filter(|msg| table_id_from_message(msg) == table_id)
            .filter_map(Self::route_message_to_spec)
            .collect())
    }

    async fn rule_add(&self, rule: &RuleSpec) -> Result<(), Error> {
        let req = self
            .handle
            .rule()
            .add()
            .fw_mark(rule.fw_mark)
            .table_id(rule.table_id)
            .priority(rule.priority)
            .action(RuleAction::ToTable);
        let res = match rule.family {
            IpFamily::V4 => req.v4().execute().await,
            IpFamily::V6 => req.v6().execute().await,
        };
        tolerate_exists(res)
    }

    async fn rule_del(&self, rule: &RuleSpec) -> Result<(), Error> {
        let rules = self
            .handle
            .rule()
            .get(ip_version(rule.family))
            .execute()
            .try_collect::<Vec<_>>()
            .await?;

        for msg in rules {
            let has_mark = msg
                .attributes
                .iter()
                .any(|a| matches!(a, RuleAttribute::FwMark(m) if *m == rule.fw_mark));
            let has_table = msg
                .attributes
                .iter()
                .any(|a| matches!(a, RuleAttribute::Table(t) if *t == rule.table_id));

            if has_mark && has_table {
                return tolerate_missing(self.handle.rule().del(msg).execute().await);
            }
        }

        tracing::debug!(fw_mark = rule.fw_mark, table = rule.table_id, "rule already absent");
        Ok(())
    }

    async fn rule_list(&self, family: IpFamily) -> Result<Vec<RuleSpec>, Error> {
        let rules = self
            .handle
            .rule()
            .get(ip_version(family))
            .execute()
            .try_collect::<Vec<_>>()
            .await?;

        Ok(rules
            .iter()
            .filter_map(|msg| {
                let fw_mark = msg.attributes.iter().find_map(|a| match a {
                    RuleAttribute::FwMark(m) => Some(*m),
                    _ => None,
                })?;
                let table_id = msg.attributes.iter().find_map(|a| match a {
                    RuleAttribute::Table(t) => Some(*t),
                    _ => None,
                })?;
                let priority = msg
                    .attributes
                    .iter()
                    .find_map(|a| match a {
                        RuleAttribute::Priority(p) => Some(*p),
                        _ => None,
                    })
                    .unwrap_or(0);

                Some(RuleSpec {
                    family,
                    fw_mark,
                    table_id,
                    priority,
                })
            })
            .collect())
    }

    async fn link_list(&self) -> Result<Vec<LinkInfo>, Error> {
        let links = self.handle.link().get().execute().try_collect::<Vec<_>>().await?;

        Ok(links
            .iter()
            .filter_map(|link| {
                let name = link.attributes.iter().find_map(|a| match a {
                    netlink_packet_route::link::LinkAttribute::IfName(n) => Some(n.clone()),
                    _ => None,
                })?;
                Some(LinkInfo {
                    index: link.header.index,
                    name,
                    up: link.header.flags.contains(LinkFlags::Up),
                })
            })
            .collect())
    }

    async fn addr_list(&self) -> Result<Vec<AddrInfo>, Error> {
        let addrs = self.handle.address().get().execute().try_collect::<Vec<_>>().await?;

        Ok(addrs
            .iter()
            .filter_map(|addr| {
                let ip = addr.attributes.iter().find_map(|a| match a {
                    netlink_packet_route::address::AddressAttribute::Address(ip) => Some(*ip),
                    _ => None,
                })?;
                Some(AddrInfo {
                    if_index: addr.header.index,
                    addr: ip,
                    prefix_len: addr.header.prefix_len,
                })
            })
            .collect())
    }
}
