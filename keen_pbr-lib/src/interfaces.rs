//! Egress interface selection.
//!
//! Walks an IP set's configured interfaces in declared order and picks the
//! first link considered good. The OS link state decides; when the Keenetic
//! RCI snapshot knows the interface by one of its addresses, the router's
//! own `connected`/`link` view has to agree as well. Every candidate is
//! logged so operators can diagnose why an interface was skipped.

use crate::config::Ipset;
use crate::keenetic::InterfaceMap;
use crate::routing::Error;
use crate::routing::netlink_ops::{LinkInfo, NetlinkOps};

/// First good link of the set's interface group, or `None` when no egress is
/// available (callers treat that as "kill-switch only").
pub async fn best_interface<N: NetlinkOps>(
    netlink: &N,
    ipset: &Ipset,
    snapshot: Option<&InterfaceMap>,
) -> Result<Option<LinkInfo>, Error> {
    let links = netlink.link_list().await?;
    let addrs = netlink.addr_list().await?;

    for name in &ipset.routing.interfaces {
        let Some(link) = links.iter().find(|l| &l.name == name) else {
            tracing::info!(ipset = %ipset.ipset_name, interface = %name, "candidate link does not exist");
            continue;
        };

        let rci = snapshot.and_then(|map| {
            addrs
                .iter()
                .filter(|a| a.if_index == link.index)
                .find_map(|a| map.get(&a.cidr_key()))
        });

        let good = match rci {
            Some(desc) => link.up && desc.is_connected(),
            None => link.up,
        };

        tracing::info!(
            ipset = %ipset.ipset_name,
            interface = %name,
            index = link.index,
            up = link.up,
            rci_connected = rci.map(|d| d.is_connected()),
            good,
            "interface candidate"
        );

        if good {
            return Ok(Some(link.clone()));
        }
    }

    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::keenetic::Interface;
    use crate::mocks::{MockNetlinkOps, NetlinkState};
    use crate::routing::netlink_ops::AddrInfo;

    fn ipset_with_interfaces(interfaces: &[&str]) -> Ipset {
        let list = interfaces
            .iter()
            .map(|i| format!("\"{i}\""))
            .collect::<Vec<_>>()
            .join(", ");
        let raw = crate::config::tests::MINIMAL.replace(
            "interfaces = [\"nwg1\"]",
            &format!("interfaces = [{list}]"),
        );
        let config: Config = toml::from_str(&raw).expect("fixture must parse");
        config.ipsets.into_iter().next().expect("one ipset")
    }

    fn link(index: u32, name: &str, up: bool) -> LinkInfo {
        LinkInfo {
            index,
            name: name.to_string(),
            up,
        }
    }

    fn rci_interface(connected: bool) -> Interface {
        let json = if connected {
            r#"{"id": "Wireguard1", "link": "up", "connected": "yes"}"#
        } else {
            r#"{"id": "Wireguard1", "link": "down", "connected": "no"}"#
        };
        serde_json::from_str(json).expect("fixture must parse")
    }

    #[tokio::test]
    async fn picks_first_up_interface_in_declared_order() -> anyhow::Result<()> {
        let netlink = MockNetlinkOps::with_state(NetlinkState {
            links: vec![link(2, "nwg0", false), link(3, "nwg1", true), link(4, "nwg2", true)],
            ..Default::default()
        });
        let ipset = ipset_with_interfaces(&["nwg0", "nwg1", "nwg2"]);

        let best = best_interface(&netlink, &ipset, None).await?;
        assert_eq!(best.map(|l| l.name), Some("nwg1".to_string()));
        Ok(())
    }

    #[tokio::test]
    async fn returns_none_when_no_candidate_is_up() -> anyhow::Result<()> {
        let netlink = MockNetlinkOps::with_state(NetlinkState {
            links: vec![link(2, "nwg0", false)],
            ..Default::default()
        });
        let ipset = ipset_with_interfaces(&["nwg0", "missing"]);

        let best = best_interface(&netlink, &ipset, None).await?;
        assert!(best.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn rci_snapshot_can_veto_an_up_link() -> anyhow::Result<()> {
        let netlink = MockNetlinkOps::with_state(NetlinkState {
            links: vec![link(3, "nwg1", true)],
            addrs: vec![AddrInfo {
                if_index: 3,
                addr: "172.16.1.2".parse()?,
                prefix_len: 24,
            }],
            ..Default::default()
        });
        let ipset = ipset_with_interfaces(&["nwg1"]);

        let mut snapshot = InterfaceMap::new();
        snapshot.insert("172.16.1.2/24".to_string(), rci_interface(false));
        let best = best_interface(&netlink, &ipset, Some(&snapshot)).await?;
        assert!(best.is_none(), "router reports the link as not connected");

        let mut snapshot = InterfaceMap::new();
        snapshot.insert("172.16.1.2/24".to_string(), rci_interface(true));
        let best = best_interface(&netlink, &ipset, Some(&snapshot)).await?;
        assert_eq!(best.map(|l| l.name), Some("nwg1".to_string()));
        Ok(())
    }

    #[tokio::test]
    async fn unknown_to_rci_falls_back_to_os_state() -> anyhow::Result<()> {
        let netlink = MockNetlinkOps::with_state(NetlinkState {
            links: vec![link(3, "nwg1", true)],
            addrs: vec![AddrInfo {
                if_index: 3,
                addr: "172.16.1.2".parse()?,
                prefix_len: 24,
            }],
            ..Default::default()
        });
        let ipset = ipset_with_interfaces(&["nwg1"]);

        let snapshot = InterfaceMap::new();
        let best = best_interface(&netlink, &ipset, Some(&snapshot)).await?;
        assert_eq!(best.map(|l| l.name), Some("nwg1".to_string()));
        Ok(())
    }
}
