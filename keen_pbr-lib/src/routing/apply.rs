//! Per-IP-set reconciliation of kernel routing state.
//!
//! One pass converges policy rule, marking rules and the routes of the set's
//! table towards the desired state for the chosen egress. Every step is
//! idempotent, so the periodic tick can re-run the pass safely.

use super::Error;
use super::iptables_ops::IptablesOps;
use super::netlink_ops::{LinkInfo, NetlinkOps, RouteSpec, RuleSpec};
use super::rules;
use crate::config::Ipset;

/// What the reconciliation pass converged to for one IP set.
#[derive(Clone, Debug, PartialEq)]
pub enum Outcome {
    /// default route towards this interface is in place
    Routed { interface: String },
    /// no egress, kill-switch blackhole keeps matched traffic contained
    Blackhole,
    /// no egress and no kill-switch: marking disabled, table empty
    Idle,
}

/// Converge kernel state for one IP set.
///
/// Order matters: the table sweep keeps an existing blackhole while the
/// kill-switch is on, and marking rules are only ever present together with a
/// route (or the retained blackhole) that accepts the marked packets. With
/// the kill-switch off a stale blackhole is removed in the sweep, before the
/// new default route goes in.
pub async fn reconcile_ipset<N: NetlinkOps>(
    netlink: &N,
    filter: &dyn IptablesOps,
    ipset: &Ipset,
    chosen: Option<&LinkInfo>,
) -> Result<Outcome, Error> {
    let family = ipset.ip_version;
    let routing = &ipset.routing;
    let marking = rules::render_rules(ipset);

    let existing = netlink.route_list(family, routing.table).await?;
    let mut blackhole_present = false;
    for route in &existing {
        if routing.kill_switch && route.blackhole {
            blackhole_present = true;
            continue;
        }
        if let Err(e) = netlink.route_del(route).await {
            tracing::warn!(ipset = %ipset.ipset_name, ?route, error = %e, "failed to delete route, continuing");
        }
    }

    let rule = RuleSpec {
        family,
        fw_mark: routing.fwmark,
        table_id: routing.table,
        priority: routing.priority,
    };
    let rule_present = netlink
        .rule_list(family)
        .await?
        .iter()
        .any(|r| r.fw_mark == rule.fw_mark && r.table_id == rule.table_id);

    if !routing.kill_switch && chosen.is_none() {
        // no egress and nothing to contain traffic: stop marking entirely
        if rule_present && let Err(e) = netlink.rule_del(&rule).await {
            tracing::warn!(ipset = %ipset.ipset_name, error = %e, "failed to delete policy rule, continuing");
        }
        rules::del_if_exists(filter, family, &marking)?;
        tracing::info!(ipset = %ipset.ipset_name, "no interface up, marking disabled");
        return Ok(Outcome::Idle);
    }

    if !rule_present {
        netlink.rule_add(&rule).await?;
        tracing::debug!(
            ipset = %ipset.ipset_name,
            fwmark = routing.fwmark,
            table = routing.table,
            priority = routing.priority,
            "policy rule installed"
        );
    }
    rules::add_if_not_exists(filter, family, &marking)?;

    if routing.kill_switch && !blackhole_present {
        netlink.route_add(&RouteSpec::blackhole(family, routing.table)).await?;
        tracing::debug!(ipset = %ipset.ipset_name, table = routing.table, "blackhole route installed");
    }

    match chosen {
        Some(link) => {
            netlink
                .route_add(&RouteSpec::default_route(family, link.index, routing.table))
                .await?;
            tracing::info!(ipset = %ipset.ipset_name, interface = %link.name, table = routing.table, "default route installed");
            Ok(Outcome::Routed {
                interface: link.name.clone(),
            })
        }
        None => Ok(Outcome::Blackhole),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::mocks::{MockIptablesOps, MockNetlinkOps, NetlinkState};
    use crate::routing::netlink_ops::{BLACKHOLE_METRIC, DEFAULT_ROUTE_METRIC};

    fn test_ipset(kill_switch: bool) -> Ipset {
        let raw = if kill_switch {
            crate::config::tests::MINIMAL.replace("[ipset.routing]", "[ipset.routing]\nkill_switch = true")
        } else {
            crate::config::tests::MINIMAL.to_string()
        };
        let config: Config = toml::from_str(&raw).expect("fixture must parse");
        config.ipsets.into_iter().next().expect("one ipset")
    }

    fn nwg1() -> LinkInfo {
        LinkInfo {
            index: 7,
            name: "nwg1".to_string(),
            up: true,
        }
    }

    #[tokio::test]
    async fn interface_up_installs_rule_and_default_route() -> anyhow::Result<()> {
        let netlink = MockNetlinkOps::new();
        let filter = MockIptablesOps::new();
        let ipset = test_ipset(false);

        let outcome = reconcile_ipset(&netlink, &filter, &ipset, Some(&nwg1())).await?;
        assert_eq!(
            outcome,
            Outcome::Routed {
                interface: "nwg1".to_string()
            }
        );

        let state = netlink.state.lock().unwrap();
        assert_eq!(state.routes.len(), 1);
        let route = &state.routes[0];
        assert_eq!(route.table_id, 1001);
        assert_eq!(route.if_index, Some(7));
        assert_eq!(route.metric, Some(DEFAULT_ROUTE_METRIC));
        assert!(!route.blackhole, "no blackhole without kill switch");

        assert_eq!(state.rules.len(), 1);
        assert_eq!(state.rules[0].fw_mark, 1001);
        assert_eq!(state.rules[0].table_id, 1001);
        assert_eq!(state.rules[0].priority, 1001);

        let filter_state = filter.state.lock().unwrap();
        assert_eq!(filter_state.rules.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn kill_switch_without_interface_converges_to_blackhole() -> anyhow::Result<()> {
        let netlink = MockNetlinkOps::new();
        let filter = MockIptablesOps::new();
        let ipset = test_ipset(true);

        let outcome = reconcile_ipset(&netlink, &filter, &ipset, None).await?;
        assert_eq!(outcome, Outcome::Blackhole);

        let state = netlink.state.lock().unwrap();
        assert_eq!(state.routes.len(), 1, "exactly one route in the table");
        let route = &state.routes[0];
        assert!(route.blackhole);
        assert_eq!(route.metric, Some(BLACKHOLE_METRIC));
        assert!(route.if_index.is_none());

        assert_eq!(state.rules.len(), 1, "policy rule present");
        assert_eq!(filter.state.lock().unwrap().rules.len(), 1, "marking rule present");
        Ok(())
    }

    #[tokio::test]
    async fn no_interface_without_kill_switch_removes_everything() -> anyhow::Result<()> {
        let ipset = test_ipset(false);
        let family = ipset.ip_version;

        // pre-existing state from an earlier pass with an interface up
        let netlink = MockNetlinkOps::with_state(NetlinkState {
            routes: vec![RouteSpec::default_route(family, 7, 1001)],
            rules: vec![RuleSpec {
                family,
                fw_mark: 1001,
                table_id: 1001,
                priority: 1001,
            }],
            ..Default::default()
        });
        let filter = MockIptablesOps::new();
        rules::add_if_not_exists(&filter, family, &rules::render_rules(&ipset))?;

        let outcome = reconcile_ipset(&netlink, &filter, &ipset, None).await?;
        assert_eq!(outcome, Outcome::Idle);

        let state = netlink.state.lock().unwrap();
        assert!(state.routes.is_empty(), "table swept clean");
        assert!(state.rules.is_empty(), "policy rule removed");
        assert!(filter.state.lock().unwrap().rules.is_empty(), "marking rules removed");
        Ok(())
    }

    #[tokio::test]
    async fn existing_blackhole_is_kept_while_kill_switch_is_on() -> anyhow::Result<()> {
        let ipset = test_ipset(true);
        let family = ipset.ip_version;

        let netlink = MockNetlinkOps::with_state(NetlinkState {
            routes: vec![
                RouteSpec::blackhole(family, 1001),
                RouteSpec::default_route(family, 9, 1001),
            ],
            ..Default::default()
        });
        let filter = MockIptablesOps::new();

        let outcome = reconcile_ipset(&netlink, &filter, &ipset, None).await?;
        assert_eq!(outcome, Outcome::Blackhole);

        let state = netlink.state.lock().unwrap();
        assert_eq!(state.routes.len(), 1);
        assert!(state.routes[0].blackhole);
        // the retained blackhole was not deleted and re-added
        assert!(!state.ops.iter().any(|op| op.starts_with("route_del blackhole")), "{:?}", state.ops);
        Ok(())
    }

    #[tokio::test]
    async fn stale_blackhole_is_removed_before_default_route_is_added() -> anyhow::Result<()> {
        let ipset = test_ipset(false);
        let family = ipset.ip_version;

        let netlink = MockNetlinkOps::with_state(NetlinkState {
            routes: vec![RouteSpec::blackhole(family, 1001)],
            ..Default::default()
        });
        let filter = MockIptablesOps::new();

        let outcome = reconcile_ipset(&netlink, &filter, &ipset, Some(&nwg1())).await?;
        assert!(matches!(outcome, Outcome::Routed { .. }));

        let state = netlink.state.lock().unwrap();
        assert_eq!(state.routes.len(), 1);
        assert!(!state.routes[0].blackhole);

        let del = state
            .ops
            .iter()
            .position(|op| op.starts_with("route_del blackhole"))
            .expect("stale blackhole deleted");
        let add = state
            .ops
            .iter()
            .position(|op| op.starts_with("route_add default"))
            .expect("default route added");
        assert!(del < add, "blackhole removed before the default route went in: {:?}", state.ops);
        Ok(())
    }

    #[tokio::test]
    async fn routes_outside_the_declared_table_are_untouched() -> anyhow::Result<()> {
        let ipset = test_ipset(false);
        let family = ipset.ip_version;

        let foreign = RouteSpec::default_route(family, 3, 254);
        let netlink = MockNetlinkOps::with_state(NetlinkState {
            routes: vec![foreign],
            ..Default::default()
        });
        let filter = MockIptablesOps::new();

        reconcile_ipset(&netlink, &filter, &ipset, None).await?;

        let state = netlink.state.lock().unwrap();
        assert!(state.routes.contains(&foreign), "main table route untouched");
        Ok(())
    }

    #[tokio::test]
    async fn reconcile_is_idempotent() -> anyhow::Result<()> {
        let netlink = MockNetlinkOps::new();
        let filter = MockIptablesOps::new();
        let ipset = test_ipset(true);

        reconcile_ipset(&netlink, &filter, &ipset, Some(&nwg1())).await?;
        let first = netlink.state.lock().unwrap().routes.clone();

        reconcile_ipset(&netlink, &filter, &ipset, Some(&nwg1())).await?;
        let state = netlink.state.lock().unwrap();
        assert_eq!(state.routes, first, "second pass converges to the same state");
        assert_eq!(state.rules.len(), 1);
        assert_eq!(filter.state.lock().unwrap().rules.len(), 1);
        Ok(())
    }
}
