//! Packet-marking rule templates.
//!
//! Rule templates carry the placeholders `{{ipset_name}}`, `{{fwmark}}`,
//! `{{table}}` and `{{priority}}`. An IP set without declared templates gets
//! the default marking rule in the mangle table's PREROUTING chain.

use super::Error;
use super::iptables_ops::IptablesOps;
use crate::config::{IpFamily, Ipset};

/// One template-expanded rule ready for the packet filter.
#[derive(Clone, Debug, PartialEq)]
pub struct RenderedRule {
    pub table: String,
    pub chain: String,
    pub rule: String,
}

/// Expand the declared rule templates of `ipset`, or synthesize the default
/// mark rule when none are declared.
pub fn render_rules(ipset: &Ipset) -> Vec<RenderedRule> {
    if ipset.iptables_rules.is_empty() {
        return vec![default_rule(ipset)];
    }

    ipset
        .iptables_rules
        .iter()
        .map(|template| RenderedRule {
            table: expand(&template.table, ipset),
            chain: expand(&template.chain, ipset),
            rule: template
                .rule
                .iter()
                .map(|arg| expand(arg, ipset))
                .collect::<Vec<_>>()
                .join(" "),
        })
        .collect()
}

fn default_rule(ipset: &Ipset) -> RenderedRule {
    RenderedRule {
        table: "mangle".to_string(),
        chain: "PREROUTING".to_string(),
        rule: format!(
            "-m set --match-set {} dst,src -j MARK --set-mark {}",
            ipset.ipset_name, ipset.routing.fwmark
        ),
    }
}

fn expand(template: &str, ipset: &Ipset) -> String {
    template
        .replace("{{ipset_name}}", &ipset.ipset_name)
        .replace("{{fwmark}}", &ipset.routing.fwmark.to_string())
        .replace("{{table}}", &ipset.routing.table.to_string())
        .replace("{{priority}}", &ipset.routing.priority.to_string())
}

pub fn exists_all(ops: &dyn IptablesOps, family: IpFamily, rules: &[RenderedRule]) -> Result<bool, Error> {
    for rule in rules {
        if !ops.exists(family, &rule.table, &rule.chain, &rule.rule)? {
            return Ok(false);
        }
    }
    Ok(true)
}

pub fn add_if_not_exists(ops: &dyn IptablesOps, family: IpFamily, rules: &[RenderedRule]) -> Result<(), Error> {
    for rule in rules {
        if !ops.exists(family, &rule.table, &rule.chain, &rule.rule)? {
            ops.append(family, &rule.table, &rule.chain, &rule.rule)?;
            tracing::debug!(table = %rule.table, chain = %rule.chain, rule = %rule.rule, "installed marking rule");
        }
    }
    Ok(())
}

pub fn del_if_exists(ops: &dyn IptablesOps, family: IpFamily, rules: &[RenderedRule]) -> Result<(), Error> {
    for rule in rules {
        if ops.exists(family, &rule.table, &rule.chain, &rule.rule)? {
            ops.delete(family, &rule.table, &rule.chain, &rule.rule)?;
            tracing::debug!(table = %rule.table, chain = %rule.chain, rule = %rule.rule, "removed marking rule");
        }
    }
    Ok(())
}
