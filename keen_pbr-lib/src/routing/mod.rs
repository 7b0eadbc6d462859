//! Kernel routing drivers: policy rules and routes over rtnetlink, plus the
//! packet-marking filter rules that feed them.
//!
//! Everything kernel-facing sits behind small trait abstractions
//! ([`netlink_ops::NetlinkOps`], [`iptables_ops::IptablesOps`]) so the
//! per-set reconciliation in [`apply`] is testable against stateful mocks.

use thiserror::Error;

pub mod apply;
pub mod iptables_ops;
pub mod netlink_ops;
pub mod rules;

#[derive(Debug, Error)]
pub enum Error {
    #[error("rtnetlink error: {0}")]
    Rtnetlink(#[from] rtnetlink::Error),
    #[error("iptables error: {0}")]
    IpTables(String),
    #[error("General error: {0}")]
    General(String),
}
