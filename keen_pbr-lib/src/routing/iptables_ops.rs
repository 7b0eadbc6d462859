//! Abstraction over iptables operations for testability.
//!
//! Defines [`IptablesOps`] mirroring the slice of the `iptables` crate API
//! the marking rules need, for both address families. Production code uses
//! [`RealIptablesOps`]; tests use stateful mocks (see the crate's `mocks`
//! module).

use super::Error;
use crate::config::IpFamily;

/// Abstraction over iptables rule operations.
///
/// All methods are synchronous, matching the underlying `iptables` crate.
pub trait IptablesOps: Send + Sync {
    fn exists(&self, family: IpFamily, table: &str, chain: &str, rule: &str) -> Result<bool, Error>;
    fn append(&self, family: IpFamily, table: &str, chain: &str, rule: &str) -> Result<(), Error>;
    fn delete(&self, family: IpFamily, table: &str, chain: &str, rule: &str) -> Result<(), Error>;
}

/// Production [`IptablesOps`] backed by the `iptables` crate, holding one
/// handle per address family (`iptables` and `ip6tables`).
pub struct RealIptablesOps {
    v4: iptables::IPTables,
    v6: iptables::IPTables,
}

impl RealIptablesOps {
    pub fn new() -> Result<Self, Error> {
        Ok(Self {
            v4: iptables::new(false).map_err(|e| Error::IpTables(e.to_string()))?,
            v6: iptables::new(true).map_err(|e| Error::IpTables(e.to_string()))?,
        })
    }

    fn handle(&self, family: IpFamily) -> &iptables::IPTables {
        match family {
            IpFamily::V4 => &self.v4,
            IpFamily::V6 => &self.v6,
        }
    }
}

impl IptablesOps for RealIptablesOps {
    fn exists(&self, family: IpFamily, table: &str, chain: &str, rule: &str) -> Result<bool, Error> {
        self.handle(family)
            .exists(table, chain, rule)
            .map_err(|e| Error::IpTables(e.to_string()))
    }

    fn append(&self, family: IpFamily, table: &str, chain: &str, rule: &str) -> Result<(), Error> {
        self.handle(family)
            .append(table, chain, rule)
            .map_err(|e| Error::IpTables(e.to_string()))
    }

    fn delete(&self, family: IpFamily, table: &str, chain: &str, rule: &str) -> Result<(), Error> {
        self.handle(family)
            .delete(table, chain, rule)
            .map_err(|e| Error::IpTables(e.to_string()))
    }
}
