//! Driver for kernel IP sets via the `ipset` userspace tool.
//!
//! One-shot operations go through [`ShellCommandExt`]; bulk population is
//! streamed over an `ipset restore` pipe so large lists do not fork one
//! process per entry.

use async_trait::async_trait;
use cidr::IpCidr;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use std::io;
use std::net::IpAddr;
use std::process::Stdio;

use crate::config::{IpFamily, Ipset};
use crate::shell_command_ext::{self, Logs, ShellCommandExt};

/// Per-line failures tolerated before an import is aborted.
const IMPORT_FAILURE_LIMIT: usize = 10;

#[derive(Debug, Error)]
pub enum Error {
    #[error("command error: {0}")]
    ShellCommand(#[from] shell_command_ext::Error),
    #[error("IO error: {0}")]
    IO(#[from] io::Error),
    #[error("import aborted after {failures} failed lines")]
    ImportAborted { failures: usize },
    #[error("ipset restore failed (status {status:?}): {stderr}")]
    Restore { status: Option<i32>, stderr: String },
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ImportStats {
    pub added: usize,
    pub discarded: usize,
}

#[async_trait]
pub trait IpsetOps: Send + Sync {
    /// Idempotent `create <name> hash:net family <inet|inet6> -exist`.
    async fn create(&self, name: &str, family: IpFamily) -> Result<(), Error>;
    async fn flush(&self, name: &str) -> Result<(), Error>;
    async fn exists(&self, name: &str) -> Result<bool, Error>;
    /// Bulk-load `networks` through a restore pipe. Entries whose family does
    /// not match the set are discarded with a warning.
    async fn import(&self, ipset: &Ipset, networks: &[IpCidr]) -> Result<ImportStats, Error>;
    async fn test(&self, name: &str, addr: IpAddr) -> Result<bool, Error>;
}

fn family_keyword(family: IpFamily) -> &'static str {
    match family {
        IpFamily::V4 => "inet",
        IpFamily::V6 => "inet6",
    }
}

fn family_matches(family: IpFamily, net: &IpCidr) -> bool {
    match (family, net) {
        (IpFamily::V4, IpCidr::V4(_)) => true,
        (IpFamily::V6, IpCidr::V6(_)) => true,
        _ => false,
    }
}

/// Split `networks` into family-matching entries and a discard count.
fn partition_by_family(ipset: &Ipset, networks: &[IpCidr]) -> (Vec<IpCidr>, usize) {
    let mut matching = Vec::with_capacity(networks.len());
    let mut discarded = 0;
    for net in networks {
        if family_matches(ipset.ip_version, net) {
            matching.push(*net);
        } else {
            discarded += 1;
            tracing::warn!(
                ipset = %ipset.ipset_name,
                family = %ipset.ip_version,
                %net,
                "discarding network with mismatched address family"
            );
        }
    }
    (matching, discarded)
}

/// Lines fed to the restore channel, flush first when configured.
fn restore_lines(ipset: &Ipset, networks: &[IpCidr]) -> Vec<String> {
    let mut lines = Vec::with_capacity(networks.len() + 1);
    if ipset.flush_before_applying {
        lines.push(format!("flush {}", ipset.ipset_name));
    }
    for net in networks {
        lines.push(format!("add {} {} -exist", ipset.ipset_name, net));
    }
    lines
}

#[derive(Clone, Copy, Debug, Default)]
pub struct RealIpsetOps;

#[async_trait]
impl IpsetOps for RealIpsetOps {
    async fn create(&self, name: &str, family: IpFamily) -> Result<(), Error> {
        Command::new("ipset")
            .args(["create", name, "hash:net", "family", family_keyword(family), "-exist"])
            .run(Logs::Print)
            .await
            .map_err(Error::from)
    }

    async fn flush(&self, name: &str) -> Result<(), Error> {
        Command::new("ipset")
            .args(["flush", name])
            .run(Logs::Print)
            .await
            .map_err(Error::from)
    }

    async fn exists(&self, name: &str) -> Result<bool, Error> {
        Command::new("ipset")
            .args(["list", name, "-name"])
            .run_status()
            .await
            .map_err(Error::from)
    }

    async fn import(&self, ipset: &Ipset, networks: &[IpCidr]) -> Result<ImportStats, Error> {
        let (matching, discarded) = partition_by_family(ipset, networks);
        let lines = restore_lines(ipset, &matching);
        if lines.is_empty() {
            return Ok(ImportStats { added: 0, discarded });
        }

        let mut child = Command::new("ipset")
            .arg("restore")
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()?;
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::IO(io::Error::other("restore channel has no stdin")))?;

        let mut failures = 0usize;
        let mut added = 0usize;
        for line in &lines {
            match stdin.write_all(format!("{line}\n").as_bytes()).await {
                Ok(()) => added += 1,
                Err(e) => {
                    failures += 1;
                    tracing::warn!(ipset = %ipset.ipset_name, line, error = %e, "failed writing restore line");
                    if failures > IMPORT_FAILURE_LIMIT {
                        drop(stdin);
                        let _ = child.kill().await;
                        return Err(Error::ImportAborted { failures });
                    }
                }
            }
        }
        drop(stdin);

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(Error::Restore {
                status: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        // the flush line is bookkeeping, not an entry
        if ipset.flush_before_applying && added > 0 {
            added -= 1;
        }
        tracing::debug!(ipset = %ipset.ipset_name, added, discarded, "imported networks");
        Ok(ImportStats { added, discarded })
    }

    async fn test(&self, name: &str, addr: IpAddr) -> Result<bool, Error> {
        Command::new("ipset")
            .args(["test", name, &addr.to_string()])
            .run_status()
            .await
            .map_err(Error::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn ipset(name: &str, family: IpFamily, flush: bool) -> Ipset {
        let mut config: crate::config::Config =
            toml::from_str(crate::config::tests::MINIMAL).expect("fixture must parse");
        let mut entry = config.ipsets.remove(0);
        entry.ipset_name = name.to_string();
        entry.ip_version = family;
        entry.flush_before_applying = flush;
        entry
    }

    fn nets(entries: &[&str]) -> Vec<IpCidr> {
        entries.iter().map(|e| IpCidr::from_str(e).expect("cidr")).collect()
    }

    #[test]
    fn mismatched_family_entries_are_discarded() {
        let set = ipset("vpn", IpFamily::V4, false);
        let (matching, discarded) = partition_by_family(&set, &nets(&["1.2.3.4/32", "2a02:6b8::/32", "10.0.0.0/8"]));
        assert_eq!(discarded, 1);
        assert_eq!(matching, nets(&["1.2.3.4/32", "10.0.0.0/8"]));

        let set = ipset("vpn6", IpFamily::V6, false);
        let (matching, discarded) = partition_by_family(&set, &nets(&["1.2.3.4/32", "2a02:6b8::/32"]));
        assert_eq!(discarded, 1);
        assert_eq!(matching, nets(&["2a02:6b8::/32"]));
    }

    #[test]
    fn restore_lines_flush_comes_first_when_configured() {
        let set = ipset("vpn", IpFamily::V4, true);
        let lines = restore_lines(&set, &nets(&["1.2.3.4/32", "141.201.11.0/24"]));
        assert_eq!(
            lines,
            vec![
                "flush vpn".to_string(),
                "add vpn 1.2.3.4 -exist".to_string(),
                "add vpn 141.201.11.0/24 -exist".to_string(),
            ]
        );

        let set = ipset("vpn", IpFamily::V4, false);
        let lines = restore_lines(&set, &nets(&["1.2.3.4/32"]));
        assert_eq!(lines, vec!["add vpn 1.2.3.4 -exist".to_string()]);
    }
}
