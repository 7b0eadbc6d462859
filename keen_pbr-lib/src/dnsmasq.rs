//! dnsmasq drop-in emitter.
//!
//! Translates the configured domain lists into `ipset=/<domain>/<sets>`
//! directives so resolved addresses land in the right kernel IP sets, plus
//! optional upstream `server=` directives discovered from the router or the
//! configured fallback.

use thiserror::Error;
use tokio::process::Command;

use std::collections::HashSet;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;

use crate::config::Config;
use crate::domains::DomainIndex;
use crate::lists::{self, Host};
use crate::shell_command_ext::{Logs, ShellCommandExt};

/// File name of the generated drop-in inside `dnsmasq_lists_dir`.
pub const DROPIN_FILE: &str = "keen_pbr.conf";

/// Diagnostic suffix domain reflected to the local DNS probe listener.
const PROBE_SUFFIX: &str = "check.keen-pbr.local";
const PROBE_PORT: u16 = 15353;

/// Init script used to ask dnsmasq to pick up a regenerated drop-in.
const DNSMASQ_INIT_SCRIPT: &str = "/opt/etc/init.d/S56dnsmasq";

#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    IO(#[from] io::Error),
    #[error("list error: {0}")]
    Lists(#[from] lists::Error),
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct EmitStats {
    pub domains: usize,
    pub collisions: usize,
    pub skipped_lines: usize,
}

/// Build the domain index for the configured IP sets.
///
/// Unparseable lines are warned about and skipped; IP/CIDR entries are not
/// indexed here, they are imported into the sets directly.
pub fn build_index(config: &Config) -> Result<(DomainIndex, usize), Error> {
    let mut index = DomainIndex::new(config.ipsets.len());
    let mut skipped = 0usize;

    for (ipset_index, ipset) in config.ipsets.iter().enumerate() {
        for list_name in &ipset.lists {
            let Some(list) = config.find_list(list_name) else {
                continue;
            };
            lists::iterate::<_, Error>(list, config, |line| {
                match lists::parse_host(line) {
                    Ok(Host::Domain(domain)) => index.associate(&domain, ipset_index),
                    Ok(Host::Net(_)) => {}
                    Err(e) => {
                        skipped += 1;
                        tracing::warn!(list = %list_name, error = %e, "skipping unparseable list entry");
                    }
                }
                Ok(())
            })?;
        }
    }

    Ok((index, skipped))
}

/// Stream the drop-in to `sink`, draining the index as domains are written.
pub fn emit<W: Write>(
    sink: W,
    config: &Config,
    index: &mut DomainIndex,
    upstreams: &[String],
) -> Result<EmitStats, Error> {
    let mut out = BufWriter::new(sink);
    let mut stats = EmitStats::default();
    let mut warned = HashSet::new();

    for upstream in upstreams {
        writeln!(out, "server={upstream}")?;
    }
    writeln!(out, "server=/{PROBE_SUFFIX}/127.0.0.1#{PROBE_PORT}")?;

    for ipset in &config.ipsets {
        for list_name in &ipset.lists {
            let Some(list) = config.find_list(list_name) else {
                continue;
            };
            lists::iterate::<_, Error>(list, config, |line| {
                let Ok(Host::Domain(domain)) = lists::parse_host(line) else {
                    return Ok(());
                };
                let Some((bits, hash)) = index.lookup(&domain) else {
                    // already written, or a collided slot that was drained
                    return Ok(());
                };

                let colliding = index.colliding_domains(hash);
                if colliding.len() > 1 && warned.insert(hash) {
                    stats.collisions += 1;
                    tracing::warn!(
                        domains = %colliding.join(", "),
                        hash,
                        "distinct domains share a CRC32 slot, their ipset membership is merged"
                    );
                }

                let names: Vec<&str> = bits
                    .iter()
                    .filter_map(|i| config.ipsets.get(i).map(|s| s.ipset_name.as_str()))
                    .collect();
                writeln!(out, "ipset=/{}/{}", domain, names.join(","))?;
                stats.domains += 1;

                for i in bits.iter().collect::<Vec<_>>() {
                    if let Some(owner) = config.ipsets.get(i)
                        && let Some(dns) = &owner.routing.dns_override
                    {
                        writeln!(out, "server=/{domain}/{dns}")?;
                    }
                }

                index.forget(hash, &domain);
                Ok(())
            })?;
        }
    }

    out.flush()?;
    Ok(stats)
}

/// Regenerate the drop-in file inside `dnsmasq_lists_dir`.
pub fn write_dropin(config: &Config, upstreams: &[String]) -> Result<(PathBuf, EmitStats), Error> {
    let dir = &config.general.dnsmasq_lists_dir;
    std::fs::create_dir_all(dir)?;
    let path = dir.join(DROPIN_FILE);

    let (mut index, skipped) = build_index(config)?;
    let file = std::fs::File::create(&path)?;
    let mut stats = emit(file, config, &mut index, upstreams)?;
    stats.skipped_lines = skipped;

    tracing::info!(
        path = %path.display(),
        domains = stats.domains,
        collisions = stats.collisions,
        skipped = stats.skipped_lines,
        "dnsmasq drop-in written"
    );
    Ok((path, stats))
}

/// Ask the resolver to pick up a regenerated drop-in. Best-effort: failures
/// are logged and ignored, the next manual restart will converge.
pub async fn reload_resolver() {
    let res = Command::new(DNSMASQ_INIT_SCRIPT).arg("restart").run(Logs::Print).await;
    match res {
        Ok(()) => tracing::info!("asked dnsmasq to reload"),
        Err(e) => tracing::warn!(error = %e, "failed to reload dnsmasq, continuing"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emit_to_string(config: &Config, upstreams: &[String]) -> (String, EmitStats) {
        let (mut index, _) = build_index(config).expect("index");
        let mut buf = Vec::new();
        let stats = emit(&mut buf, config, &mut index, upstreams).expect("emit");
        (String::from_utf8(buf).expect("utf8"), stats)
    }

    fn config_from(raw: &str) -> Config {
        toml::from_str(raw).expect("fixture must parse")
    }

    #[test]
    fn emits_domains_and_leaves_networks_to_the_ipset_driver() {
        let config = config_from(crate::config::tests::MINIMAL);
        let (out, stats) = emit_to_string(&config, &[]);

        assert!(out.contains("ipset=/ifconfig.co/vpn\n"), "missing domain line in: {out}");
        assert!(!out.contains("1.2.3.4"), "networks must not be emitted");
        assert_eq!(stats.domains, 1);
    }

    #[test]
    fn shared_domain_is_emitted_once_with_both_sets_in_order() {
        let raw = r#####"
[general]
lists_output_dir = "/tmp/lists"
dnsmasq_lists_dir = "/tmp/dnsmasq.d"

[[ipset]]
ipset_name = "a"
lists = ["common"]

[ipset.routing]
interfaces = ["nwg1"]
fwmark = 1
table = 1
priority = 1

[[ipset]]
ipset_name = "b"
lists = ["common"]

[ipset.routing]
interfaces = ["nwg2"]
fwmark = 2
table = 2
priority = 2

[[list]]
list_name = "common"
hosts = ["example.org"]
"#####;
        let config = config_from(raw);
        let (out, stats) = emit_to_string(&config, &[]);

        assert_eq!(out.matches("example.org").count(), 1, "no duplicate line in: {out}");
        assert!(out.contains("ipset=/example.org/a,b\n"));
        assert_eq!(stats.domains, 1);
    }

    #[test]
    fn upstreams_and_probe_directive_come_first() {
        let config = config_from(crate::config::tests::MINIMAL);
        let (out, _) = emit_to_string(&config, &["1.1.1.1".to_string(), "9.9.9.9".to_string()]);

        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines[0], "server=1.1.1.1");
        assert_eq!(lines[1], "server=9.9.9.9");
        assert!(lines[2].starts_with("server=/check.keen-pbr.local/"));
    }

    #[test]
    fn dns_override_follows_the_domain_line() {
        let raw = crate::config::tests::MINIMAL.replace(
            "priority = 1001",
            "priority = 1001\ndns_override = \"10.0.0.1\"",
        );
        let config = config_from(&raw);
        let (out, _) = emit_to_string(&config, &[]);

        let lines: Vec<&str> = out.lines().collect();
        let ipset_line = lines
            .iter()
            .position(|l| *l == "ipset=/ifconfig.co/vpn")
            .expect("domain line present");
        assert_eq!(lines[ipset_line + 1], "server=/ifconfig.co/10.0.0.1");
    }

    #[test]
    fn colliding_domains_are_both_emitted_with_one_warning() {
        let (a, b) = crate::domains::tests::COLLIDING;
        let raw = crate::config::tests::MINIMAL.replace(
            "hosts = [\"ifconfig.co\", \"1.2.3.4\", \"141.201.11.0/24\"]",
            &format!("hosts = [\"{a}\", \"{b}\"]"),
        );
        let config = config_from(&raw);
        let (out, stats) = emit_to_string(&config, &[]);

        assert!(out.contains(&format!("ipset=/{a}/vpn\n")), "first colliding domain in: {out}");
        assert!(out.contains(&format!("ipset=/{b}/vpn\n")), "second colliding domain in: {out}");
        assert_eq!(stats.collisions, 1);
        assert_eq!(stats.domains, 2);
    }

    #[test]
    fn write_dropin_creates_the_file() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let raw = crate::config::tests::MINIMAL.replace(
            "dnsmasq_lists_dir = \"/opt/etc/dnsmasq.d\"",
            &format!("dnsmasq_lists_dir = \"{}\"", tmp.path().display()),
        );
        let config = config_from(&raw);

        let (path, stats) = write_dropin(&config, &[])?;
        assert_eq!(stats.domains, 1);
        let content = std::fs::read_to_string(path)?;
        assert!(content.contains("ipset=/ifconfig.co/vpn"));
        Ok(())
    }
}
