use serde::{Deserialize, Serialize};
use thiserror::Error;

use std::io;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

mod upgrade;

pub const DEFAULT_PATH: &str = "/opt/etc/keen_pbr/keen_pbr.toml";
pub const ENV_VAR: &str = "KEEN_PBR_CONFIG_PATH";

#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration file not found")]
    NoFile,
    #[error("IO error: {0}")]
    IO(#[from] io::Error),
    #[error("Deserialization error: {0}")]
    TomlDeserialization(#[from] toml::de::Error),
    #[error("Serialization error: {0}")]
    TomlSerialization(#[from] toml::ser::Error),
    #[error("Invalid configuration: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub general: General,
    #[serde(rename = "ipset", default)]
    pub ipsets: Vec<Ipset>,
    #[serde(rename = "list", default)]
    pub lists: Vec<List>,
    /// absolute location this configuration was loaded from, used for write-back
    /// and for resolving relative list file paths
    #[serde(skip)]
    pub path: PathBuf,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct General {
    pub lists_output_dir: PathBuf,
    pub dnsmasq_lists_dir: PathBuf,
    #[serde(default = "default_true")]
    pub use_keenetic_api: bool,
    #[serde(default)]
    pub use_keenetic_dns: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_dns: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Ipset {
    pub ipset_name: String,
    #[serde(default)]
    pub ip_version: IpFamily,
    #[serde(default)]
    pub flush_before_applying: bool,
    pub lists: Vec<String>,
    pub routing: Routing,
    #[serde(rename = "iptables_rule", default, skip_serializing_if = "Vec::is_empty")]
    pub iptables_rules: Vec<IptablesRule>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Routing {
    pub interfaces: Vec<String>,
    #[serde(default)]
    pub kill_switch: bool,
    pub fwmark: u32,
    pub table: u32,
    pub priority: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns_override: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IptablesRule {
    pub chain: String,
    pub table: String,
    pub rule: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct List {
    pub list_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hosts: Option<Vec<String>>,
}

/// Address family of an IP set, serialized as the `ip_version` integer.
/// Legacy `0` is promoted to v4 on load.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum IpFamily {
    #[default]
    V4,
    V6,
}

impl TryFrom<u8> for IpFamily {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 | 4 => Ok(IpFamily::V4),
            6 => Ok(IpFamily::V6),
            other => Err(format!("unsupported ip_version: {other}")),
        }
    }
}

impl From<IpFamily> for u8 {
    fn from(value: IpFamily) -> Self {
        match value {
            IpFamily::V4 => 4,
            IpFamily::V6 => 6,
        }
    }
}

impl std::fmt::Display for IpFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IpFamily::V4 => write!(f, "ipv4"),
            IpFamily::V6 => write!(f, "ipv6"),
        }
    }
}

impl IpFamily {
    pub fn unspecified(&self) -> IpAddr {
        match self {
            IpFamily::V4 => IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED),
            IpFamily::V6 => IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED),
        }
    }

    pub fn matches(&self, addr: &IpAddr) -> bool {
        match self {
            IpFamily::V4 => addr.is_ipv4(),
            IpFamily::V6 => addr.is_ipv6(),
        }
    }
}

/// Which of the mutually exclusive source fields a [`List`] carries.
/// Only meaningful after validation enforced exactly one is set.
#[derive(Debug)]
pub enum ListKind<'a> {
    Url(&'a str),
    File(&'a Path),
    Hosts(&'a [String]),
}

impl List {
    pub fn kind(&self) -> Option<ListKind<'_>> {
        match (&self.url, &self.file, &self.hosts) {
            (Some(url), None, None) => Some(ListKind::Url(url)),
            (None, Some(file), None) => Some(ListKind::File(file)),
            (None, None, Some(hosts)) => Some(ListKind::Hosts(hosts)),
            _ => None,
        }
    }

    /// Local file path, resolved relative to the configuration's directory.
    pub fn file_path(&self, config_dir: &Path) -> Option<PathBuf> {
        self.file.as_ref().map(|file| {
            if file.is_absolute() {
                file.clone()
            } else {
                config_dir.join(file)
            }
        })
    }
}

impl Config {
    /// Directory of the configuration file, used to resolve relative list paths.
    pub fn dir(&self) -> &Path {
        self.path.parent().unwrap_or_else(|| Path::new("."))
    }

    pub fn find_list(&self, name: &str) -> Option<&List> {
        self.lists.iter().find(|l| l.list_name == name)
    }

    /// Toggle the kill switch of one policy group. Applied through
    /// [`Store::modify`] so the change is validated and persisted atomically.
    pub fn set_kill_switch(&mut self, ipset_name: &str, enabled: bool) -> Result<(), Error> {
        let ipset = self
            .ipsets
            .iter_mut()
            .find(|i| i.ipset_name == ipset_name)
            .ok_or_else(|| Error::Invalid(vec![format!("ipset.{ipset_name}: no such ipset")]))?;
        ipset.routing.kill_switch = enabled;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), Error> {
        let mut problems = Vec::new();

        if self.ipsets.is_empty() {
            problems.push("ipset: at least one [[ipset]] entry is required".to_string());
        }

        let mut names = std::collections::HashSet::new();
        let mut fwmarks = std::collections::HashMap::new();
        let mut tables = std::collections::HashMap::new();
        let mut priorities = std::collections::HashMap::new();

        for ipset in &self.ipsets {
            let name = &ipset.ipset_name;
            let field = format!("ipset.{name}");

            if !valid_ipset_name(name) {
                problems.push(format!("{field}.ipset_name: must match [a-z][a-z0-9_]*"));
            }
            if !names.insert(name.clone()) {
                problems.push(format!("{field}.ipset_name: duplicate name"));
            }

            let routing = &ipset.routing;
            if routing.interfaces.is_empty() {
                problems.push(format!("{field}.routing.interfaces: must not be empty"));
            }
            let mut seen_ifaces = std::collections::HashSet::new();
            for iface in &routing.interfaces {
                if !seen_ifaces.insert(iface) {
                    problems.push(format!("{field}.routing.interfaces: duplicate interface {iface}"));
                }
            }
            if let Some(other) = fwmarks.insert(routing.fwmark, name.clone()) {
                problems.push(format!("{field}.routing.fwmark: {} already used by ipset.{other}", routing.fwmark));
            }
            if let Some(other) = tables.insert(routing.table, name.clone()) {
                problems.push(format!("{field}.routing.table: {} already used by ipset.{other}", routing.table));
            }
            if let Some(other) = priorities.insert(routing.priority, name.clone()) {
                problems.push(format!(
                    "{field}.routing.priority: {} already used by ipset.{other}",
                    routing.priority
                ));
            }

            for (idx, rule) in ipset.iptables_rules.iter().enumerate() {
                if rule.chain.is_empty() {
                    problems.push(format!("{field}.iptables_rule[{idx}].chain: must not be empty"));
                }
                if rule.table.is_empty() {
                    problems.push(format!("{field}.iptables_rule[{idx}].table: must not be empty"));
                }
                if rule.rule.is_empty() {
                    problems.push(format!("{field}.iptables_rule[{idx}].rule: must not be empty"));
                }
            }

            if ipset.lists.is_empty() {
                problems.push(format!("{field}.lists: must not be empty"));
            }
            for list_name in &ipset.lists {
                if self.find_list(list_name).is_none() {
                    problems.push(format!("{field}.lists: unknown list {list_name}"));
                }
            }
        }

        let mut list_names = std::collections::HashSet::new();
        for list in &self.lists {
            let name = &list.list_name;
            let field = format!("list.{name}");

            if name.is_empty() {
                problems.push("list.list_name: must not be empty".to_string());
            }
            if !list_names.insert(name.clone()) {
                problems.push(format!("{field}.list_name: duplicate name"));
            }

            match list.kind() {
                Some(ListKind::Hosts(hosts)) if hosts.is_empty() => {
                    problems.push(format!("{field}.hosts: must not be empty"));
                }
                Some(ListKind::File(_)) => {
                    // existence check runs against the resolved location
                    let resolved = list.file_path(self.dir()).unwrap_or_default();
                    if !resolved.exists() {
                        problems.push(format!("{field}.file: {} does not exist", resolved.display()));
                    }
                }
                Some(_) => {}
                None => {
                    problems.push(format!("{field}: exactly one of url, file or hosts must be set"));
                }
            }
        }

        if problems.is_empty() { Ok(()) } else { Err(Error::Invalid(problems)) }
    }

    pub fn to_toml_string(&self) -> Result<String, Error> {
        toml::to_string(self).map_err(Error::from)
    }
}

fn default_true() -> bool {
    true
}

fn valid_ipset_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

/// Load, upgrade (in memory) and validate the configuration at `path`.
pub fn read(path: &Path) -> Result<Config, Error> {
    let (config, _changed) = read_with_upgrade(path)?;
    Ok(config)
}

fn read_with_upgrade(path: &Path) -> Result<(Config, bool), Error> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        if e.kind() == io::ErrorKind::NotFound {
            Error::NoFile
        } else {
            Error::IO(e)
        }
    })?;

    let mut table = content.parse::<toml::Table>()?;
    let changed = upgrade::apply(&mut table);

    let mut config: Config = table.try_into()?;
    config.path = path.to_path_buf();
    config.validate()?;
    Ok((config, changed))
}

/// Persist the configuration atomically: write a sibling temp file, then rename.
pub fn write(config: &Config) -> Result<(), Error> {
    let serialized = config.to_toml_string()?;
    let tmp = config.path.with_extension("toml.tmp");
    std::fs::write(&tmp, serialized)?;
    std::fs::rename(&tmp, &config.path)?;
    Ok(())
}

/// Process-wide configuration store guarding the file with a reader/writer lock.
///
/// Readers never observe a half-written file and writers serialize with each
/// other and with all readers.
#[derive(Clone, Debug)]
pub struct Store {
    path: PathBuf,
    lock: Arc<RwLock<()>>,
}

impl Store {
    pub fn new(path: PathBuf) -> Self {
        Store {
            path,
            lock: Arc::new(RwLock::new(())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the configuration under the shared lock.
    pub fn read(&self) -> Result<Config, Error> {
        let _guard = self.lock.read().unwrap_or_else(PoisonError::into_inner);
        read(&self.path)
    }

    /// Migrate legacy configuration shapes in place. Writes back only when
    /// something changed; running it twice is a no-op.
    pub fn upgrade(&self) -> Result<bool, Error> {
        let _guard = self.lock.write().unwrap_or_else(PoisonError::into_inner);
        let (config, changed) = read_with_upgrade(&self.path)?;
        if changed {
            tracing::info!(path = %self.path.display(), "migrated legacy configuration shape");
            write(&config)?;
        }
        Ok(changed)
    }

    /// Read-modify-write under the exclusive lock: reload, apply `f`,
    /// validate, persist atomically. The caller is expected to request a
    /// reconciler restart afterwards.
    pub fn modify<F>(&self, f: F) -> Result<Config, Error>
    where
        F: FnOnce(&mut Config) -> Result<(), Error>,
    {
        let _guard = self.lock.write().unwrap_or_else(PoisonError::into_inner);
        let mut config = read(&self.path)?;
        f(&mut config)?;
        config.validate()?;
        write(&config)?;
        Ok(config)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const MINIMAL: &str = r#####"
[general]
lists_output_dir = "/opt/etc/keen_pbr/lists"
dnsmasq_lists_dir = "/opt/etc/dnsmasq.d"

[[ipset]]
ipset_name = "vpn"
ip_version = 4
lists = ["inline"]

[ipset.routing]
interfaces = ["nwg1"]
fwmark = 1001
table = 1001
priority = 1001

[[list]]
list_name = "inline"
hosts = ["ifconfig.co", "1.2.3.4", "141.201.11.0/24"]
"#####;

    fn parse(content: &str) -> Config {
        toml::from_str::<Config>(content).expect("fixture must parse")
    }

    #[test]
    fn minimal_config_parses_and_validates() -> anyhow::Result<()> {
        let config = parse(MINIMAL);
        config.validate()?;
        assert_eq!(config.ipsets.len(), 1);
        assert_eq!(config.ipsets[0].ip_version, IpFamily::V4);
        assert!(config.general.use_keenetic_api, "defaults to true when unset");
        Ok(())
    }

    #[test]
    fn ip_version_zero_promotes_to_v4() {
        let config = parse(&MINIMAL.replace("ip_version = 4", "ip_version = 0"));
        assert_eq!(config.ipsets[0].ip_version, IpFamily::V4);
    }

    #[test]
    fn rejects_unsupported_ip_version() {
        let res = toml::from_str::<Config>(&MINIMAL.replace("ip_version = 4", "ip_version = 5"));
        assert!(res.is_err());
    }

    #[test]
    fn duplicate_fwmark_is_rejected_with_field_path() {
        let extra = r#####"
[[ipset]]
ipset_name = "other"
lists = ["inline"]

[ipset.routing]
interfaces = ["nwg2"]
fwmark = 1001
table = 1002
priority = 1002
"#####;
        let config = parse(&format!("{MINIMAL}\n{extra}"));
        let err = config.validate().expect_err("duplicate fwmark must fail");
        let Error::Invalid(problems) = err else {
            panic!("expected validation error");
        };
        assert!(problems.iter().any(|p| p.contains("ipset.other.routing.fwmark")));
    }

    #[test]
    fn duplicate_table_and_priority_are_rejected() {
        let extra = r#####"
[[ipset]]
ipset_name = "other"
lists = ["inline"]

[ipset.routing]
interfaces = ["nwg2"]
fwmark = 1002
table = 1001
priority = 1001
"#####;
        let config = parse(&format!("{MINIMAL}\n{extra}"));
        let Error::Invalid(problems) = config.validate().expect_err("must fail") else {
            panic!("expected validation error");
        };
        assert!(problems.iter().any(|p| p.contains("routing.table")));
        assert!(problems.iter().any(|p| p.contains("routing.priority")));
    }

    #[test]
    fn invalid_ipset_name_is_rejected() {
        let config = parse(&MINIMAL.replace("ipset_name = \"vpn\"", "ipset_name = \"Vpn-1\""));
        let Error::Invalid(problems) = config.validate().expect_err("must fail") else {
            panic!("expected validation error");
        };
        assert!(problems.iter().any(|p| p.contains("ipset.Vpn-1.ipset_name")));
    }

    #[test]
    fn unknown_list_reference_is_rejected() {
        let config = parse(&MINIMAL.replace("lists = [\"inline\"]", "lists = [\"nope\"]"));
        let Error::Invalid(problems) = config.validate().expect_err("must fail") else {
            panic!("expected validation error");
        };
        assert!(problems.iter().any(|p| p.contains("unknown list nope")));
    }

    #[test]
    fn duplicate_interfaces_are_rejected() {
        let config = parse(&MINIMAL.replace("interfaces = [\"nwg1\"]", "interfaces = [\"nwg1\", \"nwg1\"]"));
        let Error::Invalid(problems) = config.validate().expect_err("must fail") else {
            panic!("expected validation error");
        };
        assert!(problems.iter().any(|p| p.contains("duplicate interface nwg1")));
    }

    #[test]
    fn list_with_both_url_and_hosts_is_rejected() {
        let config = parse(&MINIMAL.replace(
            "hosts = [\"ifconfig.co\", \"1.2.3.4\", \"141.201.11.0/24\"]",
            "hosts = [\"ifconfig.co\"]\nurl = \"https://example.org/list.lst\"",
        ));
        let Error::Invalid(problems) = config.validate().expect_err("must fail") else {
            panic!("expected validation error");
        };
        assert!(problems.iter().any(|p| p.contains("exactly one of url, file or hosts")));
    }

    #[test]
    fn missing_list_file_is_rejected() {
        let config = parse(&MINIMAL.replace(
            "hosts = [\"ifconfig.co\", \"1.2.3.4\", \"141.201.11.0/24\"]",
            "file = \"does-not-exist.lst\"",
        ));
        let Error::Invalid(problems) = config.validate().expect_err("must fail") else {
            panic!("expected validation error");
        };
        assert!(problems.iter().any(|p| p.contains("does-not-exist.lst")));
    }

    #[test]
    fn serialize_then_load_preserves_semantics() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let path = tmp.path().join("keen_pbr.toml");
        std::fs::write(&path, MINIMAL)?;

        let loaded = read(&path)?;
        let serialized = loaded.to_toml_string()?;
        std::fs::write(&path, &serialized)?;
        let reloaded = read(&path)?;

        assert_eq!(loaded, reloaded);
        assert!(reloaded.general.fallback_dns.is_none(), "unset options stay unset");
        assert_eq!(reloaded.ipsets[0].routing.interfaces, vec!["nwg1".to_string()]);
        Ok(())
    }

    #[test]
    fn store_modify_validates_and_persists() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let path = tmp.path().join("keen_pbr.toml");
        std::fs::write(&path, MINIMAL)?;
        let store = Store::new(path.clone());

        let modified = store.modify(|config| config.set_kill_switch("vpn", true))?;
        assert!(modified.ipsets[0].routing.kill_switch);

        let res = store.modify(|config| config.set_kill_switch("nope", true));
        assert!(res.is_err(), "unknown group is rejected");

        let reloaded = store.read()?;
        assert!(reloaded.ipsets[0].routing.kill_switch);

        // a mutation failing validation must not be persisted
        let res = store.modify(|config| {
            config.ipsets[0].routing.interfaces.clear();
            Ok(())
        });
        assert!(res.is_err());
        let reloaded = store.read()?;
        assert!(!reloaded.ipsets[0].routing.interfaces.is_empty());
        Ok(())
    }
}
