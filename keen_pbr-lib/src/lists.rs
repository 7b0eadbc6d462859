use cidr::IpCidr;
use md5::{Digest, Md5};
use thiserror::Error;

use std::ffi::OsString;
use std::io::{self, BufRead};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::config::{Config, General, List, ListKind};

const FETCH_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    IO(#[from] io::Error),
    #[error("HTTP error: {0}")]
    Fetch(#[from] reqwest::Error),
    #[error("unexpected HTTP status {status}")]
    Status { status: reqwest::StatusCode },
    #[error("list `{list}` has no usable source")]
    NoSource { list: String },
}

#[derive(Debug, Error)]
#[error("not a domain nor an IP network: `{entry}`")]
pub struct HostParseError {
    pub entry: String,
}

/// A single list entry: either a DNS name destined for the resolver feeder
/// or an IP network destined for direct IP set population.
#[derive(Clone, Debug, PartialEq)]
pub enum Host {
    Domain(String),
    Net(IpCidr),
}

/// Classify one list line. Bare IP addresses become host prefixes
/// (/32 or /128); prefixes with host bits set are normalized to their network.
pub fn parse_host(entry: &str) -> Result<Host, HostParseError> {
    if let Ok(net) = cidr::parsers::parse_cidr_ignore_hostbits::<IpCidr, _>(entry, IpAddr::from_str) {
        return Ok(Host::Net(net));
    }
    if valid_domain(entry) {
        return Ok(Host::Domain(entry.trim_end_matches('.').to_string()));
    }
    Err(HostParseError {
        entry: entry.to_string(),
    })
}

/// RFC-1035-ish name check: dot-separated labels of 1..=63 bytes, total at
/// most 253 bytes, label characters alphanumeric plus `-` and `_`, hyphens
/// not at label edges.
fn valid_domain(entry: &str) -> bool {
    let name = entry.trim_end_matches('.');
    if name.is_empty() || name.len() > 253 {
        return false;
    }
    name.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    })
}

/// Location of the cached copy of a remote list.
pub fn cached_path(general: &General, list_name: &str) -> PathBuf {
    general.lists_output_dir.join(format!("{list_name}.lst"))
}

fn sidecar_path(path: &Path) -> PathBuf {
    let mut os: OsString = path.as_os_str().to_os_string();
    os.push(".md5");
    PathBuf::from(os)
}

/// Yield every non-blank, non-comment line of the list exactly once, in
/// declaration order, short-circuiting on the first callback error.
pub fn iterate<F, E>(list: &List, config: &Config, mut f: F) -> Result<(), E>
where
    F: FnMut(&str) -> Result<(), E>,
    E: From<Error>,
{
    match list.kind() {
        Some(ListKind::Hosts(hosts)) => {
            for host in hosts {
                each_line(host, &mut f)?;
            }
            Ok(())
        }
        Some(ListKind::File(_)) => {
            let path = list
                .file_path(config.dir())
                .ok_or_else(|| Error::NoSource {
                    list: list.list_name.clone(),
                })?;
            iterate_file(&path, &mut f)
        }
        Some(ListKind::Url(_)) => {
            let path = cached_path(&config.general, &list.list_name);
            if !path.exists() {
                tracing::warn!(list = %list.list_name, path = %path.display(), "remote list not downloaded yet, treating as empty");
                return Ok(());
            }
            iterate_file(&path, &mut f)
        }
        None => Err(Error::NoSource {
            list: list.list_name.clone(),
        }
        .into()),
    }
}

fn iterate_file<F, E>(path: &Path, f: &mut F) -> Result<(), E>
where
    F: FnMut(&str) -> Result<(), E>,
    E: From<Error>,
{
    let file = std::fs::File::open(path).map_err(Error::from)?;
    let reader = io::BufReader::new(file);
    for line in reader.lines() {
        let line = line.map_err(Error::from)?;
        each_line(&line, f)?;
    }
    Ok(())
}

fn each_line<F, E>(raw: &str, f: &mut F) -> Result<(), E>
where
    F: FnMut(&str) -> Result<(), E>,
{
    let line = raw.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(());
    }
    f(line)
}

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum DownloadStatus {
    Downloaded,
    Unchanged,
    Failed(String),
}

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct DownloadOutcome {
    pub list_name: String,
    pub status: DownloadStatus,
}

/// Fetch every url-typed list into `lists_output_dir`.
///
/// A body hashing identically to the recorded sidecar leaves the cached file
/// untouched. A non-200 response fails that list only; write failures of the
/// cached file or its sidecar abort the whole run.
pub async fn download(config: &Config) -> Result<Vec<DownloadOutcome>, Error> {
    let client = reqwest::Client::builder().timeout(FETCH_TIMEOUT).build()?;
    let mut outcomes = Vec::new();

    for list in &config.lists {
        let Some(ListKind::Url(url)) = list.kind() else {
            continue;
        };

        let status = match fetch(&client, url).await {
            Ok((digest, body)) => {
                let path = cached_path(&config.general, &list.list_name);
                accept_body(&path, &digest, &body)?
            }
            Err(e) => {
                tracing::error!(list = %list.list_name, url, error = %e, "failed downloading list");
                DownloadStatus::Failed(e.to_string())
            }
        };

        tracing::debug!(list = %list.list_name, ?status, "list download finished");
        outcomes.push(DownloadOutcome {
            list_name: list.list_name.clone(),
            status,
        });
    }

    Ok(outcomes)
}

/// Stream the response body through an MD5 hasher while collecting it.
async fn fetch(client: &reqwest::Client, url: &str) -> Result<(String, Vec<u8>), Error> {
    let mut resp = client.get(url).send().await?;
    if resp.status() != reqwest::StatusCode::OK {
        return Err(Error::Status { status: resp.status() });
    }

    let mut hasher = Md5::new();
    let mut body = Vec::new();
    while let Some(chunk) = resp.chunk().await? {
        hasher.update(&chunk);
        body.extend_from_slice(&chunk);
    }
    Ok((hex::encode(hasher.finalize()), body))
}

/// Persist a fetched body unless its hash matches the sidecar of the last
/// accepted one, in which case the cached file stays untouched.
fn accept_body(path: &Path, digest: &str, body: &[u8]) -> Result<DownloadStatus, Error> {
    let sidecar = sidecar_path(path);
    if path.exists()
        && let Ok(previous) = std::fs::read_to_string(&sidecar)
        && previous.trim() == digest
    {
        return Ok(DownloadStatus::Unchanged);
    }

    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    std::fs::write(path, body)?;
    std::fs::write(&sidecar, digest)?;
    Ok(DownloadStatus::Downloaded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cidr::{Ipv4Cidr, Ipv6Cidr};
    use std::net::{Ipv4Addr, Ipv6Addr};

    fn md5_hex(body: &[u8]) -> String {
        let mut hasher = Md5::new();
        hasher.update(body);
        hex::encode(hasher.finalize())
    }

    fn inline_config(hosts: &[&str]) -> Config {
        let hosts = hosts
            .iter()
            .map(|h| format!("\"{h}\""))
            .collect::<Vec<_>>()
            .join(", ");
        let raw = crate::config::tests::MINIMAL.replace(
            "hosts = [\"ifconfig.co\", \"1.2.3.4\", \"141.201.11.0/24\"]",
            &format!("hosts = [{hosts}]"),
        );
        toml::from_str(&raw).expect("fixture must parse")
    }

    #[test]
    fn classifies_domains_and_networks() -> anyhow::Result<()> {
        assert_eq!(parse_host("ifconfig.co")?, Host::Domain("ifconfig.co".to_string()));
        assert_eq!(
            parse_host("1.2.3.4")?,
            Host::Net(IpCidr::V4(Ipv4Cidr::new(Ipv4Addr::new(1, 2, 3, 4), 32)?))
        );
        assert_eq!(
            parse_host("141.201.11.7/24")?,
            Host::Net(IpCidr::V4(Ipv4Cidr::new(Ipv4Addr::new(141, 201, 11, 0), 24)?))
        );
        assert_eq!(
            parse_host("2a02:6b8::1")?,
            Host::Net(IpCidr::V6(Ipv6Cidr::new("2a02:6b8::1".parse::<Ipv6Addr>()?, 128)?))
        );
        Ok(())
    }

    #[test]
    fn rejects_malformed_entries() {
        assert!(parse_host("").is_err());
        assert!(parse_host("-leading.hyphen.example").is_err());
        assert!(parse_host("exa mple.org").is_err());
        let long_label = format!("{}.example.org", "a".repeat(64));
        assert!(parse_host(&long_label).is_err());
        let long_name = format!("{}.org", "a.".repeat(130));
        assert!(parse_host(&long_name).is_err());
    }

    #[test]
    fn tolerates_underscores_and_trailing_dots() -> anyhow::Result<()> {
        assert_eq!(
            parse_host("_dmarc.example.org")?,
            Host::Domain("_dmarc.example.org".to_string())
        );
        assert_eq!(parse_host("example.org.")?, Host::Domain("example.org".to_string()));
        Ok(())
    }

    #[test]
    fn iterates_inline_hosts_in_order() -> anyhow::Result<()> {
        let config = inline_config(&["a.example", "b.example", "c.example"]);
        let list = &config.lists[0];

        let mut seen = Vec::new();
        iterate::<_, Error>(list, &config, |line| {
            seen.push(line.to_string());
            Ok(())
        })?;
        assert_eq!(seen, vec!["a.example", "b.example", "c.example"]);
        Ok(())
    }

    #[test]
    fn skips_comments_and_blank_lines_in_files() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let list_file = tmp.path().join("hosts.lst");
        std::fs::write(&list_file, "# comment\n\nexample.org\n   \n# more\n10.0.0.0/8\n")?;

        let raw = crate::config::tests::MINIMAL.replace(
            "hosts = [\"ifconfig.co\", \"1.2.3.4\", \"141.201.11.0/24\"]",
            &format!("file = \"{}\"", list_file.display()),
        );
        let config: Config = toml::from_str(&raw)?;

        let mut seen = Vec::new();
        iterate::<_, Error>(&config.lists[0], &config, |line| {
            seen.push(line.to_string());
            Ok(())
        })?;
        assert_eq!(seen, vec!["example.org", "10.0.0.0/8"]);
        Ok(())
    }

    #[test]
    fn iterate_short_circuits_on_first_error() {
        let config = inline_config(&["a.example", "b.example"]);
        let mut seen = 0;
        let res = iterate::<_, Error>(&config.lists[0], &config, |_| {
            seen += 1;
            Err(Error::NoSource {
                list: "stop".to_string(),
            })
        });
        assert!(res.is_err());
        assert_eq!(seen, 1);
    }

    #[test]
    fn identical_body_leaves_cached_file_untouched() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let path = tmp.path().join("remote.lst");
        let body = b"example.org\n1.2.3.4\n";
        let digest = md5_hex(body);

        assert_eq!(accept_body(&path, &digest, body)?, DownloadStatus::Downloaded);
        let mtime = std::fs::metadata(&path)?.modified()?;

        assert_eq!(accept_body(&path, &digest, body)?, DownloadStatus::Unchanged);
        assert_eq!(std::fs::metadata(&path)?.modified()?, mtime, "mtime unchanged on skip");
        Ok(())
    }

    #[test]
    fn changed_body_rewrites_file_and_sidecar() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let path = tmp.path().join("remote.lst");

        let first = b"example.org\n";
        accept_body(&path, &md5_hex(first), first)?;

        let second = b"example.org\nexample.net\n";
        assert_eq!(accept_body(&path, &md5_hex(second), second)?, DownloadStatus::Downloaded);

        assert_eq!(std::fs::read(&path)?, second);
        assert_eq!(std::fs::read_to_string(sidecar_path(&path))?, md5_hex(second));
        Ok(())
    }
}
