//! Reconciler supervising the kernel state against the configuration.
//!
//! A single background task wakes every 30 seconds, reloads the
//! configuration and converges every IP set's routing towards the current
//! interface state. List parsing and set population happen on start and on
//! explicit apply, not on the periodic tick. One set's failure never stops
//! reconciliation of the others; convergence is achieved by the next tick
//! rather than by retries inside one.

use cidr::IpCidr;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::config::{self, Config};
use crate::dnsmasq;
use crate::interfaces;
use crate::ipset::{self, IpsetOps};
use crate::keenetic::{self, InterfaceMap};
use crate::lists::{self, Host};
use crate::routing::apply::{Outcome, reconcile_ipset};
use crate::routing::iptables_ops::{IptablesOps, RealIptablesOps};
use crate::routing;
use crate::routing::netlink_ops::{NetlinkOps, RealNetlinkOps};

pub const TICK_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(#[from] config::Error),
    #[error("routing error: {0}")]
    Routing(#[from] routing::Error),
    #[error("ipset error: {0}")]
    Ipset(#[from] ipset::Error),
    #[error("list error: {0}")]
    Lists(#[from] lists::Error),
    #[error("service already running")]
    AlreadyRunning,
    #[error("service not running")]
    AlreadyStopped,
    #[error("no ipset could be applied")]
    NothingApplied,
}

/// Converged state of one IP set, as reported to operators.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum IpsetState {
    Routed { interface: String },
    Blackhole,
    Idle,
    Failed { error: String },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IpsetStatus {
    pub name: String,
    pub state: IpsetState,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Status {
    pub running: bool,
    pub ipsets: Vec<IpsetStatus>,
}

/// Result of a one-shot apply, surfaced to CLI callers.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum ApplyReport {
    Applied(Vec<IpsetStatus>),
    /// configuration was valid but no interface was up and no kill-switch
    /// kept traffic contained
    NoInterface,
}

fn lock_inner(inner: &Mutex<Inner>) -> MutexGuard<'_, Inner> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Inner {
    running: bool,
    cancel: Option<CancellationToken>,
    handle: Option<JoinHandle<()>>,
    last: Vec<IpsetStatus>,
}

/// Supervisor owning the reconciliation loop.
#[derive(Clone)]
pub struct Supervisor<N: NetlinkOps + 'static, S: IpsetOps + Clone + 'static> {
    store: config::Store,
    netlink: N,
    ipsets: S,
    filter: Arc<dyn IptablesOps>,
    keenetic: Option<keenetic::Client>,
    inner: Arc<Mutex<Inner>>,
}

/// Production supervisor over the real kernel drivers.
pub type RealSupervisor = Supervisor<RealNetlinkOps, ipset::RealIpsetOps>;

/// Wire up a supervisor against the real kernel interfaces.
pub fn supervisor(store: config::Store, handle: rtnetlink::Handle) -> Result<RealSupervisor, Error> {
    let filter = RealIptablesOps::new()?;
    Ok(Supervisor::new(
        store,
        RealNetlinkOps::new(handle),
        ipset::RealIpsetOps,
        Arc::new(filter),
    ))
}

impl<N: NetlinkOps + 'static, S: IpsetOps + Clone + 'static> Supervisor<N, S> {
    pub fn new(store: config::Store, netlink: N, ipsets: S, filter: Arc<dyn IptablesOps>) -> Self {
        let keenetic = match keenetic::Client::new() {
            Ok(client) => Some(client),
            Err(e) => {
                tracing::warn!(error = %e, "router RCI client unavailable, continuing without hints");
                None
            }
        };
        Supervisor {
            store,
            netlink,
            ipsets,
            filter,
            keenetic,
            inner: Arc::new(Mutex::new(Inner {
                running: false,
                cancel: None,
                handle: None,
                last: Vec::new(),
            })),
        }
    }

    /// Validate the configuration, apply it once and spawn the periodic
    /// reconciliation loop. An invalid configuration fails before any kernel
    /// state is touched; "no interface up" is expressly not an error.
    pub async fn start(&self) -> Result<(), Error> {
        if self.is_running() {
            return Err(Error::AlreadyRunning);
        }

        let cfg = self.store.read()?;
        let statuses = self.apply_config(&cfg).await;
        let failed = statuses.iter().filter(|s| matches!(s.state, IpsetState::Failed { .. })).count();
        if failed > 0 {
            tracing::warn!(failed, total = statuses.len(), "some ipsets failed to apply, retrying on next tick");
        }

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_loop(
            self.store.clone(),
            self.netlink.clone(),
            self.filter.clone(),
            self.keenetic.clone(),
            self.inner.clone(),
            cancel.clone(),
        ));

        let mut inner = lock_inner(&self.inner);
        inner.running = true;
        inner.cancel = Some(cancel);
        inner.handle = Some(handle);
        inner.last = statuses;
        tracing::info!("reconciler started");
        Ok(())
    }

    /// Cancel the loop and wait for it to exit. Double stops are reported so
    /// orchestration can notice them.
    pub async fn stop(&self) -> Result<(), Error> {
        let (cancel, handle) = {
            let mut inner = lock_inner(&self.inner);
            if !inner.running {
                return Err(Error::AlreadyStopped);
            }
            inner.running = false;
            (inner.cancel.take(), inner.handle.take())
        };

        if let Some(cancel) = cancel {
            cancel.cancel();
        }
        if let Some(handle) = handle
            && let Err(e) = handle.await
        {
            tracing::warn!(error = %e, "reconciler loop ended abnormally");
        }
        tracing::info!("reconciler stopped");
        Ok(())
    }

    /// Stop (when running), flush every configured set, start again.
    pub async fn restart(&self) -> Result<(), Error> {
        match self.stop().await {
            Ok(()) => {}
            Err(Error::AlreadyStopped) => {}
            Err(e) => return Err(e),
        }

        match self.store.read() {
            Ok(cfg) => {
                for ipset in &cfg.ipsets {
                    match self.ipsets.exists(&ipset.ipset_name).await {
                        Ok(true) => {
                            if let Err(e) = self.ipsets.flush(&ipset.ipset_name).await {
                                tracing::warn!(ipset = %ipset.ipset_name, error = %e, "failed to flush set during restart");
                            }
                        }
                        Ok(false) => {
                            tracing::debug!(ipset = %ipset.ipset_name, "set not present, nothing to flush");
                        }
                        Err(e) => {
                            tracing::warn!(ipset = %ipset.ipset_name, error = %e, "existence check failed, skipping flush");
                        }
                    }
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "cannot read configuration for flush, starting anyway");
            }
        }

        self.start().await
    }

    /// Orchestrated sequence after a persisted configuration change:
    /// restart (which quiesces marking and flushes sets), then ask the
    /// resolver to reload. Only failing to start again is fatal.
    pub async fn after_config_change(&self) -> Result<(), Error> {
        self.restart().await?;
        dnsmasq::reload_resolver().await;
        Ok(())
    }

    /// Read-modify-write the configuration under the writer lock, then run
    /// the orchestrated restart sequence. A mutation that fails validation
    /// is discarded and leaves the running service untouched.
    pub async fn modify_config<F>(&self, f: F) -> Result<(), Error>
    where
        F: FnOnce(&mut Config) -> Result<(), config::Error> + Send,
    {
        self.store.modify(f)?;
        self.after_config_change().await
    }

    pub fn is_running(&self) -> bool {
        lock_inner(&self.inner).running
    }

    pub fn status(&self) -> Status {
        let inner = lock_inner(&self.inner);
        Status {
            running: inner.running,
            ipsets: inner.last.clone(),
        }
    }

    /// Fetch every url-typed list into the cache directory.
    pub async fn download(&self) -> Result<Vec<lists::DownloadOutcome>, Error> {
        let cfg = self.store.read()?;
        Ok(lists::download(&cfg).await?)
    }

    /// One full reconciliation pass for CLI callers.
    pub async fn apply_once(&self) -> Result<ApplyReport, Error> {
        let cfg = self.store.read()?;
        let statuses = self.apply_config(&cfg).await;
        lock_inner(&self.inner).last = statuses.clone();

        let contained = statuses
            .iter()
            .any(|s| matches!(s.state, IpsetState::Routed { .. } | IpsetState::Blackhole));
        if contained {
            return Ok(ApplyReport::Applied(statuses));
        }
        if statuses.iter().any(|s| s.state == IpsetState::Idle) {
            return Ok(ApplyReport::NoInterface);
        }
        Err(Error::NothingApplied)
    }

    /// Full apply: ensure sets exist, populate them from the lists,
    /// regenerate the resolver drop-in, then converge routing per set.
    async fn apply_config(&self, cfg: &Config) -> Vec<IpsetStatus> {
        let mut broken: HashSet<String> = HashSet::new();

        for ipset in &cfg.ipsets {
            match self.ipsets.exists(&ipset.ipset_name).await {
                Ok(true) => continue,
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(ipset = %ipset.ipset_name, error = %e, "existence check failed, creating anyway");
                }
            }
            if let Err(e) = self.ipsets.create(&ipset.ipset_name, ipset.ip_version).await {
                tracing::error!(ipset = %ipset.ipset_name, error = %e, "failed to create set");
                broken.insert(ipset.ipset_name.clone());
            }
        }

        for ipset in &cfg.ipsets {
            if broken.contains(&ipset.ipset_name) {
                continue;
            }
            match collect_networks(cfg, ipset) {
                Ok(networks) => {
                    if let Err(e) = self.ipsets.import(ipset, &networks).await {
                        tracing::error!(ipset = %ipset.ipset_name, error = %e, "failed to import networks");
                    }
                }
                Err(e) => {
                    tracing::error!(ipset = %ipset.ipset_name, error = %e, "failed to gather networks");
                }
            }
        }

        let upstreams = self.dns_upstreams(cfg).await;
        if let Err(e) = dnsmasq::write_dropin(cfg, &upstreams) {
            tracing::error!(error = %e, "failed to write resolver drop-in");
        }

        let snapshot = rci_snapshot(self.keenetic.as_ref(), cfg).await;
        let mut statuses = reconcile_all(&self.netlink, &self.filter, cfg, snapshot.as_ref(), None).await;
        for status in statuses.iter_mut() {
            if broken.contains(&status.name) {
                status.state = IpsetState::Failed {
                    error: "set creation failed".to_string(),
                };
            }
        }
        statuses
    }

    /// Upstream `server=` payloads for the resolver drop-in: the router's
    /// DNS configuration when enabled, otherwise the configured fallback.
    async fn dns_upstreams(&self, cfg: &Config) -> Vec<String> {
        let fallback: Vec<String> = cfg.general.fallback_dns.clone().into_iter().collect();
        if !cfg.general.use_keenetic_dns {
            return fallback;
        }

        if let Some(client) = &self.keenetic {
            match client.dns_servers().await {
                Ok(servers) if !servers.is_empty() => return servers,
                Ok(_) => tracing::warn!("router reported no DNS servers"),
                Err(e) => tracing::warn!(error = %e, "failed to discover router DNS servers"),
            }
        }

        if fallback.is_empty() {
            tracing::warn!("no upstream DNS available, emitting no server directives");
        }
        fallback
    }
}

async fn rci_snapshot(client: Option<&keenetic::Client>, cfg: &Config) -> Option<InterfaceMap> {
    if !cfg.general.use_keenetic_api {
        return None;
    }
    let client = client?;
    match client.interfaces().await {
        Ok(map) => Some(map),
        Err(e) => {
            tracing::warn!(error = %e, "failed to fetch router interface snapshot, using OS state only");
            None
        }
    }
}

/// Converge routing for every configured set; one set's failure is recorded
/// and the next set is reconciled regardless.
async fn reconcile_all<N: NetlinkOps>(
    netlink: &N,
    filter: &Arc<dyn IptablesOps>,
    cfg: &Config,
    snapshot: Option<&InterfaceMap>,
    cancel: Option<&CancellationToken>,
) -> Vec<IpsetStatus> {
    let mut statuses = Vec::with_capacity(cfg.ipsets.len());

    for ipset in &cfg.ipsets {
        if cancel.is_some_and(|c| c.is_cancelled()) {
            break;
        }

        let state = match interfaces::best_interface(netlink, ipset, snapshot).await {
            Ok(chosen) => match reconcile_ipset(netlink, filter.as_ref(), ipset, chosen.as_ref()).await {
                Ok(Outcome::Routed { interface }) => IpsetState::Routed { interface },
                Ok(Outcome::Blackhole) => IpsetState::Blackhole,
                Ok(Outcome::Idle) => IpsetState::Idle,
                Err(e) => {
                    tracing::error!(ipset = %ipset.ipset_name, error = %e, "reconciliation failed");
                    IpsetState::Failed { error: e.to_string() }
                }
            },
            Err(e) => {
                tracing::error!(ipset = %ipset.ipset_name, error = %e, "interface selection failed");
                IpsetState::Failed { error: e.to_string() }
            }
        };

        statuses.push(IpsetStatus {
            name: ipset.ipset_name.clone(),
            state,
        });
    }

    statuses
}

/// IP/CIDR entries of the set's lists, deduplicated in declaration order.
/// Unparseable lines are warned about and skipped.
fn collect_networks(cfg: &Config, ipset: &config::Ipset) -> Result<Vec<IpCidr>, lists::Error> {
    let mut networks = Vec::new();
    let mut seen = HashSet::new();

    for list_name in &ipset.lists {
        let Some(list) = cfg.find_list(list_name) else {
            continue;
        };
        lists::iterate::<_, lists::Error>(list, cfg, |line| {
            match lists::parse_host(line) {
                Ok(Host::Net(net)) => {
                    if seen.insert(net) {
                        networks.push(net);
                    }
                }
                Ok(Host::Domain(_)) => {}
                Err(e) => {
                    tracing::warn!(list = %list_name, error = %e, "skipping unparseable list entry");
                }
            }
            Ok(())
        })?;
    }

    Ok(networks)
}

/// The background loop: reload configuration and re-converge routing on each
/// tick. Lists are not re-imported here; a config change goes through
/// restart, which does the full apply.
async fn run_loop<N: NetlinkOps + 'static>(
    store: config::Store,
    netlink: N,
    filter: Arc<dyn IptablesOps>,
    keenetic: Option<keenetic::Client>,
    inner: Arc<Mutex<Inner>>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!("reconciler loop cancelled");
                return;
            }
            _ = tokio::time::sleep(TICK_INTERVAL) => {}
        }

        let cfg = match store.read() {
            Ok(cfg) => cfg,
            Err(e) => {
                tracing::warn!(error = %e, "failed to reload configuration, staying on kernel state");
                continue;
            }
        };

        let snapshot = rci_snapshot(keenetic.as_ref(), &cfg).await;
        let statuses = reconcile_all(&netlink, &filter, &cfg, snapshot.as_ref(), Some(&cancel)).await;
        if cancel.is_cancelled() {
            return;
        }
        lock_inner(&inner).last = statuses;
    }
}
