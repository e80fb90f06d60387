//! Failover and load-balance coordination.
//!
//! The coordinator owns the ordered host list parsed from the connection
//! URL and a shared blacklist of recently failed hosts. It re-establishes
//! sessions on failure and swaps between primary and replica hosts for
//! read-only mode, but never replays in-flight statements: a mid-command
//! failure surfaces as a non-transient connection error.

pub mod aurora;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::RwLock;
use rand::seq::SliceRandom;
use tracing::{debug, info, warn};

use crate::error::Error;
use crate::metrics::metrics;
use crate::session::{Connector, Session};
use crate::url::{ConnectionUrl, HostAddress, HostRole};

/// Shared blacklist of failed hosts. Entries expire after the configured
/// timeout. Pool-wide state: clone the `Arc` into every coordinator that
/// should share one view.
pub struct Blacklist {
    entries: DashMap<String, Instant>,
    timeout: Duration,
}

impl Blacklist {
    pub fn new(timeout: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            timeout,
        }
    }

    pub fn add(&self, host: &HostAddress) {
        debug!(host = %host, "Host blacklisted");
        self.entries.insert(host.addr(), Instant::now());
        metrics().set_blacklisted_hosts(self.entries.len());
    }

    pub fn remove(&self, host: &HostAddress) {
        self.entries.remove(&host.addr());
        metrics().set_blacklisted_hosts(self.entries.len());
    }

    pub fn contains(&self, host: &HostAddress) -> bool {
        let addr = host.addr();
        if let Some(entry) = self.entries.get(&addr) {
            if entry.elapsed() < self.timeout {
                return true;
            }
        }
        // Expired entries are dropped lazily
        self.entries
            .remove_if(&addr, |_, at| at.elapsed() >= self.timeout);
        false
    }

    /// Blacklist timestamp for tie-breaking when every host is down
    fn blacklisted_at(&self, host: &HostAddress) -> Option<Instant> {
        self.entries.get(&host.addr()).map(|e| *e.value())
    }
}

/// Coordinates session establishment across the host list.
pub struct FailoverCoordinator {
    hosts: Vec<HostAddress>,
    database: Option<String>,
    connector: Connector,
    blacklist: Arc<Blacklist>,
    session: RwLock<Option<Arc<Session>>>,
    read_only: AtomicBool,
}

impl FailoverCoordinator {
    pub fn new(url: ConnectionUrl) -> Self {
        let blacklist = Arc::new(Blacklist::new(url.options.blacklist_timeout()));
        Self::with_blacklist(url, blacklist)
    }

    /// Share one blacklist across coordinators (e.g. all members of a pool)
    pub fn with_blacklist(url: ConnectionUrl, blacklist: Arc<Blacklist>) -> Self {
        let connector = Connector::new(url.options.clone());
        Self {
            hosts: url.hosts,
            database: url.database,
            connector,
            blacklist,
            session: RwLock::new(None),
            read_only: AtomicBool::new(false),
        }
    }

    /// Hosts in URL order with their role tags, exactly as parsed
    pub fn hosts(&self) -> &[HostAddress] {
        &self.hosts
    }

    pub fn blacklist(&self) -> &Arc<Blacklist> {
        &self.blacklist
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::Acquire)
    }

    /// Establish the initial session.
    pub async fn connect(&self) -> Result<Arc<Session>, Error> {
        let session = self.establish(self.is_read_only()).await?;
        *self.session.write() = Some(session.clone());
        Ok(session)
    }

    /// The active session. Handles from a replaced session raise
    /// resource-closed errors on use, never silently migrate.
    pub fn session(&self) -> Result<Arc<Session>, Error> {
        self.session
            .read()
            .clone()
            .ok_or(Error::ResourceClosed("Connection"))
    }

    /// React to a connection-fatal error: blacklist the failed host and
    /// connect to the next eligible candidate. Nothing in flight is
    /// replayed.
    pub async fn failover(&self) -> Result<Arc<Session>, Error> {
        let failed = self.session.read().clone();
        if let Some(old) = failed {
            self.blacklist.add(old.host());
            old.close().await.ok();
        }
        metrics().record_failover();

        let session = self.establish(self.is_read_only()).await?;
        info!(host = %session.host(), "Failover complete");
        *self.session.write() = Some(session.clone());
        Ok(session)
    }

    /// Switch between primary and replica without tearing down the
    /// coordinator handle. Outstanding statement and cursor handles from
    /// the replaced session become invalid.
    pub async fn set_read_only(&self, read_only: bool) -> Result<Arc<Session>, Error> {
        if self.read_only.swap(read_only, Ordering::AcqRel) == read_only {
            // No role change; keep the current session
            if let Ok(session) = self.session() {
                return Ok(session);
            }
        }

        let session = self.establish(read_only).await?;
        let old = self.session.write().replace(session.clone());
        if let Some(old) = old {
            old.close().await.ok();
        }
        debug!(read_only, host = %session.host(), "Role-aware reconnect");
        Ok(session)
    }

    /// Try candidates in selection order until one connects. Fail fast with
    /// the last cause when the list is exhausted.
    async fn establish(&self, read_only: bool) -> Result<Arc<Session>, Error> {
        let candidates = self.candidates(read_only);
        if candidates.is_empty() {
            return Err(Error::NoHostAvailable("empty host list".to_string()));
        }

        let mut last_error: Option<Error> = None;
        for host in &candidates {
            match self.connector.connect(host, self.database.as_deref()).await {
                Ok(session) => {
                    self.blacklist.remove(host);
                    return Ok(Arc::new(session));
                }
                Err(e) => {
                    warn!(host = %host, error = %e, "Candidate connect failed");
                    self.blacklist.add(host);
                    last_error = Some(e);
                }
            }
        }

        Err(Error::NoHostAvailable(
            last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no candidate hosts".to_string()),
        ))
    }

    /// Candidate order: primaries in URL order for writes; replicas in
    /// random order (then primaries as fallback) for read-only. Blacklisted
    /// hosts are skipped unless every candidate is blacklisted, in which
    /// case the oldest entries are retried first.
    fn candidates(&self, read_only: bool) -> Vec<HostAddress> {
        let mut ordered: Vec<HostAddress> = if read_only {
            let mut replicas: Vec<HostAddress> = self
                .hosts
                .iter()
                .filter(|h| h.role == HostRole::Replica)
                .cloned()
                .collect();
            replicas.shuffle(&mut rand::thread_rng());
            replicas.extend(
                self.hosts
                    .iter()
                    .filter(|h| h.role == HostRole::Primary)
                    .cloned(),
            );
            replicas
        } else {
            self.hosts
                .iter()
                .filter(|h| h.role == HostRole::Primary)
                .cloned()
                .collect()
        };

        let eligible: Vec<HostAddress> = ordered
            .iter()
            .filter(|h| !self.blacklist.contains(h))
            .cloned()
            .collect();

        if !eligible.is_empty() {
            return eligible;
        }

        // Everything is blacklisted: ignore the blacklist, oldest first
        ordered.sort_by_key(|h| self.blacklist.blacklisted_at(h));
        ordered
    }
}
