//! Rotation policy: decides when to refresh, what to hand out, and how to
//! treat failures.
//!
//! The policy owns the pool exclusively; all admissions and quarantines go
//! through it. Proxy mode sequences freshness -> `next()` -> liveness
//! confirmation with bounded, escalating retries. Tor mode drives the circuit
//! controller under the same contract, so the orchestrator never cares which
//! kind of identity it is holding.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::sleep;

use crate::circuit::CircuitController;
use crate::events::{
    AttemptFailedEvent, CircuitRenewedEvent, EventDispatcher, FetchCompletedEvent,
    IdentityQuarantinedEvent, IdentityVerifiedEvent, RotationEvent,
};
use crate::identity::{
    CandidateSource, IdentityPool, IdentityRecord, IdentityValidator, ProbeClient, SnapshotStore,
};

/// Refresh thresholds and retry bounds.
///
/// The values mirror the observed behavior of the system this replaces; they
/// are tuning parameters, not invariants.
#[derive(Debug, Clone)]
pub struct PolicyConfig {
    /// Refresh when the pool shrinks below this.
    pub min_pool_size: usize,
    /// Refresh when the last successful fetch cycle is older than this.
    pub refresh_interval: Duration,
    /// Clear the quarantine set after this much time, giving transiently
    /// overloaded addresses a chance to be re-tested.
    pub quarantine_clear_interval: Duration,
    /// Maximum acquisition attempts per `get_identity` call.
    pub max_attempts: u32,
    /// Base wait between attempts; scales linearly with the attempt number.
    pub retry_base_wait: Duration,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            min_pool_size: 3,
            refresh_interval: Duration::from_secs(1800),
            quarantine_clear_interval: Duration::from_secs(3600),
            max_attempts: 5,
            retry_base_wait: Duration::from_secs(5),
        }
    }
}

/// A verified-fresh identity handed to the session driver.
#[derive(Debug, Clone)]
pub enum IdentityLease {
    Proxy(IdentityRecord),
    Circuit { ip: IpAddr, socks_port: u16 },
}

impl IdentityLease {
    /// Proxy URL the session should egress through.
    pub fn proxy_url(&self) -> Option<String> {
        match self {
            IdentityLease::Proxy(record) => record.proxy_url(),
            IdentityLease::Circuit { socks_port, .. } => {
                Some(format!("socks5h://127.0.0.1:{socks_port}"))
            }
        }
    }

    pub fn describe(&self) -> String {
        match self {
            IdentityLease::Proxy(record) => record.endpoint(),
            IdentityLease::Circuit { ip, .. } => format!("tor circuit via {ip}"),
        }
    }
}

/// Mode-dispatching facade over the two policy implementations.
pub enum RotationPolicy {
    Proxy(ProxyRotationPolicy),
    Tor(TorRotationPolicy),
}

impl RotationPolicy {
    /// Obtain a verified-fresh identity, or `None` when attempts are
    /// exhausted. Never fatal: the orchestrator waits and restarts the cycle.
    pub async fn get_identity(&mut self) -> Option<IdentityLease> {
        match self {
            RotationPolicy::Proxy(policy) => policy.get_identity().await,
            RotationPolicy::Tor(policy) => policy.get_identity().await,
        }
    }
}

/// Proxy-mode rotation: fetch, classify, rotate, confirm, quarantine.
pub struct ProxyRotationPolicy {
    config: PolicyConfig,
    source: Arc<dyn CandidateSource>,
    validator: IdentityValidator<dyn ProbeClient>,
    pool: IdentityPool,
    store: Option<SnapshotStore>,
    events: Arc<EventDispatcher>,
    snapshot_restored: bool,
}

impl ProxyRotationPolicy {
    pub fn new(
        config: PolicyConfig,
        source: Arc<dyn CandidateSource>,
        validator: IdentityValidator<dyn ProbeClient>,
        store: Option<SnapshotStore>,
        events: Arc<EventDispatcher>,
    ) -> Self {
        Self {
            config,
            source,
            validator,
            pool: IdentityPool::new(),
            store,
            events,
            snapshot_restored: false,
        }
    }

    pub fn pool(&self) -> &IdentityPool {
        &self.pool
    }

    pub async fn get_identity(&mut self) -> Option<IdentityLease> {
        for attempt in 1..=self.config.max_attempts {
            self.ensure_fresh().await;

            let Some(record) = self.pool.next() else {
                self.attempt_failed(attempt, "identity pool empty");
                self.wait_before_retry(attempt).await;
                continue;
            };

            match self.validator.confirm_live(&record).await {
                Some(ip) => {
                    log::info!("rotating to {} (egress {ip})", record.endpoint());
                    return Some(IdentityLease::Proxy(record));
                }
                None => {
                    self.pool.quarantine(&record.address);
                    self.events.dispatch(RotationEvent::IdentityQuarantined(
                        IdentityQuarantinedEvent {
                            address: record.address.clone(),
                            timestamp: Utc::now(),
                        },
                    ));
                    self.persist().await;
                    self.attempt_failed(attempt, &format!("{} went dead", record.endpoint()));
                    self.wait_before_retry(attempt).await;
                }
            }
        }
        log::warn!(
            "no identity available after {} attempts",
            self.config.max_attempts
        );
        None
    }

    /// Apply the refresh trigger policy and run a fetch-and-validate cycle
    /// when due. An empty fetch is "no new candidates this cycle", never an
    /// error.
    async fn ensure_fresh(&mut self) {
        if self
            .pool
            .quarantine_stale(self.config.quarantine_clear_interval)
        {
            self.pool.clear_quarantine();
        }

        if !self
            .pool
            .needs_refresh(self.config.min_pool_size, self.config.refresh_interval)
        {
            return;
        }

        if !self.snapshot_restored {
            self.snapshot_restored = true;
            self.restore_snapshot().await;
        }

        let candidates = self.source.fetch().await;
        self.events
            .dispatch(RotationEvent::FetchCompleted(FetchCompletedEvent {
                candidates: candidates.len(),
                timestamp: Utc::now(),
            }));
        // An empty batch still completes the fetch cycle and throttles the
        // next one; a thin pool refetches via the size trigger regardless.
        self.pool.mark_refreshed();
        if candidates.is_empty() {
            return;
        }

        let mut admitted = 0usize;
        for candidate in candidates {
            if self.pool.is_quarantined(&candidate.address) || self.pool.contains(&candidate.address)
            {
                continue;
            }
            if let Some(kind) = self.validator.classify(&candidate).await {
                let record = candidate.into_verified(kind);
                self.events
                    .dispatch(RotationEvent::IdentityVerified(IdentityVerifiedEvent {
                        endpoint: record.endpoint(),
                        protocol: kind,
                        timestamp: Utc::now(),
                    }));
                if self.pool.admit(record) {
                    admitted += 1;
                }
            }
        }

        if admitted > 0 {
            log::info!("admitted {admitted} new identities ({} total)", self.pool.len());
            self.persist().await;
        }
    }

    /// Re-admit persisted identities, confirming liveness of each first.
    /// A stale snapshot admits nothing.
    async fn restore_snapshot(&mut self) {
        let Some(store) = &self.store else {
            return;
        };
        let persisted = store.load().await;
        let mut restored = 0usize;
        for record in persisted {
            if self.pool.is_quarantined(&record.address) || self.pool.contains(&record.address) {
                continue;
            }
            if self.validator.confirm_live(&record).await.is_some() && self.pool.admit(record) {
                restored += 1;
            }
        }
        if restored > 0 {
            log::info!("restored {restored} identities from snapshot");
        }
    }

    async fn persist(&self) {
        if let Some(store) = &self.store
            && let Err(err) = store.save(self.pool.records()).await
        {
            log::warn!("snapshot save failed: {err}");
        }
    }

    fn attempt_failed(&self, attempt: u32, reason: &str) {
        self.events
            .dispatch(RotationEvent::AttemptFailed(AttemptFailedEvent {
                reason: reason.to_string(),
                attempt,
                timestamp: Utc::now(),
            }));
    }

    async fn wait_before_retry(&self, attempt: u32) {
        if attempt < self.config.max_attempts {
            sleep(self.config.retry_base_wait * attempt).await;
        }
    }
}

/// Tor-mode rotation: every acquisition is a circuit renewal.
pub struct TorRotationPolicy {
    controller: CircuitController,
    events: Arc<EventDispatcher>,
}

impl TorRotationPolicy {
    pub fn new(controller: CircuitController, events: Arc<EventDispatcher>) -> Self {
        Self { controller, events }
    }

    pub fn controller(&self) -> &CircuitController {
        &self.controller
    }

    pub async fn get_identity(&mut self) -> Option<IdentityLease> {
        match self.controller.renew().await {
            Ok(ip) => {
                self.events
                    .dispatch(RotationEvent::CircuitRenewed(CircuitRenewedEvent {
                        ip,
                        unique_identities: self.controller.seen_identities().len(),
                        timestamp: Utc::now(),
                    }));
                Some(IdentityLease::Circuit {
                    ip,
                    socks_port: self.controller.socks_port(),
                })
            }
            Err(err) => {
                self.events
                    .dispatch(RotationEvent::AttemptFailed(AttemptFailedEvent {
                        reason: err.to_string(),
                        attempt: 1,
                        timestamp: Utc::now(),
                    }));
                None
            }
        }
    }
}
