//! High level session orchestration.
//!
//! Wires together the rotation policy, the external session driver, and the
//! workflow collaborator into the outer retry/backoff loop: obtain a
//! verified-fresh identity, run one session through it, cool down, repeat.
//! The loop runs until the injected shutdown handle fires; no error in normal
//! operation terminates it.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use thiserror::Error;
use tokio::time::sleep;

use crate::circuit::{CircuitConfig, CircuitController, CircuitError};
use crate::events::{
    AttemptFailedEvent, EventDispatcher, EventHandler, LoggingHandler, RotationEvent,
    SessionFinishedEvent,
};
use crate::identity::{
    CandidateSource, HttpCandidateSource, IdentityValidator, ProbeClient, ReqwestProbeClient,
    SnapshotStore, StoreError, ValidatorConfig,
};
use crate::policy::{
    IdentityLease, PolicyConfig, ProxyRotationPolicy, RotationPolicy, TorRotationPolicy,
};

/// Result alias used across the orchestration layer.
pub type RotatorResult<T> = Result<T, RotatorError>;

/// High-level error surfaced by the orchestrator.
#[derive(Debug, Error)]
pub enum RotatorError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("identity store error: {0}")]
    Store(#[from] StoreError),
    #[error("circuit error: {0}")]
    Circuit(#[from] CircuitError),
    #[error("builder misconfiguration: {0}")]
    Config(String),
    #[error("session driver failure: {0}")]
    Driver(#[from] DriverError),
    #[error("unexpected failure: {0}")]
    Unexpected(String),
}

/// Failure reported by the external driver factory.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct DriverError(pub String);

/// A live session handle produced by the driver.
///
/// The orchestrator only needs to be able to release it; everything else
/// about the session is the collaborator's business.
#[async_trait]
pub trait Session: Send {
    async fn close(&mut self);
}

/// External driver factory collaborator.
#[async_trait]
pub trait SessionDriver: Send + Sync {
    async fn create_session(&self, lease: &IdentityLease) -> Result<Box<dyn Session>, DriverError>;
}

/// External workflow collaborator.
///
/// `Ok(false)` is an ordinary workflow failure (short cooldown);
/// `Err(RotatorError::Unexpected)` is a crash and triggers the recovery
/// delay.
#[async_trait]
pub trait Workflow: Send + Sync {
    async fn run(&self, session: &mut dyn Session, intensity: u32) -> RotatorResult<bool>;
}

/// Cooperative stop signal for the run loop.
#[derive(Clone, Debug, Default)]
pub struct ShutdownHandle {
    flag: Arc<AtomicBool>,
}

impl ShutdownHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shutdown(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_shutdown(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Orchestrator configuration used by the builder.
#[derive(Debug, Clone)]
pub struct RotatorConfig {
    pub policy: PolicyConfig,
    pub validator: ValidatorConfig,
    /// Inclusive range the per-session workflow intensity is drawn from.
    pub intensity_range: (u32, u32),
    /// Cooldown range after a successful session.
    pub success_cooldown: (Duration, Duration),
    /// Shorter cooldown range after a failed workflow.
    pub failure_cooldown: (Duration, Duration),
    /// Wait when no identity could be acquired this cycle.
    pub no_identity_wait: Duration,
    /// Wait after the driver fails to produce a session.
    pub driver_retry_wait: Duration,
    /// Fixed recovery delay after an unexpected crash.
    pub crash_recovery_wait: Duration,
}

impl Default for RotatorConfig {
    fn default() -> Self {
        Self {
            policy: PolicyConfig::default(),
            validator: ValidatorConfig::default(),
            intensity_range: (2, 4),
            success_cooldown: (Duration::from_secs(120), Duration::from_secs(300)),
            failure_cooldown: (Duration::from_secs(10), Duration::from_secs(30)),
            no_identity_wait: Duration::from_secs(30),
            driver_retry_wait: Duration::from_secs(30),
            crash_recovery_wait: Duration::from_secs(30),
        }
    }
}

enum IdentityMode {
    Proxy {
        list_url: Option<String>,
        source: Option<Arc<dyn CandidateSource>>,
        snapshot_path: Option<PathBuf>,
    },
    Tor(CircuitConfig),
}

/// Fluent builder for [`Rotator`].
pub struct RotatorBuilder {
    config: RotatorConfig,
    mode: Option<IdentityMode>,
    driver: Option<Arc<dyn SessionDriver>>,
    workflow: Option<Arc<dyn Workflow>>,
    probe: Option<Arc<dyn ProbeClient>>,
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl RotatorBuilder {
    pub fn new() -> Self {
        Self {
            config: RotatorConfig::default(),
            mode: None,
            driver: None,
            workflow: None,
            probe: None,
            handlers: Vec::new(),
        }
    }

    pub fn with_config(mut self, config: RotatorConfig) -> Self {
        self.config = config;
        self
    }

    /// Proxy mode fed from a remote newline-delimited list.
    pub fn with_list_url(mut self, url: impl Into<String>) -> Self {
        self.mode = Some(IdentityMode::Proxy {
            list_url: Some(url.into()),
            source: None,
            snapshot_path: self.snapshot_path(),
        });
        self
    }

    /// Proxy mode fed from a custom candidate source.
    pub fn with_candidate_source(mut self, source: Arc<dyn CandidateSource>) -> Self {
        self.mode = Some(IdentityMode::Proxy {
            list_url: None,
            source: Some(source),
            snapshot_path: self.snapshot_path(),
        });
        self
    }

    /// Persist verified identities to the given file across restarts.
    pub fn with_snapshot_path(mut self, path: impl Into<PathBuf>) -> Self {
        if let Some(IdentityMode::Proxy { snapshot_path, .. }) = &mut self.mode {
            *snapshot_path = Some(path.into());
        } else {
            self.mode = Some(IdentityMode::Proxy {
                list_url: None,
                source: None,
                snapshot_path: Some(path.into()),
            });
        }
        self
    }

    /// Tor mode: identities come from circuit renewal.
    ///
    /// Installs the hotter Tor-mode session tuning (wider intensity range,
    /// short success cooldown); a later [`with_config`](Self::with_config)
    /// overrides it.
    pub fn with_tor(mut self, config: CircuitConfig) -> Self {
        self.config.intensity_range = (2, 7);
        self.config.success_cooldown = (Duration::from_secs(10), Duration::from_secs(20));
        self.mode = Some(IdentityMode::Tor(config));
        self
    }

    pub fn with_driver(mut self, driver: Arc<dyn SessionDriver>) -> Self {
        self.driver = Some(driver);
        self
    }

    pub fn with_workflow(mut self, workflow: Arc<dyn Workflow>) -> Self {
        self.workflow = Some(workflow);
        self
    }

    /// Override the probe transport, mainly for tests.
    pub fn with_probe_client(mut self, probe: Arc<dyn ProbeClient>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    fn snapshot_path(&self) -> Option<PathBuf> {
        match &self.mode {
            Some(IdentityMode::Proxy { snapshot_path, .. }) => snapshot_path.clone(),
            _ => None,
        }
    }

    pub fn build(self) -> RotatorResult<Rotator> {
        let driver = self
            .driver
            .ok_or_else(|| RotatorError::Config("session driver is required".into()))?;
        let workflow = self
            .workflow
            .ok_or_else(|| RotatorError::Config("workflow is required".into()))?;
        let mode = self
            .mode
            .ok_or_else(|| RotatorError::Config("identity source is not configured".into()))?;

        let mut events = EventDispatcher::new();
        events.register_handler(Arc::new(LoggingHandler));
        for handler in self.handlers {
            events.register_handler(handler);
        }
        let events = Arc::new(events);

        let probe: Arc<dyn ProbeClient> = self
            .probe
            .unwrap_or_else(|| Arc::new(ReqwestProbeClient::new()));

        let policy = match mode {
            IdentityMode::Proxy {
                list_url,
                source,
                snapshot_path,
            } => {
                let source: Arc<dyn CandidateSource> = match (source, list_url) {
                    (Some(source), _) => source,
                    (None, Some(url)) => Arc::new(HttpCandidateSource::new(url)?),
                    (None, None) => {
                        return Err(RotatorError::Config(
                            "proxy mode needs a list url or candidate source".into(),
                        ));
                    }
                };
                let validator =
                    IdentityValidator::new(probe, self.config.validator.clone());
                RotationPolicy::Proxy(ProxyRotationPolicy::new(
                    self.config.policy.clone(),
                    source,
                    validator,
                    snapshot_path.map(SnapshotStore::new),
                    events.clone(),
                ))
            }
            IdentityMode::Tor(circuit_config) => RotationPolicy::Tor(TorRotationPolicy::new(
                CircuitController::new(circuit_config, probe),
                events.clone(),
            )),
        };

        Ok(Rotator {
            config: self.config,
            policy,
            driver,
            workflow,
            events,
        })
    }
}

impl Default for RotatorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of one orchestration cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// A session ran to completion; `success` is the workflow's verdict.
    Completed { success: bool },
    /// No identity could be acquired this cycle.
    NoIdentity,
    /// The driver could not produce a session from the leased identity.
    DriverFailed,
}

/// Long-running session orchestrator.
pub struct Rotator {
    config: RotatorConfig,
    policy: RotationPolicy,
    driver: Arc<dyn SessionDriver>,
    workflow: Arc<dyn Workflow>,
    events: Arc<EventDispatcher>,
}

impl Rotator {
    pub fn builder() -> RotatorBuilder {
        RotatorBuilder::new()
    }

    /// Run until `shutdown` fires.
    ///
    /// Intentionally an infinite-retry loop: every failure class maps to a
    /// wait-and-restart, never to termination. Unexpected errors release the
    /// session, apply the recovery delay, and continue.
    pub async fn run(&mut self, shutdown: ShutdownHandle) -> RotatorResult<()> {
        while !shutdown.is_shutdown() {
            match self.run_cycle().await {
                Ok(CycleOutcome::Completed { success: true }) => {
                    self.cooldown(self.config.success_cooldown, "between sessions")
                        .await;
                }
                Ok(CycleOutcome::Completed { success: false }) => {
                    self.cooldown(self.config.failure_cooldown, "after workflow failure")
                        .await;
                }
                Ok(CycleOutcome::NoIdentity) => {
                    log::warn!("no identity available this cycle");
                    sleep(self.config.no_identity_wait).await;
                }
                Ok(CycleOutcome::DriverFailed) => {
                    sleep(self.config.driver_retry_wait).await;
                }
                Err(err) => {
                    log::error!("cycle crashed: {err}");
                    self.events
                        .dispatch(RotationEvent::AttemptFailed(AttemptFailedEvent {
                            reason: err.to_string(),
                            attempt: 1,
                            timestamp: chrono::Utc::now(),
                        }));
                    sleep(self.config.crash_recovery_wait).await;
                }
            }
        }
        log::info!("rotator stopped");
        Ok(())
    }

    /// Run exactly one acquisition/session cycle.
    pub async fn run_cycle(&mut self) -> RotatorResult<CycleOutcome> {
        let Some(lease) = self.policy.get_identity().await else {
            return Ok(CycleOutcome::NoIdentity);
        };

        let mut session = match self.driver.create_session(&lease).await {
            Ok(session) => session,
            Err(err) => {
                log::warn!("driver failed for {}: {err}", lease.describe());
                return Ok(CycleOutcome::DriverFailed);
            }
        };

        let intensity = self.pick_intensity();
        log::info!("starting session via {} (intensity {intensity})", lease.describe());
        let outcome = self.workflow.run(session.as_mut(), intensity).await;
        // Release the session before any error propagates.
        session.close().await;
        let success = outcome?;

        self.events
            .dispatch(RotationEvent::SessionFinished(SessionFinishedEvent {
                success,
                intensity,
                timestamp: chrono::Utc::now(),
            }));
        Ok(CycleOutcome::Completed { success })
    }

    fn pick_intensity(&self) -> u32 {
        let (low, high) = self.config.intensity_range;
        if high <= low {
            low
        } else {
            rand::thread_rng().gen_range(low..=high)
        }
    }

    async fn cooldown(&self, range: (Duration, Duration), why: &str) {
        let wait = random_wait(range);
        log::debug!("waiting {:.1}s {why}", wait.as_secs_f32());
        sleep(wait).await;
    }
}

fn random_wait((min, max): (Duration, Duration)) -> Duration {
    if max <= min {
        return min;
    }
    let mut rng = rand::thread_rng();
    Duration::from_secs_f32(rng.gen_range(min.as_secs_f32()..max.as_secs_f32()))
}
