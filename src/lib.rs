//! # netnym
//!
//! An identity rotation engine for long-running automated sessions that must
//! appear to originate from different network identities over time.
//!
//! The crate acquires, validates, and rotates outbound identities —
//! authenticated proxy endpoints or a Tor circuit — and drives the
//! retry/backoff loop around them so a calling workflow always either gets a
//! verified-fresh identity or an explicit failure.
//!
//! ## Features
//!
//! - Live protocol classification (HTTP/HTTPS/SOCKS4/SOCKS5) against
//!   independent IP-echo services
//! - Round-robin rotation with address-scoped quarantine
//! - Snapshot persistence with liveness re-confirmation on restore
//! - Tor circuit renewal over the control port with per-process IP diversity
//! - Pluggable session driver and workflow collaborators
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use netnym::{Rotator, ShutdownHandle};
//! # use netnym::{DriverError, IdentityLease, RotatorResult, Session, SessionDriver, Workflow};
//! # struct MyDriver;
//! # #[async_trait::async_trait]
//! # impl SessionDriver for MyDriver {
//! #     async fn create_session(&self, _: &IdentityLease) -> Result<Box<dyn Session>, DriverError> {
//! #         Err(DriverError("todo".into()))
//! #     }
//! # }
//! # struct MyWorkflow;
//! # #[async_trait::async_trait]
//! # impl Workflow for MyWorkflow {
//! #     async fn run(&self, _: &mut dyn Session, _: u32) -> RotatorResult<bool> { Ok(true) }
//! # }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut rotator = Rotator::builder()
//!         .with_list_url("https://example.com/identities.txt")
//!         .with_snapshot_path("identities.json")
//!         .with_driver(Arc::new(MyDriver))
//!         .with_workflow(Arc::new(MyWorkflow))
//!         .build()?;
//!     rotator.run(ShutdownHandle::new()).await?;
//!     Ok(())
//! }
//! ```

mod orchestrator;

pub mod circuit;
pub mod events;
pub mod identity;
pub mod policy;

pub use crate::orchestrator::{
    CycleOutcome,
    DriverError,
    Rotator,
    RotatorBuilder,
    RotatorConfig,
    RotatorError,
    RotatorResult,
    Session,
    SessionDriver,
    ShutdownHandle,
    Workflow,
};

pub use crate::circuit::{CircuitConfig, CircuitController, CircuitError, CircuitState};

pub use crate::events::{
    AttemptFailedEvent,
    CircuitRenewedEvent,
    EventDispatcher,
    EventHandler,
    FetchCompletedEvent,
    IdentityQuarantinedEvent,
    IdentityVerifiedEvent,
    LoggingHandler,
    RotationEvent,
    SessionFinishedEvent,
};

pub use crate::identity::{
    CandidateSource,
    Credentials,
    HttpCandidateSource,
    IdentityPool,
    IdentityRecord,
    IdentityStatus,
    IdentityValidator,
    ProbeClient,
    ProbeError,
    ProtocolKind,
    ReqwestProbeClient,
    parse_candidates,
    SnapshotStore,
    StoreError,
    ValidatorConfig,
};

pub use crate::policy::{
    IdentityLease,
    PolicyConfig,
    ProxyRotationPolicy,
    RotationPolicy,
    TorRotationPolicy,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
