//! Rotation lifecycle events.
//!
//! Provides hooks for logging and custom reactions around fetch, validation,
//! quarantine, and session activity.

use chrono::{DateTime, Utc};
use std::net::IpAddr;
use std::sync::Arc;

use crate::identity::ProtocolKind;

#[derive(Debug, Clone)]
pub struct FetchCompletedEvent {
    pub candidates: usize,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct IdentityVerifiedEvent {
    pub endpoint: String,
    pub protocol: ProtocolKind,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct IdentityQuarantinedEvent {
    pub address: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CircuitRenewedEvent {
    pub ip: IpAddr,
    pub unique_identities: usize,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct AttemptFailedEvent {
    pub reason: String,
    pub attempt: u32,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct SessionFinishedEvent {
    pub success: bool,
    pub intensity: u32,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum RotationEvent {
    FetchCompleted(FetchCompletedEvent),
    IdentityVerified(IdentityVerifiedEvent),
    IdentityQuarantined(IdentityQuarantinedEvent),
    CircuitRenewed(CircuitRenewedEvent),
    AttemptFailed(AttemptFailedEvent),
    SessionFinished(SessionFinishedEvent),
}

/// Trait implemented by event handlers.
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: &RotationEvent);
}

/// Dispatcher that broadcasts events to registered handlers.
#[derive(Default)]
pub struct EventDispatcher {
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self { handlers: Vec::new() }
    }

    pub fn register_handler(&mut self, handler: Arc<dyn EventHandler>) {
        self.handlers.push(handler);
    }

    pub fn dispatch(&self, event: RotationEvent) {
        for handler in &self.handlers {
            handler.handle(&event);
        }
    }
}

/// Logs events using the `log` crate.
#[derive(Debug)]
pub struct LoggingHandler;

impl EventHandler for LoggingHandler {
    fn handle(&self, event: &RotationEvent) {
        match event {
            RotationEvent::FetchCompleted(fetch) => {
                log::debug!("fetch cycle produced {} candidates", fetch.candidates);
            }
            RotationEvent::IdentityVerified(verified) => {
                log::info!("verified {} as {}", verified.endpoint, verified.protocol);
            }
            RotationEvent::IdentityQuarantined(quarantined) => {
                log::warn!("quarantined {}", quarantined.address);
            }
            RotationEvent::CircuitRenewed(renewed) => {
                log::info!(
                    "circuit renewed -> {} ({} unique identities)",
                    renewed.ip,
                    renewed.unique_identities
                );
            }
            RotationEvent::AttemptFailed(failed) => {
                log::warn!("attempt {} failed: {}", failed.attempt, failed.reason);
            }
            RotationEvent::SessionFinished(finished) => {
                log::info!(
                    "session finished success={} intensity={}",
                    finished.success,
                    finished.intensity
                );
            }
        }
    }
}
