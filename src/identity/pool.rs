//! Verified-identity registry with round-robin rotation and quarantine.
//!
//! Rotation order is insertion order and wraps. Quarantine is scoped to the
//! address, not the record: re-fetching the same address does not bypass it.
//! The quarantine set lives for the process only, so a restart gives
//! previously-bad addresses a second chance.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use super::IdentityRecord;

/// Ordered pool of verified identities plus quarantined addresses.
#[derive(Debug, Default)]
pub struct IdentityPool {
    records: Vec<IdentityRecord>,
    cursor: usize,
    quarantined: HashSet<String>,
    last_refresh: Option<Instant>,
    last_quarantine_clear: Option<Instant>,
}

impl IdentityPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn contains(&self, address: &str) -> bool {
        self.records.iter().any(|rec| rec.address == address)
    }

    pub fn is_quarantined(&self, address: &str) -> bool {
        self.quarantined.contains(address)
    }

    /// Insert at the tail of rotation order. Idempotent on duplicate address;
    /// quarantined addresses are refused.
    pub fn admit(&mut self, record: IdentityRecord) -> bool {
        if self.is_quarantined(&record.address) || self.contains(&record.address) {
            return false;
        }
        self.records.push(record);
        true
    }

    /// Record at the rotation cursor; advances the cursor modulo pool size.
    /// Empty pool yields `None` and the caller must trigger a refresh.
    pub fn next(&mut self) -> Option<IdentityRecord> {
        if self.records.is_empty() {
            return None;
        }
        if self.cursor >= self.records.len() {
            self.cursor = 0;
        }
        let record = self.records[self.cursor].clone();
        self.cursor = (self.cursor + 1) % self.records.len();
        Some(record)
    }

    /// Remove every record at `address` from rotation and quarantine the
    /// address. Effective for subsequent `next()` calls immediately.
    pub fn quarantine(&mut self, address: &str) {
        // Keep the cursor pointing at the same successor after removals.
        let removed_before_cursor = self
            .records
            .iter()
            .take(self.cursor)
            .filter(|rec| rec.address == address)
            .count();
        self.records.retain(|rec| rec.address != address);
        self.cursor = self.cursor.saturating_sub(removed_before_cursor);
        if !self.records.is_empty() {
            self.cursor %= self.records.len();
        } else {
            self.cursor = 0;
        }
        self.quarantined.insert(address.to_string());
        if self.last_quarantine_clear.is_none() {
            self.last_quarantine_clear = Some(Instant::now());
        }
        log::info!("quarantined {address} ({} identities remain)", self.records.len());
    }

    /// Drop the whole quarantine set so addresses can be re-tested.
    pub fn clear_quarantine(&mut self) {
        if !self.quarantined.is_empty() {
            log::info!("clearing {} quarantined addresses", self.quarantined.len());
        }
        self.quarantined.clear();
        self.last_quarantine_clear = Some(Instant::now());
    }

    pub fn mark_refreshed(&mut self) {
        self.last_refresh = Some(Instant::now());
    }

    /// Refresh when the pool is thin or the last successful fetch cycle is
    /// older than `interval`, whichever comes first.
    pub fn needs_refresh(&self, min_size: usize, interval: Duration) -> bool {
        if self.records.len() < min_size {
            return true;
        }
        match self.last_refresh {
            Some(at) => at.elapsed() > interval,
            None => true,
        }
    }

    /// Whether the longer quarantine-clearing interval has elapsed.
    pub fn quarantine_stale(&self, interval: Duration) -> bool {
        match self.last_quarantine_clear {
            Some(at) => at.elapsed() > interval,
            None => false,
        }
    }

    /// Verified records in rotation order, for snapshot persistence.
    pub fn records(&self) -> &[IdentityRecord] {
        &self.records
    }
}
