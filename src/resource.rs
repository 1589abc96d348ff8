//! Execution resources and the shared pool
//!
//! A [`Resource`] is a named backend instance with a finite number of
//! execution slots. The [`ResourcePool`] preserves declaration order (the
//! scheduler's tie-break) and conserves slots: every take is matched by
//! exactly one release.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::types::ResourceName;

// ============================================================================
// RELIABILITY STATISTICS
// ============================================================================

/// Running success/turnaround history of a resource, fed by the engine on
/// every terminal transition and consumed by reliability-aware schedulers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReliabilityStats {
    pub succeeded: u64,
    pub failed: u64,
    total_turnaround_secs: u64,
}

impl ReliabilityStats {
    pub fn record(&mut self, success: bool, turnaround_secs: u64) {
        if success {
            self.succeeded += 1;
        } else {
            self.failed += 1;
        }
        self.total_turnaround_secs += turnaround_secs;
    }

    /// Fraction of terminated jobs that succeeded; 1.0 with no history so
    /// fresh resources are not penalized.
    pub fn success_ratio(&self) -> f64 {
        let total = self.succeeded + self.failed;
        if total == 0 {
            1.0
        } else {
            self.succeeded as f64 / total as f64
        }
    }

    pub fn mean_turnaround_secs(&self) -> Option<f64> {
        let total = self.succeeded + self.failed;
        if total == 0 {
            None
        } else {
            Some(self.total_turnaround_secs as f64 / total as f64)
        }
    }
}

// ============================================================================
// RESOURCE
// ============================================================================

/// A named backend instance with slot capacity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub name: ResourceName,
    /// Declared capacity
    pub total_slots: u32,
    /// Currently free slots
    free_slots: u32,
    pub stats: ReliabilityStats,
}

impl Resource {
    pub fn new(name: ResourceName, total_slots: u32) -> Self {
        Self {
            name,
            total_slots,
            free_slots: total_slots,
            stats: ReliabilityStats::default(),
        }
    }

    pub fn free_slots(&self) -> u32 {
        self.free_slots
    }

    fn try_take(&mut self, slots: u32) -> bool {
        if self.free_slots >= slots {
            self.free_slots -= slots;
            true
        } else {
            false
        }
    }

    fn release(&mut self, slots: u32) {
        self.free_slots = (self.free_slots + slots).min(self.total_slots);
    }
}

// ============================================================================
// RESOURCE POOL
// ============================================================================

/// Declaration-ordered set of resources, shared across the engine.
///
/// Mutated only by the engine while it holds the session lock; the RwLock
/// here is for interior mutability through `&self`, not for contention.
#[derive(Debug, Default)]
pub struct ResourcePool {
    inner: RwLock<Vec<Resource>>,
}

impl ResourcePool {
    pub fn new(resources: Vec<Resource>) -> Self {
        Self {
            inner: RwLock::new(resources),
        }
    }

    /// Snapshot in declaration order (what schedulers rank over).
    pub fn snapshot(&self) -> Vec<Resource> {
        self.inner.read().clone()
    }

    /// Reserve `slots` on `name`. Returns false if the resource is missing
    /// or lacks capacity — the caller's scheduling decision went stale.
    pub fn take(&self, name: &ResourceName, slots: u32) -> bool {
        let mut pool = self.inner.write();
        pool.iter_mut()
            .find(|r| &r.name == name)
            .map(|r| r.try_take(slots))
            .unwrap_or(false)
    }

    /// Return `slots` to `name`, saturating at the declared capacity.
    pub fn release(&self, name: &ResourceName, slots: u32) {
        let mut pool = self.inner.write();
        if let Some(r) = pool.iter_mut().find(|r| &r.name == name) {
            r.release(slots);
        }
    }

    /// Feed a terminal outcome into the resource's history.
    pub fn record_outcome(&self, name: &ResourceName, success: bool, turnaround_secs: u64) {
        let mut pool = self.inner.write();
        if let Some(r) = pool.iter_mut().find(|r| &r.name == name) {
            r.stats.record(success, turnaround_secs);
        }
    }

    pub fn free_slots(&self, name: &ResourceName) -> Option<u32> {
        self.inner
            .read()
            .iter()
            .find(|r| &r.name == name)
            .map(|r| r.free_slots())
    }

    /// Sum of free slots across all resources.
    pub fn total_free(&self) -> u32 {
        self.inner.read().iter().map(|r| r.free_slots()).sum()
    }
}

// ============================================================================
// TESTS
// ============================================================================
