//! Resource ranking policies
//!
//! A scheduler looks at a snapshot of the resource pool and picks exactly
//! one resource for a NEW job, or none (the job stays NEW and is retried
//! next cycle). Policies are pure functions over the snapshot: the engine
//! alone mutates capacity, so repeated calls with equal inputs must pick
//! the same resource.

use crate::resource::Resource;
use crate::types::ResourceName;

/// Policy choosing which resource a new job is submitted to.
///
/// Contract: return a resource with `free_slots >= requested_slots`, or
/// `None`. Deterministic: ties broken by declaration order.
pub trait Scheduler: Send + Sync {
    fn name(&self) -> &str;

    /// `resources` is in declaration order.
    fn choose(&self, resources: &[Resource], requested_slots: u32) -> Option<ResourceName>;
}

// ============================================================================
// GREEDY (DEFAULT)
// ============================================================================

/// Default policy: the fitting resource with the most free slots wins;
/// ties go to the earliest-declared resource.
#[derive(Debug, Clone, Copy, Default)]
pub struct GreedyScheduler;

impl Scheduler for GreedyScheduler {
    fn name(&self) -> &str {
        "greedy"
    }

    fn choose(&self, resources: &[Resource], requested_slots: u32) -> Option<ResourceName> {
        let mut best: Option<&Resource> = None;
        for r in resources {
            if r.free_slots() < requested_slots {
                continue;
            }
            // Strict comparison keeps the earliest resource on ties.
            if best.map_or(true, |b| r.free_slots() > b.free_slots()) {
                best = Some(r);
            }
        }
        best.map(|r| r.name.clone())
    }
}

// ============================================================================
// RELIABILITY-WEIGHTED
// ============================================================================

/// Alternative policy ranking by historical success ratio first, free
/// capacity second, declaration order last. Fresh resources rank as fully
/// reliable, so this degrades to greedy until history accumulates.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReliabilityScheduler;

impl Scheduler for ReliabilityScheduler {
    fn name(&self) -> &str {
        "reliability"
    }

    fn choose(&self, resources: &[Resource], requested_slots: u32) -> Option<ResourceName> {
        let mut best: Option<&Resource> = None;
        for r in resources {
            if r.free_slots() < requested_slots {
                continue;
            }
            let better = match best {
                None => true,
                Some(b) => {
                    let (ra, rb) = (r.stats.success_ratio(), b.stats.success_ratio());
                    ra > rb || (ra == rb && r.free_slots() > b.free_slots())
                }
            };
            if better {
                best = Some(r);
            }
        }
        best.map(|r| r.name.clone())
    }
}

// ============================================================================
// TESTS
// ============================================================================
