//! Shared resource quotas charged by memories and tables when they grow.

use std::sync::{Arc, RwLock};

struct Counters {
    current: usize,
    max: usize,
}

/// A current/max counter pair with overflow-safe allocation.
///
/// `allocate` fails atomically: either the whole delta is charged or the
/// counter is left untouched.
pub struct CurrentAndMax {
    state: RwLock<Counters>,
}

impl CurrentAndMax {
    /// Creates a counter with the given maximum and a current value of zero.
    pub fn new(max: usize) -> Self {
        Self {
            state: RwLock::new(Counters { current: 0, max }),
        }
    }

    /// Try to charge `delta` units. Returns false if the charge would
    /// overflow the counter or exceed the maximum.
    pub fn allocate(&self, delta: usize) -> bool {
        let mut state = self.state.write().unwrap();

        // Make sure the delta doesn't make current overflow.
        let Some(new_current) = state.current.checked_add(delta) else {
            return false;
        };
        if new_current > state.max {
            tracing::debug!(
                current = state.current,
                max = state.max,
                delta,
                "resource quota denied allocation"
            );
            return false;
        }

        state.current = new_current;
        true
    }

    /// Return `delta` previously allocated units. It is a bug to free more
    /// than is outstanding.
    pub fn free(&self, delta: usize) {
        let mut state = self.state.write().unwrap();
        assert!(
            state.current >= delta,
            "freed more quota units than were allocated"
        );
        state.current -= delta;
    }

    /// The number of units currently allocated.
    pub fn current(&self) -> usize {
        self.state.read().unwrap().current
    }

    /// The maximum number of units that may be allocated.
    pub fn max(&self) -> usize {
        self.state.read().unwrap().max
    }

    /// Replace the maximum. Outstanding allocations are unaffected, even if
    /// they exceed the new maximum.
    pub fn set_max(&self, new_max: usize) {
        self.state.write().unwrap().max = new_max;
    }
}

impl Default for CurrentAndMax {
    fn default() -> Self {
        Self::new(usize::MAX)
    }
}

/// A quota limiting the memory pages and table elements a set of objects may
/// hold. Quotas are deliberately shareable: the same quota may be referenced
/// by any number of memories and tables, which then compete for it.
#[derive(Default)]
pub struct ResourceQuota {
    /// Pages of linear memory.
    pub memory_pages: CurrentAndMax,
    /// Table elements.
    pub table_elems: CurrentAndMax,
}

impl ResourceQuota {
    /// A quota with no effective limits.
    pub fn unlimited() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A quota with the given limits.
    pub fn with_limits(max_memory_pages: usize, max_table_elems: usize) -> Arc<Self> {
        Arc::new(Self {
            memory_pages: CurrentAndMax::new(max_memory_pages),
            table_elems: CurrentAndMax::new(max_table_elems),
        })
    }
}

/// An optional shared reference to a quota. `None` means unconstrained.
pub type ResourceQuotaRef = Option<Arc<ResourceQuota>>;
