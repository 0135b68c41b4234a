//! Per-resource bound constraints and enabled-AWM recomputation.
//!
//! Grounded on `bbque/app/application.cc`'s `SetConstraint` /
//! `RemoveConstraint` / `WorkingModesEnabling`, with the bound comparison
//! corrected per the documented source bug: an AWM is enabled iff its
//! demand on every constrained resource lies *within* the bound, not the
//! source's ambiguous lower-bound comparison.

use std::collections::HashMap;

use crate::app::awm::WorkingMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundType {
    Lower,
    Upper,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
struct Bound {
    lower: u64,
    upper: Option<u64>,
}

impl Bound {
    fn is_trivial(&self) -> bool {
        self.lower == 0 && self.upper.is_none()
    }

    fn admits(&self, demand: u64) -> bool {
        demand >= self.lower && self.upper.map(|u| demand <= u).unwrap_or(true)
    }
}

/// Per-resource lower/upper bound map for one application.
#[derive(Debug, Clone, Default)]
pub struct ConstraintMap {
    bounds: HashMap<String, Bound>,
}

impl ConstraintMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `bound_type` on `path` to `value`. Adding a constraint may
    /// disable AWMs that were previously enabled.
    pub fn set(&mut self, path: &str, bound_type: BoundType, value: u64) {
        let bound = self.bounds.entry(path.to_string()).or_default();
        match bound_type {
            BoundType::Lower => bound.lower = value,
            BoundType::Upper => bound.upper = Some(value),
        }
    }

    /// Drop `bound_type` on `path` back to its limit (0 for lower, ∞ for
    /// upper). Once both bounds are at their limits the record is erased
    /// entirely, matching the source's cleanup behaviour.
    pub fn remove(&mut self, path: &str, bound_type: BoundType) {
        let Some(bound) = self.bounds.get_mut(path) else {
            return;
        };
        match bound_type {
            BoundType::Lower => bound.lower = 0,
            BoundType::Upper => bound.upper = None,
        }
        if bound.is_trivial() {
            self.bounds.remove(path);
        }
    }

    /// Is `awm` compatible with every constraint currently recorded?
    pub fn admits(&self, awm: &WorkingMode) -> bool {
        self.bounds
            .iter()
            .all(|(path, bound)| bound.admits(awm.demand_on(path)))
    }

    pub fn is_empty(&self) -> bool {
        self.bounds.is_empty()
    }
}

/// Recompute the enabled-AWM list for `all_awms` under `constraints`,
/// sorted by AWM value ascending (spec: "re-sorted by AWM value ascending"
/// after every recomputation).
pub fn recompute_enabled<'a>(
    all_awms: &'a [WorkingMode],
    constraints: &ConstraintMap,
) -> Vec<&'a WorkingMode> {
    let mut enabled: Vec<&WorkingMode> =
        all_awms.iter().filter(|awm| constraints.admits(awm)).collect();
    enabled.sort_by_key(|awm| awm.value);
    enabled
}
