//! Application Working Mode: one named execution profile with a fixed
//! resource demand and a QoS value.
//!
//! Grounded on `include/bbque/app/working_mode.h` /
//! `bbque/app/working_mode.cc`. Immutable after load except for the
//! reconfiguration-overhead table, which accumulates as the scheduler
//! transitions applications between AWMs over the daemon's lifetime.

use std::collections::HashMap;

use crate::resources::UsageMap;

/// min/max/last/count of the reported wall-clock transition time to reach
/// this AWM from one particular source AWM. No running sum is kept — the
/// mean is derived on read from `last` and `count`'s siblings, matching
/// `working_mode.cc`'s recorded fields exactly.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct OverheadStats {
    pub min_ms: f64,
    pub max_ms: f64,
    pub last_ms: f64,
    pub count: u64,
}

impl OverheadStats {
    fn record(&mut self, sample_ms: f64) {
        if self.count == 0 {
            self.min_ms = sample_ms;
            self.max_ms = sample_ms;
        } else {
            self.min_ms = self.min_ms.min(sample_ms);
            self.max_ms = self.max_ms.max(sample_ms);
        }
        self.last_ms = sample_ms;
        self.count += 1;
    }
}

/// Immutable-after-load execution profile.
#[derive(Debug, Clone)]
pub struct WorkingMode {
    pub id: u32,
    pub name: String,
    /// Higher is better; the enabled-AWM list is sorted ascending by this.
    pub value: u16,
    /// The resource demand this mode declares, before binding.
    pub usage_template: UsageMap,
    /// Recorded overhead, keyed by the *destination* AWM id reached from
    /// this one.
    overheads: HashMap<u32, OverheadStats>,
}

impl WorkingMode {
    pub fn new(id: u32, name: impl Into<String>, value: u16, usage_template: UsageMap) -> Self {
        Self {
            id,
            name: name.into(),
            value,
            usage_template,
            overheads: HashMap::new(),
        }
    }

    /// Record a successful transition from this AWM to `destination_awm_id`
    /// that took `wall_ms`. Advisory data; consumed only by policies.
    pub fn record_overhead(&mut self, destination_awm_id: u32, wall_ms: f64) {
        self.overheads.entry(destination_awm_id).or_default().record(wall_ms);
    }

    pub fn overhead_to(&self, destination_awm_id: u32) -> Option<OverheadStats> {
        self.overheads.get(&destination_awm_id).copied()
    }

    /// Total demand this mode declares on `path` (sum, since a template may
    /// list the same abstract path more than once across binds).
    pub fn demand_on(&self, path: &str) -> u64 {
        self.usage_template
            .iter()
            .filter(|(p, _)| p == path)
            .map(|(_, amount)| *amount)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overhead_tracks_min_max_last_count_no_running_sum() {
        let mut awm = WorkingMode::new(0, "base", 10, vec![]);
        awm.record_overhead(1, 5.0);
        awm.record_overhead(1, 15.0);
        awm.record_overhead(1, 10.0);
        let stats = awm.overhead_to(1).unwrap();
        assert_eq!(stats.min_ms, 5.0);
        assert_eq!(stats.max_ms, 15.0);
        assert_eq!(stats.last_ms, 10.0);
        assert_eq!(stats.count, 3);
    }

    #[test]
    fn overhead_is_per_destination() {
        let mut awm = WorkingMode::new(0, "base", 10, vec![]);
        awm.record_overhead(1, 5.0);
        awm.record_overhead(2, 50.0);
        assert_eq!(awm.overhead_to(1).unwrap().last_ms, 5.0);
        assert_eq!(awm.overhead_to(2).unwrap().last_ms, 50.0);
        assert!(awm.overhead_to(3).is_none());
    }

    #[test]
    fn demand_on_sums_repeated_path_entries() {
        let awm = WorkingMode::new(
            0,
            "base",
            10,
            vec![("arch.tile0.pe0".to_string(), 1), ("arch.tile0.pe0".to_string(), 1)],
        );
        assert_eq!(awm.demand_on("arch.tile0.pe0"), 2);
        assert_eq!(awm.demand_on("arch.tile0.pe1"), 0);
    }
}
