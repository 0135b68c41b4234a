//! Scheduler Manager: adapter around a pluggable scheduling policy.
//!
//! Grounded on `bbque/scheduler_manager.cc`: request a fresh view, invoke
//! the policy, and on success hand the view token off to the
//! synchronization manager; on failure release the view and report the
//! outcome as a non-error "no work" variant rather than a hard failure.

pub mod metrics;
pub mod policy;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::app::exc::SyncSubState;
use crate::app_manager::ApplicationManager;
use crate::error::SchedulerError;
use crate::ids::{AppUid, ViewToken};
use crate::resources::ResourceAccounter;
use crate::scheduler::metrics::CycleMetrics;
use crate::scheduler::policy::SchedulerPolicy;

const SUB_STATES: [SyncSubState; 5] = [
    SyncSubState::Starting,
    SyncSubState::Reconf,
    SyncSubState::MigRec,
    SyncSubState::Migrate,
    SyncSubState::Blocked,
];

pub struct SchedulerManager {
    policy: Box<dyn SchedulerPolicy>,
    metrics: Mutex<CycleMetrics>,
    last_cycle_at: Mutex<Option<Instant>>,
}

impl SchedulerManager {
    pub fn new(policy: Box<dyn SchedulerPolicy>) -> Self {
        Self {
            policy,
            metrics: Mutex::new(CycleMetrics::default()),
            last_cycle_at: Mutex::new(None),
        }
    }

    /// Run one scheduling cycle: open a fresh view, invoke the policy, and
    /// return its view token on success so the caller (the resource
    /// manager's control loop) can hand it to the synchronization manager.
    /// On failure the view is released and the error is returned —
    /// `NoWorkingMode` is an expected, non-fatal outcome.
    pub async fn run_cycle(
        &self,
        app_manager: &ApplicationManager,
        accounter: &mut ResourceAccounter,
    ) -> Result<ViewToken, SchedulerError> {
        let start = Instant::now();
        let view = accounter.get_view();

        // Snapshot every sync sub-state queue before the policy runs so a
        // successful cycle can tell which EXCs it moved into SYNC, and
        // under which sub-state, for the per-outcome tally.
        let mut before = Vec::with_capacity(SUB_STATES.len());
        for sub_state in SUB_STATES {
            before.push(app_manager.snapshot_sync_state(sub_state).await);
        }

        let result = self.policy.schedule(app_manager, accounter, view).await;

        let mut metrics = self.metrics.lock().await;
        metrics.runs += 1;
        metrics.wall_time_ms.record(start.elapsed().as_secs_f64() * 1000.0);

        let mut last_cycle_at = self.last_cycle_at.lock().await;
        if let Some(prev) = *last_cycle_at {
            metrics.inter_cycle_period_ms.record(prev.elapsed().as_secs_f64() * 1000.0);
        }
        *last_cycle_at = Some(start);
        drop(last_cycle_at);

        match result {
            Ok(()) => {
                metrics.completions += 1;
                metrics.mark_completed();
                for (sub_state, before_set) in SUB_STATES.into_iter().zip(before) {
                    let before_set: HashSet<AppUid> = before_set.into_iter().collect();
                    for uid in app_manager.snapshot_sync_state(sub_state).await {
                        if !before_set.contains(&uid) {
                            metrics.record_outcome(sub_state);
                        }
                    }
                }
                drop(metrics);
                accounter.set_scheduled_view(view);
                info!(policy = self.policy.name(), %view, "scheduling cycle completed");
                Ok(view)
            }
            Err(e) => {
                drop(metrics);
                let _ = accounter.put_view(view);
                warn!(policy = self.policy.name(), error = %e, "scheduling cycle produced no work");
                Err(e)
            }
        }
    }

    pub fn policy_name(&self) -> &str {
        self.policy.name()
    }

    /// Snapshot of the running cycle-metrics aggregate, for a status
    /// dump or telemetry export.
    pub async fn metrics_snapshot(&self) -> CycleMetrics {
        self.metrics.lock().await.clone()
    }
}

pub type SharedSchedulerManager = Arc<SchedulerManager>;
