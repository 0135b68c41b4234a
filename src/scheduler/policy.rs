//! The scheduler policy contract and two reference implementations.
//!
//! Grounded on `include/bbque/plugins/scheduler_policy.h` and the random /
//! contention-ordered policies shipped alongside it in the original tree.
//! Neither the core nor spec.md mandates which policy runs; both are
//! provided as working references a real deployment would replace.

use async_trait::async_trait;

use crate::app::exc::SyncSubState;
use crate::app_manager::ApplicationManager;
use crate::error::SchedulerError;
use crate::ids::{ViewToken, SYSTEM_VIEW};
use crate::resources::ResourceAccounter;

/// One (app, candidate AWM) pairing a policy is choosing between.
pub struct Candidate {
    pub uid: crate::ids::AppUid,
    pub awm_id: u32,
    pub value: u16,
    pub contention: f64,
}

/// A pluggable scheduling policy. Receives the system's read side and the
/// scheduler's private view to book into; returns `Ok(())` having called
/// [`ApplicationManager::set_next_schedule`] for every application it
/// decided to (re)schedule, or an error/`NoWorkingMode`/`Delayed` outcome.
#[async_trait]
pub trait SchedulerPolicy: Send + Sync {
    fn name(&self) -> &str;

    async fn schedule(
        &self,
        app_manager: &ApplicationManager,
        accounter: &mut ResourceAccounter,
        view: ViewToken,
    ) -> Result<(), SchedulerError>;
}

/// Which sub-state a RUNNING application's reconsideration lands in, given
/// its last committed AWM id and whether the freshly booked usage map binds
/// different leaves than its current one (`ResourceAccounter::is_reshuffling`).
/// `None` means the rebind changed nothing worth a sync cycle over.
fn reconsider_sub_state(current_awm_id: Option<u32>, next_awm_id: u32, reshuffling: bool) -> Option<SyncSubState> {
    match (current_awm_id == Some(next_awm_id), reshuffling) {
        (true, false) => None,
        (true, true) => Some(SyncSubState::Migrate),
        (false, true) => Some(SyncSubState::MigRec),
        (false, false) => Some(SyncSubState::Reconf),
    }
}

/// Deterministic-for-tests stand-in for a "pick any AWM" policy: assigns
/// each READY application its lowest-value enabled AWM, booked greedily.
pub struct RandomPolicy;

#[async_trait]
impl SchedulerPolicy for RandomPolicy {
    fn name(&self) -> &str {
        "random"
    }

    async fn schedule(
        &self,
        app_manager: &ApplicationManager,
        accounter: &mut ResourceAccounter,
        view: ViewToken,
    ) -> Result<(), SchedulerError> {
        let mut scheduled_any = false;

        // Reconsider RUNNING applications first (random_schedpol.cc's
        // `Schedule` walks `GetFirstRunning`/`GetNextRunning` before the
        // READY queue): a fresh greedy rebind may reshuffle an already
        // running EXC's concrete bindings even when its AWM doesn't change.
        for uid in app_manager.snapshot_state(crate::app::exc::ExcState::Running).await {
            let Some(shared) = app_manager.get(uid).await else { continue };
            let exc = shared.lock().await;
            let Some(awm) = exc.enabled_awms().first() else { continue };
            let awm_id = awm.id;
            let usages = awm.usage_template.clone();
            let current_awm_id = exc.current.awm_id;
            let current_template = current_awm_id.and_then(|id| exc.awm_by_id(id)).map(|a| a.usage_template.clone());
            drop(exc);

            if accounter
                .book_resources(uid, &usages, view, crate::resources::BookingMode::Scheduling)
                .is_ok()
            {
                let current_usages = current_template
                    .map(|t| accounter.concrete_usage(uid, &t, SYSTEM_VIEW))
                    .unwrap_or_default();
                let next_usages = accounter.concrete_usage(uid, &usages, view);
                let reshuffling = accounter.is_reshuffling(&current_usages, &next_usages);
                match reconsider_sub_state(current_awm_id, awm_id, reshuffling) {
                    Some(sub_state) => {
                        app_manager
                            .set_next_schedule(uid, awm_id, sub_state)
                            .await
                            .map_err(|e| SchedulerError::PolicyFailed(e.to_string()))?;
                        scheduled_any = true;
                    }
                    None => accounter.release_resources(uid, view),
                }
            }
        }

        for uid in app_manager.snapshot_state(crate::app::exc::ExcState::Ready).await {
            let Some(shared) = app_manager.get(uid).await else { continue };
            let exc = shared.lock().await;
            let Some(awm) = exc.enabled_awms().first() else { continue };
            let awm_id = awm.id;
            let usages = awm.usage_template.clone();
            drop(exc);

            if accounter
                .book_resources(uid, &usages, view, crate::resources::BookingMode::Scheduling)
                .is_ok()
            {
                app_manager
                    .set_next_schedule(uid, awm_id, SyncSubState::Starting)
                    .await
                    .map_err(|e| SchedulerError::PolicyFailed(e.to_string()))?;
                scheduled_any = true;
            }
        }

        if scheduled_any {
            Ok(())
        } else {
            Err(SchedulerError::NoWorkingMode)
        }
    }
}

/// Ranks every (app, AWM) candidate by `(value - reconf_overhead) /
/// contention` descending and assigns greedily, skipping any pairing that
/// no longer fits once earlier picks have consumed resources.
pub struct MetricOrderedPolicy;

impl MetricOrderedPolicy {
    fn score(value: u16, reconf_overhead_ms: f64, contention: f64) -> f64 {
        let contention = contention.max(1e-6);
        (value as f64 - reconf_overhead_ms) / contention
    }
}

#[async_trait]
impl SchedulerPolicy for MetricOrderedPolicy {
    fn name(&self) -> &str {
        "metric-ordered"
    }

    async fn schedule(
        &self,
        app_manager: &ApplicationManager,
        accounter: &mut ResourceAccounter,
        view: ViewToken,
    ) -> Result<(), SchedulerError> {
        let ready = app_manager.snapshot_state(crate::app::exc::ExcState::Ready).await;
        if ready.is_empty() {
            return Err(SchedulerError::NoWorkingMode);
        }

        let mut candidates: Vec<(crate::ids::AppUid, u32, f64)> = Vec::new();
        for uid in &ready {
            let Some(shared) = app_manager.get(*uid).await else { continue };
            let exc = shared.lock().await;
            for awm in exc.enabled_awms() {
                let contention = demand_contention(accounter, awm, view);
                let reconf = exc
                    .current
                    .awm_id
                    .and_then(|src| exc.awm_by_id(src))
                    .and_then(|src| src.overhead_to(awm.id))
                    .map(|o| o.last_ms)
                    .unwrap_or(0.0);
                let score = Self::score(awm.value, reconf, contention);
                candidates.push((*uid, awm.id, score));
            }
        }
        candidates.sort_by(|a, b| b.2.partial_cmp(&a.2).unwrap_or(std::cmp::Ordering::Equal));

        let mut scheduled_any = false;
        for (uid, awm_id, _score) in candidates {
            let Some(shared) = app_manager.get(uid).await else { continue };
            let exc = shared.lock().await;
            if exc.state() != crate::app::exc::ExcState::Ready {
                continue;
            }
            let Some(awm) = exc.awm_by_id(awm_id) else { continue };
            let usages = awm.usage_template.clone();
            drop(exc);

            if accounter
                .book_resources(uid, &usages, view, crate::resources::BookingMode::Scheduling)
                .is_ok()
            {
                app_manager
                    .set_next_schedule(uid, awm_id, SyncSubState::Starting)
                    .await
                    .map_err(|e| SchedulerError::PolicyFailed(e.to_string()))?;
                scheduled_any = true;
            }
        }
        if scheduled_any {
            Ok(())
        } else {
            Err(SchedulerError::NoWorkingMode)
        }
    }
}

fn demand_contention(accounter: &ResourceAccounter, awm: &crate::app::WorkingMode, view: ViewToken) -> f64 {
    let mut worst = 0.0_f64;
    for (path, amount) in &awm.usage_template {
        let total = accounter.total(path).max(1) as f64;
        let used = accounter.used(path, view) as f64;
        let level = (used + *amount as f64) / total;
        worst = worst.max(level);
    }
    worst
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::exc::ExcState;
    use crate::app_manager::ApplicationManager;

    struct EmptyLoader;
    impl crate::app::recipe::RecipeLoader for EmptyLoader {
        fn load(
            &self,
            name: &str,
            _accounter: &ResourceAccounter,
            _allow_weak: bool,
        ) -> Result<crate::app::Recipe, crate::app::RecipeError> {
            let awms = vec![
                crate::app::WorkingMode::new(0, "low", 10, vec![("arch.pe0".to_string(), 1)]),
                crate::app::WorkingMode::new(1, "high", 20, vec![("arch.pe0".to_string(), 4)]),
            ];
            Ok(crate::app::Recipe {
                name: name.to_string(),
                awms,
                constraints: crate::app::ConstraintMap::new(),
                plugin_data: Default::default(),
                weak_load: false,
            })
        }
    }

    #[tokio::test]
    async fn random_policy_schedules_ready_apps() {
        let am = ApplicationManager::new();
        let mut ra = ResourceAccounter::new();
        ra.register_resource("arch.pe0", 4, "1").unwrap();
        let uid = crate::ids::AppUid::new(1, 0);
        am.create_exc(uid, "a", "r", 0, false, &EmptyLoader, &ra).await.unwrap();
        am.enable(uid).await.unwrap();

        let view = ra.get_view();
        let policy = RandomPolicy;
        policy.schedule(&am, &mut ra, view).await.unwrap();
        assert_eq!(am.snapshot_state(ExcState::Sync(SyncSubState::Starting)).await, vec![uid]);
    }

    #[tokio::test]
    async fn no_ready_apps_returns_no_working_mode() {
        let am = ApplicationManager::new();
        let mut ra = ResourceAccounter::new();
        let view = ra.get_view();
        let policy = RandomPolicy;
        let err = policy.schedule(&am, &mut ra, view).await.unwrap_err();
        assert!(matches!(err, SchedulerError::NoWorkingMode));
    }

    #[tokio::test]
    async fn metric_ordered_prefers_less_contended_candidate() {
        let am = ApplicationManager::new();
        let mut ra = ResourceAccounter::new();
        ra.register_resource("arch.pe0", 4, "1").unwrap();
        let uid = crate::ids::AppUid::new(1, 0);
        am.create_exc(uid, "a", "r", 0, false, &EmptyLoader, &ra).await.unwrap();
        am.enable(uid).await.unwrap();

        let view = ra.get_view();
        let policy = MetricOrderedPolicy;
        policy.schedule(&am, &mut ra, view).await.unwrap();
        let shared = am.get(uid).await.unwrap();
        let exc = shared.lock().await;
        assert!(exc.next.awm_id.is_some());
    }

    struct TemplateLoader;
    impl crate::app::recipe::RecipeLoader for TemplateLoader {
        fn load(
            &self,
            name: &str,
            _accounter: &ResourceAccounter,
            _allow_weak: bool,
        ) -> Result<crate::app::Recipe, crate::app::RecipeError> {
            Ok(crate::app::Recipe {
                name: name.to_string(),
                awms: vec![crate::app::WorkingMode::new(0, "awm0", 10, vec![("arch.pe".to_string(), 1)])],
                constraints: crate::app::ConstraintMap::new(),
                plugin_data: Default::default(),
                weak_load: false,
            })
        }
    }

    /// Puts `uid` into RUNNING holding `leaf` in the system view via a
    /// direct view-commit (bypassing the sync protocol, irrelevant here).
    async fn make_running(am: &ApplicationManager, ra: &mut ResourceAccounter, uid: crate::ids::AppUid, leaf: &str) {
        let sched_view = ra.get_view();
        let usages = vec![(leaf.to_string(), 1)];
        ra.book_resources(uid, &usages, sched_view, crate::resources::BookingMode::Scheduling).unwrap();
        am.set_next_schedule(uid, 0, SyncSubState::Starting).await.unwrap();
        ra.set_view(sched_view).unwrap();
        am.sync_commit(uid).await.unwrap();
    }

    #[tokio::test]
    async fn running_exc_with_unchanged_binding_is_left_alone() {
        let am = ApplicationManager::new();
        let mut ra = ResourceAccounter::new();
        ra.register_resource("arch.pe0", 4, "1").unwrap();
        let uid = crate::ids::AppUid::new(1, 0);
        am.create_exc(uid, "a", "r", 0, false, &EmptyLoader, &ra).await.unwrap();
        am.enable(uid).await.unwrap();
        make_running(&am, &mut ra, uid, "arch.pe0").await;

        let view = ra.get_view();
        let err = RandomPolicy.schedule(&am, &mut ra, view).await.unwrap_err();
        assert!(matches!(err, SchedulerError::NoWorkingMode));
        assert_eq!(ra.used("arch.pe0", view), 0);
        assert_eq!(am.snapshot_state(ExcState::Running).await, vec![uid]);
    }

    #[tokio::test]
    async fn running_exc_rebound_to_a_different_leaf_reschedules_as_migrate() {
        let am = ApplicationManager::new();
        let mut ra = ResourceAccounter::new();
        ra.register_resource("arch.pe0", 1, "1").unwrap();
        ra.register_resource("arch.pe1", 1, "1").unwrap();
        let uid = crate::ids::AppUid::new(1, 0);
        am.create_exc(uid, "a", "r", 0, false, &TemplateLoader, &ra).await.unwrap();
        am.enable(uid).await.unwrap();
        make_running(&am, &mut ra, uid, "arch.pe0").await;
        assert_eq!(ra.used("arch.pe0", SYSTEM_VIEW), 1);

        // A fresh scheduler view where a contending app already holds pe0,
        // forcing the RUNNING reconsideration's rebind onto pe1.
        let view = ra.get_view();
        let contender = crate::ids::AppUid::new(2, 0);
        ra.book_resources(contender, &vec![("arch.pe0".to_string(), 1)], view, crate::resources::BookingMode::Scheduling)
            .unwrap();

        RandomPolicy.schedule(&am, &mut ra, view).await.unwrap();

        assert_eq!(am.snapshot_state(ExcState::Sync(SyncSubState::Migrate)).await, vec![uid]);
        assert_eq!(ra.used("arch.pe1", view), 1);
    }
}
