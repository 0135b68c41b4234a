//! Synchronization Manager: the four-phase commit protocol driven against
//! every EXC selected for change in a cycle, followed by the atomic view
//! swap.
//!
//! Grounded on `bbque/synchronization_manager.cc`'s `SyncSchedule` /
//! `SyncApps` / `Sync_PreChange` / `Sync_SyncChange` / `Sync_DoChange` /
//! `Sync_PostChange`: each phase is issued to, and collected from, every
//! selected EXC before the next phase starts for any of them — an EXC's
//! PostChange never begins before another selected EXC's PreChange has
//! been observed, and no EXC is finalized into RUNNING until every EXC's
//! PostChange outcome in the batch is known. Selection order across EXCs
//! comes from the sync policy's `GetApplicationsQueue`-equivalent
//! `next_queue`, drained one sub-state queue at a time until it reports
//! no more work (spec.md §4.E "Selection").

pub mod policy;

use std::time::Duration;

use tokio::time::timeout;
use tracing::{info, warn};

use crate::app_manager::ApplicationManager;
use crate::error::SyncError;
use crate::ids::AppUid;
use crate::proxy::protocol::{RpcHeader, RpcMessage, RtlibExitCode};
use crate::proxy::ApplicationProxy;
use crate::resources::{ResourceAccounter, UsageMap};
use crate::sync::policy::SyncPolicy;

const PHASE_TIMEOUT: Duration = Duration::from_secs(2);

fn header(uid: AppUid, msg_type: u8) -> RpcHeader {
    RpcHeader { token: 0, msg_type, app_pid: uid.pid, exc_id: uid.exc_id }
}

async fn send_and_await<F>(
    proxy: &ApplicationProxy,
    uid: AppUid,
    msg_type: u8,
    out: RpcMessage,
    accept: F,
) -> Result<RpcMessage, SyncError>
where
    F: Fn(&RpcMessage) -> bool,
{
    let channel = proxy
        .connection(uid.pid)
        .await
        .ok_or_else(|| SyncError::TransportFatal(format!("no connection for {uid}")))?;
    channel
        .send(header(uid, msg_type), out)
        .await
        .map_err(|e| SyncError::TransportFatal(e.to_string()))?;

    let reply = timeout(PHASE_TIMEOUT, async {
        loop {
            match channel.recv().await {
                Some((_, msg)) if accept(&msg) => return Some(msg),
                Some(_) => continue,
                None => return None,
            }
        }
    })
    .await
    .map_err(|_| SyncError::Timeout(uid.to_string()))?;

    reply.ok_or_else(|| SyncError::TransportFatal(format!("channel closed for {uid}")))
}

/// Per-EXC outcome of the four-phase protocol; evicted EXCs are reported
/// separately so the caller can continue without aborting the cycle.
pub struct PhaseOutcome {
    pub uid: AppUid,
    pub sync_latency_ms: Option<u32>,
}

/// An EXC carried forward from one protocol phase into the next, still
/// alive in this cycle's sync set.
struct LiveExc {
    uid: AppUid,
    awm_id: u32,
    next_usages: UsageMap,
    sync_latency_ms: Option<u32>,
}

pub struct SynchronizationManager {
    policy: Box<dyn SyncPolicy>,
}

impl SynchronizationManager {
    pub fn new(policy: Box<dyn SyncPolicy>) -> Self {
        Self { policy }
    }

    /// Order `selections` by the sync policy's queue selection: drain
    /// `next_queue` until it yields no more sub-states, and for each one
    /// pick out the caller-selected EXCs currently in that queue (in
    /// queue order), dropping any the per-app filter rejects.
    async fn ordered_selection(
        &self,
        selections: &[(AppUid, u32, UsageMap)],
        app_manager: &ApplicationManager,
    ) -> Vec<LiveExc> {
        let mut ordered = Vec::new();
        let mut restart = true;
        while let Some(sub_state) = self.policy.next_queue(app_manager, restart).await {
            restart = false;
            for uid in app_manager.snapshot_sync_state(sub_state).await {
                if !self.policy.do_sync(uid) {
                    continue;
                }
                if let Some((_, awm_id, usages)) = selections.iter().find(|(u, _, _)| *u == uid) {
                    ordered.push(LiveExc {
                        uid,
                        awm_id: *awm_id,
                        next_usages: usages.clone(),
                        sync_latency_ms: None,
                    });
                }
            }
        }
        ordered
    }

    /// On a successful PostChange: book the AWM's usage into the system
    /// view (unless the sub-state was BLOCKED), commit the EXC out of
    /// SYNC, and record the reported sync latency as a reconfiguration
    /// overhead sample on the source AWM.
    async fn finalize(
        &self,
        exc: LiveExc,
        app_manager: &ApplicationManager,
        accounter: &mut ResourceAccounter,
    ) -> Result<PhaseOutcome, SyncError> {
        let (blocked, source_awm_id) = match app_manager.get(exc.uid).await {
            Some(shared) => {
                let e = shared.lock().await;
                let blocked = matches!(
                    e.next.state,
                    crate::app::ExcState::Sync(crate::app::SyncSubState::Blocked)
                );
                (blocked, e.current.awm_id)
            }
            None => (false, None),
        };

        if !blocked {
            accounter
                .sync_acquire_resources(exc.uid, &exc.next_usages)
                .map_err(SyncError::from)?;
        }
        app_manager.sync_commit(exc.uid).await.map_err(SyncError::from)?;

        // spec.md §4.B: "On successful transition, the source AWM records,
        // keyed by destination AWM id, min/max/last/count of the reported
        // wall time" — the PreChange response's `syncLatency` estimate.
        if !blocked {
            if let (Some(src_id), Some(ms)) = (source_awm_id, exc.sync_latency_ms) {
                if let Some(shared) = app_manager.get(exc.uid).await {
                    let mut e = shared.lock().await;
                    if let Some(source_awm) = e.awm_by_id_mut(src_id) {
                        source_awm.record_overhead(exc.awm_id, ms as f64);
                    }
                }
            }
        }

        Ok(PhaseOutcome { uid: exc.uid, sync_latency_ms: exc.sync_latency_ms })
    }

    /// Drive every EXC the scheduler selected through the four-phase
    /// protocol, batched by phase across the whole selected set, then
    /// commit the sync view as the new system view. `selections` is
    /// `(uid, awm_id, next_usage_map)` for each EXC the scheduler set a
    /// next schedule for this cycle.
    pub async fn sync_schedule(
        &self,
        selections: &[(AppUid, u32, UsageMap)],
        current_bindings: &[(AppUid, UsageMap)],
        app_manager: &ApplicationManager,
        accounter: &mut ResourceAccounter,
        proxy: &ApplicationProxy,
    ) -> Result<Vec<PhaseOutcome>, SyncError> {
        accounter.sync_start(current_bindings).map_err(SyncError::from)?;

        let live = self.ordered_selection(selections, app_manager).await;

        // Phase 1: PreChange, issued to and collected from every selected
        // EXC before any of them proceeds to SyncChange.
        let mut next = Vec::with_capacity(live.len());
        for mut exc in live {
            let reply = send_and_await(proxy, exc.uid, 1, RpcMessage::PreChange { awm_id: exc.awm_id }, |m| {
                matches!(m, RpcMessage::PreChangeResp { .. })
            })
            .await;
            match reply {
                Ok(RpcMessage::PreChangeResp { sync_latency_ms, code: RtlibExitCode::Ok }) => {
                    exc.sync_latency_ms = sync_latency_ms;
                    next.push(exc);
                }
                Ok(_) | Err(SyncError::TransportFatal(_)) => {
                    let e = evict(app_manager, accounter, exc.uid).await;
                    warn!(error = %e, "synchronization cycle aborted");
                    let _ = accounter.sync_abort();
                    return Err(e);
                }
                Err(SyncError::Timeout(_)) => evict_ok(app_manager, accounter, exc.uid).await,
                Err(e) => {
                    let _ = accounter.sync_abort();
                    return Err(e);
                }
            }
        }
        let live = next;

        // Phase 2: SyncChange, same all-before-any ordering.
        let mut next = Vec::with_capacity(live.len());
        for exc in live {
            let reply = send_and_await(proxy, exc.uid, 2, RpcMessage::SyncChange, |m| {
                matches!(m, RpcMessage::BbqResp { .. })
            })
            .await;
            match reply {
                Ok(RpcMessage::BbqResp { code: RtlibExitCode::Ok }) => next.push(exc),
                Ok(_) | Err(SyncError::TransportFatal(_)) => {
                    let e = evict(app_manager, accounter, exc.uid).await;
                    warn!(error = %e, "synchronization cycle aborted");
                    let _ = accounter.sync_abort();
                    return Err(e);
                }
                Err(SyncError::Timeout(_)) => evict_ok(app_manager, accounter, exc.uid).await,
                Err(e) => {
                    let _ = accounter.sync_abort();
                    return Err(e);
                }
            }
        }
        let live = next;

        // Phase 3: DoChange is one-way — every surviving EXC is just told
        // to go, with no reply to wait on.
        for exc in &live {
            if let Some(channel) = proxy.connection(exc.uid.pid).await {
                let _ = channel.send(header(exc.uid, 3), RpcMessage::DoChange { awm_id: exc.awm_id }).await;
            }
        }

        // Phase 4: PostChange, collected from every EXC before any of them
        // is finalized. An EXC that replies Ok is only staged in `post_ok`
        // here — booking its resources and committing its app-manager
        // transition waits until the whole batch's outcomes are known, so a
        // later EXC's failure still aborts the cycle before any earlier
        // survivor has been finalized into RUNNING.
        let mut post_ok = Vec::with_capacity(live.len());
        for exc in live {
            let reply = send_and_await(proxy, exc.uid, 4, RpcMessage::PostChange, |m| {
                matches!(m, RpcMessage::AppResp { .. })
            })
            .await;
            match reply {
                Ok(RpcMessage::AppResp { code: RtlibExitCode::Ok }) => post_ok.push(exc),
                Ok(_) | Err(SyncError::TransportFatal(_)) => {
                    let e = evict(app_manager, accounter, exc.uid).await;
                    warn!(error = %e, "synchronization cycle aborted");
                    let _ = accounter.sync_abort();
                    return Err(e);
                }
                Err(SyncError::Timeout(_)) => evict_ok(app_manager, accounter, exc.uid).await,
                Err(e) => {
                    let _ = accounter.sync_abort();
                    return Err(e);
                }
            }
        }

        let mut outcomes = Vec::with_capacity(post_ok.len());
        for exc in post_ok {
            match self.finalize(exc, app_manager, accounter).await {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => {
                    let _ = accounter.sync_abort();
                    return Err(e);
                }
            }
        }

        accounter.sync_commit().map_err(SyncError::from)?;
        info!(synced = outcomes.len(), "synchronization cycle committed");
        Ok(outcomes)
    }
}

/// A phase response that was neither a timeout nor an acceptable reply:
/// disables the EXC and aborts the whole cycle.
async fn evict(
    app_manager: &ApplicationManager,
    accounter: &mut ResourceAccounter,
    uid: AppUid,
) -> SyncError {
    let _ = app_manager.disable(uid, accounter).await;
    SyncError::Timeout(uid.to_string())
}

/// A phase timed out: disables the EXC but lets the cycle continue with
/// the remaining selected EXCs (spec.md §7).
async fn evict_ok(app_manager: &ApplicationManager, accounter: &mut ResourceAccounter, uid: AppUid) {
    let _ = app_manager.disable(uid, accounter).await;
    warn!(%uid, "synchronization phase timed out, evicting EXC from this cycle");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::channel::InProcessChannel;
    use crate::sync::policy::FifoSyncPolicy;
    use std::sync::Arc;

    struct EmptyLoader;
    impl crate::app::recipe::RecipeLoader for EmptyLoader {
        fn load(
            &self,
            name: &str,
            _accounter: &ResourceAccounter,
            _allow_weak: bool,
        ) -> Result<crate::app::Recipe, crate::app::RecipeError> {
            Ok(crate::app::Recipe {
                name: name.to_string(),
                awms: vec![crate::app::WorkingMode::new(0, "awm0", 10, vec![("arch.pe0".to_string(), 1)])],
                constraints: crate::app::ConstraintMap::new(),
                plugin_data: Default::default(),
                weak_load: false,
            })
        }
    }

    #[tokio::test]
    async fn full_sync_protocol_success_commits_to_running() {
        let am = ApplicationManager::new();
        let mut ra = ResourceAccounter::new();
        ra.register_resource("arch.pe0", 4, "1").unwrap();
        let uid = AppUid::new(1, 0);
        am.create_exc(uid, "a", "r", 0, false, &EmptyLoader, &ra).await.unwrap();
        am.enable(uid).await.unwrap();

        let sched_view = ra.get_view();
        let usages = vec![("arch.pe0".to_string(), 1)];
        ra.book_resources(uid, &usages, sched_view, crate::resources::BookingMode::Scheduling).unwrap();
        ra.set_scheduled_view(sched_view);
        am.set_next_schedule(uid, 0, crate::app::SyncSubState::Starting).await.unwrap();

        let proxy = ApplicationProxy::new();
        let (core_side, app_side) = InProcessChannel::pair();
        proxy.pair(uid.pid, Arc::new(core_side)).await;

        let responder = tokio::spawn(async move {
            use crate::proxy::protocol::RtlibExitCode;
            let (h1, _) = app_side.recv().await.unwrap();
            app_side
                .send(h1, RpcMessage::PreChangeResp { code: RtlibExitCode::Ok, sync_latency_ms: 5 })
                .await
                .unwrap();
            let (h2, _) = app_side.recv().await.unwrap();
            app_side.send(h2, RpcMessage::BbqResp { code: RtlibExitCode::Ok }).await.unwrap();
            let (_h3, _) = app_side.recv().await.unwrap(); // DoChange, one-way
            let (h4, _) = app_side.recv().await.unwrap();
            app_side.send(h4, RpcMessage::AppResp { code: RtlibExitCode::Ok }).await.unwrap();
        });

        let sync_mgr = SynchronizationManager::new(Box::new(FifoSyncPolicy::new()));
        let selections = vec![(uid, 0u32, usages.clone())];
        let outcomes = sync_mgr
            .sync_schedule(&selections, &[], &am, &mut ra, &proxy)
            .await
            .unwrap();
        responder.await.unwrap();

        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].sync_latency_ms, Some(5));
        assert_eq!(am.snapshot_state(crate::app::ExcState::Running).await, vec![uid]);
        assert_eq!(ra.used("arch.pe0", crate::ids::SYSTEM_VIEW), 1);
    }

    struct TwoAwmLoader;
    impl crate::app::recipe::RecipeLoader for TwoAwmLoader {
        fn load(
            &self,
            name: &str,
            _accounter: &ResourceAccounter,
            _allow_weak: bool,
        ) -> Result<crate::app::Recipe, crate::app::RecipeError> {
            Ok(crate::app::Recipe {
                name: name.to_string(),
                awms: vec![
                    crate::app::WorkingMode::new(0, "awm0", 10, vec![("arch.pe0".to_string(), 1)]),
                    crate::app::WorkingMode::new(1, "awm1", 20, vec![("arch.pe0".to_string(), 2)]),
                ],
                constraints: crate::app::ConstraintMap::new(),
                plugin_data: Default::default(),
                weak_load: false,
            })
        }
    }

    async fn drive_one_phase_success(
        sync_mgr: &SynchronizationManager,
        am: &ApplicationManager,
        ra: &mut ResourceAccounter,
        proxy: &ApplicationProxy,
        uid: AppUid,
        awm_id: u32,
        usages: crate::resources::UsageMap,
        latency_ms: u32,
        app_side: &InProcessChannel,
    ) {
        use crate::proxy::protocol::RtlibExitCode;
        let (h1, _) = app_side.recv().await.unwrap();
        app_side
            .send(h1, RpcMessage::PreChangeResp { code: RtlibExitCode::Ok, sync_latency_ms: latency_ms })
            .await
            .unwrap();
        let (h2, _) = app_side.recv().await.unwrap();
        app_side.send(h2, RpcMessage::BbqResp { code: RtlibExitCode::Ok }).await.unwrap();
        let (_h3, _) = app_side.recv().await.unwrap();
        let (h4, _) = app_side.recv().await.unwrap();
        app_side.send(h4, RpcMessage::AppResp { code: RtlibExitCode::Ok }).await.unwrap();

        let selections = vec![(uid, awm_id, usages)];
        sync_mgr.sync_schedule(&selections, &[], am, ra, proxy).await.unwrap();
    }

    #[tokio::test]
    async fn second_transition_records_reconfiguration_overhead_on_source_awm() {
        let am = ApplicationManager::new();
        let mut ra = ResourceAccounter::new();
        ra.register_resource("arch.pe0", 4, "1").unwrap();
        let uid = AppUid::new(2, 0);
        am.create_exc(uid, "a", "r", 0, false, &TwoAwmLoader, &ra).await.unwrap();
        am.enable(uid).await.unwrap();

        let proxy = ApplicationProxy::new();
        let (core_side, app_side) = InProcessChannel::pair();
        proxy.pair(uid.pid, Arc::new(core_side)).await;
        let sync_mgr = SynchronizationManager::new(Box::new(FifoSyncPolicy::new()));

        // First transition: READY -> awm0. No prior AWM, so nothing to
        // attribute the overhead sample to.
        let sched_view = ra.get_view();
        let usages0 = vec![("arch.pe0".to_string(), 1)];
        ra.book_resources(uid, &usages0, sched_view, crate::resources::BookingMode::Scheduling).unwrap();
        ra.set_scheduled_view(sched_view);
        am.set_next_schedule(uid, 0, crate::app::SyncSubState::Starting).await.unwrap();

        let responder = tokio::spawn({
            let app_side_clone = app_side;
            async move {
                use crate::proxy::protocol::RtlibExitCode;
                let (h1, _) = app_side_clone.recv().await.unwrap();
                app_side_clone
                    .send(h1, RpcMessage::PreChangeResp { code: RtlibExitCode::Ok, sync_latency_ms: 4 })
                    .await
                    .unwrap();
                let (h2, _) = app_side_clone.recv().await.unwrap();
                app_side_clone.send(h2, RpcMessage::BbqResp { code: RtlibExitCode::Ok }).await.unwrap();
                let (_h3, _) = app_side_clone.recv().await.unwrap();
                let (h4, _) = app_side_clone.recv().await.unwrap();
                app_side_clone.send(h4, RpcMessage::AppResp { code: RtlibExitCode::Ok }).await.unwrap();
                app_side_clone
            }
        });
        let selections = vec![(uid, 0u32, usages0)];
        sync_mgr.sync_schedule(&selections, &[], &am, &mut ra, &proxy).await.unwrap();
        let app_side = responder.await.unwrap();

        {
            let shared = am.get(uid).await.unwrap();
            let exc = shared.lock().await;
            assert!(exc.awm_by_id(0).unwrap().overhead_to(1).is_none());
        }

        // Second transition: awm0 -> awm1, a real reconfiguration. The
        // reported PreChange latency should land on awm0's overhead table
        // keyed by destination id 1.
        let sched_view2 = ra.get_view();
        let usages1 = vec![("arch.pe0".to_string(), 2)];
        ra.book_resources(uid, &usages1, sched_view2, crate::resources::BookingMode::Scheduling).unwrap();
        ra.set_scheduled_view(sched_view2);
        am.set_next_schedule(uid, 1, crate::app::SyncSubState::Reconf).await.unwrap();

        drive_one_phase_success(&sync_mgr, &am, &mut ra, &proxy, uid, 1, usages1, 17, &app_side).await;

        let shared = am.get(uid).await.unwrap();
        let exc = shared.lock().await;
        let stats = exc.awm_by_id(0).unwrap().overhead_to(1).expect("overhead sample recorded");
        assert_eq!(stats.last_ms, 17.0);
        assert_eq!(stats.count, 1);
        assert_eq!(exc.current.awm_id, Some(1));
    }

    /// Two EXCs selected in the same cycle: both PreChange replies must be
    /// observed before either SyncChange is issued. Each responder logs
    /// the phase it just answered to a shared, ordered log; the assertion
    /// checks no `sync` entry precedes the second `pre` entry.
    #[tokio::test]
    async fn two_exc_cycle_batches_each_phase_before_the_next() {
        use crate::proxy::protocol::RtlibExitCode;

        let am = ApplicationManager::new();
        let mut ra = ResourceAccounter::new();
        ra.register_resource("arch.pe0", 4, "1").unwrap();
        ra.register_resource("arch.pe1", 4, "1").unwrap();

        let uid_a = AppUid::new(10, 0);
        let uid_b = AppUid::new(11, 0);
        am.create_exc(uid_a, "a", "ra", 0, false, &EmptyLoader, &ra).await.unwrap();
        am.create_exc(uid_b, "b", "rb", 0, false, &EmptyLoader, &ra).await.unwrap();
        am.enable(uid_a).await.unwrap();
        am.enable(uid_b).await.unwrap();

        let usages_a = vec![("arch.pe0".to_string(), 1)];
        let usages_b = vec![("arch.pe1".to_string(), 1)];
        let view = ra.get_view();
        ra.book_resources(uid_a, &usages_a, view, crate::resources::BookingMode::Scheduling).unwrap();
        ra.book_resources(uid_b, &usages_b, view, crate::resources::BookingMode::Scheduling).unwrap();
        ra.set_scheduled_view(view);
        am.set_next_schedule(uid_a, 0, crate::app::SyncSubState::Starting).await.unwrap();
        am.set_next_schedule(uid_b, 0, crate::app::SyncSubState::Starting).await.unwrap();

        let proxy = ApplicationProxy::new();
        let (core_a, app_a) = InProcessChannel::pair();
        let (core_b, app_b) = InProcessChannel::pair();
        proxy.pair(uid_a.pid, Arc::new(core_a)).await;
        proxy.pair(uid_b.pid, Arc::new(core_b)).await;

        let log = Arc::new(tokio::sync::Mutex::new(Vec::<&'static str>::new()));

        let log_a = log.clone();
        let responder_a = tokio::spawn(async move {
            let (h1, _) = app_a.recv().await.unwrap();
            log_a.lock().await.push("pre_a");
            app_a.send(h1, RpcMessage::PreChangeResp { code: RtlibExitCode::Ok, sync_latency_ms: 1 }).await.unwrap();
            let (h2, _) = app_a.recv().await.unwrap();
            log_a.lock().await.push("sync_a");
            app_a.send(h2, RpcMessage::BbqResp { code: RtlibExitCode::Ok }).await.unwrap();
            let (_h3, _) = app_a.recv().await.unwrap();
            let (h4, _) = app_a.recv().await.unwrap();
            app_a.send(h4, RpcMessage::AppResp { code: RtlibExitCode::Ok }).await.unwrap();
        });
        let log_b = log.clone();
        let responder_b = tokio::spawn(async move {
            let (h1, _) = app_b.recv().await.unwrap();
            log_b.lock().await.push("pre_b");
            app_b.send(h1, RpcMessage::PreChangeResp { code: RtlibExitCode::Ok, sync_latency_ms: 1 }).await.unwrap();
            let (h2, _) = app_b.recv().await.unwrap();
            log_b.lock().await.push("sync_b");
            app_b.send(h2, RpcMessage::BbqResp { code: RtlibExitCode::Ok }).await.unwrap();
            let (_h3, _) = app_b.recv().await.unwrap();
            let (h4, _) = app_b.recv().await.unwrap();
            app_b.send(h4, RpcMessage::AppResp { code: RtlibExitCode::Ok }).await.unwrap();
        });

        let sync_mgr = SynchronizationManager::new(Box::new(FifoSyncPolicy::new()));
        let selections = vec![(uid_a, 0u32, usages_a), (uid_b, 0u32, usages_b)];
        let outcomes = sync_mgr.sync_schedule(&selections, &[], &am, &mut ra, &proxy).await.unwrap();
        responder_a.await.unwrap();
        responder_b.await.unwrap();

        assert_eq!(outcomes.len(), 2);
        let log = log.lock().await;
        let last_pre = log.iter().rposition(|e| *e == "pre_a" || *e == "pre_b").unwrap();
        let first_sync = log.iter().position(|e| *e == "sync_a" || *e == "sync_b").unwrap();
        assert!(last_pre < first_sync, "both PreChange replies must land before any SyncChange: {log:?}");
    }
}
