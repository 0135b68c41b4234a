//! Resource Manager: the daemon's control loop.
//!
//! Grounded on `bbque/resource_manager.cc`. The original keeps a bitmask of
//! pending events behind a mutex+condvar; `NotifyEvent` flips a bit and
//! signals, fire-and-forget, whether or not the loop is mid-step. The async
//! translation keeps the same shape: a [`tokio::sync::Mutex`] guarding the
//! bitmask plus a [`tokio::sync::Notify`] standing in for the condvar.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::app::exc::{ExcState, SyncSubState};
use crate::app_manager::ApplicationManager;
use crate::ids::AppUid;
use crate::proxy::ApplicationProxy;
use crate::resources::{ResourceAccounter, UsageMap};
use crate::scheduler::SchedulerManager;
use crate::sync::SynchronizationManager;

/// A new EXC became READY and wants a scheduling cycle.
pub const EXC_START: u8 = 1 << 0;
/// An EXC stopped and its resources should be reclaimed.
pub const EXC_STOP: u8 = 1 << 1;
/// Clean shutdown: terminate every EXC, exit `0`.
pub const BBQ_EXIT: u8 = 1 << 2;
/// Immediate shutdown: exit non-zero without further cleanup.
pub const BBQ_ABORT: u8 = 1 << 3;

/// Priority order the loop services pending events in, highest first.
const PRIORITY_ORDER: [u8; 4] = [BBQ_ABORT, BBQ_EXIT, EXC_STOP, EXC_START];

const SUB_STATES: [SyncSubState; 5] = [
    SyncSubState::Starting,
    SyncSubState::Reconf,
    SyncSubState::MigRec,
    SyncSubState::Migrate,
    SyncSubState::Blocked,
];

/// Process exit code the loop settled on.
pub enum LoopExit {
    Clean,
    Aborted,
}

/// Owns the pending-event bitmask and every service this daemon wires
/// together: the application registry, resource ledger, scheduler, sync
/// manager, and transport-facing proxy.
pub struct ResourceManager {
    pending: Mutex<u8>,
    notify: tokio::sync::Notify,
    app_manager: Arc<ApplicationManager>,
    accounter: Mutex<ResourceAccounter>,
    scheduler: SchedulerManager,
    sync_manager: SynchronizationManager,
    proxy: Arc<ApplicationProxy>,
    /// EXCs a `StopRequest` named, drained whenever `EXC_STOP` is serviced.
    /// The RPC dispatcher (or any other caller) pushes here via
    /// [`Self::request_stop`] before raising the event bit.
    stop_requests: Mutex<Vec<AppUid>>,
}

impl ResourceManager {
    pub fn new(
        app_manager: Arc<ApplicationManager>,
        accounter: ResourceAccounter,
        scheduler: SchedulerManager,
        sync_manager: SynchronizationManager,
        proxy: Arc<ApplicationProxy>,
    ) -> Self {
        Self {
            pending: Mutex::new(0),
            notify: tokio::sync::Notify::new(),
            app_manager,
            accounter: Mutex::new(accounter),
            scheduler,
            sync_manager,
            proxy,
            stop_requests: Mutex::new(Vec::new()),
        }
    }

    /// Read-only access to the resource accounter's current state, e.g.
    /// for recipe-load validation on the RPC dispatch path.
    pub fn accounter(&self) -> &Mutex<ResourceAccounter> {
        &self.accounter
    }

    pub fn app_manager(&self) -> &ApplicationManager {
        &self.app_manager
    }

    /// Queue `uid` for the next `EXC_STOP` service and raise the event bit.
    pub async fn request_stop(&self, uid: AppUid) {
        self.stop_requests.lock().await.push(uid);
        self.notify_event(EXC_STOP).await;
    }

    /// Flip the event bit and wake the loop. Never blocks waiting for the
    /// loop to actually service the event — the original's "fire-and-forget
    /// if the loop is mid-step" framing, translated to a buffered
    /// `Notify::notify_one` permit.
    pub async fn notify_event(&self, event: u8) {
        let mut pending = self.pending.lock().await;
        *pending |= event;
        drop(pending);
        self.notify.notify_one();
    }

    pub fn policy_name(&self) -> &str {
        self.scheduler.policy_name()
    }

    async fn take_pending(&self) -> u8 {
        let mut pending = self.pending.lock().await;
        let events = *pending;
        *pending = 0;
        events
    }

    /// Run until a `BBQ_EXIT` or `BBQ_ABORT` event is serviced.
    pub async fn run(&self) -> LoopExit {
        loop {
            let events = self.take_pending().await;
            if events == 0 {
                self.notify.notified().await;
                continue;
            }

            for &event in &PRIORITY_ORDER {
                if events & event == 0 {
                    continue;
                }
                match event {
                    BBQ_ABORT => {
                        warn!("BBQ_ABORT received, exiting immediately");
                        return LoopExit::Aborted;
                    }
                    BBQ_EXIT => {
                        info!("BBQ_EXIT received, terminating every execution context");
                        self.terminate_all().await;
                        return LoopExit::Clean;
                    }
                    EXC_STOP => self.handle_exc_stop().await,
                    EXC_START => self.handle_exc_start().await,
                    _ => unreachable!("event bit not in PRIORITY_ORDER"),
                }
            }
        }
    }

    async fn handle_exc_start(&self) {
        let mut accounter = self.accounter.lock().await;
        if let Err(e) = self.scheduler.run_cycle(&self.app_manager, &mut accounter).await {
            info!(error = %e, "no scheduling work this cycle");
            return;
        }

        let selections = collect_selections(&self.app_manager).await;
        let current_bindings = collect_current_bindings(&self.app_manager).await;

        if selections.is_empty() {
            return;
        }

        match self
            .sync_manager
            .sync_schedule(&selections, &current_bindings, &self.app_manager, &mut accounter, &self.proxy)
            .await
        {
            Ok(outcomes) => info!(synced = outcomes.len(), "cycle serviced"),
            Err(e) => warn!(error = %e, "synchronization cycle failed"),
        }
    }

    async fn handle_exc_stop(&self) {
        let uids = std::mem::take(&mut *self.stop_requests.lock().await);
        let mut accounter = self.accounter.lock().await;
        for uid in uids {
            if let Err(e) = self.app_manager.disable(uid, &mut accounter).await {
                warn!(%uid, error = %e, "stop request for unknown execution context");
            }
        }
    }

    async fn terminate_all(&self) {
        let mut all = Vec::new();
        for state in [ExcState::Ready, ExcState::Running, ExcState::Disabled] {
            all.extend(self.app_manager.snapshot_state(state).await);
        }
        for sub in SUB_STATES {
            all.extend(self.app_manager.snapshot_sync_state(sub).await);
        }
        all.sort();
        all.dedup();

        let mut accounter = self.accounter.lock().await;
        for uid in all {
            let _ = self.app_manager.disable(uid, &mut accounter).await;
            let _ = self.app_manager.destroy(uid).await;
            self.proxy.exit(uid.pid).await;
        }
    }
}

/// Every EXC the scheduler tentatively assigned this cycle: `(uid, awm_id,
/// next usage map)`, gathered from every sync sub-state queue.
async fn collect_selections(app_manager: &ApplicationManager) -> Vec<(AppUid, u32, UsageMap)> {
    let mut selections = Vec::new();
    for sub in SUB_STATES {
        for uid in app_manager.snapshot_sync_state(sub).await {
            let Some(shared) = app_manager.get(uid).await else { continue };
            let exc = shared.lock().await;
            let Some(awm_id) = exc.next.awm_id else { continue };
            let Some(awm) = exc.awm_by_id(awm_id) else { continue };
            selections.push((uid, awm_id, awm.usage_template.clone()));
        }
    }
    selections
}

/// Every currently RUNNING EXC's committed bindings, so the sync session's
/// pre-seeded view keeps untouched applications' resources intact.
async fn collect_current_bindings(app_manager: &ApplicationManager) -> Vec<(AppUid, UsageMap)> {
    let mut bindings = Vec::new();
    for uid in app_manager.snapshot_state(ExcState::Running).await {
        let Some(shared) = app_manager.get(uid).await else { continue };
        let exc = shared.lock().await;
        let Some(awm_id) = exc.current.awm_id else { continue };
        let Some(awm) = exc.awm_by_id(awm_id) else { continue };
        bindings.push((uid, awm.usage_template.clone()));
    }
    bindings
}
