//! Indexed registry of live execution contexts.
//!
//! Grounded on `bbque/application_manager.cc`. Five index families are kept
//! in sync on every state move: `by_uid` (primary handle), `by_pid`
//! (multimap — one OS process may host several EXCs), `by_priority`,
//! `by_state`, and `by_sync_state`. Each is guarded by its own lock so a
//! reader iterating one queue never blocks writers touching another.
//!
//! Lock ordering follows spec.md §4.C/§5: when an EXC moves between two
//! state queues, both queue locks are acquired in ascending state-id order
//! before either map is mutated.
//!
//! Queue iteration uses the "snapshot the UIDs and re-look-up each step"
//! variant licensed by spec.md §9 as the simpler in-loop-erase-safe
//! alternative to an intrusive cursor-retention list — adequate here since
//! a cycle touches at most a handful of EXCs.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::app::exc::{valid_transition, Exc, ExcState, SyncSubState, LOWEST_PRIORITY};
use crate::app::recipe::{Recipe, RecipeError, RecipeLoader};
use crate::error::AppManagerError;
use crate::ids::{AppUid, SYSTEM_VIEW};
use crate::resources::{BookingMode, ResourceAccounter};

fn state_index(state: ExcState) -> usize {
    match state {
        ExcState::Disabled => 0,
        ExcState::Ready => 1,
        ExcState::Sync(_) => 2,
        ExcState::Running => 3,
        ExcState::Finished => 4,
    }
}

fn sync_sub_index(sub: SyncSubState) -> usize {
    match sub {
        SyncSubState::Starting => 0,
        SyncSubState::Reconf => 1,
        SyncSubState::MigRec => 2,
        SyncSubState::Migrate => 3,
        SyncSubState::Blocked => 4,
    }
}

const STATE_COUNT: usize = 5;
const SYNC_SUB_COUNT: usize = 5;

pub type SharedExc = Arc<Mutex<Exc>>;

/// Indexed registry of every live execution context.
pub struct ApplicationManager {
    by_uid: Mutex<HashMap<AppUid, SharedExc>>,
    by_pid: Mutex<HashMap<i32, HashSet<AppUid>>>,
    by_priority: Vec<Mutex<HashSet<AppUid>>>,
    by_state: Vec<Mutex<HashSet<AppUid>>>,
    by_sync_state: Vec<Mutex<HashSet<AppUid>>>,
    recipe_cache: Mutex<HashMap<String, Arc<Recipe>>>,
}

impl ApplicationManager {
    pub fn new() -> Self {
        Self {
            by_uid: Mutex::new(HashMap::new()),
            by_pid: Mutex::new(HashMap::new()),
            by_priority: (0..=LOWEST_PRIORITY as usize).map(|_| Mutex::new(HashSet::new())).collect(),
            by_state: (0..STATE_COUNT).map(|_| Mutex::new(HashSet::new())).collect(),
            by_sync_state: (0..SYNC_SUB_COUNT).map(|_| Mutex::new(HashSet::new())).collect(),
            recipe_cache: Mutex::new(HashMap::new()),
        }
    }

    /// Load (or reuse, by name) the named recipe, then create a DISABLED
    /// EXC bound to it. Rejects a partial ("weak") load unless
    /// `weak_load_allowed` is set.
    pub async fn create_exc(
        &self,
        uid: AppUid,
        name: &str,
        recipe_name: &str,
        priority: u8,
        weak_load_allowed: bool,
        loader: &dyn RecipeLoader,
        accounter: &ResourceAccounter,
    ) -> Result<(), AppManagerError> {
        let recipe = self.load_recipe(recipe_name, weak_load_allowed, loader, accounter).await?;
        if recipe.weak_load && !weak_load_allowed {
            return Err(AppManagerError::WeakLoadRefused(recipe_name.to_string()));
        }

        let exc = Exc::new(uid, name, priority, (*recipe).clone());
        let priority = exc.priority();
        let shared = Arc::new(Mutex::new(exc));

        self.by_uid.lock().await.insert(uid, shared);
        self.by_pid.lock().await.entry(uid.pid).or_default().insert(uid);
        self.by_priority[priority as usize].lock().await.insert(uid);
        self.by_state[state_index(ExcState::Disabled)].lock().await.insert(uid);

        info!(%uid, recipe = recipe_name, "execution context created");
        Ok(())
    }

    async fn load_recipe(
        &self,
        recipe_name: &str,
        weak_load_allowed: bool,
        loader: &dyn RecipeLoader,
        accounter: &ResourceAccounter,
    ) -> Result<Arc<Recipe>, AppManagerError> {
        if let Some(cached) = self.recipe_cache.lock().await.get(recipe_name) {
            return Ok(cached.clone());
        }
        let recipe = loader
            .load(recipe_name, accounter, weak_load_allowed)
            .map_err(|e| recipe_load_error(recipe_name, e))?;
        let recipe = Arc::new(recipe);
        self.recipe_cache.lock().await.insert(recipe_name.to_string(), recipe.clone());
        Ok(recipe)
    }

    pub async fn get(&self, uid: AppUid) -> Option<SharedExc> {
        self.by_uid.lock().await.get(&uid).cloned()
    }

    /// Set a per-resource bound on `uid`'s constraint map and recompute its
    /// enabled-AWM list. Spec.md §4.B: "Adding a constraint may disable
    /// AWMs".
    pub async fn set_constraint(
        &self,
        uid: AppUid,
        path: &str,
        bound_type: crate::app::constraint::BoundType,
        value: u64,
    ) -> Result<(), AppManagerError> {
        let shared = self.get(uid).await.ok_or_else(|| unknown(uid))?;
        let mut exc = shared.lock().await;
        exc.constraints_mut().set(path, bound_type, value);
        exc.recompute_enabled_awms();
        Ok(())
    }

    /// Drop a bound back to its limit and recompute the enabled-AWM list.
    /// Spec.md §4.B: "removing one may re-enable them".
    pub async fn remove_constraint(
        &self,
        uid: AppUid,
        path: &str,
        bound_type: crate::app::constraint::BoundType,
    ) -> Result<(), AppManagerError> {
        let shared = self.get(uid).await.ok_or_else(|| unknown(uid))?;
        let mut exc = shared.lock().await;
        exc.constraints_mut().remove(path, bound_type);
        exc.recompute_enabled_awms();
        Ok(())
    }

    /// Clamp `uid`'s priority into `[0, LOWEST_PRIORITY]`, moving it
    /// between `by_priority` queues.
    pub async fn set_priority(&self, uid: AppUid, priority: u8) -> Result<(), AppManagerError> {
        let shared = self.get(uid).await.ok_or_else(|| unknown(uid))?;
        let mut exc = shared.lock().await;
        let from = exc.priority();
        exc.set_priority(priority);
        let to = exc.priority();
        drop(exc);
        if from != to {
            self.by_priority[from as usize].lock().await.remove(&uid);
            self.by_priority[to as usize].lock().await.insert(uid);
        }
        Ok(())
    }

    /// DISABLED → READY.
    pub async fn enable(&self, uid: AppUid) -> Result<(), AppManagerError> {
        let shared = self.get(uid).await.ok_or_else(|| unknown(uid))?;
        let mut exc = shared.lock().await;
        if exc.state() != ExcState::Disabled {
            return Err(AppManagerError::NotDisabled(uid.to_string()));
        }
        exc.enable();
        drop(exc);
        self.move_state(uid, ExcState::Disabled, ExcState::Ready).await;
        Ok(())
    }

    /// Release the EXC's resources in the system view and move it to
    /// DISABLED from any other state.
    pub async fn disable(&self, uid: AppUid, accounter: &mut ResourceAccounter) -> Result<(), AppManagerError> {
        let shared = self.get(uid).await.ok_or_else(|| unknown(uid))?;
        let mut exc = shared.lock().await;
        let from = exc.state();
        if from == ExcState::Disabled {
            return Ok(());
        }
        accounter.release_resources(uid, SYSTEM_VIEW);
        exc.disable();
        drop(exc);
        self.move_state(uid, from, ExcState::Disabled).await;
        if matches!(from, ExcState::Sync(_)) {
            self.clear_sync_state(uid).await;
        }
        Ok(())
    }

    /// Mark FINISHED and remove from every index.
    pub async fn destroy(&self, uid: AppUid) -> Result<(), AppManagerError> {
        let shared = self.get(uid).await.ok_or_else(|| unknown(uid))?;
        let mut exc = shared.lock().await;
        let from = exc.state();
        let priority = exc.priority();
        exc.finish();
        drop(exc);

        self.move_state(uid, from, ExcState::Finished).await;
        if matches!(from, ExcState::Sync(_)) {
            self.clear_sync_state(uid).await;
        }
        self.by_priority[priority as usize].lock().await.remove(&uid);
        self.by_pid.lock().await.get_mut(&uid.pid).map(|s| s.remove(&uid));
        self.by_state[state_index(ExcState::Finished)].lock().await.remove(&uid);
        self.by_uid.lock().await.remove(&uid);
        Ok(())
    }

    /// Called by the scheduler after it has booked `awm_id`'s usage map
    /// into its private view: records the tentative next schedule on the
    /// EXC and moves it from its committed state into SYNC with
    /// `sub_state` in every index.
    pub async fn set_next_schedule(
        &self,
        uid: AppUid,
        awm_id: u32,
        sub_state: SyncSubState,
    ) -> Result<(), AppManagerError> {
        let shared = self.get(uid).await.ok_or_else(|| unknown(uid))?;
        let mut exc = shared.lock().await;
        let from = exc.committed_state();
        let to = ExcState::Sync(sub_state);
        if !valid_transition(from, to) {
            return Err(AppManagerError::InvalidSyncSubState(format!("{sub_state:?}")));
        }
        exc.set_next_schedule(awm_id, sub_state);
        drop(exc);
        self.move_state(uid, from, to).await;
        self.by_sync_state[sync_sub_index(sub_state)].lock().await.insert(uid);
        Ok(())
    }

    /// Validate the EXC is currently in SYNC with `sub_state` — a no-op
    /// placeholder for downstream notification (spec: the actual queue
    /// move already happened in [`Self::set_next_schedule`]).
    pub async fn sync_request(&self, uid: AppUid, sub_state: SyncSubState) -> Result<(), AppManagerError> {
        let shared = self.get(uid).await.ok_or_else(|| unknown(uid))?;
        let exc = shared.lock().await;
        if exc.state() != ExcState::Sync(sub_state) {
            return Err(AppManagerError::NotInSync(uid.to_string()));
        }
        Ok(())
    }

    /// Finalize the EXC's transition out of SYNC: RUNNING, or DISABLED if
    /// the sub-state was BLOCKED.
    pub async fn sync_commit(&self, uid: AppUid) -> Result<(), AppManagerError> {
        let shared = self.get(uid).await.ok_or_else(|| unknown(uid))?;
        let mut exc = shared.lock().await;
        let from = exc.state();
        if !matches!(from, ExcState::Sync(_)) {
            return Err(AppManagerError::NotInSync(uid.to_string()));
        }
        exc.commit_sync();
        let to = exc.state();
        drop(exc);
        self.move_state(uid, from, to).await;
        self.clear_sync_state(uid).await;
        Ok(())
    }

    async fn clear_sync_state(&self, uid: AppUid) {
        for q in &self.by_sync_state {
            q.lock().await.remove(&uid);
        }
    }

    /// Acquire both state-queue locks in ascending index order, move `uid`
    /// between them, then release in the reverse order (Rust's `Mutex`
    /// guards drop at scope end, which already unwinds in reverse
    /// acquisition order).
    async fn move_state(&self, uid: AppUid, from: ExcState, to: ExcState) {
        let (from_idx, to_idx) = (state_index(from), state_index(to));
        if from_idx == to_idx {
            return;
        }
        let (lo, hi) = if from_idx < to_idx { (from_idx, to_idx) } else { (to_idx, from_idx) };
        let (lo_guard, hi_guard) = if lo == from_idx {
            let mut lo_guard = self.by_state[lo].lock().await;
            let mut hi_guard = self.by_state[hi].lock().await;
            lo_guard.remove(&uid);
            hi_guard.insert(uid);
            (lo_guard, hi_guard)
        } else {
            let mut lo_guard = self.by_state[lo].lock().await;
            let mut hi_guard = self.by_state[hi].lock().await;
            hi_guard.remove(&uid);
            lo_guard.insert(uid);
            (lo_guard, hi_guard)
        };
        drop(hi_guard);
        drop(lo_guard);
    }

    /// Snapshot every UID currently in `state`, for safe iteration while
    /// the caller may move or destroy entries mid-loop.
    pub async fn snapshot_state(&self, state: ExcState) -> Vec<AppUid> {
        self.by_state[state_index(state)].lock().await.iter().copied().collect()
    }

    pub async fn snapshot_sync_state(&self, sub_state: SyncSubState) -> Vec<AppUid> {
        self.by_sync_state[sync_sub_index(sub_state)].lock().await.iter().copied().collect()
    }

    pub async fn snapshot_priority(&self, priority: u8) -> Vec<AppUid> {
        self.by_priority[priority.min(LOWEST_PRIORITY) as usize]
            .lock()
            .await
            .iter()
            .copied()
            .collect()
    }

    /// Every EXC currently registered for `pid` — used by the RPC
    /// dispatcher on `APP_EXIT` to find what to tear down.
    pub async fn uids_for_pid(&self, pid: i32) -> Vec<AppUid> {
        self.by_pid.lock().await.get(&pid).map(|s| s.iter().copied().collect()).unwrap_or_default()
    }

    pub async fn len(&self) -> usize {
        self.by_uid.lock().await.len()
    }
}

impl Default for ApplicationManager {
    fn default() -> Self {
        Self::new()
    }
}

fn unknown(uid: AppUid) -> AppManagerError {
    AppManagerError::UnknownExc(uid.to_string())
}

fn recipe_load_error(recipe_name: &str, e: RecipeError) -> AppManagerError {
    warn!(recipe = recipe_name, error = %e, "recipe load failed");
    AppManagerError::RecipeLoadFailed(recipe_name.to_string())
}

/// Book `usages` for `uid`'s next AWM into the scheduler's private view,
/// greedily. Helper shared by the scheduler manager's per-application
/// `ScheduleRequest` handling.
pub fn schedule_request_booking(
    accounter: &mut ResourceAccounter,
    uid: AppUid,
    usages: &crate::resources::UsageMap,
    view: crate::ids::ViewToken,
) -> Result<(), crate::error::AccounterError> {
    accounter.book_resources(uid, usages, view, BookingMode::Scheduling)
}
