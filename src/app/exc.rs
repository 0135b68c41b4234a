//! Execution Context: an independently schedulable unit belonging to an
//! application process, and its lifecycle state machine.
//!
//! Grounded on `include/bbque/app/application.h` /
//! `bbque/app/application.cc`. The per-EXC mutex and condition variable of
//! the original become, in the async translation, a [`tokio::sync::Notify`]
//! the synchronization manager signals when a pending reply arrives.

use std::sync::Arc;

use tokio::sync::Notify;

use crate::app::awm::WorkingMode;
use crate::app::constraint::{recompute_enabled, ConstraintMap};
use crate::app::recipe::Recipe;
use crate::ids::{AppUid, ViewToken};

/// Lowest (least urgent) priority level; priorities are clamped to
/// `[0, LOWEST_PRIORITY]`, 0 being the highest.
pub const LOWEST_PRIORITY: u8 = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncSubState {
    Starting,
    Reconf,
    MigRec,
    Migrate,
    Blocked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExcState {
    Disabled,
    Ready,
    Sync(SyncSubState),
    Running,
    Finished,
}

/// `(state, awm id)` tuple tracked both for the current committed schedule
/// and the scheduler's tentative next one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleTuple {
    pub state: ExcState,
    pub awm_id: Option<u32>,
}

impl ScheduleTuple {
    pub fn empty() -> Self {
        Self { state: ExcState::Disabled, awm_id: None }
    }
}

/// Is `to` a legal transition from `from`? Mirrors the original's explicit
/// state machine (spec.md §3 "State machine (per EXC)").
pub fn valid_transition(from: ExcState, to: ExcState) -> bool {
    use ExcState::*;
    matches!(
        (from, to),
        (Disabled, Ready)
            | (Ready, Sync(_))
            | (Ready, Disabled)
            | (Sync(_), Running)
            | (Sync(SyncSubState::Blocked), Disabled)
            | (Running, Sync(_))
            | (Running, Disabled)
            | (Disabled, Finished)
            | (Ready, Finished)
            | (Sync(_), Finished)
            | (Running, Finished)
    )
}

/// An execution context: `(pid, exc_id)` identity, priority, recipe-backed
/// AWM list, per-resource constraints, and current/next schedule.
pub struct Exc {
    pub uid: AppUid,
    pub name: String,
    priority: u8,
    pub recipe: Recipe,
    enabled_awms: Vec<WorkingMode>,
    constraints: ConstraintMap,
    pub current: ScheduleTuple,
    pub next: ScheduleTuple,
    /// Signalled whenever a sync-protocol reply for this EXC arrives, so an
    /// async waiter can wake instead of polling.
    pub sync_reply: Arc<Notify>,
}

impl Exc {
    pub fn new(uid: AppUid, name: impl Into<String>, priority: u8, recipe: Recipe) -> Self {
        let mut exc = Self {
            uid,
            name: name.into(),
            priority: priority.min(LOWEST_PRIORITY),
            enabled_awms: Vec::new(),
            constraints: ConstraintMap::new(),
            current: ScheduleTuple::empty(),
            next: ScheduleTuple::empty(),
            sync_reply: Arc::new(Notify::new()),
            recipe,
        };
        exc.recompute_enabled_awms();
        exc
    }

    pub fn priority(&self) -> u8 {
        self.priority
    }

    pub fn set_priority(&mut self, p: u8) {
        self.priority = p.min(LOWEST_PRIORITY);
    }

    /// Effective queryable state: as soon as the scheduler tentatively
    /// sets a `next` schedule, the EXC is observably in SYNC even though
    /// `current` (the last committed tuple) hasn't moved yet; once
    /// `commit_sync` finalizes the transition, `next` is emptied and this
    /// reports `current` again.
    pub fn state(&self) -> ExcState {
        match self.next.state {
            ExcState::Sync(sub) => ExcState::Sync(sub),
            _ => self.current.state,
        }
    }

    /// The last committed state, ignoring any pending `next` schedule.
    pub fn committed_state(&self) -> ExcState {
        self.current.state
    }

    /// Recompute `enabled_awms` from the recipe's full AWM list under the
    /// current constraint map, sorted by value ascending. Called whenever
    /// constraints change or the recipe is (re)assigned.
    pub fn recompute_enabled_awms(&mut self) {
        self.enabled_awms =
            recompute_enabled(&self.recipe.awms, &self.constraints).into_iter().cloned().collect();
    }

    pub fn enabled_awms(&self) -> &[WorkingMode] {
        &self.enabled_awms
    }

    pub fn constraints_mut(&mut self) -> &mut ConstraintMap {
        &mut self.constraints
    }

    pub fn awm_by_id(&self, id: u32) -> Option<&WorkingMode> {
        self.recipe.awms.iter().find(|a| a.id == id)
    }

    /// Mutable lookup, used to record a reconfiguration overhead sample on
    /// the source AWM of a just-completed transition.
    pub fn awm_by_id_mut(&mut self, id: u32) -> Option<&mut WorkingMode> {
        self.recipe.awms.iter_mut().find(|a| a.id == id)
    }

    /// Attempt the DISABLED → READY transition.
    pub fn enable(&mut self) -> bool {
        if self.current.state == ExcState::Disabled {
            self.current.state = ExcState::Ready;
            true
        } else {
            false
        }
    }

    /// Move to DISABLED from any state (the caller is responsible for
    /// releasing the EXC's resources in the accounter first).
    pub fn disable(&mut self) {
        self.current.state = ExcState::Disabled;
        self.next = ScheduleTuple::empty();
    }

    pub fn finish(&mut self) {
        self.current.state = ExcState::Finished;
    }

    /// Tentatively set the scheduler's pick for next cycle. The caller
    /// (scheduler manager) has already booked the AWM's usage into the
    /// scheduling view before calling this; on the caller's failure path
    /// this is never invoked, leaving `next` unchanged (spec.md §4.B
    /// `SetNextSchedule`).
    pub fn set_next_schedule(&mut self, awm_id: u32, sub_state: SyncSubState) {
        self.next = ScheduleTuple { state: ExcState::Sync(sub_state), awm_id: Some(awm_id) };
    }

    /// Finalize the pending transition into `current` on a successful
    /// PostChange, moving to RUNNING unless the sub-state was BLOCKED, in
    /// which case the EXC returns to DISABLED.
    pub fn commit_sync(&mut self) {
        match self.next.state {
            ExcState::Sync(SyncSubState::Blocked) => self.disable(),
            ExcState::Sync(_) => {
                self.current = ScheduleTuple { state: ExcState::Running, awm_id: self.next.awm_id };
                self.next = ScheduleTuple::empty();
            }
            _ => {}
        }
    }
}
