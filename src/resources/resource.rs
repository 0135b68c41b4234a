//! A single resource leaf descriptor with multi-view booking state.
//!
//! Grounded on `include/bbque/res/resources.h` / `bbque/res/resources.cc`:
//! each resource holds a static `total` and a set of per-view states keyed
//! by view token, each state tracking `used` and a per-application map.

use std::collections::BTreeMap;
use std::collections::HashMap;

use crate::ids::{AppUid, ViewToken};

/// Per-view booking state for one resource.
#[derive(Debug, Clone, Default)]
struct ResourceState {
    used: u64,
    /// Amount held by each application in this view, keyed for deterministic
    /// iteration (diagnostics, `used_by`).
    apps: BTreeMap<AppUid, u64>,
}

/// A named node in the hierarchical resource path space, e.g.
/// `arch.tile0.cluster1.pe0`.
#[derive(Debug, Clone)]
pub struct Resource {
    path: String,
    total: u64,
    state_views: HashMap<ViewToken, ResourceState>,
}

impl Resource {
    pub fn new(path: impl Into<String>, total: u64) -> Self {
        let mut state_views = HashMap::new();
        state_views.insert(crate::ids::SYSTEM_VIEW, ResourceState::default());
        Self {
            path: path.into(),
            total,
            state_views,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Leaf name — the last dot-separated segment of the path.
    pub fn name(&self) -> &str {
        self.path.rsplit('.').next().unwrap_or(&self.path)
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    fn view(&self, vtok: ViewToken) -> Option<&ResourceState> {
        self.state_views.get(&vtok)
    }

    fn view_mut(&mut self, vtok: ViewToken) -> &mut ResourceState {
        self.state_views.entry(vtok).or_default()
    }

    /// Amount in use within `vtok`. A view with no recorded state has
    /// nothing allocated yet.
    pub fn used(&self, vtok: ViewToken) -> u64 {
        self.view(vtok).map(|v| v.used).unwrap_or(0)
    }

    /// Amount still available within `vtok`.
    pub fn available(&self, vtok: ViewToken) -> u64 {
        self.total - self.used(vtok)
    }

    /// Amount available to `app` specifically — the view's availability
    /// plus whatever `app` already holds (so it "sees itself"), per spec
    /// §4.A `Available(path|usage, vtok, app?)`.
    pub fn available_for(&self, vtok: ViewToken, app: AppUid) -> u64 {
        self.available(vtok) + self.app_usage(vtok, app)
    }

    /// Amount currently held by `app` in `vtok`.
    pub fn app_usage(&self, vtok: ViewToken, app: AppUid) -> u64 {
        self.view(vtok)
            .and_then(|v| v.apps.get(&app))
            .copied()
            .unwrap_or(0)
    }

    /// Number of distinct applications holding this resource in `vtok`.
    pub fn apps_count(&self, vtok: ViewToken) -> usize {
        self.view(vtok).map(|v| v.apps.len()).unwrap_or(0)
    }

    /// The `idx`-th (app, amount) pair using this resource in `vtok`, in
    /// ascending `AppUid` order. Supplemental diagnostic primitive ported
    /// from `Resource::UsedBy` in the original.
    pub fn used_by(&self, idx: usize, vtok: ViewToken) -> Option<(AppUid, u64)> {
        self.view(vtok)?.apps.iter().nth(idx).map(|(k, v)| (*k, *v))
    }

    /// Greedily acquire up to `amount`, capped by what's actually available
    /// in `vtok`. Returns the amount actually acquired. Accumulates into any
    /// amount the app already holds on this leaf in this view (a single
    /// booking call may touch the same leaf from more than one Usage).
    ///
    /// This is the scheduling-booking primitive: greedy, availability-capped,
    /// no precondition beyond `amount` being the remaining unsatisfied demand.
    pub fn acquire_greedy(&mut self, app: AppUid, amount: u64, vtok: ViewToken) -> u64 {
        let avail = self.available(vtok);
        let take = amount.min(avail);
        if take == 0 {
            return 0;
        }
        let state = self.view_mut(vtok);
        state.used += take;
        *state.apps.entry(app).or_insert(0) += take;
        take
    }

    /// Acquire exactly `amount` without any availability check — the
    /// sync-booking primitive. Fails only if doing so would exceed `total`,
    /// which indicates a corrupted cycle (the amount was supposed to have
    /// been validated already).
    pub fn acquire_exact(&mut self, app: AppUid, amount: u64, vtok: ViewToken) -> bool {
        if amount == 0 {
            return true;
        }
        let used = self.used(vtok);
        if used + amount > self.total {
            return false;
        }
        let state = self.view_mut(vtok);
        state.used += amount;
        *state.apps.entry(app).or_insert(0) += amount;
        true
    }

    /// Release everything `app` holds on this leaf in `vtok`. Returns the
    /// amount released, or `None` if `app` held nothing here.
    pub fn release(&mut self, app: AppUid, vtok: ViewToken) -> Option<u64> {
        let state = self.state_views.get_mut(&vtok)?;
        let held = state.apps.remove(&app)?;
        state.used -= held;
        Some(held)
    }

    /// Drop a view's state entirely (`PutView`). The caller is
    /// responsible for never doing this to the system view.
    pub fn delete_view(&mut self, vtok: ViewToken) {
        self.state_views.remove(&vtok);
    }

    /// Ensure a (possibly empty) state exists for `vtok`, without touching
    /// any existing state.
    pub fn ensure_view(&mut self, vtok: ViewToken) {
        self.state_views.entry(vtok).or_default();
    }
}
