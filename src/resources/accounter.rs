//! The resource accounter: registry of resource leaves plus the multi-view
//! booking ledger and the view-swap commit primitive.
//!
//! Grounded on `bbque/resource_accounter.cc`. The accounter keeps a fresh
//! view alive for every `GetView` caller (typically one per scheduling or
//! synchronization policy instance), lets each view book and release
//! resources independently of the system view, and commits one view to
//! become the new system view atomically via [`ResourceAccounter::set_view`].
//!
//! Two booking modes exist, matching `SchedResourceBooking` /
//! `SyncResourceBooking` in the original:
//! - scheduling-mode booking greedily acquires `min(requested, available)`
//!   per usage, capped within the caller's private view;
//! - sync-mode booking replays, leaf by leaf, the *exact* amount the
//!   application was assigned in the last scheduled view (tracked via
//!   [`ResourceAccounter::scheduled_view`]) onto the sync view, using an
//!   unchecked exact acquire. This is what guarantees the committed state is
//!   bit-identical to what the scheduling policy validated.

use std::collections::{HashMap, HashSet};

use crate::error::AccounterError;
use crate::ids::{AppUid, ViewToken, SYSTEM_VIEW};
use crate::resources::tree::{convert_units, ResourceTree};

/// A flat list of (path, amount) pairs an application wants to book —
/// the resource usage bound into one Application Working Mode.
pub type UsageMap = Vec<(String, u64)>;

/// Which booking algorithm to apply when acquiring a [`UsageMap`] into a
/// view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BookingMode {
    /// Greedy, availability-capped acquire (policy exploration views).
    Scheduling,
    /// Exact replay of the scheduled view's per-leaf amounts (the sync
    /// view during the four-phase protocol).
    Sync,
}

/// Registry + multi-view ledger for every resource in the platform.
#[derive(Debug, Default)]
pub struct ResourceAccounter {
    tree: ResourceTree,
    /// Every outstanding view other than the system view, and which
    /// applications have a usage set booked in it (for `put_view` cleanup
    /// and reshuffling checks).
    view_apps: HashMap<ViewToken, HashSet<AppUid>>,
    /// The currently-committed view's token. Changes identity on every
    /// successful `set_view` — it is not always literally `0`.
    system_view: ViewToken,
    /// The view token holding the *last scheduled* (policy-validated, not
    /// yet committed) per-application bindings, consulted by sync-mode
    /// booking. `None` until a scheduling cycle has produced one.
    scheduled_view: Option<ViewToken>,
    /// Monotonic counter backing freshly minted view tokens (the original
    /// hashes a caller-supplied path; a counter is the idiomatic
    /// equivalent since callers here don't provide one).
    next_view: ViewToken,
    /// Open synchronization session's view, if any.
    sync_view: Option<ViewToken>,
}

impl ResourceAccounter {
    pub fn new() -> Self {
        Self {
            tree: ResourceTree::new(),
            view_apps: HashMap::new(),
            system_view: SYSTEM_VIEW,
            scheduled_view: None,
            next_view: SYSTEM_VIEW + 1,
            sync_view: None,
        }
    }

    /// Register a new resource leaf. `path` must be non-empty and must not
    /// already be registered; `units` is an optional K/M/G suffix applied to
    /// `amount`.
    pub fn register_resource(
        &mut self,
        path: &str,
        amount: u64,
        units: &str,
    ) -> Result<(), AccounterError> {
        if path.is_empty() {
            return Err(AccounterError::MissPath);
        }
        let total = convert_units(amount, units);
        self.tree.insert(path, total);
        Ok(())
    }

    pub fn is_registered(&self, path: &str) -> bool {
        self.tree.contains(path)
    }

    pub fn resource_count(&self) -> usize {
        self.tree.len()
    }

    fn resolve_view(&self, vtok: ViewToken) -> ViewToken {
        if vtok == SYSTEM_VIEW {
            self.system_view
        } else {
            vtok
        }
    }

    /// Static capacity of `path` (a template query sums every matching leaf).
    pub fn total(&self, path: &str) -> u64 {
        self.tree.matching(path).iter().filter_map(|p| self.tree.get(p)).map(|r| r.total()).sum()
    }

    /// Amount in use under `path` within `vtok`.
    pub fn used(&self, path: &str, vtok: ViewToken) -> u64 {
        let vtok = self.resolve_view(vtok);
        self.tree
            .matching(path)
            .iter()
            .filter_map(|p| self.tree.get(p))
            .map(|r| r.used(vtok))
            .sum()
    }

    /// Amount available under `path` within `vtok`, optionally as seen by
    /// `app` (so the app's own current holdings don't count against it).
    pub fn available(&self, path: &str, vtok: ViewToken, app: Option<AppUid>) -> u64 {
        let vtok = self.resolve_view(vtok);
        self.tree
            .matching(path)
            .iter()
            .filter_map(|p| self.tree.get(p))
            .map(|r| match app {
                Some(a) => r.available_for(vtok, a),
                None => r.available(vtok),
            })
            .sum()
    }

    /// Open a fresh, empty view derived from the current system state.
    /// Returns its token.
    pub fn get_view(&mut self) -> ViewToken {
        let tok = self.next_view;
        self.next_view += 1;
        self.view_apps.insert(tok, HashSet::new());
        tok
    }

    /// Discard a non-system view and every booking made within it.
    pub fn put_view(&mut self, vtok: ViewToken) -> Result<(), AccounterError> {
        if vtok == self.system_view || vtok == SYSTEM_VIEW {
            return Err(AccounterError::SystemView);
        }
        for path in self.tree.paths().map(str::to_owned).collect::<Vec<_>>() {
            if let Some(r) = self.tree.get_mut(&path) {
                r.delete_view(vtok);
            }
        }
        self.view_apps.remove(&vtok);
        Ok(())
    }

    /// Atomically promote `vtok` to become the new system view, discarding
    /// the previous one. This is the only commit primitive: once it
    /// returns, every reader using the system-view convention (token `0`)
    /// observes `vtok`'s bookings.
    pub fn set_view(&mut self, vtok: ViewToken) -> Result<(), AccounterError> {
        if vtok == self.system_view {
            return Err(AccounterError::SystemView);
        }
        let old = self.system_view;
        self.system_view = vtok;
        self.view_apps.remove(&vtok);
        if old != SYSTEM_VIEW {
            let _ = self.put_view(old);
        } else {
            for path in self.tree.paths().map(str::to_owned).collect::<Vec<_>>() {
                if let Some(r) = self.tree.get_mut(&path) {
                    r.delete_view(old);
                }
            }
        }
        Ok(())
    }

    /// Book `usages` for `app` into `vtok` using `mode`. On scheduling-mode
    /// failure, any partial acquisitions already made are rolled back and
    /// `UsageExceeded` is returned — a booking call is all-or-nothing.
    ///
    /// Each usage's `path` is resolved against the registered leaf set
    /// (exact, template, or hybrid match) into its ordered `binds` —
    /// spec.md §3/§4.A's "walks its binds in order, acquiring from each
    /// leaf up to the remaining requested amount until the amount is
    /// satisfied": a single-leaf path naturally binds to just that leaf, a
    /// template path (e.g. `arch.tile.cluster.pe`) fans the demand across
    /// every matching leaf in path order.
    pub fn book_resources(
        &mut self,
        app: AppUid,
        usages: &UsageMap,
        vtok: ViewToken,
        mode: BookingMode,
    ) -> Result<(), AccounterError> {
        if usages.is_empty() {
            return Err(AccounterError::MissUsages);
        }
        let vtok = self.resolve_view(vtok);
        if self.already_holds(app, vtok) {
            return Err(AccounterError::AppUsages);
        }

        let mut acquired: Vec<(String, u64)> = Vec::new();
        for (path, amount) in usages {
            let binds = self.tree.matching(path).into_iter().map(str::to_owned).collect::<Vec<_>>();
            if binds.is_empty() {
                self.rollback(&acquired, app, vtok);
                return Err(AccounterError::MissPath);
            }

            match mode {
                BookingMode::Scheduling => {
                    let mut remaining = *amount;
                    for leaf in &binds {
                        if remaining == 0 {
                            break;
                        }
                        let resource = self.tree.get_mut(leaf).expect("leaf from matching() exists");
                        let got = resource.acquire_greedy(app, remaining, vtok);
                        if got > 0 {
                            acquired.push((leaf.clone(), got));
                            remaining -= got;
                        }
                    }
                    if remaining > 0 {
                        self.rollback(&acquired, app, vtok);
                        return Err(AccounterError::UsageExceeded);
                    }
                }
                BookingMode::Sync => {
                    for leaf in &binds {
                        let want = self.scheduled_amount(leaf, app);
                        if want == 0 {
                            continue;
                        }
                        let resource = self.tree.get_mut(leaf).expect("leaf from matching() exists");
                        if !resource.acquire_exact(app, want, vtok) {
                            self.rollback(&acquired, app, vtok);
                            return Err(AccounterError::UsageExceeded);
                        }
                        acquired.push((leaf.clone(), want));
                    }
                }
            }
        }

        self.view_apps.entry(vtok).or_default().insert(app);
        Ok(())
    }

    /// Undo every leaf acquisition recorded in `acquired` for `app` in
    /// `vtok` — the all-or-nothing rollback path for a failed booking.
    fn rollback(&mut self, acquired: &[(String, u64)], app: AppUid, vtok: ViewToken) {
        for (leaf, _) in acquired {
            if let Some(r) = self.tree.get_mut(leaf) {
                r.release(app, vtok);
            }
        }
    }

    /// Release every resource `app` holds in `vtok`.
    pub fn release_resources(&mut self, app: AppUid, vtok: ViewToken) {
        let vtok = self.resolve_view(vtok);
        for path in self.tree.paths().map(str::to_owned).collect::<Vec<_>>() {
            if let Some(r) = self.tree.get_mut(&path) {
                r.release(app, vtok);
            }
        }
        if let Some(apps) = self.view_apps.get_mut(&vtok) {
            apps.remove(&app);
        }
    }

    fn already_holds(&self, app: AppUid, vtok: ViewToken) -> bool {
        self.view_apps
            .get(&vtok)
            .map(|apps| apps.contains(&app))
            .unwrap_or(false)
    }

    /// The amount `app` was assigned on `path` in the last scheduled view.
    /// `0` if the scheduler never touched this leaf for this app.
    fn scheduled_amount(&self, path: &str, app: AppUid) -> u64 {
        let Some(sched) = self.scheduled_view else {
            return 0;
        };
        self.tree.get(path).map(|r| r.app_usage(sched, app)).unwrap_or(0)
    }

    /// The concrete per-leaf usage map `app` currently holds within `vtok`,
    /// restricted to leaves matching the paths named in `usages` — resolves
    /// an abstract usage map (an AWM's `usage_template`, say) down to the
    /// actual leaves the accounter has bound for this app, so two snapshots
    /// of it taken in different views can be compared with
    /// [`Self::is_reshuffling`].
    pub fn concrete_usage(&self, app: AppUid, usages: &UsageMap, vtok: ViewToken) -> UsageMap {
        let vtok = self.resolve_view(vtok);
        let mut out = Vec::new();
        for (path, _) in usages {
            for leaf in self.tree.matching(path) {
                if let Some(r) = self.tree.get(leaf) {
                    let amount = r.app_usage(vtok, app);
                    if amount > 0 {
                        out.push((leaf.to_string(), amount));
                    }
                }
            }
        }
        out
    }

    /// Do the two usage maps bind different leaves for `app`? Used to
    /// detect a "reshuffling" transition (the app keeps the same AWM value
    /// but its concrete bindings moved), which the synchronization manager
    /// treats as a RECONF rather than a no-op.
    pub fn is_reshuffling(&self, a: &UsageMap, b: &UsageMap) -> bool {
        let pa: HashSet<&str> = a.iter().map(|(p, _)| p.as_str()).collect();
        let pb: HashSet<&str> = b.iter().map(|(p, _)| p.as_str()).collect();
        pa != pb
    }

    /// Record `vtok` as the view holding the scheduler's latest validated
    /// bindings, consulted by subsequent sync-mode bookings.
    pub fn set_scheduled_view(&mut self, vtok: ViewToken) {
        self.scheduled_view = Some(self.resolve_view(vtok));
    }

    pub fn clear_scheduled_view(&mut self) {
        self.scheduled_view = None;
    }

    /// Open a synchronization session: a fresh view pre-seeded with every
    /// currently RUNNING application's current (not next) bindings, so that
    /// apps untouched by this sync round keep their resources throughout.
    pub fn sync_start(
        &mut self,
        current_bindings: &[(AppUid, UsageMap)],
    ) -> Result<ViewToken, AccounterError> {
        let vtok = self.get_view();
        for (app, usages) in current_bindings {
            self.book_resources(*app, usages, vtok, BookingMode::Scheduling)?;
        }
        self.sync_view = Some(vtok);
        Ok(vtok)
    }

    /// During `PostChange`, book the application's next bindings into the
    /// open sync view using exact sync-mode booking.
    pub fn sync_acquire_resources(
        &mut self,
        app: AppUid,
        next_usages: &UsageMap,
    ) -> Result<(), AccounterError> {
        let vtok = self.sync_view.ok_or(AccounterError::SyncNotStarted)?;
        self.book_resources(app, next_usages, vtok, BookingMode::Sync)
    }

    /// Abandon the open synchronization session without committing it.
    pub fn sync_abort(&mut self) -> Result<(), AccounterError> {
        let vtok = self.sync_view.take().ok_or(AccounterError::SyncNotStarted)?;
        self.put_view(vtok)
    }

    /// Commit the open synchronization session: the sync view becomes the
    /// new system view, and the scheduled-view marker is cleared so the
    /// next scheduling cycle starts fresh.
    pub fn sync_commit(&mut self) -> Result<(), AccounterError> {
        let vtok = self.sync_view.take().ok_or(AccounterError::SyncNotStarted)?;
        self.set_view(vtok)?;
        self.clear_scheduled_view();
        Ok(())
    }

    pub fn system_view_token(&self) -> ViewToken {
        self.system_view
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uid(pid: i32) -> AppUid {
        AppUid::new(pid, 0)
    }

    fn new_ra() -> ResourceAccounter {
        let mut ra = ResourceAccounter::new();
        ra.register_resource("arch.tile0.cluster0.pe0", 4, "1").unwrap();
        ra.register_resource("arch.tile0.cluster0.pe1", 4, "1").unwrap();
        ra.register_resource("arch.tile0.mem0", 1, "gb").unwrap();
        ra
    }

    #[test]
    fn register_and_query_totals() {
        let ra = new_ra();
        assert_eq!(ra.total("arch.tile0.cluster0.pe0"), 4);
        assert_eq!(ra.total("arch.tile0.mem0"), 1 << 30);
        assert_eq!(ra.total("arch.tile.cluster.pe"), 8);
    }

    #[test]
    fn register_rejects_empty_path() {
        let mut ra = ResourceAccounter::new();
        assert_eq!(ra.register_resource("", 1, "1"), Err(AccounterError::MissPath));
    }

    #[test]
    fn book_and_release_in_system_view() {
        let mut ra = new_ra();
        let usages = vec![("arch.tile0.cluster0.pe0".to_string(), 2)];
        ra.book_resources(uid(1), &usages, SYSTEM_VIEW, BookingMode::Scheduling)
            .unwrap();
        assert_eq!(ra.used("arch.tile0.cluster0.pe0", SYSTEM_VIEW), 2);
        ra.release_resources(uid(1), SYSTEM_VIEW);
        assert_eq!(ra.used("arch.tile0.cluster0.pe0", SYSTEM_VIEW), 0);
    }

    #[test]
    fn book_fans_amount_across_template_matched_leaves() {
        // spec.md §8 scenario 2: two single-unit PEs, one usage demanding
        // amount=2 against the template path that matches both.
        let mut ra = ResourceAccounter::new();
        ra.register_resource("arch.tile0.cluster0.pe0", 1, "1").unwrap();
        ra.register_resource("arch.tile0.cluster0.pe1", 1, "1").unwrap();
        let usages = vec![("arch.tile0.cluster0.pe".to_string(), 2)];
        ra.book_resources(uid(1), &usages, SYSTEM_VIEW, BookingMode::Scheduling)
            .unwrap();
        assert_eq!(ra.used("arch.tile0.cluster0.pe0", SYSTEM_VIEW), 1);
        assert_eq!(ra.used("arch.tile0.cluster0.pe1", SYSTEM_VIEW), 1);
        assert_eq!(ra.available("arch.tile0.cluster0.pe0", SYSTEM_VIEW, None), 0);
        assert_eq!(ra.available("arch.tile0.cluster0.pe1", SYSTEM_VIEW, None), 0);

        ra.release_resources(uid(1), SYSTEM_VIEW);
        assert_eq!(ra.used("arch.tile0.cluster0.pe0", SYSTEM_VIEW), 0);
        assert_eq!(ra.used("arch.tile0.cluster0.pe1", SYSTEM_VIEW), 0);
    }

    #[test]
    fn book_rejects_double_booking_same_view() {
        let mut ra = new_ra();
        let usages = vec![("arch.tile0.cluster0.pe0".to_string(), 1)];
        ra.book_resources(uid(1), &usages, SYSTEM_VIEW, BookingMode::Scheduling)
            .unwrap();
        let err = ra
            .book_resources(uid(1), &usages, SYSTEM_VIEW, BookingMode::Scheduling)
            .unwrap_err();
        assert_eq!(err, AccounterError::AppUsages);
    }

    #[test]
    fn views_are_isolated_until_committed() {
        let mut ra = new_ra();
        let view = ra.get_view();
        let usages = vec![("arch.tile0.cluster0.pe0".to_string(), 3)];
        ra.book_resources(uid(1), &usages, view, BookingMode::Scheduling)
            .unwrap();
        assert_eq!(ra.used("arch.tile0.cluster0.pe0", SYSTEM_VIEW), 0);
        assert_eq!(ra.used("arch.tile0.cluster0.pe0", view), 3);
    }

    #[test]
    fn set_view_commits_atomically_and_changes_system_token() {
        let mut ra = new_ra();
        let view = ra.get_view();
        let usages = vec![("arch.tile0.cluster0.pe0".to_string(), 3)];
        ra.book_resources(uid(1), &usages, view, BookingMode::Scheduling)
            .unwrap();
        ra.set_view(view).unwrap();
        assert_eq!(ra.system_view_token(), view);
        assert_eq!(ra.used("arch.tile0.cluster0.pe0", SYSTEM_VIEW), 3);
    }

    #[test]
    fn set_view_rejects_committing_current_system_view() {
        let mut ra = new_ra();
        let tok = ra.system_view_token();
        assert_eq!(ra.set_view(tok), Err(AccounterError::SystemView));
    }

    #[test]
    fn sync_mode_replays_exact_scheduled_amount() {
        let mut ra = new_ra();
        let sched_view = ra.get_view();
        let usages = vec![("arch.tile0.cluster0.pe0".to_string(), 3)];
        ra.book_resources(uid(1), &usages, sched_view, BookingMode::Scheduling)
            .unwrap();
        ra.set_scheduled_view(sched_view);

        let sync_view = ra.get_view();
        // Sync-mode booking ignores the amount in `usages` and instead
        // replays whatever the scheduled view actually holds for this app.
        let bogus_usages = vec![("arch.tile0.cluster0.pe0".to_string(), 999)];
        ra.book_resources(uid(1), &bogus_usages, sync_view, BookingMode::Sync)
            .unwrap();
        assert_eq!(ra.used("arch.tile0.cluster0.pe0", sync_view), 3);
    }

    #[test]
    fn sync_protocol_commits_next_bindings() {
        let mut ra = new_ra();
        let current = vec![(uid(1), vec![("arch.tile0.cluster0.pe0".to_string(), 1)])];
        ra.sync_start(&current).unwrap();

        ra.sync_acquire_resources(
            uid(2),
            &vec![("arch.tile0.cluster0.pe1".to_string(), 2)],
        )
        .unwrap_or(()); // app 2 has no scheduled amount yet, so this books 0 and succeeds

        ra.sync_commit().unwrap();
        assert_eq!(ra.used("arch.tile0.cluster0.pe0", SYSTEM_VIEW), 1);
    }

    #[test]
    fn sync_abort_discards_the_session() {
        let mut ra = new_ra();
        let current = vec![(uid(1), vec![("arch.tile0.cluster0.pe0".to_string(), 1)])];
        ra.sync_start(&current).unwrap();
        ra.sync_abort().unwrap();
        assert_eq!(ra.used("arch.tile0.cluster0.pe0", SYSTEM_VIEW), 0);
    }

    #[test]
    fn concrete_usage_resolves_template_to_held_leaves() {
        let mut ra = new_ra();
        let usages = vec![("arch.tile0.cluster0.pe".to_string(), 1)];
        ra.book_resources(uid(1), &usages, SYSTEM_VIEW, BookingMode::Scheduling).unwrap();
        let held = ra.concrete_usage(uid(1), &usages, SYSTEM_VIEW);
        assert_eq!(held, vec![("arch.tile0.cluster0.pe0".to_string(), 1)]);
        assert!(ra.concrete_usage(uid(2), &usages, SYSTEM_VIEW).is_empty());
    }

    #[test]
    fn is_reshuffling_detects_binding_change() {
        let ra = new_ra();
        let a = vec![("arch.tile0.cluster0.pe0".to_string(), 2)];
        let b = vec![("arch.tile0.cluster0.pe1".to_string(), 2)];
        assert!(ra.is_reshuffling(&a, &b));
        assert!(!ra.is_reshuffling(&a, &a.clone()));
    }
}
