//! Pluggable selection policy for the synchronization manager: which
//! sub-state queue to drain next, and a per-app filter.
//!
//! Grounded on `include/bbque/plugins/synchronization_policy.h`'s
//! `GetApplicationsQueue` / `DoSync` contract.

use async_trait::async_trait;

use crate::app::exc::SyncSubState;
use crate::app_manager::ApplicationManager;
use crate::ids::AppUid;

const SUB_STATE_ORDER: [SyncSubState; 5] = [
    SyncSubState::Starting,
    SyncSubState::Reconf,
    SyncSubState::MigRec,
    SyncSubState::Migrate,
    SyncSubState::Blocked,
];

#[async_trait]
pub trait SyncPolicy: Send + Sync {
    /// Which sub-state queue should be processed next? `restart` is set
    /// only on the first call of a cycle, to reset any internal cursor.
    /// `None` means the policy has no more work for this cycle.
    async fn next_queue(
        &self,
        app_manager: &ApplicationManager,
        restart: bool,
    ) -> Option<SyncSubState>;

    /// Per-app filter consulted before driving an EXC through the
    /// four-phase protocol; default accepts everyone.
    fn do_sync(&self, _uid: AppUid) -> bool {
        true
    }
}

/// Visits each non-empty sub-state queue in a fixed priority order
/// exactly once per cycle.
pub struct FifoSyncPolicy {
    cursor: tokio::sync::Mutex<usize>,
}

impl FifoSyncPolicy {
    pub fn new() -> Self {
        Self { cursor: tokio::sync::Mutex::new(0) }
    }
}

impl Default for FifoSyncPolicy {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SyncPolicy for FifoSyncPolicy {
    async fn next_queue(
        &self,
        app_manager: &ApplicationManager,
        restart: bool,
    ) -> Option<SyncSubState> {
        let mut cursor = self.cursor.lock().await;
        if restart {
            *cursor = 0;
        }
        while *cursor < SUB_STATE_ORDER.len() {
            let sub_state = SUB_STATE_ORDER[*cursor];
            *cursor += 1;
            if !app_manager.snapshot_sync_state(sub_state).await.is_empty() {
                return Some(sub_state);
            }
        }
        None
    }
}
