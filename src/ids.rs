//! Identifiers shared across subsystems.
//!
//! Kept in their own module (rather than on `app::Exc`) so that
//! `resources` does not need to depend on `app` — the resource ledger only
//! needs to key its per-application maps by something hashable, not by the
//! full `Exc` record.

use std::fmt;

/// Uniquely identifies an Execution Context as `(pid, exc_id)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AppUid {
    pub pid: i32,
    pub exc_id: u8,
}

impl AppUid {
    pub fn new(pid: i32, exc_id: u8) -> Self {
        Self { pid, exc_id }
    }
}

impl fmt::Display for AppUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.pid, self.exc_id)
    }
}

/// Opaque token identifying a resource accounter view. `0` is always the
/// system (committed) view, by convention.
pub type ViewToken = u64;

/// The system view's token.
pub const SYSTEM_VIEW: ViewToken = 0;
