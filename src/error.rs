//! Structured error taxonomy for the core subsystems.
//!
//! Invariant violations are logged at CRIT/FATAL by the caller and abort
//! the current cycle; policy/admission rejections and "no work" outcomes
//! are ordinary `Err`/non-error return values inspected by the caller;
//! nothing here panics. `anyhow::Error` is reserved for the CLI/bootstrap
//! boundary in `main.rs`, `thiserror` enums carry structure everywhere else.

use thiserror::Error;

/// Errors from [`crate::resources::accounter::ResourceAccounter`] operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AccounterError {
    #[error("missing or empty resource path")]
    MissPath,
    #[error("resource descriptor allocation failed")]
    Mem,
    #[error("application reference is missing")]
    MissApp,
    #[error("resource usages set is missing or empty")]
    MissUsages,
    #[error("resource state view {0} is unknown")]
    MissView(u64),
    #[error("application already holds a resource usage set in this view")]
    AppUsages,
    #[error("requested amount exceeds availability")]
    UsageExceeded,
    #[error("cannot release the system view")]
    SystemView,
    #[error("synchronization session is not open")]
    SyncNotStarted,
    #[error("next AWM is missing for the application being synced")]
    MissAwm,
}

/// Errors from [`crate::app_manager::ApplicationManager`] lifecycle operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AppManagerError {
    #[error("execution context {0} is not registered")]
    UnknownExc(String),
    #[error("execution context {0} is not in DISABLED state")]
    NotDisabled(String),
    #[error("recipe {0} failed to load")]
    RecipeLoadFailed(String),
    #[error("recipe {0} loaded with missing resource bindings (weak load refused)")]
    WeakLoadRefused(String),
    #[error("execution context {0} is not in SYNC state")]
    NotInSync(String),
    #[error("sync sub-state {0:?} is not valid for this transition")]
    InvalidSyncSubState(String),
}

/// Outcome of one scheduler cycle.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("no application has an assignable working mode this cycle")]
    NoWorkingMode,
    #[error("scheduling is delayed until the next cycle")]
    Delayed,
    #[error("policy invocation failed: {0}")]
    PolicyFailed(String),
    #[error(transparent)]
    Accounter(#[from] AccounterError),
}

/// Errors from the four-phase synchronization protocol.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SyncError {
    #[error("synchronization phase timed out for execution context {0}")]
    Timeout(String),
    #[error("transport channel failed: {0}")]
    TransportFatal(String),
    #[error(transparent)]
    Accounter(#[from] AccounterError),
    #[error(transparent)]
    AppManager(#[from] AppManagerError),
    #[error("cycle aborted: {0}")]
    Aborted(String),
}

/// Errors surfaced by the application proxy.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProxyError {
    #[error("no connection registered for pid {0}")]
    UnknownPid(i32),
    #[error("malformed RPC header")]
    MalformedHeader,
    #[error("unsupported RPC message type {0}")]
    UnsupportedMessageType(u8),
}
