//! Wire protocol between the RTRM core and each application's runtime
//! library: a fixed 8-byte header plus a type-specific JSON payload.
//!
//! Grounded on `include/bbque/rtlib.h` / `include/bbque/rpc_messages.h`'s
//! message partitioning (EXC→RTRM, RTRM→EXC, responses). The reference
//! transport used OS FIFOs; this crate treats the wire substrate as an
//! external collaborator (spec.md §6) and only fixes the framing.

use serde::{Deserialize, Serialize};

/// `RTLIB_ExitCode`-equivalent response code carried by every response
/// message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RtlibExitCode {
    Ok,
    Rejected,
    Timeout,
    Disabled,
}

/// Fixed 8-byte header preceding every message on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcHeader {
    /// Identifies a pending transaction; echoed in the matching response.
    pub token: u32,
    pub msg_type: u8,
    pub app_pid: i32,
    pub exc_id: u8,
}

/// Every message family named in spec.md §6, tagged for `serde_json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum RpcMessage {
    // EXC → RTRM
    Pair { rtlib_version: String },
    Exit,
    RegisterExc { name: String, recipe: String, priority: u8 },
    UnregisterExc,
    SetConstraint { path: String, bound: String, value: u64 },
    ClearConstraint { path: String, bound: String },
    StartRequest,
    StopRequest,
    ScheduleRequest,
    GgapNotice { gap_percent: f64 },

    // RTRM → EXC
    StopExecution,
    PreChange { awm_id: u32 },
    SyncChange,
    DoChange { awm_id: u32 },
    PostChange,

    // Responses
    BbqResp { code: RtlibExitCode },
    AppResp { code: RtlibExitCode },
    PreChangeResp { code: RtlibExitCode, sync_latency_ms: u32 },
}

impl RpcMessage {
    /// Does this message belong to the response family? Responses outrank
    /// inbound requests in the proxy's priority queue (spec.md §4.G).
    pub fn is_response(&self) -> bool {
        matches!(self, RpcMessage::BbqResp { .. } | RpcMessage::AppResp { .. } | RpcMessage::PreChangeResp { .. })
    }
}
