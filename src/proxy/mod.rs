//! Application Proxy: the transport-facing half of the core.
//!
//! Grounded on `bbque/application_proxy.cc`: a `pid → connection` map, pairing
//! performed synchronously on the dispatcher path so transport-owned
//! resources attach before anything else touches the connection, and
//! every other inbound message fanned out to per-request handling. The
//! inbound priority queue is grounded on the teacher's
//! `scheduler/queue.rs` `BinaryHeap`-backed `SchedulerQueue`: here,
//! response messages (`BBQ_RESP`, `APP_RESP`, `PreChangeResp`) outrank
//! inbound requests so the sync protocol makes progress under registration
//! load (spec.md §4.G).

pub mod channel;
pub mod dispatch;
pub mod protocol;

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::info;

use crate::error::ProxyError;
use crate::proxy::channel::RpcChannel;
use crate::proxy::protocol::{RpcHeader, RpcMessage};

/// One entry in the inbound priority queue: responses outrank requests,
/// ties broken FIFO by sequence number (monotonic, assigned at enqueue).
struct InboundEntry {
    header: RpcHeader,
    message: RpcMessage,
    seq: u64,
}

impl InboundEntry {
    fn priority(&self) -> u8 {
        if self.message.is_response() {
            1
        } else {
            0
        }
    }
}

impl Ord for InboundEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority().cmp(&other.priority()).then(other.seq.cmp(&self.seq))
    }
}
impl PartialOrd for InboundEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl PartialEq for InboundEntry {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}
impl Eq for InboundEntry {}

/// Per-application connection context: the channel plus whatever
/// transport-owned resources pairing attached (kept abstract — a real
/// transport might stash file descriptors here).
pub struct Connection {
    pub pid: i32,
    pub channel: Arc<dyn RpcChannel>,
}

/// Pool of worker dispatch state: a `pid → connection` map and an inbound
/// priority queue fed by the dispatcher.
pub struct ApplicationProxy {
    connections: Mutex<HashMap<i32, Connection>>,
    inbound: Mutex<BinaryHeap<InboundEntry>>,
    next_seq: Mutex<u64>,
}

impl ApplicationProxy {
    pub fn new() -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
            inbound: Mutex::new(BinaryHeap::new()),
            next_seq: Mutex::new(0),
        }
    }

    /// Handle an `APP_PAIR` message on the dispatcher path: synchronously
    /// register the connection before anything else can reference it.
    pub async fn pair(&self, pid: i32, channel: Arc<dyn RpcChannel>) {
        self.connections.lock().await.insert(pid, Connection { pid, channel });
        info!(pid, "application paired");
    }

    /// Handle an `APP_EXIT` message: release the connection. The caller
    /// (resource manager control loop) is responsible for reclaiming any
    /// EXC resources this pid held.
    pub async fn exit(&self, pid: i32) {
        self.connections.lock().await.remove(&pid);
        info!(pid, "application exited, connection released");
    }

    pub async fn connection(&self, pid: i32) -> Option<Arc<dyn RpcChannel>> {
        self.connections.lock().await.get(&pid).map(|c| c.channel.clone())
    }

    pub async fn send(&self, pid: i32, header: RpcHeader, message: RpcMessage) -> Result<(), ProxyError> {
        let channel = self.connection(pid).await.ok_or(ProxyError::UnknownPid(pid))?;
        channel.send(header, message).await
    }

    /// Feed a dispatcher-observed inbound message into the priority queue;
    /// a pool of per-request workers drains it.
    pub async fn dispatch(&self, header: RpcHeader, message: RpcMessage) {
        let mut seq_guard = self.next_seq.lock().await;
        let seq = *seq_guard;
        *seq_guard += 1;
        drop(seq_guard);
        self.inbound.lock().await.push(InboundEntry { header, message, seq });
    }

    /// Pop the highest-priority inbound message (a response, if any is
    /// queued; otherwise the oldest request).
    pub async fn next_inbound(&self) -> Option<(RpcHeader, RpcMessage)> {
        self.inbound.lock().await.pop().map(|e| (e.header, e.message))
    }

    pub async fn inbound_len(&self) -> usize {
        self.inbound.lock().await.len()
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.lock().await.len()
    }
}

impl Default for ApplicationProxy {
    fn default() -> Self {
        Self::new()
    }
}

pub type SharedApplicationProxy = Arc<ApplicationProxy>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::channel::InProcessChannel;
    use crate::proxy::protocol::RtlibExitCode;

    fn header(pid: i32, t: u8) -> RpcHeader {
        RpcHeader { token: 0, msg_type: t, app_pid: pid, exc_id: 0 }
    }

    #[tokio::test]
    async fn pair_then_exit_manages_connection_map() {
        let proxy = ApplicationProxy::new();
        let (core, _app) = InProcessChannel::pair();
        proxy.pair(42, Arc::new(core)).await;
        assert_eq!(proxy.connection_count().await, 1);
        proxy.exit(42).await;
        assert_eq!(proxy.connection_count().await, 0);
    }

    #[tokio::test]
    async fn responses_outrank_requests_in_inbound_queue() {
        let proxy = ApplicationProxy::new();
        proxy.dispatch(header(1, 0), RpcMessage::StartRequest).await;
        proxy
            .dispatch(header(1, 1), RpcMessage::BbqResp { code: RtlibExitCode::Ok })
            .await;
        proxy.dispatch(header(1, 0), RpcMessage::StopRequest).await;

        let (_, first) = proxy.next_inbound().await.unwrap();
        assert!(first.is_response());
        let (_, second) = proxy.next_inbound().await.unwrap();
        assert!(!second.is_response());
    }

    #[tokio::test]
    async fn send_fails_for_unknown_pid() {
        let proxy = ApplicationProxy::new();
        let err = proxy.send(99, header(99, 0), RpcMessage::StopExecution).await.unwrap_err();
        assert!(matches!(err, ProxyError::UnknownPid(99)));
    }
}
