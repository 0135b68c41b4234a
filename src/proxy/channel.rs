//! The transport trait boundary, plus a minimal in-process implementation
//! for the control loop and tests to exercise the protocol without a real
//! socket.
//!
//! Grounded on spec.md §1/§6: "the wire substrate is not fixed by this
//! core." The reference implementation used OS FIFOs
//! (`include/bbque/rpc_fifo_server.h`); an in-process channel plays the
//! same structural role here.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::ProxyError;
use crate::proxy::protocol::{RpcHeader, RpcMessage};

/// A bidirectional, reliable, framed message channel to one application.
/// Conformance fixes only the framing (header + typed payload), not the
/// concrete substrate.
#[async_trait]
pub trait RpcChannel: Send + Sync {
    async fn send(&self, header: RpcHeader, message: RpcMessage) -> Result<(), ProxyError>;
    async fn recv(&self) -> Option<(RpcHeader, RpcMessage)>;
}

/// In-process channel backed by an mpsc pair — stands in for a real FIFO
/// or socket in tests and the reference control loop.
pub struct InProcessChannel {
    outbound: mpsc::UnboundedSender<(RpcHeader, RpcMessage)>,
    inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<(RpcHeader, RpcMessage)>>,
}

impl InProcessChannel {
    /// Build a connected pair: whatever is sent on one side's `send` shows
    /// up on the other side's `recv`.
    pub fn pair() -> (Self, Self) {
        let (tx_a, rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();
        (
            Self { outbound: tx_a, inbound: tokio::sync::Mutex::new(rx_b) },
            Self { outbound: tx_b, inbound: tokio::sync::Mutex::new(rx_a) },
        )
    }
}

#[async_trait]
impl RpcChannel for InProcessChannel {
    async fn send(&self, header: RpcHeader, message: RpcMessage) -> Result<(), ProxyError> {
        self.outbound
            .send((header, message))
            .map_err(|_| ProxyError::UnknownPid(header.app_pid))
    }

    async fn recv(&self) -> Option<(RpcHeader, RpcMessage)> {
        self.inbound.lock().await.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::protocol::RtlibExitCode;

    #[tokio::test]
    async fn paired_channel_delivers_messages() {
        let (core, app) = InProcessChannel::pair();
        let header = RpcHeader { token: 1, msg_type: 0, app_pid: 42, exc_id: 0 };
        core.send(header, RpcMessage::PreChange { awm_id: 3 }).await.unwrap();
        let (recv_header, recv_msg) = app.recv().await.unwrap();
        assert_eq!(recv_header, header);
        assert!(matches!(recv_msg, RpcMessage::PreChange { awm_id: 3 }));

        app.send(header, RpcMessage::PreChangeResp { code: RtlibExitCode::Ok, sync_latency_ms: 5 })
            .await
            .unwrap();
        let (_, reply) = core.recv().await.unwrap();
        assert!(matches!(reply, RpcMessage::PreChangeResp { sync_latency_ms: 5, .. }));
    }
}
