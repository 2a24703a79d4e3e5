use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use std::net::SocketAddr;
use crate::sequencing::SequenceId;

/// The seam between the transport core and the application layer: deliverable
///  payloads, ack notifications and heartbeats are pushed through this trait.
///  Implementations must not block - they typically enqueue into the
///  application's receive queue.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MessageDispatcher: Send + Sync + 'static {
    /// a payload that passed the channel's delivery guarantee
    async fn on_message(&self, peer_addr: SocketAddr, channel_id: u8, msg_buf: &[u8]);

    /// a reliable message sent with a nonzero notification key was acknowledged
    ///  by the peer
    async fn on_notify(&self, peer_addr: SocketAddr, channel_id: u8, notification_key: u64);

    /// a heartbeat arrived; liveness bookkeeping is the connection layer's job
    async fn on_heartbeat(&self, peer_addr: SocketAddr, sequence: SequenceId);
}
