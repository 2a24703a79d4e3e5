use async_trait::async_trait;
use bytes::BufMut;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;
use crate::buffers::memory_pool::{MemoryPool, PointerSet};
use crate::channel::{Channel, ChannelKind};
use crate::channel_router::Outbound;
use crate::config::EffectiveChannelConfig;
use crate::error::TransportError;
use crate::wire::{pack_header_byte, MessageFlags, MessageType, DATA_HEADER_LEN};

/// Fire-and-forget: no sequencing, no dedup, no acks. The only state is the
///  identity binding, but the two-lock discipline is kept so `release`/`assign`
///  behave uniformly across all variants.
pub struct UnreliableChannel {
    send: RwLock<SendHalf>,
    recv: RwLock<RecvHalf>,
    pool: Arc<MemoryPool>,
    outbound: Arc<Outbound>,
}

struct SendHalf {
    channel_id: u8,
    peer_addr: SocketAddr,
    config: Arc<EffectiveChannelConfig>,
}

struct RecvHalf {
    channel_id: u8,
}

impl UnreliableChannel {
    pub fn new(
        channel_id: u8,
        peer_addr: SocketAddr,
        config: Arc<EffectiveChannelConfig>,
        pool: Arc<MemoryPool>,
        outbound: Arc<Outbound>,
    ) -> UnreliableChannel {
        UnreliableChannel {
            send: RwLock::new(SendHalf {
                channel_id,
                peer_addr,
                config,
            }),
            recv: RwLock::new(RecvHalf {
                channel_id,
            }),
            pool,
            outbound,
        }
    }
}

#[async_trait]
impl Channel for UnreliableChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Unreliable
    }

    async fn create_outgoing_message(&self, payload: &[u8], no_merge: bool, _notification_key: u64) -> Result<(), TransportError> {
        let send = self.send.write().await;

        let max_payload_len = send.config.mtu - DATA_HEADER_LEN;
        if payload.len() > max_payload_len {
            debug!("dropping oversized unreliable message for channel {} with {:?}", send.channel_id, send.peer_addr);
            return Err(TransportError::PayloadTooLarge {
                payload_len: payload.len(),
                max_payload_len,
            });
        }

        let mut buf = self.pool.alloc(DATA_HEADER_LEN + payload.len())?;
        buf.put_u8(pack_header_byte(MessageType::Data, MessageFlags::empty()));
        buf.put_u8(send.channel_id);
        buf.put_slice(payload);

        let mut pointers = self.pool.alloc_pointer_set(1);
        pointers.push(buf);
        self.outbound.send_message(send.peer_addr, pointers, no_merge).await;
        Ok(())
    }

    async fn handle_incoming_message_poll(&self, msg_buf: &[u8]) -> Option<PointerSet> {
        let _recv = self.recv.read().await;

        // no sequencing state: everything that arrives is deliverable
        let Ok(mut buf) = self.pool.alloc(msg_buf.len()) else {
            return None;
        };
        buf.put_slice(msg_buf);

        let mut pointers = self.pool.alloc_pointer_set(1);
        pointers.push(buf);
        Some(pointers)
    }

    async fn handle_ack(&self, _ack_buf: &[u8]) {
        // unreliable messages have no acks
    }

    async fn internal_update(&self) -> bool {
        // nothing to resend, nothing can time out
        false
    }

    async fn release(&self) {
        let _send = self.send.write().await;
        let _recv = self.recv.write().await;
        // no sequencing state to zero
    }

    async fn assign(&self, channel_id: u8, peer_addr: SocketAddr, config: Arc<EffectiveChannelConfig>) {
        let mut send = self.send.write().await;
        let mut recv = self.recv.write().await;

        send.channel_id = channel_id;
        send.peer_addr = peer_addr;
        send.config = config;
        recv.channel_id = channel_id;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::predicate::eq;
    use rstest::*;
    use tokio::runtime::Builder;
    use crate::send_pipeline::{MockSendSocket, SendPipeline};

    fn test_config(mtu: usize) -> Arc<EffectiveChannelConfig> {
        let mut config = crate::config::RudpConfig::default_ipv4();
        config.mtu = mtu;
        Arc::new(config.get_effective_channel_config(4))
    }

    fn new_channel_with_socket(send_socket: MockSendSocket, mtu: usize) -> UnreliableChannel {
        let pool = Arc::new(MemoryPool::new(4096, 16));
        let outbound = Arc::new(Outbound::new(
            mtu,
            Arc::new(SendPipeline::new(Arc::new(send_socket))),
            pool.clone(),
        ));
        UnreliableChannel::new(4, SocketAddr::from(([1, 2, 3, 4], 9)), test_config(mtu), pool, outbound)
    }

    #[rstest]
    #[case::empty(vec![], vec![1, 4])]
    #[case::simple(vec![7, 8, 9], vec![1, 4, 7, 8, 9])]
    fn test_create_outgoing_message(#[case] payload: Vec<u8>, #[case] expected_packet: Vec<u8>) {
        let mut send_socket = MockSendSocket::new();
        send_socket.expect_do_send_packet()
            .once()
            .with(eq(SocketAddr::from(([1, 2, 3, 4], 9))), eq(expected_packet))
            .return_const(());

        let channel = new_channel_with_socket(send_socket, 100);

        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async move {
            channel.create_outgoing_message(&payload, true, 0).await.unwrap();
        });
    }

    #[test]
    fn test_create_outgoing_message_too_large() {
        let channel = new_channel_with_socket(MockSendSocket::new(), 100);

        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async move {
            let result = channel.create_outgoing_message(&[0u8; 99], true, 0).await;
            assert_eq!(result, Err(TransportError::PayloadTooLarge {
                payload_len: 99,
                max_payload_len: 98,
            }));
        });
    }

    #[test]
    fn test_handle_incoming_delivers_everything() {
        let channel = new_channel_with_socket(MockSendSocket::new(), 100);

        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async move {
            for _ in 0..2 {
                // even an identical message is delivered again - no dedup
                let pointers = channel.handle_incoming_message_poll(&[5, 6, 7]).await.unwrap();
                assert_eq!(pointers.iter().map(|b| b.as_ref().to_vec()).collect::<Vec<_>>(),
                           vec![vec![5, 6, 7]]);
            }

            assert!(!channel.internal_update().await);
        });
    }
}
