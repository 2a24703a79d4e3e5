use async_trait::async_trait;
use bytes::{Buf, BufMut};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, trace, warn};
use crate::buffers::memory_pool::{MemoryPool, PointerSet};
use crate::channel::{Channel, ChannelKind};
use crate::channel_router::Outbound;
use crate::config::EffectiveChannelConfig;
use crate::error::TransportError;
use crate::sequencing::SequenceId;
use crate::wire::{pack_header_byte, MessageFlags, MessageType, SEQUENCED_HEADER_LEN};

/// Unreliable delivery that never goes backwards: a message older than the
///  newest one already delivered is discarded, not reordered. There is no
///  buffering - a late arrival is simply gone.
pub struct UnreliableOrderedChannel {
    send: RwLock<SendHalf>,
    recv: RwLock<RecvHalf>,
    pool: Arc<MemoryPool>,
    outbound: Arc<Outbound>,
}

struct SendHalf {
    channel_id: u8,
    peer_addr: SocketAddr,
    config: Arc<EffectiveChannelConfig>,
    last_outbound_sequence: SequenceId,
}

struct RecvHalf {
    channel_id: u8,
    last_delivered_sequence: SequenceId,
}

impl UnreliableOrderedChannel {
    pub fn new(
        channel_id: u8,
        peer_addr: SocketAddr,
        config: Arc<EffectiveChannelConfig>,
        pool: Arc<MemoryPool>,
        outbound: Arc<Outbound>,
    ) -> UnreliableOrderedChannel {
        UnreliableOrderedChannel {
            send: RwLock::new(SendHalf {
                channel_id,
                peer_addr,
                config,
                last_outbound_sequence: SequenceId::ZERO,
            }),
            recv: RwLock::new(RecvHalf {
                channel_id,
                last_delivered_sequence: SequenceId::ZERO,
            }),
            pool,
            outbound,
        }
    }
}

#[async_trait]
impl Channel for UnreliableOrderedChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::UnreliableOrdered
    }

    async fn create_outgoing_message(&self, payload: &[u8], no_merge: bool, _notification_key: u64) -> Result<(), TransportError> {
        let mut send = self.send.write().await;

        let max_payload_len = send.config.mtu - SEQUENCED_HEADER_LEN;
        if payload.len() > max_payload_len {
            debug!("dropping oversized message for channel {} with {:?}", send.channel_id, send.peer_addr);
            return Err(TransportError::PayloadTooLarge {
                payload_len: payload.len(),
                max_payload_len,
            });
        }

        let sequence = send.last_outbound_sequence.next();
        let mut buf = self.pool.alloc(SEQUENCED_HEADER_LEN + payload.len())?;
        buf.put_u8(pack_header_byte(MessageType::Data, MessageFlags::empty()));
        buf.put_u8(send.channel_id);
        buf.put_u16_le(sequence.to_raw());
        buf.put_slice(payload);

        let mut pointers = self.pool.alloc_pointer_set(1);
        pointers.push(buf);
        self.outbound.send_message(send.peer_addr, pointers, no_merge).await;

        send.last_outbound_sequence = sequence;
        Ok(())
    }

    async fn handle_incoming_message_poll(&self, msg_buf: &[u8]) -> Option<PointerSet> {
        let mut parse_buf = msg_buf;
        let sequence = match parse_buf.try_get_u16_le() {
            Ok(raw) => SequenceId::from_raw(raw),
            Err(_) => {
                warn!("received data message with truncated sequence header - dropping");
                return None;
            }
        };

        let mut recv = self.recv.write().await;

        if !sequence.is_newer_than(recv.last_delivered_sequence) {
            trace!("channel {}: discarding stale message #{} (newest delivered is #{})",
                   recv.channel_id, sequence, recv.last_delivered_sequence);
            return None;
        }
        recv.last_delivered_sequence = sequence;

        let Ok(mut buf) = self.pool.alloc(parse_buf.len()) else {
            return None;
        };
        buf.put_slice(parse_buf);

        let mut pointers = self.pool.alloc_pointer_set(1);
        pointers.push(buf);
        Some(pointers)
    }

    async fn handle_ack(&self, _ack_buf: &[u8]) {
        // unreliable messages have no acks
    }

    async fn internal_update(&self) -> bool {
        false
    }

    async fn release(&self) {
        let mut send = self.send.write().await;
        let mut recv = self.recv.write().await;

        send.last_outbound_sequence = SequenceId::ZERO;
        recv.last_delivered_sequence = SequenceId::ZERO;
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
