use async_trait::async_trait;
use bytes::{Buf, BufMut};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, trace, warn};
use crate::buffers::memory_pool::{MemoryPool, PointerSet};
use crate::channel::send_window::SendWindow;
use crate::channel::{send_ack_field, Channel, ChannelKind};
use crate::channel_router::Outbound;
use crate::config::EffectiveChannelConfig;
use crate::error::TransportError;
use crate::message_dispatcher::MessageDispatcher;
use crate::sequencing::SequenceId;
use crate::sliding_window::SlidingWindow;
use crate::wire::{pack_header_byte, MessageFlags, MessageType, SEQUENCED_HEADER_LEN};

/// Reliable, unordered delivery: every message is retained and resent until
///  acknowledged, but arrivals are delivered in whatever order they show up.
pub struct ReliableChannel {
    send: RwLock<SendHalf>,
    recv: RwLock<RecvHalf>,
    pool: Arc<MemoryPool>,
    outbound: Arc<Outbound>,
    dispatcher: Arc<dyn MessageDispatcher>,
}

struct SendHalf {
    channel_id: u8,
    peer_addr: SocketAddr,
    config: Arc<EffectiveChannelConfig>,
    window: SendWindow,
}

struct RecvHalf {
    channel_id: u8,
    peer_addr: SocketAddr,
    config: Arc<EffectiveChannelConfig>,
    highest_received_sequence: SequenceId,
    received: SlidingWindow<bool>,
}

impl ReliableChannel {
    pub fn new(
        channel_id: u8,
        peer_addr: SocketAddr,
        config: Arc<EffectiveChannelConfig>,
        pool: Arc<MemoryPool>,
        outbound: Arc<Outbound>,
        dispatcher: Arc<dyn MessageDispatcher>,
    ) -> ReliableChannel {
        let window_size = config.reliability_window_size;
        ReliableChannel {
            send: RwLock::new(SendHalf {
                channel_id,
                peer_addr,
                config: config.clone(),
                window: SendWindow::new(window_size),
            }),
            recv: RwLock::new(RecvHalf {
                channel_id,
                peer_addr,
                config,
                highest_received_sequence: SequenceId::ZERO,
                received: SlidingWindow::new(window_size),
            }),
            pool,
            outbound,
            dispatcher,
        }
    }

    /// Acknowledges `base` and everything the receive window knows about below
    ///  it, within the mask width. Sent for duplicates too, so a lost ack is
    ///  repaired by the retransmission it failed to prevent.
    async fn send_ack(&self, recv: &RecvHalf, base: SequenceId) {
        send_ack_field(
            &self.pool, &self.outbound,
            recv.channel_id, recv.peer_addr, recv.config.ack_mask_bytes,
            base,
            |sequence| recv.received.contains(sequence),
        ).await;
    }
}

#[async_trait]
impl Channel for ReliableChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Reliable
    }

    async fn create_outgoing_message(&self, payload: &[u8], no_merge: bool, notification_key: u64) -> Result<(), TransportError> {
        let mut send = self.send.write().await;

        let max_payload_len = send.config.mtu - SEQUENCED_HEADER_LEN;
        if payload.len() > max_payload_len {
            debug!("dropping oversized message for channel {} with {:?}", send.channel_id, send.peer_addr);
            return Err(TransportError::PayloadTooLarge {
                payload_len: payload.len(),
                max_payload_len,
            });
        }

        let sequence = send.window.next_sequence();
        let mut buf = self.pool.alloc(SEQUENCED_HEADER_LEN + payload.len())?;
        buf.put_u8(pack_header_byte(MessageType::Data, MessageFlags::empty()));
        buf.put_u8(send.channel_id);
        buf.put_u16_le(sequence.to_raw());
        buf.put_slice(payload);

        self.outbound.send_retained(send.peer_addr, buf.as_ref(), no_merge).await;

        let channel_id = send.channel_id;
        send.window.commit(sequence, buf, notification_key, &self.pool, channel_id);
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

        let distance = sequence.distance(recv.highest_received_sequence) as i32;
        let deliverable = if distance > 0 {
            recv.highest_received_sequence = sequence;
            recv.received.set(sequence, true);
            true
        }
        else if distance <= -(recv.received.capacity() as i32) {
            // too old to verify against the window; it was either delivered
            //  long ago or is unrecoverable - ack it so the sender stops
            trace!("channel {}: discarding ancient message #{}", recv.channel_id, sequence);
            false
        }
        else if recv.received.contains(sequence) {
            trace!("channel {}: discarding duplicate message #{}", recv.channel_id, sequence);
            false
        }
        else {
            recv.received.set(sequence, true);
            true
        };

        self.send_ack(&recv, sequence).await;

        if !deliverable {
            return None;
        }

        let Ok(mut buf) = self.pool.alloc(parse_buf.len()) else {
            return None;
        };
        buf.put_slice(parse_buf);

        let mut pointers = self.pool.alloc_pointer_set(1);
        pointers.push(buf);
        Some(pointers)
    }

    async fn handle_ack(&self, ack_buf: &[u8]) {
        let mut send = self.send.write().await;

        let (channel_id, peer_addr, config) = (send.channel_id, send.peer_addr, send.config.clone());
        send.window.process_ack(ack_buf, &config, &self.pool, &self.dispatcher, channel_id, peer_addr).await;
    }

    async fn internal_update(&self) -> bool {
        let mut send = self.send.write().await;

        let (channel_id, peer_addr, config) = (send.channel_id, send.peer_addr, send.config.clone());
        send.window.retransmit_due(&config, &self.outbound, channel_id, peer_addr).await
    }

    async fn release(&self) {
        let mut send = self.send.write().await;
        let mut recv = self.recv.write().await;

        send.window.reset(&self.pool);

        recv.highest_received_sequence = SequenceId::ZERO;
        recv.received.drain().for_each(drop);
    }

    async fn assign(&self, channel_id: u8, peer_addr: SocketAddr, config: Arc<EffectiveChannelConfig>) {
        let mut send = self.send.write().await;
        let mut recv = self.recv.write().await;

        send.channel_id = channel_id;
        send.peer_addr = peer_addr;
        send.window.resize(config.reliability_window_size);
        send.config = config.clone();

        recv.channel_id = channel_id;
        recv.peer_addr = peer_addr;
        recv.received = SlidingWindow::new(config.reliability_window_size);
        recv.config = config;
    }
}
