use async_trait::async_trait;
use bytes::{Buf, BufMut};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, trace, warn};
use crate::buffers::heap_buf::HeapBuf;
use crate::buffers::memory_pool::{MemoryPool, PointerSet};
use crate::channel::{Channel, ChannelKind};
use crate::channel_router::Outbound;
use crate::config::EffectiveChannelConfig;
use crate::error::TransportError;
use crate::sequencing::SequenceId;
use crate::sliding_window::SlidingWindow;
use crate::wire::{pack_header_byte, MessageFlags, MessageType, SEQUENCED_HEADER_LEN};

/// Unreliable delivery with duplicate detection, where 'stale' is judged
///  against what the application has actually *consumed* rather than what has
///  arrived: the acceptance watermark is `last_poll_sequence`, advanced
///  explicitly via [UnreliableSequencedChannel::set_last_poll_sequence] when the
///  application drains its queue. A slow consumer therefore does not cause
///  legitimate newer packets to be discarded merely because older ones are
///  still queued.
///
/// This channel also mints heartbeat messages for its connection - heartbeats
///  share the channel's outgoing sequence space.
pub struct UnreliableSequencedChannel {
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
    /// the newest sequence accepted so far; becomes the poll watermark when
    ///  the application reports having caught up
    lowest_acked_sequence: SequenceId,
    /// the acceptance watermark - only messages newer than this are delivered
    last_poll_sequence: SequenceId,
    /// duplicate detection, distinct from the ordering watermarks
    acked_packets: SlidingWindow<bool>,
}

impl UnreliableSequencedChannel {
    pub fn new(
        channel_id: u8,
        peer_addr: SocketAddr,
        config: Arc<EffectiveChannelConfig>,
        pool: Arc<MemoryPool>,
        outbound: Arc<Outbound>,
    ) -> UnreliableSequencedChannel {
        let window_size = config.reliability_window_size;
        UnreliableSequencedChannel {
            send: RwLock::new(SendHalf {
                channel_id,
                peer_addr,
                config,
                last_outbound_sequence: SequenceId::ZERO,
            }),
            recv: RwLock::new(RecvHalf {
                channel_id,
                lowest_acked_sequence: SequenceId::ZERO,
                last_poll_sequence: SequenceId::ZERO,
                acked_packets: SlidingWindow::new(window_size),
            }),
            pool,
            outbound,
        }
    }

    /// Marks everything accepted so far as consumed by the application. Called
    ///  by the layer that owns the receive queue, *after* draining it.
    pub async fn set_last_poll_sequence(&self) {
        let mut recv = self.recv.write().await;
        recv.last_poll_sequence = recv.lowest_acked_sequence;
    }

    /// Builds a heartbeat message from this channel's sequence space. The
    ///  caller owns the returned buffer and is responsible for sending it and
    ///  returning it to the pool.
    pub async fn create_outgoing_heartbeat_message(&self) -> Result<HeapBuf, TransportError> {
        let mut send = self.send.write().await;

        let sequence = send.last_outbound_sequence.next();
        let mut buf = self.pool.alloc(3)?;
        buf.put_u8(pack_header_byte(MessageType::Heartbeat, MessageFlags::empty()));
        buf.put_u16_le(sequence.to_raw());

        send.last_outbound_sequence = sequence;
        Ok(buf)
    }
}

#[async_trait]
impl Channel for UnreliableSequencedChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::UnreliableSequenced
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

        if recv.acked_packets.contains(sequence) {
            trace!("channel {}: discarding duplicate message #{}", recv.channel_id, sequence);
            return None;
        }

        // the watermark is what was *polled*, not what arrived - see type docs
        if !sequence.is_newer_than(recv.last_poll_sequence) {
            trace!("channel {}: discarding message #{} at or below the poll watermark #{}",
                   recv.channel_id, sequence, recv.last_poll_sequence);
            return None;
        }

        recv.lowest_acked_sequence = sequence;
        recv.acked_packets.set(sequence, true);

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
        // nothing to resend, thus no internal work is required
        false
    }

    async fn release(&self) {
        let mut send = self.send.write().await;
        let mut recv = self.recv.write().await;

        send.last_outbound_sequence = SequenceId::ZERO;
        recv.lowest_acked_sequence = SequenceId::ZERO;
        recv.last_poll_sequence = SequenceId::ZERO;
        recv.acked_packets.drain().for_each(drop);
    }

    async fn assign(&self, channel_id: u8, peer_addr: SocketAddr, config: Arc<EffectiveChannelConfig>) {
        let mut send = self.send.write().await;
        let mut recv = self.recv.write().await;

        send.channel_id = channel_id;
        send.peer_addr = peer_addr;
        recv.channel_id = channel_id;
        recv.acked_packets = SlidingWindow::new(config.reliability_window_size);
        send.config = config;
    }
}
