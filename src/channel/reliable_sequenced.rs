use async_trait::async_trait;
use bytes::{Buf, BufMut};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, trace, warn};
use crate::buffers::heap_buf::HeapBuf;
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

/// Reliable delivery in the issuer's order: out-of-order arrivals are
///  withheld in a pending window until the gap below them fills, then flushed
///  consecutively. Messages are never delivered out of order on this variant;
///  a gap that never fills surfaces as the *sender's* retry exhaustion, since
///  the reverse ack path keeps retransmission going until then.
pub struct ReliableSequencedChannel {
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
    /// everything at or below this has been handed to the application
    last_delivered_sequence: SequenceId,
    /// out-of-order arrivals waiting for their gap to fill; doubles as the
    ///  dedup record above the watermark
    pending: SlidingWindow<HeapBuf>,
}

impl RecvHalf {
    fn is_received(&self, sequence: SequenceId) -> bool {
        !sequence.is_newer_than(self.last_delivered_sequence) || self.pending.contains(sequence)
    }
}

impl ReliableSequencedChannel {
    pub fn new(
        channel_id: u8,
        peer_addr: SocketAddr,
        config: Arc<EffectiveChannelConfig>,
        pool: Arc<MemoryPool>,
        outbound: Arc<Outbound>,
        dispatcher: Arc<dyn MessageDispatcher>,
    ) -> ReliableSequencedChannel {
        let window_size = config.reliability_window_size;
        ReliableSequencedChannel {
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
                last_delivered_sequence: SequenceId::ZERO,
                pending: SlidingWindow::new(window_size),
            }),
            pool,
            outbound,
            dispatcher,
        }
    }

    async fn send_ack(&self, recv: &RecvHalf, base: SequenceId) {
        send_ack_field(
            &self.pool, &self.outbound,
            recv.channel_id, recv.peer_addr, recv.config.ack_mask_bytes,
            base,
            |sequence| recv.is_received(sequence),
        ).await;
    }
}

#[async_trait]
impl Channel for ReliableSequencedChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::ReliableSequenced
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

        let distance = sequence.distance(recv.last_delivered_sequence) as i32;

        if distance <= 0 {
            trace!("channel {}: discarding already-delivered message #{}", recv.channel_id, sequence);
            self.send_ack(&recv, sequence).await;
            return None;
        }

        if distance > recv.pending.capacity() as i32 {
            // beyond what the pending window can hold; not acked, so the
            //  sender keeps retransmitting until the window catches up
            debug!("channel {}: message #{} is {} ahead of the delivery watermark #{} - dropping unbuffered",
                   recv.channel_id, sequence, distance, recv.last_delivered_sequence);
            return None;
        }

        if recv.pending.contains(sequence) {
            trace!("channel {}: discarding duplicate buffered message #{}", recv.channel_id, sequence);
            self.send_ack(&recv, sequence).await;
            return None;
        }

        if distance == 1 {
            // in order: deliver it plus every consecutive buffered successor
            recv.last_delivered_sequence = sequence;

            let Ok(mut buf) = self.pool.alloc(parse_buf.len()) else {
                return None;
            };
            buf.put_slice(parse_buf);

            let mut pointers = self.pool.alloc_pointer_set(1);
            pointers.push(buf);
            loop {
                let next = recv.last_delivered_sequence.next();
                match recv.pending.remove(next) {
                    Some(buffered) => {
                        trace!("channel {}: gap filled, flushing buffered message #{}", recv.channel_id, next);
                        pointers.push(buffered);
                        recv.last_delivered_sequence = next;
                    }
                    None => break,
                }
            }

            self.send_ack(&recv, sequence).await;
            return Some(pointers);
        }

        // a gap below this message is still open: withhold from delivery
        trace!("channel {}: buffering out-of-order message #{} (watermark #{})",
               recv.channel_id, sequence, recv.last_delivered_sequence);
        let Ok(mut buf) = self.pool.alloc(parse_buf.len()) else {
            return None;
        };
        buf.put_slice(parse_buf);
        if let Some((evicted_sequence, evicted)) = recv.pending.set(sequence, buf) {
            warn!("channel {}: buffered message #{} evicted by #{} - this should not happen within the window bound",
                  recv.channel_id, evicted_sequence, sequence);
            self.pool.release(evicted);
        }
        self.send_ack(&recv, sequence).await;
        None
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

        recv.last_delivered_sequence = SequenceId::ZERO;
        for (_, buffered) in recv.pending.drain() {
            self.pool.release(buffered);
        }
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
        recv.pending = SlidingWindow::new(config.reliability_window_size);
        recv.config = config;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::predicate::eq;
    use rstest::*;
    use std::time::Duration;
    use tokio::runtime::Builder;
    use crate::message_dispatcher::MockMessageDispatcher;
    use crate::send_pipeline::{MockSendSocket, SendPipeline};

    fn peer() -> SocketAddr {
        SocketAddr::from(([1, 2, 3, 4], 9))
    }

    fn test_config() -> Arc<EffectiveChannelConfig> {
        Arc::new(EffectiveChannelConfig {
            mtu: 100,
            reliability_window_size: 16,
            max_fragments: 8,
            retransmit_timeout: Duration::from_millis(100),
            max_retries: 3,
            assembly_timeout: Duration::from_secs(1),
            ack_mask_bytes: 4,
        })
    }

    fn new_channel_with_mocks(send_socket: MockSendSocket) -> ReliableSequencedChannel {
        let pool = Arc::new(MemoryPool::new(4096, 16));
        let outbound = Arc::new(Outbound::new(
            100,
            Arc::new(SendPipeline::new(Arc::new(send_socket))),
            pool.clone(),
        ));
        ReliableSequencedChannel::new(4, peer(), test_config(), pool, outbound, Arc::new(MockMessageDispatcher::new()))
    }

    async fn receive(channel: &ReliableSequencedChannel, raw_seq: u16) -> Vec<u16> {
        let mut msg = raw_seq.to_le_bytes().to_vec();
        msg.extend_from_slice(&raw_seq.to_le_bytes()); // payload identifies the message
        match channel.handle_incoming_message_poll(&msg).await {
            Some(pointers) => pointers.iter()
                .map(|b| u16::from_le_bytes([b.as_ref()[0], b.as_ref()[1]]))
                .collect(),
            None => vec![],
        }
    }

    /// delivery never leaves the issuer's order: out-of-order arrivals are
    ///  withheld until the gap fills, then flushed in one batch
    #[rstest]
    #[case::in_order(vec![1, 2, 3], vec![vec![1], vec![2], vec![3]])]
    #[case::simple_gap(vec![2, 1, 3], vec![vec![], vec![1, 2], vec![3]])]
    #[case::longer_gap(vec![2, 3, 4, 1], vec![vec![], vec![], vec![], vec![1, 2, 3, 4]])]
    #[case::two_gaps(vec![2, 4, 1, 3], vec![vec![], vec![], vec![1, 2], vec![3, 4]])]
    #[case::duplicate_buffered(vec![2, 2, 1], vec![vec![], vec![], vec![1, 2]])]
    #[case::duplicate_delivered(vec![1, 1, 2], vec![vec![1], vec![], vec![2]])]
    fn test_in_order_delivery(#[case] arrivals: Vec<u16>, #[case] expected: Vec<Vec<u16>>) {
        let mut send_socket = MockSendSocket::new();
        send_socket.expect_do_send_packet().return_const(()); // acks

        let channel = new_channel_with_mocks(send_socket);

        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async move {
            for (raw_seq, expected_batch) in arrivals.into_iter().zip(expected) {
                assert_eq!(receive(&channel, raw_seq).await, expected_batch,
                           "unexpected delivery batch for arrival #{}", raw_seq);
            }
        });
    }

    #[test]
    fn test_too_far_ahead_is_dropped_without_ack() {
        let mut send_socket = MockSendSocket::new();
        // only the ack for #1 - the out-of-window #30 must not be acked
        send_socket.expect_do_send_packet()
            .with(eq(peer()), eq(vec![2u8, 4, 1, 0, 0, 0, 0, 0]))
            .once()
            .return_const(());

        let channel = new_channel_with_mocks(send_socket);

        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async move {
            assert_eq!(receive(&channel, 1).await, vec![1]);
            assert_eq!(receive(&channel, 30).await, Vec::<u16>::new());
        });
    }

    #[test]
    fn test_ack_mask_covers_buffered_messages() {
        let mut send_socket = MockSendSocket::new();
        // #2 buffered: ack base 2, mask empty (1 not yet received)
        send_socket.expect_do_send_packet()
            .with(eq(peer()), eq(vec![2u8, 4, 2, 0, 0, 0, 0, 0]))
            .once()
            .return_const(());
        // #4 buffered: ack base 4, mask has bit 1 set (#2 received), bits 0 and 2 clear
        send_socket.expect_do_send_packet()
            .with(eq(peer()), eq(vec![2u8, 4, 4, 0, 0b10, 0, 0, 0]))
            .once()
            .return_const(());
        // #1 fills the gap: ack base 1, mask empty; #2 flushes with it
        send_socket.expect_do_send_packet()
            .with(eq(peer()), eq(vec![2u8, 4, 1, 0, 0, 0, 0, 0]))
            .once()
            .return_const(());

        let channel = new_channel_with_mocks(send_socket);

        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async move {
            assert_eq!(receive(&channel, 2).await, Vec::<u16>::new());
            assert_eq!(receive(&channel, 4).await, Vec::<u16>::new());
            assert_eq!(receive(&channel, 1).await, vec![1, 2]);
        });
    }

    #[test]
    fn test_release_drops_buffered_messages() {
        let mut send_socket = MockSendSocket::new();
        send_socket.expect_do_send_packet().return_const(());

        let channel = new_channel_with_mocks(send_socket);

        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async move {
            assert_eq!(receive(&channel, 2).await, Vec::<u16>::new());

            channel.release().await;
            channel.assign(4, peer(), test_config()).await;

            // the buffered #2 is gone; a fresh #1 delivers alone
            assert_eq!(receive(&channel, 1).await, vec![1]);
            // and #2 arrives again as a new message
            assert_eq!(receive(&channel, 2).await, vec![2]);
        });
    }
}
