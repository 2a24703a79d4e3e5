use async_trait::async_trait;
use bytes::{Buf, BufMut};
use rustc_hash::FxHashMap;
use std::collections::hash_map::Entry;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::Instant;
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
use crate::wire::{pack_header_byte, FragmentInfo, MessageFlags, MessageType, FRAGMENT_HEADER_LEN};

/// Reliable, in-order delivery with fragmentation: payloads of any size (up
///  to `max_fragments` worth) split into per-datagram fragments, each with its
///  own channel sequence and individual reliability. A message id groups the
///  fragments; the receiver reassembles and delivers whole messages in
///  message-id order.
///
/// Partial assemblies are reclaimed after `assembly_timeout` to bound memory
///  under sustained loss. A reclaimed message is permanently lost (some of its
///  fragments were already acknowledged, so the sender will not close the gap)
///  and the delivery watermark skips past it.
pub struct ReliableFragmentedChannel {
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
    /// message ids wrap independently of the channel sequence space
    last_message_id: SequenceId,
}

struct RecvHalf {
    channel_id: u8,
    peer_addr: SocketAddr,
    config: Arc<EffectiveChannelConfig>,
    /// per-fragment dedup, identical in spirit to the plain reliable variant
    highest_received_sequence: SequenceId,
    received: SlidingWindow<bool>,
    assembler: FragmentAssembler,
}

impl ReliableFragmentedChannel {
    pub fn new(
        channel_id: u8,
        peer_addr: SocketAddr,
        config: Arc<EffectiveChannelConfig>,
        pool: Arc<MemoryPool>,
        outbound: Arc<Outbound>,
        dispatcher: Arc<dyn MessageDispatcher>,
    ) -> ReliableFragmentedChannel {
        let window_size = config.reliability_window_size;
        ReliableFragmentedChannel {
            send: RwLock::new(SendHalf {
                channel_id,
                peer_addr,
                config: config.clone(),
                window: SendWindow::new(window_size),
                last_message_id: SequenceId::ZERO,
            }),
            recv: RwLock::new(RecvHalf {
                channel_id,
                peer_addr,
                config,
                highest_received_sequence: SequenceId::ZERO,
                received: SlidingWindow::new(window_size),
                assembler: FragmentAssembler::new(),
            }),
            pool,
            outbound,
            dispatcher,
        }
    }
}

#[async_trait]
impl Channel for ReliableFragmentedChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::ReliableFragmentedSequenced
    }

    async fn create_outgoing_message(&self, payload: &[u8], no_merge: bool, notification_key: u64) -> Result<(), TransportError> {
        let mut send = self.send.write().await;

        let fragment_payload_len = send.config.mtu - FRAGMENT_HEADER_LEN;
        let num_fragments = payload.len().div_ceil(fragment_payload_len).max(1);
        if num_fragments > send.config.max_fragments {
            debug!("dropping message needing {} fragments for channel {} with {:?}", num_fragments, send.channel_id, send.peer_addr);
            return Err(TransportError::TooManyFragments {
                payload_len: payload.len(),
                num_fragments,
                max_fragments: send.config.max_fragments,
            });
        }

        let message_id = send.last_message_id.next();
        trace!("channel {}: sending message {} as {} fragments", send.channel_id, message_id, num_fragments);

        for fragment_index in 0..num_fragments {
            let chunk = &payload[fragment_index * fragment_payload_len
                ..payload.len().min((fragment_index + 1) * fragment_payload_len)];

            let sequence = send.window.next_sequence();
            let mut buf = self.pool.alloc(FRAGMENT_HEADER_LEN + chunk.len())?;
            buf.put_u8(pack_header_byte(MessageType::Data, MessageFlags::FRAGMENTED));
            buf.put_u8(send.channel_id);
            buf.put_u16_le(sequence.to_raw());
            FragmentInfo {
                message_id: message_id.to_raw(),
                fragment_index: fragment_index as u16,
                fragment_count: num_fragments as u16,
            }.ser(&mut buf);
            buf.put_slice(chunk);

            self.outbound.send_retained(send.peer_addr, buf.as_ref(), no_merge).await;

            // the notification key rides on the last fragment: its ack means
            //  the peer had (or has) everything needed to assemble
            let fragment_key = if fragment_index + 1 == num_fragments { notification_key } else { 0 };
            let channel_id = send.channel_id;
            send.window.commit(sequence, buf, fragment_key, &self.pool, channel_id);
        }

        send.last_message_id = message_id;
        Ok(())
    }

    async fn handle_incoming_message_poll(&self, msg_buf: &[u8]) -> Option<PointerSet> {
        let mut parse_buf = msg_buf;
        let sequence = match parse_buf.try_get_u16_le() {
            Ok(raw) => SequenceId::from_raw(raw),
            Err(_) => {
                warn!("received fragment with truncated sequence header - dropping");
                return None;
            }
        };
        let info = match FragmentInfo::deser(&mut parse_buf) {
            Ok(info) => info,
            Err(_) => {
                warn!("received fragment #{} with unparseable fragment header - dropping", sequence);
                return None;
            }
        };

        let mut recv = self.recv.write().await;

        // per-fragment dedup, as for the unfragmented reliable variant
        let distance = sequence.distance(recv.highest_received_sequence) as i32;
        let fresh = if distance > 0 {
            recv.highest_received_sequence = sequence;
            recv.received.set(sequence, true);
            true
        }
        else if distance <= -(recv.received.capacity() as i32) {
            trace!("channel {}: discarding ancient fragment #{}", recv.channel_id, sequence);
            false
        }
        else if recv.received.contains(sequence) {
            trace!("channel {}: discarding duplicate fragment #{}", recv.channel_id, sequence);
            false
        }
        else {
            recv.received.set(sequence, true);
            true
        };

        send_ack_field(
            &self.pool, &self.outbound,
            recv.channel_id, recv.peer_addr, recv.config.ack_mask_bytes,
            sequence,
            |s| recv.received.contains(s),
        ).await;

        if !fresh {
            return None;
        }

        let message_id = SequenceId::from_raw(info.message_id);
        if !message_id.is_newer_than(recv.assembler.last_delivered_message) {
            // late fragment of a message that was already delivered or
            //  reclaimed; the ack above stops its retransmission
            trace!("channel {}: discarding fragment of settled message {}", recv.channel_id, message_id);
            return None;
        }

        let channel_id = recv.channel_id;
        recv.assembler.accept(&self.pool, &info, parse_buf, channel_id);

        let ready = recv.assembler.drain_ready(channel_id);
        if ready.is_empty() {
            return None;
        }
        let mut pointers = self.pool.alloc_pointer_set(ready.len());
        for buf in ready {
            pointers.push(buf);
        }
        Some(pointers)
    }

    async fn handle_ack(&self, ack_buf: &[u8]) {
        let mut send = self.send.write().await;

        let (channel_id, peer_addr, config) = (send.channel_id, send.peer_addr, send.config.clone());
        send.window.process_ack(ack_buf, &config, &self.pool, &self.dispatcher, channel_id, peer_addr).await;
    }

    async fn internal_update(&self) -> bool {
        let timed_out = {
            let mut send = self.send.write().await;
            let (channel_id, peer_addr, config) = (send.channel_id, send.peer_addr, send.config.clone());
            send.window.retransmit_due(&config, &self.outbound, channel_id, peer_addr).await
        };

        // receive side: reclaim aged partial assemblies, and deliver whatever
        //  an expiry unblocked
        let mut recv = self.recv.write().await;
        let assembly_timeout = recv.config.assembly_timeout;
        let channel_id = recv.channel_id;
        let peer_addr = recv.peer_addr;

        recv.assembler.reclaim_expired(&self.pool, assembly_timeout, channel_id);
        for buf in recv.assembler.drain_ready(channel_id) {
            self.dispatcher.on_message(peer_addr, channel_id, buf.as_ref()).await;
            self.pool.release(buf);
        }

        timed_out
    }

    async fn release(&self) {
        let mut send = self.send.write().await;
        let mut recv = self.recv.write().await;

        send.window.reset(&self.pool);
        send.last_message_id = SequenceId::ZERO;

        recv.highest_received_sequence = SequenceId::ZERO;
        recv.received.drain().for_each(drop);
        recv.assembler.reset(&self.pool);
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

/// Per-message reassembly state. Completed messages wait here until their
///  message id is next in line, so delivery stays in the issuer's order.
struct FragmentAssembler {
    /// ids at or below this are settled: delivered, or reclaimed and skipped
    last_delivered_message: SequenceId,
    assemblies: FxHashMap<u16, AssemblyState>,
}

enum AssemblyState {
    Partial(Assembly),
    Complete(HeapBuf),
    /// reclaimed after aging out; the watermark passes it instead of waiting
    ///  for fragments that will never arrive again
    Expired,
}

struct Assembly {
    fragments: Vec<Option<HeapBuf>>,
    num_received: usize,
    created: Instant,
}

impl FragmentAssembler {
    fn new() -> FragmentAssembler {
        FragmentAssembler {
            last_delivered_message: SequenceId::ZERO,
            assemblies: FxHashMap::default(),
        }
    }

    /// Stores one (seq-deduped) fragment; concatenates the message once all
    ///  fragments are present.
    fn accept(&mut self, pool: &MemoryPool, info: &FragmentInfo, payload: &[u8], channel_id: u8) {
        let state = match self.assemblies.entry(info.message_id) {
            Entry::Occupied(e) => e.into_mut(),
            Entry::Vacant(e) => e.insert(AssemblyState::Partial(Assembly {
                fragments: (0..info.fragment_count).map(|_| None).collect(),
                num_received: 0,
                created: Instant::now(),
            })),
        };

        let assembly = match &mut *state {
            AssemblyState::Partial(assembly) => assembly,
            _ => {
                trace!("channel {}: fragment for settled message {} - dropping", channel_id, info.message_id);
                return;
            }
        };

        if assembly.fragments.len() != info.fragment_count as usize {
            warn!("channel {}: message {} declares {} fragments but was started with {} - this is a sender-side bug, dropping the assembly",
                  channel_id, info.message_id, info.fragment_count, assembly.fragments.len());
            Self::expire(pool, state);
            return;
        }

        let slot = &mut assembly.fragments[info.fragment_index as usize];
        if slot.is_some() {
            trace!("channel {}: duplicate fragment {}/{} for message {} - dropping", channel_id, info.fragment_index, info.fragment_count, info.message_id);
            return;
        }

        let Ok(mut buf) = pool.alloc(payload.len()) else {
            warn!("channel {}: fragment of {} bytes exceeds the pool block size - dropping the assembly", channel_id, payload.len());
            Self::expire(pool, state);
            return;
        };
        buf.put_slice(payload);
        *slot = Some(buf);
        assembly.num_received += 1;

        if assembly.num_received == assembly.fragments.len() {
            let total_len = assembly.fragments.iter()
                .map(|f| f.as_ref().map(|b| b.len()).unwrap_or(0))
                .sum();

            let mut assembled = match pool.alloc(total_len) {
                Ok(assembled) => assembled,
                Err(_) => {
                    warn!("channel {}: assembled message {} of {} bytes exceeds the pool block size - dropping it", channel_id, info.message_id, total_len);
                    Self::expire(pool, state);
                    return;
                }
            };
            for fragment in assembly.fragments.iter_mut() {
                let fragment = fragment.take()
                    .expect("all fragments are present, their count was just checked");
                assembled.put_slice(fragment.as_ref());
                pool.release(fragment);
            }

            trace!("channel {}: message {} complete with {} bytes", channel_id, info.message_id, total_len);
            *state = AssemblyState::Complete(assembled);
        }
    }

    /// Takes every completed message that is next in message-id order,
    ///  skipping reclaimed ones.
    fn drain_ready(&mut self, channel_id: u8) -> Vec<HeapBuf> {
        let mut ready = Vec::new();
        loop {
            let next = self.last_delivered_message.next();
            match self.assemblies.get(&next.to_raw()) {
                Some(AssemblyState::Complete(_)) => {
                    let Some(AssemblyState::Complete(buf)) = self.assemblies.remove(&next.to_raw()) else {
                        unreachable!("entry was just matched as complete");
                    };
                    ready.push(buf);
                    self.last_delivered_message = next;
                }
                Some(AssemblyState::Expired) => {
                    debug!("channel {}: skipping reclaimed message {}", channel_id, next);
                    self.assemblies.remove(&next.to_raw());
                    self.last_delivered_message = next;
                }
                _ => break,
            }
        }
        ready
    }

    /// ages out partial assemblies; their message is permanently lost
    fn reclaim_expired(&mut self, pool: &MemoryPool, assembly_timeout: std::time::Duration, channel_id: u8) {
        let now = Instant::now();
        for (&message_id, state) in self.assemblies.iter_mut() {
            if let AssemblyState::Partial(assembly) = state {
                if now.duration_since(assembly.created) >= assembly_timeout {
                    debug!("channel {}: partial assembly for message {} aged out - reclaiming its buffers", channel_id, message_id);
                    Self::expire(pool, state);
                }
            }
        }
    }

    fn expire(pool: &MemoryPool, state: &mut AssemblyState) {
        if let AssemblyState::Partial(assembly) = state {
            for fragment in assembly.fragments.iter_mut() {
                if let Some(buf) = fragment.take() {
                    pool.release(buf);
                }
            }
        }
        *state = AssemblyState::Expired;
    }

    fn reset(&mut self, pool: &MemoryPool) {
        for (_, state) in self.assemblies.iter_mut() {
            Self::expire(pool, state);
        }
        self.assemblies.clear();
        self.last_delivered_message = SequenceId::ZERO;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::predicate::eq;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::runtime::Builder;
    use tokio::time;
    use crate::message_dispatcher::MockMessageDispatcher;
    use crate::send_pipeline::{MockSendSocket, SendPipeline};

    fn peer() -> SocketAddr {
        SocketAddr::from(([1, 2, 3, 4], 9))
    }

    fn test_config(mtu: usize, max_fragments: usize) -> Arc<EffectiveChannelConfig> {
        Arc::new(EffectiveChannelConfig {
            mtu,
            reliability_window_size: 64,
            max_fragments,
            retransmit_timeout: Duration::from_millis(100),
            max_retries: 10,
            assembly_timeout: Duration::from_secs(1),
            ack_mask_bytes: 4,
        })
    }

    struct TestSetup {
        channel: ReliableFragmentedChannel,
        sent: Arc<Mutex<Vec<Vec<u8>>>>,
    }

    /// records outgoing packets instead of asserting them one by one -
    ///  fragmentation tests care about counts and reassembly, not exact bytes
    fn recording_setup(mtu: usize, max_fragments: usize) -> TestSetup {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let sent_clone = sent.clone();

        let mut send_socket = MockSendSocket::new();
        send_socket.expect_do_send_packet()
            .returning(move |_, packet_buf| {
                sent_clone.lock().unwrap().push(packet_buf.to_vec());
            });

        let pool = Arc::new(MemoryPool::new(64 * 1024, 256));
        let outbound = Arc::new(Outbound::new(
            mtu,
            Arc::new(SendPipeline::new(Arc::new(send_socket))),
            pool.clone(),
        ));
        let channel = ReliableFragmentedChannel::new(
            4, peer(), test_config(mtu, max_fragments), pool, outbound, Arc::new(MockMessageDispatcher::new()));

        TestSetup { channel, sent }
    }

    fn data_packets(sent: &Arc<Mutex<Vec<Vec<u8>>>>) -> Vec<Vec<u8>> {
        sent.lock().unwrap().iter()
            .filter(|p| p[0] == pack_header_byte(MessageType::Data, MessageFlags::FRAGMENTED))
            .cloned()
            .collect()
    }

    #[test]
    fn test_fragment_count() {
        let setup = recording_setup(1200, 16);

        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async move {
            // 10_000 bytes at 1190 per fragment: 9 fragments
            setup.channel.create_outgoing_message(&[7u8; 10_000], true, 0).await.unwrap();

            let packets = data_packets(&setup.sent);
            assert_eq!(packets.len(), 9);

            // every fragment fits the MTU, and the last one carries the rest
            for (index, packet) in packets.iter().enumerate() {
                assert!(packet.len() <= 1200);
                let mut parse_buf = &packet[4..];
                let info = FragmentInfo::deser(&mut parse_buf).unwrap();
                assert_eq!(info.fragment_index, index as u16);
                assert_eq!(info.fragment_count, 9);
                assert_eq!(info.message_id, 1);
            }
            assert_eq!(packets.iter().map(|p| p.len() - FRAGMENT_HEADER_LEN).sum::<usize>(), 10_000);
        });
    }

    #[test]
    fn test_too_many_fragments() {
        let setup = recording_setup(1200, 4);

        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async move {
            let result = setup.channel.create_outgoing_message(&[7u8; 10_000], true, 0).await;
            assert_eq!(result, Err(TransportError::TooManyFragments {
                payload_len: 10_000,
                num_fragments: 9,
                max_fragments: 4,
            }));
            assert!(data_packets(&setup.sent).is_empty());
        });
    }

    #[test]
    fn test_small_payload_is_a_single_fragment() {
        let setup = recording_setup(1200, 16);

        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async move {
            setup.channel.create_outgoing_message(&[1, 2, 3], true, 0).await.unwrap();

            let packets = data_packets(&setup.sent);
            assert_eq!(packets.len(), 1);
            let mut parse_buf = &packets[0][4..];
            assert_eq!(FragmentInfo::deser(&mut parse_buf).unwrap().fragment_count, 1);
            assert_eq!(parse_buf, &[1, 2, 3]);
        });
    }

    /// round-trips a payload through a sending channel and a receiving
    ///  channel, with the fragments arriving in an arbitrary order
    fn roundtrip(payload: Vec<u8>, reorder: impl Fn(&mut Vec<Vec<u8>>)) {
        let sender = recording_setup(1200, 16);
        let receiver = recording_setup(1200, 16);

        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async move {
            sender.channel.create_outgoing_message(&payload, true, 0).await.unwrap();

            let mut fragments = data_packets(&sender.sent);
            reorder(&mut fragments);

            let mut delivered = Vec::new();
            for fragment in fragments {
                // strip the packed byte and channel id, as the router would
                if let Some(pointers) = receiver.channel.handle_incoming_message_poll(&fragment[2..]).await {
                    delivered.extend(pointers.iter().map(|b| b.as_ref().to_vec()));
                }
            }

            assert_eq!(delivered, vec![payload]);
        });
    }

    #[test]
    fn test_reassembly_in_order() {
        roundtrip((0..255u8).cycle().take(10_000).collect(), |_| ());
    }

    #[test]
    fn test_reassembly_reverse_order() {
        roundtrip((0..255u8).cycle().take(10_000).collect(), |fragments| fragments.reverse());
    }

    #[test]
    fn test_reassembly_duplicated_fragments() {
        roundtrip((0..255u8).cycle().take(5_000).collect(), |fragments| {
            let dupes = fragments.clone();
            fragments.extend(dupes);
        });
    }

    #[test]
    fn test_messages_deliver_in_issue_order() {
        let sender = recording_setup(1200, 16);
        let receiver = recording_setup(1200, 16);

        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async move {
            sender.channel.create_outgoing_message(&[1u8; 2000], true, 0).await.unwrap();
            sender.channel.create_outgoing_message(&[2u8; 10], true, 0).await.unwrap();

            let fragments = data_packets(&sender.sent);
            assert_eq!(fragments.len(), 3);

            // message 2 arrives complete first, but must wait for message 1
            assert!(receiver.channel.handle_incoming_message_poll(&fragments[2][2..]).await.is_none());
            assert!(receiver.channel.handle_incoming_message_poll(&fragments[0][2..]).await.is_none());

            let pointers = receiver.channel.handle_incoming_message_poll(&fragments[1][2..]).await.unwrap();
            let delivered = pointers.iter().map(|b| b.as_ref().to_vec()).collect::<Vec<_>>();
            assert_eq!(delivered, vec![vec![1u8; 2000], vec![2u8; 10]]);
        });
    }

    #[test]
    fn test_assembly_timeout_reclaims_and_skips() {
        let sender = recording_setup(1200, 16);

        // receiver whose dispatcher expects message 2 once the reclaim of
        //  message 1 unblocks it
        let mut send_socket = MockSendSocket::new();
        send_socket.expect_do_send_packet().return_const(()); // acks
        let mut dispatcher = MockMessageDispatcher::new();
        dispatcher.expect_on_message()
            .with(eq(peer()), eq(4u8), eq(vec![2u8; 10]))
            .once()
            .return_const(());

        let pool = Arc::new(MemoryPool::new(64 * 1024, 64));
        let outbound = Arc::new(Outbound::new(
            1200,
            Arc::new(SendPipeline::new(Arc::new(send_socket))),
            pool.clone(),
        ));
        let receiver = ReliableFragmentedChannel::new(
            4, peer(), test_config(1200, 16), pool, outbound, Arc::new(dispatcher));

        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async move {
            sender.channel.create_outgoing_message(&[1u8; 2000], true, 0).await.unwrap();
            sender.channel.create_outgoing_message(&[2u8; 10], true, 0).await.unwrap();
            let fragments = data_packets(&sender.sent);

            // message 1 stays partial (its second fragment never arrives),
            //  message 2 is complete but withheld behind it
            assert!(receiver.handle_incoming_message_poll(&fragments[0][2..]).await.is_none());
            assert!(receiver.handle_incoming_message_poll(&fragments[2][2..]).await.is_none());

            // before the age limit, nothing moves
            time::sleep(Duration::from_millis(500)).await;
            assert!(!receiver.internal_update().await);

            // past the age limit: message 1 is reclaimed, message 2 delivers
            time::sleep(Duration::from_millis(600)).await;
            assert!(!receiver.internal_update().await);
        });
    }

    #[test]
    fn test_sustained_loss_does_not_exhaust_the_pool() {
        let sender = recording_setup(1200, 4);
        let receiver = recording_setup(1200, 4);

        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async move {
            let pool = receiver.channel.pool.clone();

            // 10_000 two-fragment messages at 50% fragment loss: the second
            //  fragment never arrives, so every assembly stays partial until
            //  the periodic tick reclaims it
            for i in 0..10_000u64 {
                sender.channel.create_outgoing_message(&vec![(i % 251) as u8; 1500], true, 0).await.unwrap();
                let fragments = data_packets(&sender.sent);
                sender.sent.lock().unwrap().clear();

                assert!(receiver.channel.handle_incoming_message_poll(&fragments[0][2..]).await.is_none());

                if i % 100 == 99 {
                    time::sleep(Duration::from_millis(1100)).await;
                    receiver.channel.internal_update().await;
                }
            }

            time::sleep(Duration::from_millis(1100)).await;
            receiver.channel.internal_update().await;

            // everything partial was reclaimed; the pool did not balloon
            assert!(pool.created_buffers() < 1000, "pool created {} buffers", pool.created_buffers());
        });
    }
}
