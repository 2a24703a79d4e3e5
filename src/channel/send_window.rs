use std::net::SocketAddr;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, trace, warn};
use crate::buffers::heap_buf::HeapBuf;
use crate::buffers::memory_pool::MemoryPool;
use crate::channel_router::Outbound;
use crate::config::EffectiveChannelConfig;
use crate::message_dispatcher::MessageDispatcher;
use crate::sequencing::SequenceId;
use crate::sliding_window::SlidingWindow;
use crate::wire::AckField;

/// a sent message retained until its ack arrives
struct PendingMessage {
    buf: HeapBuf,
    last_sent: Instant,
    attempts: u16,
    notification_key: u64,
}

/// The send-side bookkeeping shared by all reliable variants: messages are
///  retained with their retransmit timer until acknowledged, resent when due,
///  and retry exhaustion is latched so it is reported upward exactly once.
///
/// Lives inside a channel's send half, so all methods run under the channel's
///  send lock.
pub(super) struct SendWindow {
    last_outbound_sequence: SequenceId,
    pending: SlidingWindow<PendingMessage>,
    retries_exhausted_reported: bool,
}

impl SendWindow {
    pub fn new(window_size: usize) -> SendWindow {
        SendWindow {
            last_outbound_sequence: SequenceId::ZERO,
            pending: SlidingWindow::new(window_size),
            retries_exhausted_reported: false,
        }
    }

    /// the sequence the next committed message will carry
    pub fn next_sequence(&self) -> SequenceId {
        self.last_outbound_sequence.next()
    }

    /// Retains a sent message and advances the sequence counter. `sequence`
    ///  must be the value [SendWindow::next_sequence] returned while building
    ///  the message.
    pub fn commit(&mut self, sequence: SequenceId, buf: HeapBuf, notification_key: u64, pool: &MemoryPool, channel_id: u8) {
        let evicted = self.pending.set(sequence, PendingMessage {
            buf,
            last_sent: Instant::now(),
            attempts: 0,
            notification_key,
        });
        if let Some((old_sequence, old)) = evicted {
            debug!("unacknowledged message #{} moved out of the send window for channel {}", old_sequence, channel_id);
            pool.release(old.buf);
        }

        self.last_outbound_sequence = sequence;
    }

    pub async fn process_ack(
        &mut self,
        ack_buf: &[u8],
        config: &EffectiveChannelConfig,
        pool: &MemoryPool,
        dispatcher: &Arc<dyn MessageDispatcher>,
        channel_id: u8,
        peer_addr: SocketAddr,
    ) {
        let mut parse_buf = ack_buf;
        let ack = match AckField::deser(&mut parse_buf, config.ack_mask_bytes) {
            Ok(ack) => ack,
            Err(_) => {
                warn!("received unparseable ack for channel {} from {:?} - dropping", channel_id, peer_addr);
                return;
            }
        };
        trace!("channel {}: received ack {:?}", channel_id, ack);

        let acked = ack.acked_sequences(config.ack_mask_bytes).collect::<Vec<_>>();
        for sequence in acked {
            if let Some(pending) = self.pending.remove(sequence) {
                trace!("channel {}: message #{} acknowledged after {} retries", channel_id, sequence, pending.attempts);
                pool.release(pending.buf);
                if pending.notification_key != 0 {
                    dispatcher.on_notify(peer_addr, channel_id, pending.notification_key).await;
                }
            }
        }
    }

    /// Resends everything whose retransmit timer is due. Returns `true` the
    ///  first time a message runs out of retries; an ack arriving afterwards
    ///  is still processed normally.
    pub async fn retransmit_due(
        &mut self,
        config: &EffectiveChannelConfig,
        outbound: &Outbound,
        channel_id: u8,
        peer_addr: SocketAddr,
    ) -> bool {
        let now = Instant::now();

        let mut retries_exhausted = false;
        for (sequence, pending) in self.pending.iter_mut() {
            if now.duration_since(pending.last_sent) < config.retransmit_timeout {
                continue;
            }
            if pending.attempts >= config.max_retries {
                retries_exhausted = true;
                continue;
            }

            pending.attempts += 1;
            pending.last_sent = now;
            debug!("channel {}: resending message #{} to {:?}, attempt {}", channel_id, sequence, peer_addr, pending.attempts);
            outbound.send_retained(peer_addr, pending.buf.as_ref(), true).await;
        }

        if retries_exhausted && !self.retries_exhausted_reported {
            self.retries_exhausted_reported = true;
            warn!("channel {} with {:?} exceeded its retry budget", channel_id, peer_addr);
            return true;
        }
        false
    }

    /// zeroes the sequence counter and returns all retained buffers to the pool
    pub fn reset(&mut self, pool: &MemoryPool) {
        self.last_outbound_sequence = SequenceId::ZERO;
        self.retries_exhausted_reported = false;
        for (_, pending) in self.pending.drain() {
            pool.release(pending.buf);
        }
    }

    /// re-sizes the (empty) window for a new channel assignment
    pub fn resize(&mut self, window_size: usize) {
        self.pending = SlidingWindow::new(window_size);
    }
}
