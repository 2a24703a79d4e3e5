use async_trait::async_trait;
use bytes::BufMut;
use std::net::SocketAddr;
use std::sync::Arc;
use crate::buffers::memory_pool::{MemoryPool, PointerSet};
use crate::channel_router::Outbound;
use crate::config::EffectiveChannelConfig;
use crate::error::TransportError;
use crate::message_dispatcher::MessageDispatcher;
use crate::sequencing::SequenceId;
use crate::wire::{pack_header_byte, AckField, MessageFlags, MessageType};

pub mod unreliable;
pub mod unreliable_ordered;
pub mod unreliable_sequenced;
pub mod reliable;
pub mod reliable_sequenced;
pub mod reliable_fragmented;

mod send_window;

/// The closed set of delivery guarantees. Which guarantee a channel id uses is
///  configuration, not negotiation - both peers must agree out of band.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum ChannelKind {
    Unreliable,
    UnreliableOrdered,
    UnreliableSequenced,
    Reliable,
    ReliableSequenced,
    ReliableFragmentedSequenced,
}

/// One logical sub-stream over one connection, with its own delivery guarantee
///  and independent sequence space.
///
/// Instances are pooled across connection lifetimes: [Channel::release] zeroes
///  all state and detaches the instance from its connection, [Channel::assign]
///  rebinds it. Send-side and receive-side state are guarded by independent
///  locks so a burst of incoming packets never stalls outgoing traffic;
///  `release`/`assign` take both locks, send side first.
#[async_trait]
pub trait Channel: Send + Sync {
    fn kind(&self) -> ChannelKind;

    /// Builds the wire form of `payload` and hands it to the router. On
    ///  success the outbound sequence counter advances; on error it does not.
    ///  `notification_key`, if nonzero, is reported back through
    ///  [MessageDispatcher::on_notify] once the peer acknowledges the message
    ///  (reliable variants only).
    async fn create_outgoing_message(&self, payload: &[u8], no_merge: bool, notification_key: u64) -> Result<(), TransportError>;

    /// Processes the body of an incoming data message (after the packed header
    ///  byte and channel id). Returns the payload buffer(s) that become
    ///  deliverable *now* - `None` for duplicates, stale arrivals and
    ///  incomplete fragment sets.
    async fn handle_incoming_message_poll(&self, msg_buf: &[u8]) -> Option<PointerSet>;

    /// Processes an ack bitfield (after the packed header byte and channel
    ///  id). A no-op for unreliable variants.
    async fn handle_ack(&self, ack_buf: &[u8]);

    /// Drives retransmission and assembly aging. Invoked by an external
    ///  periodic tick - channels never spawn their own timers. Returns `true`
    ///  exactly once when the channel exhausts its retry budget; the
    ///  connection layer decides what to do about it.
    async fn internal_update(&self) -> bool;

    /// Zeroes all sequence counters and windows and returns in-flight buffers
    ///  to the pool. The instance is connection-agnostic afterward.
    async fn release(&self);

    /// Rebinds a released instance to a new (connection, channel id) identity.
    ///  Must only be called after [Channel::release].
    async fn assign(&self, channel_id: u8, peer_addr: SocketAddr, config: Arc<EffectiveChannelConfig>);
}

/// Builds and sends an ack bitfield: `base` plus whatever `is_received`
///  reports for the mask width below it. Acks bypass merging - they are
///  time-sensitive, and a round trip is at stake.
pub(crate) async fn send_ack_field(
    pool: &MemoryPool,
    outbound: &Outbound,
    channel_id: u8,
    peer_addr: SocketAddr,
    mask_bytes: usize,
    base: SequenceId,
    is_received: impl Fn(SequenceId) -> bool,
) {
    let mut mask = 0u64;
    for i in 0..(mask_bytes * 8) as u16 {
        let sequence = SequenceId::from_raw(base.to_raw().wrapping_sub(i + 1));
        if is_received(sequence) {
            mask |= 1 << i;
        }
    }

    let Ok(mut buf) = pool.alloc(2 + 2 + mask_bytes) else {
        return;
    };
    buf.put_u8(pack_header_byte(MessageType::Ack, MessageFlags::empty()));
    buf.put_u8(channel_id);
    AckField { base, mask }.ser(&mut buf, mask_bytes);

    let mut pointers = pool.alloc_pointer_set(1);
    pointers.push(buf);
    outbound.send_message(peer_addr, pointers, true).await;
}

pub fn new_channel(
    kind: ChannelKind,
    channel_id: u8,
    peer_addr: SocketAddr,
    config: Arc<EffectiveChannelConfig>,
    pool: Arc<MemoryPool>,
    outbound: Arc<Outbound>,
    dispatcher: Arc<dyn MessageDispatcher>,
) -> Arc<dyn Channel> {
    match kind {
        ChannelKind::Unreliable =>
            Arc::new(unreliable::UnreliableChannel::new(channel_id, peer_addr, config, pool, outbound)),
        ChannelKind::UnreliableOrdered =>
            Arc::new(unreliable_ordered::UnreliableOrderedChannel::new(channel_id, peer_addr, config, pool, outbound)),
        ChannelKind::UnreliableSequenced =>
            Arc::new(unreliable_sequenced::UnreliableSequencedChannel::new(channel_id, peer_addr, config, pool, outbound)),
        ChannelKind::Reliable =>
            Arc::new(reliable::ReliableChannel::new(channel_id, peer_addr, config, pool, outbound, dispatcher)),
        ChannelKind::ReliableSequenced =>
            Arc::new(reliable_sequenced::ReliableSequencedChannel::new(channel_id, peer_addr, config, pool, outbound, dispatcher)),
        ChannelKind::ReliableFragmentedSequenced =>
            Arc::new(reliable_fragmented::ReliableFragmentedChannel::new(channel_id, peer_addr, config, pool, outbound, dispatcher)),
    }
}
