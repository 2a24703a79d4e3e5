use bytes::{Buf, BufMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};
use rustc_hash::FxHashMap;
use std::collections::hash_map::Entry;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, span, trace, warn, Instrument, Level};
use uuid::Uuid;
use crate::buffers::atomic_map::AtomicMap;
use crate::buffers::heap_buf::HeapBuf;
use crate::buffers::memory_pool::{MemoryPool, PointerSet};
use crate::channel::{new_channel, Channel, ChannelKind};
use crate::config::RudpConfig;
use crate::message_dispatcher::MessageDispatcher;
use crate::send_pipeline::SendPipeline;
use crate::sequencing::SequenceId;
use crate::wire::{pack_header_byte, unpack_header_byte, MessageFlags, MessageType};

/// The channel-to-socket half of the router. Channels hand their wire-ready
///  buffers here; small messages for the same peer are merged into one
///  datagram (varint-length-prefixed inside a `Merge` frame) unless the caller
///  opts out with `no_merge` - acks and heartbeats do, so they are never
///  delayed behind a filling merge buffer.
///
/// Merge buffers flush when the next message would not fit, and on the
///  external periodic tick - there is no internal timer.
pub struct Outbound {
    mtu: usize,
    pipeline: Arc<SendPipeline>,
    pool: Arc<MemoryPool>,
    merge_buffers: AsyncMutex<FxHashMap<SocketAddr, HeapBuf>>,
}

/// serialized length of a varint-encoded usize
fn varint_len(value: usize) -> usize {
    let mut len = 1;
    let mut rest = value >> 7;
    while rest > 0 {
        len += 1;
        rest >>= 7;
    }
    len
}

impl Outbound {
    pub fn new(mtu: usize, pipeline: Arc<SendPipeline>, pool: Arc<MemoryPool>) -> Outbound {
        Outbound {
            mtu,
            pipeline,
            pool,
            merge_buffers: AsyncMutex::new(FxHashMap::default()),
        }
    }

    /// Sends buffers the caller hands over for good; they are released to the
    ///  pool once the socket layer has them.
    pub async fn send_message(&self, peer_addr: SocketAddr, mut pointers: PointerSet, no_merge: bool) {
        for buf in pointers.drain() {
            if no_merge {
                trace!("sending packet to {:?} immediately: {:?}", peer_addr, buf.as_ref());
                self.pipeline.do_send_packet(peer_addr, buf.as_ref()).await;
            }
            else {
                self.append_to_merge(peer_addr, buf.as_ref()).await;
            }
            self.pool.release(buf);
        }
        self.pool.release_pointer_set(pointers);
    }

    /// Sends a packet that stays owned by the caller - reliable channels keep
    ///  their buffers in the retransmission window and send from there.
    pub async fn send_retained(&self, peer_addr: SocketAddr, packet_buf: &[u8], no_merge: bool) {
        if no_merge {
            trace!("sending retained packet to {:?} immediately: {:?}", peer_addr, packet_buf);
            self.pipeline.do_send_packet(peer_addr, packet_buf).await;
        }
        else {
            self.append_to_merge(peer_addr, packet_buf).await;
        }
    }

    async fn append_to_merge(&self, peer_addr: SocketAddr, message: &[u8]) {
        let needed = varint_len(message.len()) + message.len();
        if 1 + needed > self.mtu {
            // cannot fit into a merge frame even alone; it fits a plain
            //  datagram, so it travels unmerged
            self.pipeline.do_send_packet(peer_addr, message).await;
            return;
        }

        let mut merge_buffers = self.merge_buffers.lock().await;

        if let Some(buf) = merge_buffers.get(&peer_addr) {
            if buf.len() + needed > self.mtu {
                let full = merge_buffers.remove(&peer_addr)
                    .expect("merge buffer present, it was just looked up");
                trace!("merge buffer for {:?} is full, flushing", peer_addr);
                self.pipeline.do_send_packet(peer_addr, full.as_ref()).await;
                self.pool.release(full);
            }
        }

        let buf = match merge_buffers.entry(peer_addr) {
            Entry::Occupied(e) => e.into_mut(),
            Entry::Vacant(e) => {
                let mut new_buf = self.pool.alloc(self.mtu)
                    .expect("config validation ensures the MTU fits a pool block");
                new_buf.put_u8(pack_header_byte(MessageType::Merge, MessageFlags::empty()));
                e.insert(new_buf)
            }
        };
        buf.put_usize_varint(message.len());
        buf.put_slice(message);
    }

    /// sends the pending merge buffer for one peer, if any
    pub async fn flush(&self, peer_addr: SocketAddr) {
        let buf = self.merge_buffers.lock().await.remove(&peer_addr);
        if let Some(buf) = buf {
            trace!("flushing merge buffer for {:?}", peer_addr);
            self.pipeline.do_send_packet(peer_addr, buf.as_ref()).await;
            self.pool.release(buf);
        }
    }

    /// sends all pending merge buffers; driven by the external periodic tick
    pub async fn flush_all(&self) {
        let drained = {
            let mut merge_buffers = self.merge_buffers.lock().await;
            merge_buffers.drain().collect::<Vec<_>>()
        };
        for (peer_addr, buf) in drained {
            trace!("flushing merge buffer for {:?}", peer_addr);
            self.pipeline.do_send_packet(peer_addr, buf.as_ref()).await;
            self.pool.release(buf);
        }
    }
}

/// The place where the parts come together: dispatches inbound datagrams to
///  the channel bound for their (connection, channel id), splits merged
///  frames, surfaces heartbeats, and owns the arena of pooled channel
///  instances that `bind_channel`/`release_connection` cycle through.
pub struct ChannelRouter {
    config: Arc<RudpConfig>,
    pool: Arc<MemoryPool>,
    outbound: Arc<Outbound>,
    dispatcher: Arc<dyn MessageDispatcher>,
    channels: AtomicMap<(SocketAddr, u8), Arc<dyn Channel>>,
    /// released instances waiting for re-assignment, by variant
    released_channels: Mutex<Vec<(ChannelKind, Arc<dyn Channel>)>>,
}

impl ChannelRouter {
    pub fn new(
        config: Arc<RudpConfig>,
        pipeline: Arc<SendPipeline>,
        dispatcher: Arc<dyn MessageDispatcher>,
    ) -> anyhow::Result<ChannelRouter> {
        config.validate()?;

        let pool = Arc::new(MemoryPool::new(config.max_block_size, config.buffer_pool_class_cap));
        Ok(ChannelRouter {
            outbound: Arc::new(Outbound::new(config.mtu, pipeline, pool.clone())),
            config,
            pool,
            dispatcher,
            channels: AtomicMap::new(),
            released_channels: Mutex::new(Vec::new()),
        })
    }

    pub fn pool(&self) -> &Arc<MemoryPool> {
        &self.pool
    }

    pub fn outbound(&self) -> &Arc<Outbound> {
        &self.outbound
    }

    /// Binds a channel for (peer, channel id), reusing a released instance of
    ///  the same variant when one is available. Returns the already-bound
    ///  instance if the binding exists.
    pub async fn bind_channel(&self, peer_addr: SocketAddr, channel_id: u8, kind: ChannelKind) -> Arc<dyn Channel> {
        if let Some(existing) = self.channels.get(&(peer_addr, channel_id)) {
            debug!("channel {} for {:?} is already bound", channel_id, peer_addr);
            return existing;
        }

        let effective_config = Arc::new(self.config.get_effective_channel_config(channel_id));

        let reusable = {
            let mut released = self.released_channels.lock().unwrap();
            released.iter()
                .position(|(k, _)| *k == kind)
                .map(|index| released.swap_remove(index).1)
        };

        let channel = match reusable {
            Some(channel) => {
                debug!("re-assigning pooled {:?} instance to channel {} for {:?}", kind, channel_id, peer_addr);
                channel.assign(channel_id, peer_addr, effective_config).await;
                channel
            }
            None => {
                debug!("initializing {:?} instance for channel {} for {:?}", kind, channel_id, peer_addr);
                new_channel(
                    kind,
                    channel_id,
                    peer_addr,
                    effective_config,
                    self.pool.clone(),
                    self.outbound.clone(),
                    self.dispatcher.clone(),
                )
            }
        };

        self.channels.update(|map| {
            map.insert((peer_addr, channel_id), channel.clone());
        });
        channel
    }

    /// Unbinds all channels of a connection, releasing their state and parking
    ///  the instances for reuse. Buffers already handed to the socket layer
    ///  are not recalled; the pending merge buffer is flushed, not dropped.
    pub async fn release_connection(&self, peer_addr: SocketAddr) {
        let snapshot = self.channels.snapshot();
        let to_release = snapshot.iter()
            .filter(|((addr, _), _)| *addr == peer_addr)
            .map(|(_, channel)| channel.clone())
            .collect::<Vec<_>>();

        if to_release.is_empty() {
            return;
        }
        debug!("releasing {} channels of connection {:?}", to_release.len(), peer_addr);

        self.channels.update(|map| {
            map.retain(|(addr, _), _| addr != &peer_addr);
        });
        self.outbound.flush(peer_addr).await;

        for channel in to_release {
            channel.release().await;
            self.released_channels.lock().unwrap().push((channel.kind(), channel));
        }
    }

    /// Drives merge flushing, retransmission and assembly aging. Returns the
    ///  channels that exceeded their retry budget this tick; the connection
    ///  layer decides whether to tear those connections down.
    pub async fn internal_update(&self) -> Vec<(SocketAddr, u8)> {
        self.outbound.flush_all().await;

        let snapshot = self.channels.snapshot();
        let mut timed_out = Vec::new();
        for ((peer_addr, channel_id), channel) in snapshot.iter() {
            if channel.internal_update().await {
                timed_out.push((*peer_addr, *channel_id));
            }
        }
        timed_out
    }

    /// outbound passthrough for layers that hold the router rather than a channel
    pub async fn send_message(&self, peer_addr: SocketAddr, pointers: PointerSet, no_merge: bool) {
        self.outbound.send_message(peer_addr, pointers, no_merge).await;
    }

    /// Entry point for raw datagrams from the socket receive loop.
    pub async fn route_incoming(&self, peer_addr: SocketAddr, datagram: &[u8]) {
        let correlation_id = Uuid::new_v4();
        let span = span!(Level::TRACE, "datagram_received", ?correlation_id);
        self.do_route_incoming(peer_addr, datagram).instrument(span).await;
    }

    async fn do_route_incoming(&self, peer_addr: SocketAddr, datagram: &[u8]) {
        trace!("received datagram from {:?}: {:?}", peer_addr, datagram);

        let Some(&packed) = datagram.first() else {
            debug!("received empty datagram from {:?} - dropping", peer_addr);
            return;
        };
        let Ok((message_type, _)) = unpack_header_byte(packed) else {
            warn!("received datagram with invalid header byte from {:?} - dropping", peer_addr);
            return;
        };

        if message_type == MessageType::Merge {
            let mut parse_buf = &datagram[1..];
            while !parse_buf.is_empty() {
                let len = match parse_buf.try_get_usize_varint() {
                    Ok(len) => len,
                    Err(_) => {
                        warn!("merge frame from {:?} with truncated length prefix - dropping the rest", peer_addr);
                        return;
                    }
                };
                if len > parse_buf.len() {
                    warn!("merge frame from {:?} declares a message of {} bytes but only {} remain - dropping the rest",
                          peer_addr, len, parse_buf.len());
                    return;
                }
                let (message, rest) = parse_buf.split_at(len);
                self.route_single(peer_addr, message).await;
                parse_buf = rest;
            }
        }
        else {
            self.route_single(peer_addr, datagram).await;
        }
    }

    async fn route_single(&self, peer_addr: SocketAddr, msg_buf: &[u8]) {
        let Some(&packed) = msg_buf.first() else {
            warn!("empty message from {:?} - dropping", peer_addr);
            return;
        };
        let Ok((message_type, _flags)) = unpack_header_byte(packed) else {
            warn!("message with invalid header byte from {:?} - dropping", peer_addr);
            return;
        };

        match message_type {
            MessageType::Data => {
                let Some(channel) = self.lookup(peer_addr, msg_buf) else {
                    return;
                };
                let channel_id = msg_buf[1];
                if let Some(pointers) = channel.handle_incoming_message_poll(&msg_buf[2..]).await {
                    for buf in pointers.iter() {
                        self.dispatcher.on_message(peer_addr, channel_id, buf.as_ref()).await;
                    }
                    self.pool.release_pointer_set(pointers);
                }
            }
            MessageType::Ack => {
                let Some(channel) = self.lookup(peer_addr, msg_buf) else {
                    return;
                };
                channel.handle_ack(&msg_buf[2..]).await;
            }
            MessageType::Heartbeat => {
                let mut parse_buf = &msg_buf[1..];
                match parse_buf.try_get_u16_le() {
                    Ok(raw) => self.dispatcher.on_heartbeat(peer_addr, SequenceId::from_raw(raw)).await,
                    Err(_) => warn!("heartbeat with truncated sequence from {:?} - dropping", peer_addr),
                }
            }
            MessageType::Merge => {
                warn!("merge frame nested inside a merge frame from {:?} - dropping", peer_addr);
            }
        }
    }

    fn lookup(&self, peer_addr: SocketAddr, msg_buf: &[u8]) -> Option<Arc<dyn Channel>> {
        let Some(&channel_id) = msg_buf.get(1) else {
            warn!("message without channel id from {:?} - dropping", peer_addr);
            return None;
        };
        let channel = self.channels.get(&(peer_addr, channel_id));
        if channel.is_none() {
            debug!("no channel {} bound for {:?} - dropping", channel_id, peer_addr);
        }
        channel
    }
}
