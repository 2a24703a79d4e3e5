//! Reliable-transport core for UDP-based networking: a set of per-connection
//!  logical *channels*, each implementing one delivery guarantee over a shared
//!  unordered, lossy datagram socket.
//!
//! ## Design goals
//!
//! * The abstraction is sending / receiving *messages* (defined-length chunks
//!   of data, not byte streams), each with a per-channel delivery guarantee:
//!   * `Unreliable` - fire and forget
//!   * `UnreliableOrdered` - drop anything older than what was already delivered
//!   * `UnreliableSequenced` - duplicate detection plus a poll-side watermark,
//!      so a slow consumer does not cause spurious drops
//!   * `Reliable` - retransmit until acknowledged, deliver in arrival order
//!   * `ReliableSequenced` - retransmit until acknowledged, deliver in send order
//!   * `ReliableFragmentedSequenced` - additionally split payloads larger than
//!      one datagram and reassemble them at the receiver
//! * No allocation on the per-message path: all buffers come from a pooled
//!   arena of size-classed blocks and are returned there, and channel
//!   instances themselves are pooled across connection lifetimes
//!   (`release`/`assign`) rather than constructed per connection
//! * Send and receive paths never block each other: each channel guards its
//!   two halves with independent locks
//! * No hidden concurrency: retransmission, fragment-assembly aging and merge
//!   flushing run inside an externally driven periodic tick
//! * Small messages for the same peer are merged into one datagram unless the
//!   sender opts out (acks and heartbeats do)
//!
//! Out of scope, by design: the socket receive loop, connection establishment
//!  and liveness policy, congestion control, and whatever object-replication
//!  protocol sits above - those layers hand validated byte buffers in and get
//!  validated byte buffers back.
//!
//! ## Header
//!
//! Wire layout of a channel message (all numbers little-endian):
//!
//! ```ascii
//! 0:  packed byte: message type in the low nibble (1 Data, 2 Ack,
//!      3 Heartbeat, 4 Merge), flags in the high nibble (bit 7: fragmented)
//! 1:  channel id (u8). Not present for Heartbeat and Merge.
//! 2:  sequence number (u16) - present on sequenced and reliable variants
//! ```
//!
//! A fragmented data message continues with:
//!
//! ```ascii
//! 4:  message id (u16) - groups the fragments of one payload, wraps
//!      independently of the sequence space
//! 6:  fragment index (u16)
//! 8:  fragment count (u16)
//! ```
//!
//! An ack message carries, after the channel id:
//!
//! ```ascii
//! 2:  base sequence (u16) - acknowledged unconditionally
//! 4:  bitmask of the preceding sequences (width fixed by configuration):
//!      bit i set acknowledges `base - 1 - i`
//! ```
//!
//! A heartbeat is the packed byte plus a bare u16 sequence. A merge datagram
//!  is the packed byte followed by varint-length-prefixed complete messages.
//!
//! ## Sequence numbers
//!
//! Sequence numbers are 16 bits and wrap; ordering is defined via the signed
//!  wraparound distance, which is correct as long as the live span never
//!  exceeds half the counter range. Window sizes are bounded accordingly.

pub mod buffers;
pub mod channel;
pub mod channel_router;
pub mod config;
pub mod error;
pub mod message_dispatcher;
pub mod send_pipeline;
pub mod sequencing;
pub mod sliding_window;
pub mod wire;

#[cfg(test)]
mod tests {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(Level::DEBUG)
            .try_init()
            .ok();
    }
}
