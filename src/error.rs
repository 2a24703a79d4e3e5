use thiserror::Error;

/// Errors surfaced by channel send paths and the memory pool. Incoming-side
///  conditions (duplicates, stale packets, incomplete fragment sets) are not
///  errors - they are expected protocol behavior and only show up in logs.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The payload does not fit into a single datagram on a channel that does
    ///  not fragment. The send is dropped; sequence counters are unchanged.
    #[error("payload of {payload_len} bytes exceeds the budget of {max_payload_len} bytes for a single datagram - use a fragmenting channel")]
    PayloadTooLarge {
        payload_len: usize,
        max_payload_len: usize,
    },

    /// The payload would split into more fragments than the channel is
    ///  configured to accept.
    #[error("payload of {payload_len} bytes would need {num_fragments} fragments, configured maximum is {max_fragments}")]
    TooManyFragments {
        payload_len: usize,
        num_fragments: usize,
        max_fragments: usize,
    },

    /// The memory pool cannot satisfy an allocation because it exceeds the
    ///  largest configured block size. Never silently truncated.
    #[error("allocation of {requested} bytes exceeds the pool's maximum block size of {max_block_size} bytes")]
    OversizedAllocation {
        requested: usize,
        max_block_size: usize,
    },
}
