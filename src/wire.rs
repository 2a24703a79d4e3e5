//! Byte-level layout of channel messages. All multi-byte fields are
//!  little-endian.
//!
//! ```ascii
//! 0:  packed header byte: message type (low nibble) + flags (high nibble)
//! 1:  channel id (not present for Heartbeat and Merge)
//! 2:  sequence number (u16) - sequenced variants only
//! ```
//!
//! A fragmented data message additionally carries, after the sequence number:
//!
//! ```ascii
//! 4:  message id (u16) - groups the fragments of one payload
//! 6:  fragment index (u16)
//! 8:  fragment count (u16)
//! ```
//!
//! Ack payload (after the packed byte and channel id):
//!
//! ```ascii
//! 2:  base sequence (u16) - acknowledged unconditionally
//! 4:  bitmask of the sequences *preceding* the base: bit i set means
//!      `base - 1 - i` is acknowledged. The mask width is fixed by
//!      configuration, not negotiated.
//! ```
//!
//! A heartbeat is the packed byte followed directly by a u16 sequence; it
//!  carries no channel id. A merge datagram is the packed byte followed by
//!  varint-length-prefixed complete messages.

use anyhow::bail;
use bitflags::bitflags;
use bytes::{Buf, BufMut};
use crate::sequencing::SequenceId;

/// packed byte 0 + channel id
pub const DATA_HEADER_LEN: usize = 2;
/// packed byte 0 + channel id + sequence
pub const SEQUENCED_HEADER_LEN: usize = 4;
/// packed byte 0 + channel id + sequence + message id + fragment index + fragment count
pub const FRAGMENT_HEADER_LEN: usize = 10;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MessageType {
    Data,
    Ack,
    Heartbeat,
    Merge,
}

impl MessageType {
    fn to_raw(self) -> u8 {
        match self {
            MessageType::Data => 1,
            MessageType::Ack => 2,
            MessageType::Heartbeat => 3,
            MessageType::Merge => 4,
        }
    }

    fn try_from_raw(raw: u8) -> anyhow::Result<MessageType> {
        match raw {
            1 => Ok(MessageType::Data),
            2 => Ok(MessageType::Ack),
            3 => Ok(MessageType::Heartbeat),
            4 => Ok(MessageType::Merge),
            _ => bail!("invalid message type {}", raw),
        }
    }
}

bitflags! {
    #[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
    pub struct MessageFlags: u8 {
        /// the data message is one fragment of a larger payload
        const FRAGMENTED = 0x80;
    }
}

pub fn pack_header_byte(message_type: MessageType, flags: MessageFlags) -> u8 {
    message_type.to_raw() | flags.bits()
}

pub fn unpack_header_byte(byte: u8) -> anyhow::Result<(MessageType, MessageFlags)> {
    let message_type = MessageType::try_from_raw(byte & 0x0f)?;
    let Some(flags) = MessageFlags::from_bits(byte & 0xf0) else {
        bail!("invalid flags in header byte {:#04x}", byte);
    };
    Ok((message_type, flags))
}

/// Per-fragment metadata of a fragmented data message. The channel sequence
///  number travels separately (every fragment has its own); this struct is the
///  part after it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FragmentInfo {
    pub message_id: u16,
    pub fragment_index: u16,
    pub fragment_count: u16,
}

impl FragmentInfo {
    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u16_le(self.message_id);
        buf.put_u16_le(self.fragment_index);
        buf.put_u16_le(self.fragment_count);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<FragmentInfo> {
        let message_id = buf.try_get_u16_le()?;
        let fragment_index = buf.try_get_u16_le()?;
        let fragment_count = buf.try_get_u16_le()?;
        if fragment_count == 0 || fragment_index >= fragment_count {
            bail!("fragment index {} out of range for fragment count {}", fragment_index, fragment_count);
        }
        Ok(FragmentInfo {
            message_id,
            fragment_index,
            fragment_count,
        })
    }
}

/// An acknowledgment bitfield: the base sequence plus a fixed-width mask of
///  its predecessors. Re-acknowledging an already-acknowledged sequence is
///  harmless, so the mask is computed fresh for every ack.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AckField {
    pub base: SequenceId,
    /// bit i set means `base - 1 - i` is acknowledged
    pub mask: u64,
}

impl AckField {
    pub fn ser(&self, buf: &mut impl BufMut, mask_bytes: usize) {
        debug_assert!((1..=8).contains(&mask_bytes));
        buf.put_u16_le(self.base.to_raw());
        buf.put_uint_le(self.mask, mask_bytes);
    }

    pub fn deser(buf: &mut impl Buf, mask_bytes: usize) -> anyhow::Result<AckField> {
        debug_assert!((1..=8).contains(&mask_bytes));
        let base = buf.try_get_u16_le()?;
        if buf.remaining() < mask_bytes {
            bail!("ack mask truncated: {} of {} bytes", buf.remaining(), mask_bytes);
        }
        let mask = buf.get_uint_le(mask_bytes);
        Ok(AckField {
            base: SequenceId::from_raw(base),
            mask,
        })
    }

    /// all sequences this field acknowledges, base first
    pub fn acked_sequences(&self, mask_bytes: usize) -> impl Iterator<Item = SequenceId> + '_ {
        let base = self.base;
        let mask = self.mask;
        std::iter::once(base)
            .chain((0..(mask_bytes * 8) as u16)
                .filter(move |i| mask & (1u64 << i) != 0)
                .map(move |i| SequenceId::from_raw(base.to_raw().wrapping_sub(i + 1))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::*;

    #[rstest]
    #[case::data(MessageType::Data, MessageFlags::empty())]
    #[case::data_fragmented(MessageType::Data, MessageFlags::FRAGMENTED)]
    #[case::ack(MessageType::Ack, MessageFlags::empty())]
    #[case::heartbeat(MessageType::Heartbeat, MessageFlags::empty())]
    #[case::merge(MessageType::Merge, MessageFlags::empty())]
    fn test_header_byte_roundtrip(#[case] message_type: MessageType, #[case] flags: MessageFlags) {
        let packed = pack_header_byte(message_type, flags);
        assert_eq!(unpack_header_byte(packed).unwrap(), (message_type, flags));
    }

    #[rstest]
    #[case::zero(0)]
    #[case::unknown_type(9)]
    #[case::unknown_flag(0x41)]
    fn test_header_byte_invalid(#[case] byte: u8) {
        assert!(unpack_header_byte(byte).is_err());
    }

    #[rstest]
    #[case::single(0, 0, 1)]
    #[case::first_of_many(17, 0, 9)]
    #[case::last_of_many(17, 8, 9)]
    #[case::max(u16::MAX, 1000, 1001)]
    fn test_fragment_info_roundtrip(#[case] message_id: u16, #[case] fragment_index: u16, #[case] fragment_count: u16) {
        let original = FragmentInfo { message_id, fragment_index, fragment_count };

        let mut buf = Vec::new();
        original.ser(&mut buf);
        assert_eq!(buf.len(), 6);

        let mut b: &[u8] = &buf;
        assert_eq!(FragmentInfo::deser(&mut b).unwrap(), original);
        assert!(b.is_empty());
    }

    #[rstest]
    #[case::index_out_of_range(vec![0,0, 3,0, 3,0])]
    #[case::zero_count(vec![0,0, 0,0, 0,0])]
    #[case::truncated(vec![0,0, 3,0])]
    fn test_fragment_info_invalid(#[case] bytes: Vec<u8>) {
        assert!(FragmentInfo::deser(&mut bytes.as_slice()).is_err());
    }

    #[rstest]
    #[case::empty_mask(5, 0, 4)]
    #[case::full_mask(5, 0xffff_ffff, 4)]
    #[case::one_byte(200, 0x81, 1)]
    #[case::eight_bytes(65535, u64::MAX, 8)]
    fn test_ack_field_roundtrip(#[case] base: u16, #[case] mask: u64, #[case] mask_bytes: usize) {
        let original = AckField { base: SequenceId::from_raw(base), mask };

        let mut buf = Vec::new();
        original.ser(&mut buf, mask_bytes);
        assert_eq!(buf.len(), 2 + mask_bytes);

        let mut b: &[u8] = &buf;
        assert_eq!(AckField::deser(&mut b, mask_bytes).unwrap(), original);
        assert!(b.is_empty());
    }

    #[rstest]
    #[case::only_base(10, 0, vec![10])]
    #[case::base_and_predecessor(10, 0b1, vec![10, 9])]
    #[case::with_gap(10, 0b101, vec![10, 9, 7])]
    #[case::wraparound(1, 0b11, vec![1, 0, 65535])]
    fn test_acked_sequences(#[case] base: u16, #[case] mask: u64, #[case] expected: Vec<u16>) {
        let field = AckField { base: SequenceId::from_raw(base), mask };
        let acked = field.acked_sequences(4)
            .map(|s| s.to_raw())
            .collect::<Vec<_>>();
        assert_eq!(acked, expected);
    }

    #[test]
    fn test_ack_field_truncated() {
        let bytes = vec![5u8, 0, 1, 2];
        assert!(AckField::deser(&mut bytes.as_slice(), 4).is_err());
    }
}
