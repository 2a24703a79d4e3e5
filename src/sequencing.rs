use std::fmt::{Display, Formatter};

/// A 16-bit wrapping sequence number. Ordering is *not* numeric but based on
///  wraparound distance: a sequence id is 'newer' than another if the signed
///  distance from the other to it is positive. This is well-defined as long as
///  the true separation between compared ids never exceeds half the counter
///  range (32768), which the window sizes enforce.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Default)]
pub struct SequenceId(u16);

impl Display for SequenceId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl SequenceId {
    pub const ZERO: SequenceId = SequenceId(0);

    pub fn from_raw(value: u16) -> Self {
        Self(value)
    }

    pub fn to_raw(&self) -> u16 {
        self.0
    }

    pub fn next(&self) -> SequenceId {
        SequenceId(self.0.wrapping_add(1))
    }

    /// signed wraparound displacement from `other` to `self`
    pub fn distance(&self, other: SequenceId) -> i16 {
        self.0.wrapping_sub(other.0) as i16
    }

    pub fn is_newer_than(&self, other: SequenceId) -> bool {
        self.distance(other) > 0
    }
}
