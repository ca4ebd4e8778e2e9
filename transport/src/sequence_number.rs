use std::fmt::{Display, Formatter};
use crate::safe_converter::SafeCast;

/// Sequence numbers live in `0..MAX_SEQUENCE`. NB: this is *not* `u16::MAX + 1`, so wrap-around
///  arithmetic has to be done explicitly rather than relying on `u16` overflow.
pub const MAX_SEQUENCE: u16 = 65535;
const HALF_SEQUENCE: i32 = (MAX_SEQUENCE / 2) as i32;

/// A datagram's position in a channel's sequence space, wrapping around at [MAX_SEQUENCE].
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Default)]
pub struct SequenceNumber(u16);

impl Display for SequenceNumber {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl SequenceNumber {
    pub const ZERO: SequenceNumber = SequenceNumber(0);

    /// returns `None` for values outside the sequence space
    pub fn from_raw(value: u16) -> Option<SequenceNumber> {
        if value < MAX_SEQUENCE {
            Some(SequenceNumber(value))
        }
        else {
            None
        }
    }

    pub fn to_raw(&self) -> u16 {
        self.0
    }

    pub fn next(&self) -> SequenceNumber {
        if self.0 == MAX_SEQUENCE - 1 {
            SequenceNumber::ZERO
        }
        else {
            SequenceNumber(self.0 + 1)
        }
    }

    /// The signed distance from `reference` to `self` in modular sequence space: positive if
    ///  `self` is 'after' `reference`, negative if it is 'before'. The result is in
    ///  `-32767..=32767`.
    pub fn relative_to(&self, reference: SequenceNumber) -> i32 {
        let max: i32 = MAX_SEQUENCE.safe_cast();
        let this: i32 = self.0.safe_cast();
        let reference: i32 = reference.0.safe_cast();
        ((this - reference + max + HALF_SEQUENCE) % max) - HALF_SEQUENCE
    }
}
