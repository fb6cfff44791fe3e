//! Sequence numbers used to order views and consensus instances.
//!
//! Both the `View` and `InstanceId` newtypes below are thin wrappers
//! around the same `SeqNo` arithmetic the teacher crate used to order
//! `PRE-PREPARE`/`PREPARE`/`COMMIT` messages: wraparound-safe subtraction,
//! with an overflow guard for obviously-bogus (too large) deltas.

use std::cmp::Ordering;
use std::fmt;

use either::{Either, Left, Right};

#[cfg(feature = "serialize_serde")]
use serde::{Deserialize, Serialize};

/// Threshold beyond which a delta between two sequence numbers is treated
/// as having wrapped around `i64`, rather than being a legitimately large
/// gap. Chosen generously relative to the default window size `W`.
const OVERFLOW_THRES_POS: i64 = 1 << 40;
const OVERFLOW_THRES_NEG: i64 = -OVERFLOW_THRES_POS;

pub(crate) enum InvalidSeqNo {
    Small,
    Big,
}

/// A monotonically increasing, wraparound-aware counter.
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Default)]
#[repr(transparent)]
pub struct SeqNo(i64);

impl SeqNo {
    pub const ZERO: SeqNo = SeqNo(0);

    #[inline]
    pub fn next(self) -> SeqNo {
        SeqNo(self.0.wrapping_add(1))
    }

    #[inline]
    pub fn next_n(self, n: i64) -> SeqNo {
        SeqNo(self.0.wrapping_add(n))
    }

    /// Distance from `other` to `self`, guarding against overflow.
    pub(crate) fn index(self, other: SeqNo) -> Either<InvalidSeqNo, i64> {
        let delta = self.0.wrapping_sub(other.0);
        if delta < OVERFLOW_THRES_NEG {
            Left(InvalidSeqNo::Small)
        } else if delta > OVERFLOW_THRES_POS {
            Left(InvalidSeqNo::Big)
        } else {
            Right(delta)
        }
    }
}

impl fmt::Display for SeqNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for SeqNo {
    #[inline]
    fn from(n: i64) -> SeqNo {
        SeqNo(n)
    }
}

impl From<SeqNo> for i64 {
    #[inline]
    fn from(n: SeqNo) -> i64 {
        n.0
    }
}

impl PartialOrd for SeqNo {
    fn partial_cmp(&self, other: &SeqNo) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SeqNo {
    fn cmp(&self, other: &SeqNo) -> Ordering {
        self.0.cmp(&other.0)
    }
}

/// Something that carries a `SeqNo` of some kind (a view, an instance id).
pub trait Orderable {
    fn sequence_number(&self) -> SeqNo;
}

macro_rules! seqno_newtype {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
        #[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Default)]
        #[repr(transparent)]
        pub struct $name(SeqNo);

        impl $name {
            pub const ZERO: $name = $name(SeqNo::ZERO);

            #[inline]
            pub fn next(self) -> $name {
                $name(self.0.next())
            }

            #[inline]
            pub fn next_n(self, n: i64) -> $name {
                $name(self.0.next_n(n))
            }

            /// Number of steps from `other` to reach `self` (may be negative).
            #[inline]
            pub fn checked_delta(self, other: $name) -> Option<i64> {
                match self.0.index(other.0) {
                    Right(d) => Some(d),
                    Left(_) => None,
                }
            }
        }

        impl From<i64> for $name {
            #[inline]
            fn from(n: i64) -> $name {
                $name(SeqNo::from(n))
            }
        }

        impl From<u32> for $name {
            #[inline]
            fn from(n: u32) -> $name {
                $name(SeqNo::from(n as i64))
            }
        }

        impl From<$name> for i64 {
            #[inline]
            fn from(n: $name) -> i64 {
                n.0.into()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }

        impl Orderable for $name {
            #[inline]
            fn sequence_number(&self) -> SeqNo {
                self.0
            }
        }
    };
}

seqno_newtype! {
    /// Names the current leader epoch. Never decreases once persisted.
    View
}

seqno_newtype! {
    /// Names a slot in the replicated log.
    InstanceId
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn view_is_monotone_under_next() {
        let v = View::from(5i64);
        assert_eq!(i64::from(v.next()), 6);
    }

    #[test]
    fn instance_delta() {
        let a = InstanceId::from(10i64);
        let b = InstanceId::from(4i64);
        assert_eq!(a.checked_delta(b), Some(6));
        assert_eq!(b.checked_delta(a), Some(-6));
    }
}
