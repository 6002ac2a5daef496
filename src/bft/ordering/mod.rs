//! Sequence numbers, views and rounds — the three ways §3's data model
//! orders things.
//!
//! [`SeqNo`] numbers transactions/batches; [`View`] numbers classical
//! primaries; [`Round`] numbers chained/DAG leaders. All three share the
//! same overflow-safe, timing-based-outlier-dropping comparison idiom.

use std::cmp::Ordering as CmpOrdering;

use either::{Either, Left, Right};

#[cfg(feature = "serialize_serde")]
use serde::{Deserialize, Serialize};

/// Something that can report the sequence number of the decision it is
/// associated with (a [`Checkpoint`](crate::bft::log::Checkpoint), a
/// stored consensus message, …).
pub trait Orderable {
    fn sequence_number(&self) -> SeqNo;
}

pub(crate) enum InvalidSeqNo {
    Small,
    Big,
}

/// A globally assigned, contiguous transaction/batch identifier (§3).
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[derive(Debug, Copy, Clone, Ord, Eq, PartialEq, Hash)]
pub struct SeqNo(i32);

impl SeqNo {
    pub const ZERO: SeqNo = SeqNo(0);

    #[inline]
    pub fn next(self) -> SeqNo {
        let (next, overflow) = self.0.overflowing_add(1);
        SeqNo(if overflow { 0 } else { next })
    }

    /// Returns `self - offset`, saturating at zero.
    #[inline]
    pub fn sub(self, offset: u32) -> SeqNo {
        SeqNo((self.0 - offset as i32).max(0))
    }

    #[inline]
    pub fn add(self, offset: u32) -> SeqNo {
        SeqNo(self.0.saturating_add(offset as i32))
    }

    /// Indexes `self` relative to `other`, given a `window` of acceptable
    /// slack (e.g. the checkpoint period, or `high - low` watermark span).
    /// Used to place out-of-order messages into a time-bound-ordering
    /// queue, and to decide whether a message is stale or suspiciously far
    /// in the future (§4.6's (ii) "dropped if outside `[low, high]`").
    #[inline]
    pub(crate) fn index(self, other: SeqNo, window: i32) -> Either<InvalidSeqNo, usize> {
        const OVERFLOW_THRES_POS: i32 = 10_000_000;
        const OVERFLOW_THRES_NEG: i32 = -OVERFLOW_THRES_POS;

        let index = {
            let index = self.0.wrapping_sub(other.0);
            if index < OVERFLOW_THRES_NEG || index > OVERFLOW_THRES_POS {
                i32::MAX.wrapping_add(index).wrapping_add(1)
            } else {
                index
            }
        };

        if index < 0 || index > window {
            Left(if index < 0 {
                InvalidSeqNo::Small
            } else {
                InvalidSeqNo::Big
            })
        } else {
            Right(index as usize)
        }
    }
}

impl From<u32> for SeqNo {
    #[inline]
    fn from(sequence_number: u32) -> SeqNo {
        SeqNo(sequence_number as i32)
    }
}

impl From<SeqNo> for u32 {
    #[inline]
    fn from(sequence_number: SeqNo) -> u32 {
        sequence_number.0 as u32
    }
}

impl PartialOrd for SeqNo {
    fn partial_cmp(&self, other: &SeqNo) -> Option<CmpOrdering> {
        Some(self.0.cmp(&other.0))
    }
}

/// The monotonically non-decreasing view number of the classical protocol;
/// the primary of view `v` is `v mod N` (§3).
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[derive(Debug, Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash)]
pub struct View(u32);

impl View {
    pub const ZERO: View = View(0);

    #[inline]
    pub fn next(self) -> View {
        View(self.0 + 1)
    }

    #[inline]
    pub fn leader(self, n: usize) -> u32 {
        self.0 % (n as u32)
    }
}

impl From<u32> for View {
    fn from(v: u32) -> View {
        View(v)
    }
}

impl From<View> for u32 {
    fn from(v: View) -> u32 {
        v.0
    }
}

/// The round number of the chained/DAG variants; plays the same role as
/// [`View`], but every replica proposes exactly one block per round in DAG
/// mode, rather than a single leader per view (§3).
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[derive(Debug, Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash)]
pub struct Round(u64);

impl Round {
    pub const ZERO: Round = Round(0);

    #[inline]
    pub fn next(self) -> Round {
        Round(self.0 + 1)
    }

    #[inline]
    pub fn prev(self) -> Option<Round> {
        self.0.checked_sub(1).map(Round)
    }

    /// Leader rule for the basic two-round-wave DAG variant (§3): `k/2 mod N`.
    #[inline]
    pub fn dag_wave_leader(self, n: usize) -> u32 {
        ((self.0 / 2) % n as u64) as u32
    }

    /// Leader rule for the chained leader protocol (§3): `(k+1) mod N`.
    #[inline]
    pub fn chained_leader(self, n: usize) -> u32 {
        ((self.0 + 1) % n as u64) as u32
    }
}

impl From<u64> for Round {
    fn from(r: u64) -> Round {
        Round(r)
    }
}

impl From<Round> for u64 {
    fn from(r: Round) -> u64 {
        r.0
    }
}
