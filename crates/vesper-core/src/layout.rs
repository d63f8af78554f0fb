//! Memory layout descriptors: physical axis order, stride policy, batch support.

use std::fmt;

use crate::{Error, Result};

/// Logical axis indices of a rank-4 activation tensor.
pub mod axis {
    pub const N: usize = 0;
    pub const C: usize = 1;
    pub const H: usize = 2;
    pub const W: usize = 3;
}

const AXIS_LETTERS: [char; 4] = ['N', 'C', 'H', 'W'];

/// Permutation mapping logical tensor axes to physical storage positions.
///
/// Entries are logical axis indices listed from the outermost physical
/// position to the innermost one, so `[0, 2, 3, 1]` stores a rank-4 tensor
/// as NHWC (channels innermost).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MemoryOrder(Vec<usize>);

impl MemoryOrder {
    /// Build an order from a permutation, validating it.
    pub fn from_perm(perm: Vec<usize>) -> Result<Self> {
        let mut seen = vec![false; perm.len()];
        for &axis in &perm {
            if axis >= perm.len() || seen[axis] {
                return Err(Error::Shape(format!(
                    "{:?} is not a permutation of {} axes",
                    perm,
                    perm.len()
                )));
            }
            seen[axis] = true;
        }
        Ok(Self(perm))
    }

    /// The row-major order of the given rank.
    pub fn identity(rank: usize) -> Self {
        Self((0..rank).collect())
    }

    pub fn nchw() -> Self {
        Self::identity(4)
    }

    pub fn nhwc() -> Self {
        Self(vec![axis::N, axis::H, axis::W, axis::C])
    }

    pub fn rank(&self) -> usize {
        self.0.len()
    }

    pub fn perm(&self) -> &[usize] {
        &self.0
    }

    pub fn is_identity(&self) -> bool {
        self.0.iter().enumerate().all(|(i, &axis)| i == axis)
    }

    /// Physical position of a logical axis, counted from the innermost.
    pub fn position_of(&self, logical_axis: usize) -> Option<usize> {
        self.0
            .iter()
            .position(|&a| a == logical_axis)
            .map(|outer| self.0.len() - 1 - outer)
    }

    /// Move one logical axis to a physical position counted from the
    /// innermost, keeping the relative order of the other axes.
    ///
    /// Returns `None` when the axis or the position is out of range.
    pub fn with_axis_at(&self, logical_axis: usize, position: usize) -> Option<Self> {
        let rank = self.0.len();
        if logical_axis >= rank || position >= rank {
            return None;
        }
        let mut perm: Vec<usize> = self.0.iter().copied().filter(|&a| a != logical_axis).collect();
        perm.insert(rank - 1 - position, logical_axis);
        Some(Self(perm))
    }
}

impl fmt::Display for MemoryOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.len() == AXIS_LETTERS.len() {
            for &axis in &self.0 {
                write!(f, "{}", AXIS_LETTERS[axis])?;
            }
            Ok(())
        } else {
            write!(f, "{:?}", self.0)
        }
    }
}

/// Stride policy for a tensor buffer.
///
/// Ordered from least to most restrictive so that merging two requests is
/// just taking the maximum.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StrideRequirement {
    /// Arbitrary strides, padding allowed.
    #[default]
    Any,

    /// Densely packed buffer.
    Compact,
}

impl StrideRequirement {
    /// Combine two requests, keeping the most restrictive.
    pub fn merge(self, other: Self) -> Self {
        self.max(other)
    }
}

/// Whether an operator can process batch elements independently.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum BatchSupport {
    /// The stage may be executed once per batch element.
    Split,

    /// The stage must see the whole batch at once.
    #[default]
    Whole,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_rank4_orders() {
        assert_eq!(MemoryOrder::nchw().to_string(), "NCHW");
        assert_eq!(MemoryOrder::nhwc().to_string(), "NHWC");
        assert_eq!(MemoryOrder::identity(2).to_string(), "[0, 1]");
    }

    #[test]
    fn test_from_perm_validates() {
        assert!(MemoryOrder::from_perm(vec![0, 2, 1]).is_ok());
        assert!(MemoryOrder::from_perm(vec![0, 0, 1]).is_err());
        assert!(MemoryOrder::from_perm(vec![0, 3]).is_err());
    }

    #[test]
    fn test_move_channel_axis() {
        // Channels at position 2 from the innermost is the planar NCHW layout.
        let moved = MemoryOrder::nhwc().with_axis_at(axis::C, 2).unwrap();
        assert_eq!(moved, MemoryOrder::nchw());
        assert_eq!(moved.position_of(axis::C), Some(2));

        let innermost = MemoryOrder::nchw().with_axis_at(axis::C, 0).unwrap();
        assert_eq!(innermost, MemoryOrder::nhwc());
        assert!(MemoryOrder::nchw().with_axis_at(axis::C, 4).is_none());
    }

    #[test]
    fn test_stride_merge_is_most_restrictive() {
        use StrideRequirement::*;
        assert_eq!(Any.merge(Any), Any);
        assert_eq!(Any.merge(Compact), Compact);
        assert_eq!(Compact.merge(Any), Compact);
    }
}
