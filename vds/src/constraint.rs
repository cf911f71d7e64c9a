use crate::errors::{Error, Result};

/// A start/stride/stop triple over one dimension, `stop` inclusive.
///
/// A constraint is expressed in the aggregated (global) index space at the
/// variable boundary and in per-member (local) space once transferred to a
/// member. `extent` is the full cardinality of the dimension the constraint
/// applies to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Hyperslab {
    pub start: usize,
    pub stride: usize,
    pub stop: usize,
    pub extent: usize,
}

impl Hyperslab {
    pub fn new(start: usize, stride: usize, stop: usize, extent: usize) -> Self {
        Self {
            start,
            stride,
            stop,
            extent,
        }
    }

    /// The whole dimension: every index, stride one.
    pub fn full(extent: usize) -> Self {
        Self {
            start: 0,
            stride: 1,
            stop: extent.saturating_sub(1),
            extent,
        }
    }

    /// Number of selected indices.
    pub fn len(&self) -> usize {
        (self.stop - self.start) / self.stride + 1
    }

    pub fn is_empty(&self) -> bool {
        self.extent == 0
    }

    pub fn validate(&self) -> Result<()> {
        if self.stride < 1 {
            return Err(Error::BadConstraint {
                detail: format!("stride must be at least 1, got {}", self.stride),
            });
        }
        if self.start > self.stop {
            return Err(Error::BadConstraint {
                detail: format!("start {} exceeds stop {}", self.start, self.stop),
            });
        }
        if self.stop >= self.extent {
            return Err(Error::BadConstraint {
                detail: format!("stop {} exceeds extent {}", self.stop, self.extent),
            });
        }

        Ok(())
    }

    /// Iterate the selected indices in increasing order.
    pub fn iter(&self) -> impl Iterator<Item = usize> {
        (self.start..=self.stop).step_by(self.stride)
    }
}
