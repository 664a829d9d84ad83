use std::fmt;

/// Highest tensor rank any operator in this workspace may produce.
///
/// Embedded NPU toolchains reject graphs containing tensors above rank 5, so the
/// ceiling is enforced at shape construction rather than left to convention.
pub const MAX_RANK: usize = 5;

/// Dimensions of a dense, row-major tensor of rank `1..=MAX_RANK`.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TensorShape {
    dims: [usize; MAX_RANK],
    rank: usize,
}

impl TensorShape {
    pub fn new(dims: &[usize]) -> crate::Result<Self> {
        if dims.is_empty() {
            return Err(crate::Error::InvalidInput(
                "Tensor shape must have at least one dimension".into(),
            ));
        }
        if dims.len() > MAX_RANK {
            return Err(crate::Error::RankExceeded {
                rank: dims.len(),
                max: MAX_RANK,
            });
        }
        let mut packed = [1usize; MAX_RANK];
        packed[..dims.len()].copy_from_slice(dims);
        Ok(Self {
            dims: packed,
            rank: dims.len(),
        })
    }

    /// Batch-channel-height-width shape; rank 4 is always within the ceiling.
    pub fn nchw(batch: usize, channels: usize, height: usize, width: usize) -> Self {
        Self {
            dims: [batch, channels, height, width, 1],
            rank: 4,
        }
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims[..self.rank]
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn dim(&self, axis: usize) -> crate::Result<usize> {
        self.dims()
            .get(axis)
            .copied()
            .ok_or_else(|| crate::Error::InvalidInput(format!(
                "Axis {} out of range for rank-{} tensor",
                axis, self.rank
            )))
    }

    pub fn len(&self) -> usize {
        self.dims().iter().fold(1usize, |acc, &d| acc.saturating_mul(d))
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Row-major strides, innermost axis fastest.
    pub fn strides(&self) -> [usize; MAX_RANK] {
        let mut strides = [0usize; MAX_RANK];
        let mut acc = 1usize;
        for axis in (0..self.rank).rev() {
            strides[axis] = acc;
            acc *= self.dims[axis];
        }
        strides
    }

    /// Unpack a rank-4 shape as `(n, c, h, w)`.
    pub fn nchw_dims(&self) -> crate::Result<(usize, usize, usize, usize)> {
        if self.rank != 4 {
            return Err(crate::Error::DimensionMismatch(format!(
                "Expected a rank-4 NCHW tensor, got {:?}",
                self
            )));
        }
        Ok((self.dims[0], self.dims[1], self.dims[2], self.dims[3]))
    }

    /// `(height, width)` of a rank-4 NCHW shape.
    pub fn hw(&self) -> crate::Result<(usize, usize)> {
        let (_, _, h, w) = self.nchw_dims()?;
        Ok((h, w))
    }
}

impl fmt::Debug for TensorShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.dims())
    }
}
