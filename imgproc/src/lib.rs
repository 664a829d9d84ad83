pub mod color;
pub mod convolve;
pub mod pool;
pub mod resize;
pub mod simd;

pub use color::*;
pub use convolve::*;
pub use pool::*;
pub use resize::*;

pub use cv_core::{Error, Result};

/// Reject tensors that are not `[N, C, H, W]` or have an empty axis.
pub fn validate_nchw(tensor: &cv_core::Tensor) -> Result<(usize, usize, usize, usize)> {
    let dims = tensor.shape().nchw_dims()?;
    if dims.0 == 0 || dims.1 == 0 || dims.2 == 0 || dims.3 == 0 {
        return Err(Error::DimensionMismatch(format!(
            "Tensor dimensions must be non-zero, got {:?}",
            tensor.shape()
        )));
    }
    Ok(dims)
}
