use cv_core::{Error, Result, Tensor, TensorShape};
use rayon::prelude::*;

/// Window geometry for [`avg_pool2d`], `(height, width)` pairs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pool2d {
    pub kernel: (usize, usize),
    pub stride: (usize, usize),
    pub padding: (usize, usize),
    /// Divide by the full window area even where it overlaps the zero padding.
    pub count_include_pad: bool,
}

impl Pool2d {
    pub fn square(kernel: usize, stride: usize, padding: usize) -> Self {
        Self {
            kernel: (kernel, kernel),
            stride: (stride, stride),
            padding: (padding, padding),
            count_include_pad: true,
        }
    }

    /// Non-overlapping average over `factor` adjacent columns, rows untouched.
    pub fn width_only(factor: usize) -> Self {
        Self {
            kernel: (1, factor),
            stride: (1, factor),
            padding: (0, 0),
            count_include_pad: true,
        }
    }

    fn output_extent(len: usize, kernel: usize, stride: usize, padding: usize) -> Result<usize> {
        let padded = len + 2 * padding;
        if kernel == 0 || stride == 0 || padded < kernel {
            return Err(Error::InvalidParameters(format!(
                "Pooling window {} (stride {}) does not fit input of size {} with padding {}",
                kernel, stride, len, padding
            )));
        }
        Ok((padded - kernel) / stride + 1)
    }
}

/// Average pooling over the spatial axes of an `[N, C, H, W]` tensor.
///
/// Trailing rows/columns that do not fill a whole window are dropped.
pub fn avg_pool2d(input: &Tensor, params: Pool2d) -> Result<Tensor> {
    let (n, c, h, w) = input.shape().nchw_dims()?;
    let (kh, kw) = params.kernel;
    let (sh, sw) = params.stride;
    let (ph, pw) = params.padding;
    let ho = Pool2d::output_extent(h, kh, sh, ph)?;
    let wo = Pool2d::output_extent(w, kw, sw, pw)?;

    let src = input.as_slice();
    let mut out = vec![0.0f32; n * c * ho * wo];
    if ho * wo > 0 {
        out.par_chunks_mut(ho * wo)
            .enumerate()
            .for_each(|(plane_idx, dst)| {
                let plane = &src[plane_idx * h * w..(plane_idx + 1) * h * w];
                for oy in 0..ho {
                    let y0 = (oy * sh) as isize - ph as isize;
                    for ox in 0..wo {
                        let x0 = (ox * sw) as isize - pw as isize;
                        let mut sum = 0.0f32;
                        let mut count = 0usize;
                        for ky in 0..kh as isize {
                            let y = y0 + ky;
                            if y < 0 || y >= h as isize {
                                continue;
                            }
                            let row = &plane[y as usize * w..(y as usize + 1) * w];
                            for kx in 0..kw as isize {
                                let x = x0 + kx;
                                if x >= 0 && x < w as isize {
                                    sum += row[x as usize];
                                    count += 1;
                                }
                            }
                        }
                        let divisor = if params.count_include_pad {
                            kh * kw
                        } else {
                            count.max(1)
                        };
                        dst[oy * wo + ox] = sum / divisor as f32;
                    }
                }
            });
    }

    Tensor::from_vec(out, TensorShape::nchw(n, c, ho, wo))
}

/// 3×3 average pool, stride 2, padding 1 (padding counted).
pub fn pool2x(input: &Tensor) -> Result<Tensor> {
    avg_pool2d(input, Pool2d::square(3, 2, 1))
}
