use cv_core::{Error, Result, Tensor, TensorShape};
use rayon::prelude::*;

/// Source coordinate of output index `i` when resizing `src_len` → `dst_len`.
#[inline]
fn source_coord(i: usize, src_len: usize, dst_len: usize, align_corners: bool) -> f32 {
    if align_corners {
        if dst_len <= 1 {
            0.0
        } else {
            i as f32 * (src_len - 1) as f32 / (dst_len - 1) as f32
        }
    } else {
        let scale = src_len as f32 / dst_len as f32;
        ((i as f32 + 0.5) * scale - 0.5).max(0.0)
    }
}

/// Interpolation taps `(i0, i1, frac)` for every output index along one axis.
fn axis_taps(src_len: usize, dst_len: usize, align_corners: bool) -> Vec<(usize, usize, f32)> {
    (0..dst_len)
        .map(|i| {
            let f = source_coord(i, src_len, dst_len, align_corners);
            let i0 = (f.floor() as usize).min(src_len - 1);
            let i1 = (i0 + 1).min(src_len - 1);
            (i0, i1, f - i0 as f32)
        })
        .collect()
}

/// Bilinear resize of the spatial axes of an `[N, C, H, W]` tensor.
///
/// With `align_corners` the corner samples of input and output coincide;
/// otherwise pixel centres are aligned (half-pixel convention).
pub fn resize_bilinear(
    input: &Tensor,
    height: usize,
    width: usize,
    align_corners: bool,
) -> Result<Tensor> {
    let (n, c, h, w) = input.shape().nchw_dims()?;
    if height == 0 || width == 0 || h == 0 || w == 0 {
        return Err(Error::InvalidInput(format!(
            "Cannot resize {:?} to {}x{}",
            input.shape(),
            height,
            width
        )));
    }

    let rows = axis_taps(h, height, align_corners);
    let cols = axis_taps(w, width, align_corners);
    let src = input.as_slice();

    let mut out = vec![0.0f32; n * c * height * width];
    out.par_chunks_mut(height * width)
        .enumerate()
        .for_each(|(plane_idx, dst)| {
            let plane = &src[plane_idx * h * w..(plane_idx + 1) * h * w];
            for (y, &(y0, y1, dy)) in rows.iter().enumerate() {
                let r0 = &plane[y0 * w..(y0 + 1) * w];
                let r1 = &plane[y1 * w..(y1 + 1) * w];
                let out_row = &mut dst[y * width..(y + 1) * width];
                for (x, &(x0, x1, dx)) in cols.iter().enumerate() {
                    let v0 = r0[x0] * (1.0 - dx) + r0[x1] * dx;
                    let v1 = r1[x0] * (1.0 - dx) + r1[x1] * dx;
                    out_row[x] = v0 * (1.0 - dy) + v1 * dy;
                }
            }
        });

    Tensor::from_vec(out, TensorShape::nchw(n, c, height, width))
}
