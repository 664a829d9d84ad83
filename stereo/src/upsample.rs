//! Convex-combination upsampling of a low-resolution flow field.
//!
//! Every intermediate tensor stays within `MAX_RANK` dimensions. The final
//! reassembly keeps the permute and its materialisation as an explicit step
//! ahead of the last reshape.

use cv_core::{Error, Result, Tensor};
use cv_imgproc::{resize_bilinear, unfold};

/// Neighbourhood size of one convex combination.
pub const NEIGHBOURS: usize = 9;

/// Softmax-normalised mask weights `[N, 9, f², H·W]`.
///
/// `mask` holds raw logits `[N, 9·f², H, W]` with channel `k·f² + sub`.
pub fn normalize_mask(mask: &Tensor, factor: usize) -> Result<Tensor> {
    let (n, c, h, w) = mask.shape().nchw_dims()?;
    let ff = factor * factor;
    if factor == 0 || c != NEIGHBOURS * ff {
        return Err(Error::DimensionMismatch(format!(
            "Mask has {} channels, expected {} for factor {}",
            c,
            NEIGHBOURS * ff,
            factor
        )));
    }
    mask.reshape(&[n, NEIGHBOURS, ff, h * w])?.softmax(1)
}

/// Upsample `flow [N, D, H, W]` by `factor` with per-pixel convex weights.
///
/// Each output pixel `(h·f + fy, w·f + fx)` is the mask-weighted average of
/// the 3×3 neighbourhood of `factor · flow` around `(h, w)`, zero padded.
pub fn convex_upsample(flow: &Tensor, mask: &Tensor, factor: usize) -> Result<Tensor> {
    let (n, d, h, w) = flow.shape().nchw_dims()?;
    let (mn, _, mh, mw) = mask.shape().nchw_dims()?;
    if (mn, mh, mw) != (n, h, w) {
        return Err(Error::DimensionMismatch(format!(
            "Mask {:?} does not cover flow {:?}",
            mask.shape(),
            flow.shape()
        )));
    }
    let hw = h * w;

    // [N, 1, 9, f², HW]
    let weights = normalize_mask(mask, factor)?.unsqueeze(1)?;

    // [N, D·9, HW] → [N, D, 9, 1, HW]
    let neighbourhoods = unfold(&flow.scale(factor as f32), 3, 1)?
        .reshape(&[n, d, NEIGHBOURS, 1, hw])?;

    // [N, D, 9, f², HW] summed over the neighbours → [N, D, f², HW]
    let blended = neighbourhoods.broadcast_mul(&weights)?.sum_axis(2)?;

    // [N·D, f, f, H, W] → [N·D, H, f, W, f]
    let tiled = blended.reshape(&[n * d, factor, factor, h, w])?;
    let interleaved = tiled.permute(&[0, 3, 1, 4, 2])?.contiguous();

    interleaved
        .flatten(1)?
        .into_shape(&[n, d, factor * h, factor * w])
}

/// Plain upsampling used when no mask head exists: align-corners bilinear
/// resize scaled by `factor`.
pub fn bilinear_upsample(flow: &Tensor, factor: usize) -> Result<Tensor> {
    let (h, w) = flow.shape().hw()?;
    Ok(resize_bilinear(flow, factor * h, factor * w, true)?.scale(factor as f32))
}
