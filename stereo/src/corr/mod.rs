//! Multi-level 1-D correlation pyramid.
//!
//! Matching cost between two rectified feature maps is only ever evaluated
//! along the same row. Level `l` compares feature map 1 against feature map 2
//! average-pooled by `2^l` along width, and a lookup samples `2·radius + 1`
//! taps around `x / 2^l` with linear interpolation along width.

mod on_demand;
mod volume;

pub use on_demand::FeaturePyramid;
pub use volume::VolumePyramid;

use crate::config::CorrImplementation;
use cv_core::{Element, Error, Result, Tensor, TensorShape};
use cv_imgproc::{avg_pool2d, simd, Pool2d};
use half::f16;
use rayon::prelude::*;
use tracing::debug;

/// Scalar storage for correlation data.
pub trait CorrElement: Element {
    fn dot(a: &[Self], b: &[Self]) -> f32;
}

impl CorrElement for f32 {
    #[inline]
    fn dot(a: &[f32], b: &[f32]) -> f32 {
        simd::dot(a, b)
    }
}

impl CorrElement for f16 {
    #[inline]
    fn dot(a: &[f16], b: &[f16]) -> f32 {
        a.iter().zip(b).map(|(x, y)| x.to_f32() * y.to_f32()).sum()
    }
}

/// Linear-interpolation taps `(x0, x1, frac)` at `x`, with `x` clamped to the
/// valid column range `0..=width-1`.
#[inline]
pub(crate) fn clamped_taps(x: f32, width: usize) -> (usize, usize, f32) {
    let max = width.saturating_sub(1) as f32;
    let x = if x.is_nan() { 0.0 } else { x.clamp(0.0, max) };
    let x0 = (x.floor() as usize).min(width.saturating_sub(1));
    let x1 = (x0 + 1).min(width.saturating_sub(1));
    (x0, x1, x - x0 as f32)
}

/// `[B, C, H, W]` → `[B, H, W, C]` so every pixel's feature vector is contiguous.
pub(crate) fn channels_last(fmap: &Tensor) -> Result<Tensor> {
    Ok(fmap.permute(&[0, 2, 3, 1])?.contiguous())
}

/// Width-only pairwise average pyramid of an NCHW tensor, `levels` entries,
/// level 0 being the input itself.
pub(crate) fn width_pyramid(base: &Tensor, levels: usize) -> Result<Vec<Tensor>> {
    let mut pyramid = Vec::with_capacity(levels);
    pyramid.push(base.clone());
    for level in 1..levels {
        let prev = &pyramid[level - 1];
        let (_, _, _, w) = prev.shape().nchw_dims()?;
        if w < 2 {
            return Err(Error::InvalidParameters(format!(
                "Correlation level {} would have zero width (base width {})",
                level,
                base.dims()[3]
            )));
        }
        let pooled = avg_pool2d(prev, Pool2d::width_only(2))?;
        pyramid.push(pooled);
    }
    Ok(pyramid)
}

#[derive(Debug, Clone)]
enum Backend {
    Reg(VolumePyramid<f32>),
    Alt(FeaturePyramid<f32>),
    AltFast(FeaturePyramid<f32>),
    RegCuda(VolumePyramid<f16>),
    AltCuda(FeaturePyramid<f16>),
}

/// Correlation pyramid for one inference call. Built once, never mutated.
#[derive(Debug, Clone)]
pub struct CorrelationPyramid {
    implementation: CorrImplementation,
    radius: usize,
    num_levels: usize,
    batch: usize,
    height: usize,
    width: usize,
    backend: Backend,
}

impl CorrelationPyramid {
    /// Build the pyramid for two `[B, C, H, W]` feature maps of identical shape.
    pub fn build(
        fmap1: &Tensor,
        fmap2: &Tensor,
        implementation: CorrImplementation,
        radius: usize,
        num_levels: usize,
    ) -> Result<Self> {
        if num_levels == 0 {
            return Err(Error::InvalidParameters(
                "Correlation pyramid needs at least one level".into(),
            ));
        }
        if fmap1.shape() != fmap2.shape() {
            return Err(Error::DimensionMismatch(format!(
                "Feature maps differ in shape: {:?} vs {:?}",
                fmap1.shape(),
                fmap2.shape()
            )));
        }
        let (batch, _, height, width) = cv_imgproc::validate_nchw(fmap1)?;

        let backend = match implementation {
            CorrImplementation::Reg => Backend::Reg(VolumePyramid::build(fmap1, fmap2, num_levels)?),
            CorrImplementation::Alt => Backend::Alt(FeaturePyramid::build(fmap1, fmap2, num_levels)?),
            CorrImplementation::AltFast => {
                Backend::AltFast(FeaturePyramid::build(fmap1, fmap2, num_levels)?)
            }
            CorrImplementation::RegCuda => {
                Backend::RegCuda(VolumePyramid::<f32>::build(fmap1, fmap2, num_levels)?.cast())
            }
            CorrImplementation::AltCuda => {
                Backend::AltCuda(FeaturePyramid::<f32>::build(fmap1, fmap2, num_levels)?.cast())
            }
        };

        debug!(
            "Built {} correlation pyramid: {} levels, radius {}, {}x{}",
            implementation, num_levels, radius, height, width
        );

        Ok(Self {
            implementation,
            radius,
            num_levels,
            batch,
            height,
            width,
            backend,
        })
    }

    pub fn implementation(&self) -> CorrImplementation {
        self.implementation
    }

    pub fn radius(&self) -> usize {
        self.radius
    }

    pub fn num_levels(&self) -> usize {
        self.num_levels
    }

    /// Channels of a lookup result, `levels · (2·radius + 1)`.
    pub fn channels(&self) -> usize {
        self.num_levels * (2 * self.radius + 1)
    }

    /// Sample the pyramid around the horizontal component of `coords1`.
    ///
    /// `coords1` is `[B, 2, H, W]` (channel 0 = x) on the feature-map grid. The
    /// result is `[B, L·(2r+1), H, W]`, level-major with offsets ascending.
    pub fn lookup(&self, coords1: &Tensor) -> Result<Tensor> {
        let (b, c, h, w) = coords1.shape().nchw_dims()?;
        if c != 2 || (b, h, w) != (self.batch, self.height, self.width) {
            return Err(Error::DimensionMismatch(format!(
                "Coordinates {:?} do not match correlation grid [{}, 2, {}, {}]",
                coords1.shape(),
                self.batch,
                self.height,
                self.width
            )));
        }

        let k = self.channels();
        let coords = coords1.as_slice();
        let mut out = vec![0.0f32; b * h * w * k];
        out.par_chunks_mut(w * k).enumerate().for_each(|(row, dst)| {
            let (bi, yi) = (row / h, row % h);
            let base = bi * 2 * h * w + yi * w;
            let xs = &coords[base..base + w];
            match &self.backend {
                Backend::Reg(v) => v.sample_row(bi, yi, xs, self.radius, dst),
                Backend::RegCuda(v) => v.sample_row(bi, yi, xs, self.radius, dst),
                Backend::Alt(f) => f.sample_row(bi, yi, xs, self.radius, false, dst),
                Backend::AltFast(f) => f.sample_row(bi, yi, xs, self.radius, true, dst),
                Backend::AltCuda(f) => f.sample_row(bi, yi, xs, self.radius, false, dst),
            }
        });

        let channels_last = Tensor::from_vec(out, TensorShape::new(&[b, h, w, k])?)?;
        Ok(channels_last.permute(&[0, 3, 1, 2])?.contiguous())
    }
}
