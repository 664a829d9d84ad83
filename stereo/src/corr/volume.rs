use super::{channels_last, clamped_taps, width_pyramid, CorrElement};
use cv_core::{Result, Tensor, TensorShape};
use rayon::prelude::*;

/// Precomputed all-pairs cost volume per level.
///
/// Level `l` is stored as `[B, H, W1, W2 >> l]`: for every left pixel, the
/// cost against every (pooled) column of the same row on the right.
#[derive(Debug, Clone)]
pub struct VolumePyramid<T: CorrElement> {
    levels: Vec<Tensor<T>>,
}

impl VolumePyramid<f32> {
    pub fn build(fmap1: &Tensor, fmap2: &Tensor, num_levels: usize) -> Result<Self> {
        let (b, c, h, w) = fmap1.shape().nchw_dims()?;
        let f1 = channels_last(fmap1)?;
        let f2 = channels_last(fmap2)?;
        let (f1, f2) = (f1.as_slice(), f2.as_slice());
        let scale = 1.0 / (c as f32).sqrt();

        let mut volume = vec![0.0f32; b * h * w * w];
        volume
            .par_chunks_mut(w)
            .enumerate()
            .for_each(|(pixel, costs)| {
                let row_start = pixel - pixel % w;
                let left = &f1[pixel * c..(pixel + 1) * c];
                for (x2, cost) in costs.iter_mut().enumerate() {
                    let right = &f2[(row_start + x2) * c..(row_start + x2 + 1) * c];
                    *cost = f32::dot(left, right) * scale;
                }
            });

        // Viewed as NCHW with rows as channels, so pooling runs along W2 only.
        let level0 = Tensor::from_vec(volume, TensorShape::nchw(b, h, w, w))?;
        Ok(Self {
            levels: width_pyramid(&level0, num_levels)?,
        })
    }

    /// Re-store every level in another precision.
    pub fn cast<U: CorrElement>(&self) -> VolumePyramid<U> {
        VolumePyramid {
            levels: self.levels.iter().map(|l| l.cast()).collect(),
        }
    }
}

impl<T: CorrElement> VolumePyramid<T> {
    pub fn num_levels(&self) -> usize {
        self.levels.len()
    }

    pub fn level(&self, index: usize) -> Option<&Tensor<T>> {
        self.levels.get(index)
    }

    /// Fill `out` (`W1 · K` values, channels last) for row `y` of batch `b`.
    pub(crate) fn sample_row(&self, b: usize, y: usize, xs: &[f32], radius: usize, out: &mut [f32]) {
        let taps = 2 * radius + 1;
        let k = self.levels.len() * taps;
        for (level, volume) in self.levels.iter().enumerate() {
            let dims = volume.dims();
            let (h, w1, w2) = (dims[1], dims[2], dims[3]);
            let data = volume.as_slice();
            let inv = 1.0 / (1u32 << level) as f32;
            for (x1, &x) in xs.iter().enumerate().take(w1) {
                let base = ((b * h + y) * w1 + x1) * w2;
                let costs = &data[base..base + w2];
                let center = x * inv;
                let dst = &mut out[x1 * k + level * taps..x1 * k + (level + 1) * taps];
                for (t, slot) in dst.iter_mut().enumerate() {
                    let (i0, i1, a) = clamped_taps(center + t as f32 - radius as f32, w2);
                    *slot = costs[i0].to_f32() * (1.0 - a) + costs[i1].to_f32() * a;
                }
            }
        }
    }
}
