use super::{channels_last, clamped_taps, width_pyramid, CorrElement};
use cv_core::{Result, Tensor};

/// Feature maps kept in channels-last layout; costs are evaluated at lookup time.
///
/// Memory stays linear in the image size, at the price of `C`-wide dot
/// products per sampled column on every lookup.
#[derive(Debug, Clone)]
pub struct FeaturePyramid<T: CorrElement> {
    /// `[B, H, W, C]`
    fmap1: Tensor<T>,
    /// Level `l` is `[B, H, W >> l, C]`.
    fmap2_levels: Vec<Tensor<T>>,
    scale: f32,
}

impl FeaturePyramid<f32> {
    pub fn build(fmap1: &Tensor, fmap2: &Tensor, num_levels: usize) -> Result<Self> {
        let (_, c, _, _) = fmap1.shape().nchw_dims()?;
        let fmap2_levels = width_pyramid(fmap2, num_levels)?
            .iter()
            .map(channels_last)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            fmap1: channels_last(fmap1)?,
            fmap2_levels,
            scale: 1.0 / (c as f32).sqrt(),
        })
    }

    pub fn cast<U: CorrElement>(&self) -> FeaturePyramid<U> {
        FeaturePyramid {
            fmap1: self.fmap1.cast(),
            fmap2_levels: self.fmap2_levels.iter().map(|l| l.cast()).collect(),
            scale: self.scale,
        }
    }
}

impl<T: CorrElement> FeaturePyramid<T> {
    pub fn num_levels(&self) -> usize {
        self.fmap2_levels.len()
    }

    /// Fill `out` (`W1 · K` values, channels last) for row `y` of batch `b`.
    ///
    /// With `strip` set, every integer column the window touches is scored
    /// once and all taps interpolate from that strip; otherwise each tap scores
    /// its two neighbouring columns itself.
    pub(crate) fn sample_row(
        &self,
        b: usize,
        y: usize,
        xs: &[f32],
        radius: usize,
        strip: bool,
        out: &mut [f32],
    ) {
        let taps = 2 * radius + 1;
        let k = self.fmap2_levels.len() * taps;
        let dims1 = self.fmap1.dims();
        let (h, w1, c) = (dims1[1], dims1[2], dims1[3]);
        let f1 = self.fmap1.as_slice();
        let mut costs: Vec<f32> = Vec::with_capacity(taps + 1);
        let mut window: Vec<(usize, usize, f32)> = Vec::with_capacity(taps);

        for (level, fmap2) in self.fmap2_levels.iter().enumerate() {
            let w2 = fmap2.dims()[2];
            let f2 = fmap2.as_slice();
            let row2 = (b * h + y) * w2;
            let inv = 1.0 / (1u32 << level) as f32;

            for (x1, &x) in xs.iter().enumerate().take(w1) {
                let p1 = (b * h + y) * w1 + x1;
                let left = &f1[p1 * c..(p1 + 1) * c];
                let cost_at = |col: usize| {
                    let p2 = row2 + col;
                    T::dot(left, &f2[p2 * c..(p2 + 1) * c]) * self.scale
                };

                let center = x * inv;
                let dst = &mut out[x1 * k + level * taps..x1 * k + (level + 1) * taps];
                if strip {
                    // Bounds come from the exact taps; `center ± r` can round
                    // to a different column than `center + t - r`.
                    window.clear();
                    window.extend(
                        (0..taps).map(|t| clamped_taps(center + t as f32 - radius as f32, w2)),
                    );
                    let lo = window.iter().map(|tap| tap.0).min().unwrap_or(0);
                    let hi = window.iter().map(|tap| tap.1).max().unwrap_or(lo);
                    costs.clear();
                    costs.extend((lo..=hi).map(cost_at));
                    for (slot, &(i0, i1, a)) in dst.iter_mut().zip(window.iter()) {
                        *slot = costs[i0 - lo] * (1.0 - a) + costs[i1 - lo] * a;
                    }
                } else {
                    for (t, slot) in dst.iter_mut().enumerate() {
                        let (i0, i1, a) = clamped_taps(center + t as f32 - radius as f32, w2);
                        *slot = cost_at(i0) * (1.0 - a) + cost_at(i1) * a;
                    }
                }
            }
        }
    }
}
