//! Encoder seam in front of the refinement core.
//!
//! The refinement loop only needs two things from an encoder: matching
//! features for both images at the finest recurrence resolution, and per-level
//! `(hidden, context)` pairs for the left image. [`ProjectionBackbone`] is a
//! small deterministic encoder used for smoke runs, tests and benches; trained
//! encoders plug in through the [`Backbone`] trait.

use crate::config::StereoConfig;
use crate::nn::Conv2d;
use crate::weights::{ConvSpec, ParamStore};
use cv_core::{Error, Result, Tensor};
use cv_imgproc::{avg_pool2d, pool2x, Pool2d};

/// Raw encoder output for one recurrence level.
#[derive(Debug, Clone)]
pub struct ContextFeatures {
    /// Pre-activation hidden state; the controller applies `tanh`.
    pub hidden: Tensor,
    /// Context features the gate projections are computed from.
    pub context: Tensor,
}

pub trait Backbone {
    /// Per-level context for a normalised `[B, 3, H, W]` image, coarse-to-fine.
    /// The finest entry lives on the feature-map grid; each coarser entry is
    /// the `pool2x` size of the next finer one.
    fn encode_context(&self, image: &Tensor, levels: usize) -> Result<Vec<ContextFeatures>>;

    /// Matching features `[B, C, H/f, W/f]` for both normalised images.
    fn encode_features(&self, image1: &Tensor, image2: &Tensor) -> Result<(Tensor, Tensor)>;
}

/// Average-pools the image to the working resolution and applies learned 1×1
/// projections per output.
#[derive(Debug, Clone)]
pub struct ProjectionBackbone {
    factor: usize,
    features: Conv2d,
    /// `(hidden, context)` projections, coarse-to-fine.
    levels: Vec<(Conv2d, Conv2d)>,
}

impl ProjectionBackbone {
    pub fn conv_specs(config: &StereoConfig) -> Vec<ConvSpec> {
        let n = config.n_gru_layers;
        let mut specs = vec![ConvSpec::new("backbone.fnet.proj", 3, config.feature_dim, 1)];
        for (level, &hidden) in config.hidden_dims.iter().enumerate() {
            let idx = n.saturating_sub(level + 1);
            specs.push(ConvSpec::new(format!("backbone.cnet.{}.hidden", idx), 3, hidden, 1));
            specs.push(ConvSpec::new(format!("backbone.cnet.{}.context", idx), 3, hidden, 1));
        }
        specs
    }

    pub fn from_store(config: &StereoConfig, store: &ParamStore) -> Result<Self> {
        config.validate()?;
        let specs = Self::conv_specs(config);
        let features = Conv2d::from_store(store, &specs[0])?;
        let levels = specs[1..]
            .chunks(2)
            .map(|pair| {
                Ok((
                    Conv2d::from_store(store, &pair[0])?,
                    Conv2d::from_store(store, &pair[1])?,
                ))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            factor: config.downsample_factor(),
            features,
            levels,
        })
    }

    pub fn seeded(config: &StereoConfig, seed: u64) -> Result<Self> {
        let store = ParamStore::seeded_from_specs(&Self::conv_specs(config), seed)?;
        Self::from_store(config, &store)
    }

    fn downsample(&self, image: &Tensor) -> Result<Tensor> {
        if self.factor == 1 {
            return Ok(image.clone());
        }
        avg_pool2d(image, Pool2d::square(self.factor, self.factor, 0))
    }
}

impl Backbone for ProjectionBackbone {
    fn encode_context(&self, image: &Tensor, levels: usize) -> Result<Vec<ContextFeatures>> {
        if levels != self.levels.len() {
            return Err(Error::InvalidParameters(format!(
                "Backbone was built for {} context levels, {} requested",
                self.levels.len(),
                levels
            )));
        }

        // Finest first, then reversed into coarse-to-fine order.
        let mut pooled = self.downsample(image)?;
        let mut out = Vec::with_capacity(levels);
        for (hidden, context) in self.levels.iter().rev() {
            if !out.is_empty() {
                pooled = pool2x(&pooled)?;
            }
            out.push(ContextFeatures {
                hidden: hidden.forward(&pooled)?,
                context: context.forward(&pooled)?,
            });
        }
        out.reverse();
        Ok(out)
    }

    fn encode_features(&self, image1: &Tensor, image2: &Tensor) -> Result<(Tensor, Tensor)> {
        let fmap1 = self.features.forward(&self.downsample(image1)?)?;
        let fmap2 = self.features.forward(&self.downsample(image2)?)?;
        Ok((fmap1, fmap2))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cv_core::TensorShape;

    #[test]
    fn test_context_levels_follow_pool2x_sizes() {
        let config = StereoConfig::default()
            .with_gru_layers(3, 4)
            .with_feature_dim(6)
            .with_n_downsample(2);
        let backbone = ProjectionBackbone::seeded(&config, 3).unwrap();
        let image = Tensor::full(TensorShape::nchw(1, 3, 20, 36), 0.5f32);

        let ctx = backbone.encode_context(&image, 3).unwrap();
        let sizes: Vec<(usize, usize)> = ctx.iter().map(|c| c.hidden.shape().hw().unwrap()).collect();
        assert_eq!(sizes, vec![(2, 3), (3, 5), (5, 9)]);
        assert!(backbone.encode_context(&image, 2).is_err());

        let (f1, f2) = backbone.encode_features(&image, &image).unwrap();
        assert_eq!(f1.dims(), &[1, 6, 5, 9]);
        assert_eq!(f1, f2);
    }
}
