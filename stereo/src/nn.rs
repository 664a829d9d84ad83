use crate::weights::{ConvSpec, ParamStore};
use cv_core::{Error, Result, Tensor};
use cv_imgproc::conv2d;

/// Stride-1 convolution with "same" zero padding (odd kernels only).
#[derive(Debug, Clone)]
pub struct Conv2d {
    weight: Tensor,
    bias: Tensor,
    padding: usize,
}

impl Conv2d {
    /// `weight` is `[O, I, K, K]` with odd `K`, `bias` has `O` entries.
    pub fn new(weight: Tensor, bias: Tensor) -> Result<Self> {
        let (out_c, _, kh, kw) = weight.shape().nchw_dims()?;
        if kh != kw || kh % 2 == 0 {
            return Err(Error::InvalidParameters(format!(
                "Convolution kernel must be square and odd, got {}x{}",
                kh, kw
            )));
        }
        if bias.len() != out_c {
            return Err(Error::DimensionMismatch(format!(
                "Bias has {} entries for {} output channels",
                bias.len(),
                out_c
            )));
        }
        Ok(Self {
            weight,
            bias,
            padding: kh / 2,
        })
    }

    pub fn from_store(store: &ParamStore, spec: &ConvSpec) -> Result<Self> {
        let (weight, bias) = store.conv(spec)?;
        Self::new(weight, bias)
    }

    pub fn out_channels(&self) -> usize {
        self.weight.dims()[0]
    }

    pub fn in_channels(&self) -> usize {
        self.weight.dims()[1]
    }

    pub fn kernel_size(&self) -> usize {
        self.weight.dims()[2]
    }

    pub fn forward(&self, input: &Tensor) -> Result<Tensor> {
        conv2d(input, &self.weight, Some(&self.bias), self.padding)
    }

    /// `relu(self(input))`
    pub fn forward_relu(&self, input: &Tensor) -> Result<Tensor> {
        Ok(self.forward(input)?.relu())
    }
}
