//! Element-wise math, reductions and broadcasting for `f32` tensors.

use crate::shape::{TensorShape, MAX_RANK};
use crate::tensor::Tensor;
use rayon::prelude::*;

fn zip_simd<F, G>(a: &[f32], b: &[f32], lanes: F, scalar: G) -> Vec<f32>
where
    F: Fn(wide::f32x8, wide::f32x8) -> wide::f32x8,
    G: Fn(f32, f32) -> f32,
{
    let mut res = vec![0.0f32; a.len()];

    let mut a_chunks = a.chunks_exact(8);
    let mut b_chunks = b.chunks_exact(8);
    let mut res_chunks = res.chunks_exact_mut(8);

    for ((a8, b8), r8) in (&mut a_chunks).zip(&mut b_chunks).zip(&mut res_chunks) {
        let va = wide::f32x8::from(<[f32; 8]>::try_from(a8).unwrap_or([0.0; 8]));
        let vb = wide::f32x8::from(<[f32; 8]>::try_from(b8).unwrap_or([0.0; 8]));
        r8.copy_from_slice(&<[f32; 8]>::from(lanes(va, vb)));
    }

    let rem_a = a_chunks.remainder();
    let rem_b = b_chunks.remainder();
    let rem_res = res_chunks.into_remainder();
    for i in 0..rem_a.len() {
        rem_res[i] = scalar(rem_a[i], rem_b[i]);
    }

    res
}

impl Tensor<f32> {
    fn check_same_shape(&self, other: &Self, op: &str) -> crate::Result<()> {
        if self.shape() != other.shape() {
            return Err(crate::Error::DimensionMismatch(format!(
                "Tensor shape mismatch in {}: {:?} vs {:?}",
                op,
                self.shape(),
                other.shape()
            )));
        }
        Ok(())
    }

    /// SIMD-accelerated element-wise addition.
    pub fn add(&self, other: &Self) -> crate::Result<Self> {
        self.check_same_shape(other, "add")?;
        let res = zip_simd(self.as_slice(), other.as_slice(), |a, b| a + b, |a, b| a + b);
        Self::from_vec(res, self.shape())
    }

    /// SIMD-accelerated element-wise subtraction.
    pub fn sub(&self, other: &Self) -> crate::Result<Self> {
        self.check_same_shape(other, "sub")?;
        let res = zip_simd(self.as_slice(), other.as_slice(), |a, b| a - b, |a, b| a - b);
        Self::from_vec(res, self.shape())
    }

    /// SIMD-accelerated element-wise multiplication.
    pub fn mul(&self, other: &Self) -> crate::Result<Self> {
        self.check_same_shape(other, "mul")?;
        let res = zip_simd(self.as_slice(), other.as_slice(), |a, b| a * b, |a, b| a * b);
        Self::from_vec(res, self.shape())
    }

    pub fn map<F>(&self, f: F) -> Self
    where
        F: Fn(f32) -> f32 + Sync + Send,
    {
        let data: Vec<f32> = self.as_slice().par_iter().map(|&v| f(v)).collect();
        Self::from_vec(data, self.shape()).unwrap_or_else(|_| Self::zeros(self.shape()))
    }

    pub fn scale(&self, factor: f32) -> Self {
        self.map(|v| v * factor)
    }

    pub fn relu(&self) -> Self {
        self.map(|v| v.max(0.0))
    }

    pub fn sigmoid(&self) -> Self {
        self.map(|v| 1.0 / (1.0 + (-v).exp()))
    }

    pub fn tanh(&self) -> Self {
        self.map(f32::tanh)
    }

    pub fn all_finite(&self) -> bool {
        self.as_slice().iter().all(|v| v.is_finite())
    }

    pub fn max_abs(&self) -> f32 {
        self.as_slice().iter().fold(0.0f32, |acc, v| acc.max(v.abs()))
    }

    /// Element-wise product with size-1 axes broadcast against the other operand.
    ///
    /// Both operands must have the same rank; the result stays within `MAX_RANK`.
    pub fn broadcast_mul(&self, other: &Self) -> crate::Result<Self> {
        let rank = self.rank();
        if other.rank() != rank {
            return Err(crate::Error::DimensionMismatch(format!(
                "Broadcast requires equal ranks: {:?} vs {:?}",
                self.shape(),
                other.shape()
            )));
        }

        let mut out_dims = [1usize; MAX_RANK];
        for axis in 0..rank {
            let (a, b) = (self.dims()[axis], other.dims()[axis]);
            out_dims[axis] = match (a, b) {
                _ if a == b => a,
                (1, _) => b,
                (_, 1) => a,
                _ => {
                    return Err(crate::Error::DimensionMismatch(format!(
                        "Cannot broadcast {:?} with {:?} on axis {}",
                        self.shape(),
                        other.shape(),
                        axis
                    )))
                }
            };
        }
        let out_shape = TensorShape::new(&out_dims[..rank])?;

        let broadcast_strides = |t: &Self| {
            let mut strides = t.shape().strides();
            for axis in 0..rank {
                if t.dims()[axis] == 1 && out_dims[axis] != 1 {
                    strides[axis] = 0;
                }
            }
            strides
        };
        let a_strides = broadcast_strides(self);
        let b_strides = broadcast_strides(other);
        let (a, b) = (self.as_slice(), other.as_slice());

        let total = out_shape.len();
        let mut data = Vec::with_capacity(total);
        if total > 0 {
            let inner = out_dims[rank - 1];
            let mut index = [0usize; MAX_RANK];
            for _ in 0..total / inner {
                let mut a_base = 0;
                let mut b_base = 0;
                for axis in 0..rank - 1 {
                    a_base += index[axis] * a_strides[axis];
                    b_base += index[axis] * b_strides[axis];
                }
                let (sa, sb) = (a_strides[rank - 1], b_strides[rank - 1]);
                data.extend((0..inner).map(|k| a[a_base + k * sa] * b[b_base + k * sb]));
                for axis in (0..rank - 1).rev() {
                    index[axis] += 1;
                    if index[axis] < out_dims[axis] {
                        break;
                    }
                    index[axis] = 0;
                }
            }
        }
        Self::from_vec(data, out_shape)
    }

    /// Sum over `axis`, removing it. A rank-1 input reduces to shape `[1]`.
    pub fn sum_axis(&self, axis: usize) -> crate::Result<Self> {
        let extent = self.shape().dim(axis)?;
        let dims = self.dims();
        let outer: usize = dims[..axis].iter().product();
        let inner: usize = dims[axis + 1..].iter().product();

        let mut data = vec![0.0f32; outer * inner];
        let src = self.as_slice();
        if inner > 0 {
            data.par_chunks_mut(inner)
                .enumerate()
                .for_each(|(o, out)| {
                    for k in 0..extent {
                        let base = (o * extent + k) * inner;
                        for (acc, &v) in out.iter_mut().zip(&src[base..base + inner]) {
                            *acc += v;
                        }
                    }
                });
        }

        let mut new_dims: Vec<usize> = dims.to_vec();
        new_dims.remove(axis);
        if new_dims.is_empty() {
            new_dims.push(1);
        }
        Self::from_vec(data, TensorShape::new(&new_dims)?)
    }

    /// Numerically stable softmax along `axis`.
    pub fn softmax(&self, axis: usize) -> crate::Result<Self> {
        let extent = self.shape().dim(axis)?;
        let dims = self.dims();
        let inner: usize = dims[axis + 1..].iter().product();

        let mut data = self.as_slice().to_vec();
        if extent > 0 && inner > 0 {
            data.par_chunks_mut(extent * inner).for_each(|block| {
                for i in 0..inner {
                    let max = (0..extent)
                        .map(|k| block[k * inner + i])
                        .fold(f32::NEG_INFINITY, f32::max);
                    let mut denom = 0.0f32;
                    for k in 0..extent {
                        let e = (block[k * inner + i] - max).exp();
                        block[k * inner + i] = e;
                        denom += e;
                    }
                    for k in 0..extent {
                        block[k * inner + i] /= denom;
                    }
                }
            });
        }
        Self::from_vec(data, self.shape())
    }
}
