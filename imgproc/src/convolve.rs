use crate::simd::axpy;
use cv_core::{Error, Result, Tensor, TensorShape};
use rayon::prelude::*;

/// Output extent of a stride-1 window of size `kernel` over `len` with symmetric `padding`.
fn output_extent(len: usize, kernel: usize, padding: usize) -> Result<usize> {
    let padded = len + 2 * padding;
    if kernel == 0 || padded < kernel {
        return Err(Error::DimensionMismatch(format!(
            "Kernel of size {} does not fit input of size {} with padding {}",
            kernel, len, padding
        )));
    }
    Ok(padded - kernel + 1)
}

/// Columns `x` of a stride-1 output row whose tap `k` reads inside `0..len`.
#[inline]
fn valid_columns(len: usize, out_len: usize, k: usize, padding: usize) -> (usize, usize) {
    let lo = padding.saturating_sub(k);
    let hi = (len + padding).saturating_sub(k).min(out_len);
    (lo, hi.max(lo))
}

/// Stride-1 2-D cross-correlation with zero padding.
///
/// `input` is `[N, C, H, W]`, `weight` is `[O, C, KH, KW]`, `bias` (if any) has `O`
/// entries. Returns `[N, O, H + 2p - KH + 1, W + 2p - KW + 1]`.
///
/// Every output plane is accumulated independently, one rayon task per
/// `(batch, out_channel)`, with the kernel taps applied as shifted SIMD AXPY rows.
pub fn conv2d(
    input: &Tensor,
    weight: &Tensor,
    bias: Option<&Tensor>,
    padding: usize,
) -> Result<Tensor> {
    let (n, cin, h, w) = input.shape().nchw_dims()?;
    let (cout, wcin, kh, kw) = weight.shape().nchw_dims()?;
    if wcin != cin {
        return Err(Error::DimensionMismatch(format!(
            "Convolution weight expects {} input channels, got {:?}",
            wcin,
            input.shape()
        )));
    }
    if let Some(b) = bias {
        if b.len() != cout {
            return Err(Error::DimensionMismatch(format!(
                "Bias has {} entries for {} output channels",
                b.len(),
                cout
            )));
        }
    }

    let ho = output_extent(h, kh, padding)?;
    let wo = output_extent(w, kw, padding)?;
    let plane = ho * wo;

    let src = input.as_slice();
    let wt = weight.as_slice();
    let bias = bias.map(|b| b.as_slice());

    let mut out = vec![0.0f32; n * cout * plane];
    if plane > 0 {
        out.par_chunks_mut(plane).enumerate().for_each(|(idx, dst)| {
            let (b, oc) = (idx / cout, idx % cout);
            if let Some(bias) = bias {
                dst.fill(bias[oc]);
            }
            for c in 0..cin {
                let src_plane = &src[(b * cin + c) * h * w..(b * cin + c + 1) * h * w];
                for ky in 0..kh {
                    for kx in 0..kw {
                        let wv = wt[((oc * cin + c) * kh + ky) * kw + kx];
                        let (x_lo, x_hi) = valid_columns(w, wo, kx, padding);
                        if x_lo == x_hi {
                            continue;
                        }
                        let sx0 = x_lo + kx - padding;
                        let run = x_hi - x_lo;
                        for y in 0..ho {
                            let sy = y + ky;
                            if sy < padding || sy - padding >= h {
                                continue;
                            }
                            let row = (sy - padding) * w;
                            axpy(
                                &mut dst[y * wo + x_lo..y * wo + x_hi],
                                &src_plane[row + sx0..row + sx0 + run],
                                wv,
                            );
                        }
                    }
                }
            }
        });
    }

    Tensor::from_vec(out, TensorShape::nchw(n, cout, ho, wo))
}

/// Extract sliding `kernel × kernel` patches with zero padding (stride 1).
///
/// `[N, C, H, W]` → `[N, C·k·k, Ho·Wo]`, patch channel `c·k² + ky·k + kx`.
pub fn unfold(input: &Tensor, kernel: usize, padding: usize) -> Result<Tensor> {
    let (n, c, h, w) = input.shape().nchw_dims()?;
    let ho = output_extent(h, kernel, padding)?;
    let wo = output_extent(w, kernel, padding)?;
    let plane = ho * wo;
    let src = input.as_slice();

    let mut out = vec![0.0f32; n * c * kernel * kernel * plane];
    if plane > 0 {
        out.par_chunks_mut(plane).enumerate().for_each(|(idx, dst)| {
            let tap = idx % (kernel * kernel);
            let (b_c, ky, kx) = (idx / (kernel * kernel), tap / kernel, tap % kernel);
            let src_plane = &src[b_c * h * w..(b_c + 1) * h * w];
            let (x_lo, x_hi) = valid_columns(w, wo, kx, padding);
            for y in 0..ho {
                let sy = y + ky;
                if sy < padding || sy - padding >= h {
                    continue;
                }
                let row = (sy - padding) * w;
                for x in x_lo..x_hi {
                    dst[y * wo + x] = src_plane[row + x + kx - padding];
                }
            }
        });
    }

    Tensor::from_vec(out, TensorShape::new(&[n, c * kernel * kernel, plane])?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tensor(dims: &[usize], data: Vec<f32>) -> Tensor {
        Tensor::from_vec(data, TensorShape::new(dims).unwrap()).unwrap()
    }

    #[test]
    fn pointwise_conv_mixes_channels() {
        let input = tensor(&[1, 2, 1, 3], vec![1.0, 2.0, 3.0, 10.0, 20.0, 30.0]);
        let weight = tensor(&[1, 2, 1, 1], vec![1.0, 0.5]);
        let bias = tensor(&[1], vec![-1.0]);
        let out = conv2d(&input, &weight, Some(&bias), 0).unwrap();
        assert_eq!(out.dims(), &[1, 1, 1, 3]);
        assert_eq!(out.as_slice(), &[5.0, 11.0, 17.0]);
    }

    #[test]
    fn box_filter_with_zero_padding() {
        let input = Tensor::full(TensorShape::nchw(1, 1, 3, 3), 1.0f32);
        let weight = Tensor::full(TensorShape::nchw(1, 1, 3, 3), 1.0f32);
        let out = conv2d(&input, &weight, None, 1).unwrap();
        assert_eq!(out.dims(), &[1, 1, 3, 3]);
        assert_eq!(
            out.as_slice(),
            &[4.0, 6.0, 4.0, 6.0, 9.0, 6.0, 4.0, 6.0, 4.0]
        );
    }

    #[test]
    fn asymmetric_kernel_is_cross_correlation() {
        // Weight picks the right-hand neighbour.
        let input = tensor(&[1, 1, 1, 4], vec![1.0, 2.0, 3.0, 4.0]);
        let weight = tensor(&[1, 1, 1, 3], vec![0.0, 0.0, 1.0]);
        let out = conv2d(&input, &weight, None, 1).unwrap();
        assert_eq!(out.dims(), &[1, 1, 3, 4]);
        assert_eq!(&out.as_slice()[4..8], &[2.0, 3.0, 4.0, 0.0]);
    }

    #[test]
    fn channel_mismatch_is_rejected() {
        let input = Tensor::zeros(TensorShape::nchw(1, 3, 4, 4));
        let weight = Tensor::zeros(TensorShape::nchw(2, 4, 3, 3));
        assert!(conv2d(&input, &weight, None, 1).is_err());
    }

    #[test]
    fn unfold_center_tap_is_identity() {
        let input = Tensor::from_fn(TensorShape::nchw(1, 2, 3, 4), |i| {
            (i[1] * 100 + i[2] * 10 + i[3]) as f32
        });
        let cols = unfold(&input, 3, 1).unwrap();
        assert_eq!(cols.dims(), &[1, 18, 12]);
        for c in 0..2 {
            let center = cols.narrow(1, c * 9 + 4, 1).unwrap();
            let expected = input.narrow(1, c, 1).unwrap();
            assert_eq!(center.as_slice(), expected.as_slice());
        }
        // Top-left tap of pixel (0, 0) lies in the padding.
        assert_eq!(cols.get(&[0, 0, 0]).unwrap(), 0.0);
        // Bottom-right tap of pixel (0, 0) is pixel (1, 1).
        assert_eq!(cols.get(&[0, 8, 0]).unwrap(), 11.0);
    }
}
