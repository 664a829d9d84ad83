use wide::f32x8;

/// `dst += alpha * src` over the common prefix of both slices.
#[inline]
pub fn axpy(dst: &mut [f32], src: &[f32], alpha: f32) {
    let len = dst.len().min(src.len());
    let (dst, src) = (&mut dst[..len], &src[..len]);
    let a = f32x8::splat(alpha);

    let mut d_chunks = dst.chunks_exact_mut(8);
    let mut s_chunks = src.chunks_exact(8);
    for (d8, s8) in (&mut d_chunks).zip(&mut s_chunks) {
        let mut vs = [0.0f32; 8];
        vs.copy_from_slice(s8);
        let mut vd = [0.0f32; 8];
        vd.copy_from_slice(d8);
        let res: [f32; 8] = (f32x8::from(vd) + f32x8::from(vs) * a).into();
        d8.copy_from_slice(&res);
    }

    for (d, &s) in d_chunks
        .into_remainder()
        .iter_mut()
        .zip(s_chunks.remainder())
    {
        *d += alpha * s;
    }
}

/// Dot product of two equally long slices.
#[inline]
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    let len = a.len().min(b.len());
    let (a, b) = (&a[..len], &b[..len]);

    let mut acc = f32x8::ZERO;
    let mut a_chunks = a.chunks_exact(8);
    let mut b_chunks = b.chunks_exact(8);
    for (a8, b8) in (&mut a_chunks).zip(&mut b_chunks) {
        let mut va = [0.0f32; 8];
        va.copy_from_slice(a8);
        let mut vb = [0.0f32; 8];
        vb.copy_from_slice(b8);
        acc += f32x8::from(va) * f32x8::from(vb);
    }

    let lanes: [f32; 8] = acc.into();
    let mut sum: f32 = lanes.iter().sum();
    for (&x, &y) in a_chunks.remainder().iter().zip(b_chunks.remainder()) {
        sum += x * y;
    }
    sum
}
