use crate::shape::{TensorShape, MAX_RANK};
use half::f16;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    F16,
    F32,
}

/// Scalar types a [`Tensor`] can hold.
pub trait Element: Copy + Default + fmt::Debug + Send + Sync + 'static {
    const DTYPE: DataType;

    fn to_f32(self) -> f32;
    fn from_f32(value: f32) -> Self;
}

impl Element for f32 {
    const DTYPE: DataType = DataType::F32;

    #[inline]
    fn to_f32(self) -> f32 {
        self
    }

    #[inline]
    fn from_f32(value: f32) -> Self {
        value
    }
}

impl Element for f16 {
    const DTYPE: DataType = DataType::F16;

    #[inline]
    fn to_f32(self) -> f32 {
        f16::to_f32(self)
    }

    #[inline]
    fn from_f32(value: f32) -> Self {
        f16::from_f32(value)
    }
}

/// Dense row-major tensor of rank `1..=MAX_RANK`.
///
/// **Layout Convention:**
/// Image-like tensors use **NCHW** (batch, channel, height, width) with width as the
/// fastest-varying dimension. The element at `(n, c, h, w)` lives at
/// `((n * C + c) * H + h) * W + w`.
///
/// Every operation returns a new tensor; nothing edits a tensor in place once it
/// has been handed to another operator.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor<T: Element = f32> {
    data: Vec<T>,
    shape: TensorShape,
}

impl<T: Element> Tensor<T> {
    pub fn from_vec(data: Vec<T>, shape: TensorShape) -> crate::Result<Self> {
        if data.len() != shape.len() {
            return Err(crate::Error::DimensionMismatch(format!(
                "Data size mismatch: got {}, expected {} for shape {:?}",
                data.len(),
                shape.len(),
                shape
            )));
        }
        Ok(Self { data, shape })
    }

    pub fn zeros(shape: TensorShape) -> Self {
        Self::full(shape, T::default())
    }

    pub fn full(shape: TensorShape, value: T) -> Self {
        Self {
            data: vec![value; shape.len()],
            shape,
        }
    }

    /// Build a tensor by evaluating `f` at every multi-index in row-major order.
    pub fn from_fn<F>(shape: TensorShape, mut f: F) -> Self
    where
        F: FnMut(&[usize]) -> T,
    {
        let mut data = Vec::with_capacity(shape.len());
        for_each_index(shape, |index| data.push(f(index)));
        Self { data, shape }
    }

    pub fn shape(&self) -> TensorShape {
        self.shape
    }

    pub fn dims(&self) -> &[usize] {
        self.shape.dims()
    }

    pub fn rank(&self) -> usize {
        self.shape.rank()
    }

    pub fn dtype(&self) -> DataType {
        T::DTYPE
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    pub fn into_vec(self) -> Vec<T> {
        self.data
    }

    pub fn get(&self, index: &[usize]) -> crate::Result<T> {
        if index.len() != self.rank() {
            return Err(crate::Error::InvalidInput(format!(
                "Index rank {} does not match tensor rank {}",
                index.len(),
                self.rank()
            )));
        }
        let strides = self.shape.strides();
        let mut offset = 0usize;
        for (axis, (&i, &d)) in index.iter().zip(self.dims()).enumerate() {
            if i >= d {
                return Err(crate::Error::InvalidInput(format!(
                    "Index {} out of bounds for axis {} of size {}",
                    i, axis, d
                )));
            }
            offset += i * strides[axis];
        }
        Ok(self.data[offset])
    }

    pub fn reshape(&self, dims: &[usize]) -> crate::Result<Self> {
        self.clone().into_shape(dims)
    }

    /// Reinterpret the buffer under a new shape without copying.
    pub fn into_shape(self, dims: &[usize]) -> crate::Result<Self> {
        let new_shape = TensorShape::new(dims)?;
        if new_shape.len() != self.data.len() {
            return Err(crate::Error::DimensionMismatch(format!(
                "Cannot reshape {:?} into {:?}: size mismatch ({} != {})",
                self.shape,
                new_shape,
                self.data.len(),
                new_shape.len()
            )));
        }
        Ok(Self {
            data: self.data,
            shape: new_shape,
        })
    }

    /// Merge axes `start_axis..rank` into one trailing axis.
    pub fn flatten(&self, start_axis: usize) -> crate::Result<Self> {
        let dims = self.dims();
        if start_axis >= dims.len() {
            return Err(crate::Error::InvalidInput(format!(
                "Cannot flatten from axis {} of a rank-{} tensor",
                start_axis,
                dims.len()
            )));
        }
        let mut new_dims: Vec<usize> = dims[..start_axis].to_vec();
        new_dims.push(dims[start_axis..].iter().product());
        self.reshape(&new_dims)
    }

    /// Insert a length-1 axis at `axis`.
    pub fn unsqueeze(&self, axis: usize) -> crate::Result<Self> {
        let dims = self.dims();
        if axis > dims.len() {
            return Err(crate::Error::InvalidInput(format!(
                "Cannot unsqueeze axis {} of a rank-{} tensor",
                axis,
                dims.len()
            )));
        }
        let mut new_dims = dims.to_vec();
        new_dims.insert(axis, 1);
        self.reshape(&new_dims)
    }

    /// Reorder axes. The result is a strided view; call
    /// [`PermutedView::contiguous`] to materialize it before any reshape.
    pub fn permute(&self, axes: &[usize]) -> crate::Result<PermutedView<'_, T>> {
        let rank = self.rank();
        if axes.len() != rank {
            return Err(crate::Error::InvalidInput(format!(
                "Permutation {:?} does not match tensor rank {}",
                axes, rank
            )));
        }
        let mut seen = [false; MAX_RANK];
        let mut permuted = [0usize; MAX_RANK];
        for (i, &axis) in axes.iter().enumerate() {
            if axis >= rank || seen[axis] {
                return Err(crate::Error::InvalidInput(format!(
                    "Invalid permutation {:?}",
                    axes
                )));
            }
            seen[axis] = true;
            permuted[i] = axis;
        }
        let new_dims: Vec<usize> = axes.iter().map(|&a| self.dims()[a]).collect();
        Ok(PermutedView {
            source: self,
            axes: permuted,
            shape: TensorShape::new(&new_dims)?,
        })
    }

    /// Take `len` entries starting at `start` along `axis`.
    pub fn narrow(&self, axis: usize, start: usize, len: usize) -> crate::Result<Self> {
        let (outer, extent, inner) = self.split_at_axis(axis)?;
        if start + len > extent {
            return Err(crate::Error::InvalidInput(format!(
                "Narrow range {}..{} out of bounds for axis {} of size {}",
                start,
                start + len,
                axis,
                extent
            )));
        }
        let mut data = Vec::with_capacity(outer * len * inner);
        for o in 0..outer {
            let base = (o * extent + start) * inner;
            data.extend_from_slice(&self.data[base..base + len * inner]);
        }
        let mut dims = self.dims().to_vec();
        dims[axis] = len;
        Self::from_vec(data, TensorShape::new(&dims)?)
    }

    /// Split into `chunks` equal parts along `axis`.
    pub fn chunk(&self, chunks: usize, axis: usize) -> crate::Result<Vec<Self>> {
        let extent = self.shape.dim(axis)?;
        if chunks == 0 || extent % chunks != 0 {
            return Err(crate::Error::DimensionMismatch(format!(
                "Axis {} of size {} cannot be split into {} equal chunks",
                axis, extent, chunks
            )));
        }
        let step = extent / chunks;
        (0..chunks)
            .map(|i| self.narrow(axis, i * step, step))
            .collect()
    }

    /// Concatenate tensors along `axis`; every other axis must agree.
    pub fn concat(tensors: &[&Self], axis: usize) -> crate::Result<Self> {
        let first = tensors.first().ok_or_else(|| {
            crate::Error::InvalidInput("Cannot concat empty tensor list".into())
        })?;
        let (outer, _, inner) = first.split_at_axis(axis)?;

        let mut new_dims = first.dims().to_vec();
        new_dims[axis] = 0;
        for (i, t) in tensors.iter().enumerate() {
            let compatible = t.rank() == first.rank()
                && t
                    .dims()
                    .iter()
                    .zip(first.dims())
                    .enumerate()
                    .all(|(a, (x, y))| a == axis || x == y);
            if !compatible {
                return Err(crate::Error::DimensionMismatch(format!(
                    "Shape mismatch at index {}: {:?} vs {:?}",
                    i,
                    t.shape(),
                    first.shape()
                )));
            }
            new_dims[axis] += t.dims()[axis];
        }

        let new_shape = TensorShape::new(&new_dims)?;
        let mut data = Vec::with_capacity(new_shape.len());
        for o in 0..outer {
            for t in tensors {
                let block = t.dims()[axis] * inner;
                data.extend_from_slice(&t.data[o * block..(o + 1) * block]);
            }
        }
        Self::from_vec(data, new_shape)
    }

    /// Convert every element to another scalar type.
    pub fn cast<U: Element>(&self) -> Tensor<U> {
        Tensor {
            data: self.data.iter().map(|&v| U::from_f32(v.to_f32())).collect(),
            shape: self.shape,
        }
    }

    /// `(outer, extent, inner)` element counts around `axis`.
    fn split_at_axis(&self, axis: usize) -> crate::Result<(usize, usize, usize)> {
        let extent = self.shape.dim(axis)?;
        let dims = self.dims();
        let outer = dims[..axis].iter().product();
        let inner = dims[axis + 1..].iter().product();
        Ok((outer, extent, inner))
    }
}

/// A tensor viewed under permuted axes. Reading it in the new order requires an
/// explicit [`contiguous`](Self::contiguous) copy.
#[derive(Debug, Clone, Copy)]
pub struct PermutedView<'a, T: Element> {
    source: &'a Tensor<T>,
    axes: [usize; MAX_RANK],
    shape: TensorShape,
}

impl<'a, T: Element> PermutedView<'a, T> {
    pub fn shape(&self) -> TensorShape {
        self.shape
    }

    /// Materialize the permuted layout into a new row-major tensor.
    pub fn contiguous(&self) -> Tensor<T> {
        let rank = self.shape.rank();
        let dims = self.shape.dims();
        let src_strides = self.source.shape.strides();
        let mut strides = [0usize; MAX_RANK];
        for i in 0..rank {
            strides[i] = src_strides[self.axes[i]];
        }

        let total = self.shape.len();
        let mut data = Vec::with_capacity(total);
        if total > 0 {
            let src = self.source.as_slice();
            let inner = dims[rank - 1];
            let inner_stride = strides[rank - 1];
            let mut index = [0usize; MAX_RANK];
            for _ in 0..total / inner {
                let base: usize = (0..rank - 1).map(|i| index[i] * strides[i]).sum();
                data.extend((0..inner).map(|k| src[base + k * inner_stride]));
                for axis in (0..rank - 1).rev() {
                    index[axis] += 1;
                    if index[axis] < dims[axis] {
                        break;
                    }
                    index[axis] = 0;
                }
            }
        }

        Tensor {
            data,
            shape: self.shape,
        }
    }
}

/// Visit every multi-index of `shape` in row-major order.
pub(crate) fn for_each_index<F: FnMut(&[usize])>(shape: TensorShape, mut f: F) {
    let rank = shape.rank();
    let dims = shape.dims();
    if shape.is_empty() {
        return;
    }
    let mut index = [0usize; MAX_RANK];
    loop {
        f(&index[..rank]);
        let mut axis = rank;
        loop {
            if axis == 0 {
                return;
            }
            axis -= 1;
            index[axis] += 1;
            if index[axis] < dims[axis] {
                break;
            }
            index[axis] = 0;
        }
    }
}

impl Tensor<f32> {
    /// Interleaved 8-bit RGB pixels to a `[1, 3, H, W]` tensor with values in `[0, 255]`.
    pub fn from_rgb_pixels(data: &[u8], width: usize, height: usize) -> crate::Result<Self> {
        if data.len() != 3 * width * height {
            return Err(crate::Error::DimensionMismatch(format!(
                "RGB buffer has {} bytes, expected {}",
                data.len(),
                3 * width * height
            )));
        }
        let plane = width * height;
        let mut float_data = vec![0.0f32; 3 * plane];
        for (i, chunk) in data.chunks_exact(3).enumerate() {
            float_data[i] = chunk[0] as f32;
            float_data[plane + i] = chunk[1] as f32;
            float_data[2 * plane + i] = chunk[2] as f32;
        }
        Self::from_vec(float_data, TensorShape::nchw(1, 3, height, width))
    }
}

impl<T: Element> fmt::Display for Tensor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tensor({:?}, {:?})", self.shape, T::DTYPE)
    }
}
