#[cfg(test)]
#[path = "../tests/unit/tensor_test.rs"]
mod tensor_test;

use anyhow::Result;
use rayon::prelude::*;
use std::sync::Arc;

/// Maximum number of dimensions supported by [`Tensor`].
pub const MAX_DIMS: usize = 4;

/// Allocation context handed to every forward pass.
///
/// Input tensors (token ids, position ids, output indices) are materialized through the
/// context, which is the place where allocation can fail. An optional element budget
/// makes that failure observable on the CPU backend.
#[derive(Debug, Clone, Default)]
pub struct Context {
    max_elements: Option<usize>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    /// Limits the number of elements a single input tensor may hold.
    pub fn with_max_elements(mut self, max_elements: usize) -> Self {
        self.max_elements = Some(max_elements);
        self
    }

    pub fn from_int_slice(&self, values: &[i32]) -> Result<IndexTensor> {
        self.reserve(values.len())?;
        Ok(IndexTensor::new(values.to_vec()))
    }

    pub fn from_float_slice(&self, values: &[f32], shape: &[usize]) -> Result<Tensor> {
        self.reserve(values.len())?;

        let expected = shape.iter().product::<usize>();
        if shape.is_empty() || shape.len() > MAX_DIMS || expected != values.len() {
            anyhow::bail!("Cannot create tensor of shape {shape:?} from {} values", values.len());
        }

        Ok(Tensor::new(values.to_vec(), shape))
    }

    fn reserve(&self, count: usize) -> Result<()> {
        match self.max_elements {
            Some(limit) if count > limit => {
                anyhow::bail!("Failed to allocate tensor of {count} elements: context limit is {limit}")
            }
            _ => Ok(()),
        }
    }
}

/// Integer tensor used for token ids, position ids and row indices.
#[derive(Clone, PartialEq, Eq)]
pub struct IndexTensor {
    values: Arc<[i32]>,
}

impl IndexTensor {
    pub(crate) fn new(values: Vec<i32>) -> Self {
        Self { values: values.into() }
    }

    pub fn values(&self) -> &[i32] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl std::fmt::Debug for IndexTensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexTensor").field("len", &self.values.len()).finish()
    }
}

/// Dense f32 tensor in GGML dimension order: `shape[0]` varies fastest.
///
/// **Layout**:
/// - Element `[i0, i1, i2, i3]` lives at `i0 * strides[0] + ... + i3 * strides[3]`
/// - Data is reference counted, so clones, `reshape` and `permute` never copy
/// - Kernels that need the canonical layout go through [`Tensor::contiguous`]
///
/// A hidden state of width `hidden_size` over `seq_len` tokens has shape
/// `[hidden_size, seq_len]`; a linear weight mapping `in -> out` has shape `[in, out]`.
#[derive(Clone)]
pub struct Tensor {
    data: Arc<[f32]>,
    shape: [usize; MAX_DIMS],
    strides: [usize; MAX_DIMS],
}

impl Tensor {
    pub fn new(data: Vec<f32>, shape: &[usize]) -> Self {
        let shape = expand_shape(shape);
        assert_eq!(
            data.len(),
            shape.iter().product::<usize>(),
            "Data length does not match shape {shape:?}"
        );
        Self::from_parts(data, shape)
    }

    pub fn zeros(shape: &[usize]) -> Self {
        let shape = expand_shape(shape);
        Self::from_parts(vec![0.0; shape.iter().product()], shape)
    }

    pub fn full(shape: &[usize], value: f32) -> Self {
        let shape = expand_shape(shape);
        Self::from_parts(vec![value; shape.iter().product()], shape)
    }

    fn from_parts(data: Vec<f32>, shape: [usize; MAX_DIMS]) -> Self {
        Self { data: data.into(), strides: contiguous_strides(&shape), shape }
    }

    /// Contiguous view over the leading elements of a shared buffer.
    pub(crate) fn from_shared(data: Arc<[f32]>, shape: &[usize]) -> Self {
        let shape = expand_shape(shape);
        assert!(
            data.len() >= shape.iter().product::<usize>(),
            "Buffer of {} elements is too small for shape {shape:?}",
            data.len()
        );
        Self { data, strides: contiguous_strides(&shape), shape }
    }

    pub fn shape(&self) -> [usize; MAX_DIMS] {
        self.shape
    }

    pub fn dim(&self, axis: usize) -> usize {
        self.shape[axis]
    }

    pub fn len(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_contiguous(&self) -> bool {
        let expected = contiguous_strides(&self.shape);
        (0..MAX_DIMS).all(|axis| self.shape[axis] <= 1 || self.strides[axis] == expected[axis])
    }

    /// Elements of a contiguous tensor; the backing buffer may be longer.
    fn as_slice(&self) -> &[f32] {
        &self.data[..self.len()]
    }

    #[inline]
    fn offset(&self, index: [usize; MAX_DIMS]) -> usize {
        index.iter().zip(self.strides.iter()).map(|(&i, &stride)| i * stride).sum()
    }

    /// Returns element at `index` (GGML order).
    pub fn get(&self, index: [usize; MAX_DIMS]) -> f32 {
        debug_assert!(index.iter().zip(self.shape.iter()).all(|(&i, &n)| i < n), "Index {index:?} out of bounds");
        self.data[self.offset(index)]
    }

    /// Materializes the tensor in the canonical layout. Cheap when already contiguous.
    pub fn contiguous(&self) -> Tensor {
        if self.is_contiguous() {
            return self.clone();
        }

        let [n0, n1, n2, n3] = self.shape;
        let mut data = Vec::with_capacity(self.len());
        for i3 in 0..n3 {
            for i2 in 0..n2 {
                for i1 in 0..n1 {
                    for i0 in 0..n0 {
                        data.push(self.data[self.offset([i0, i1, i2, i3])]);
                    }
                }
            }
        }

        Self::from_parts(data, self.shape)
    }

    /// Copies elements out in the canonical layout.
    pub fn to_vec(&self) -> Vec<f32> {
        self.contiguous().as_slice().to_vec()
    }

    /// Returns column `i1` of a 2D tensor.
    pub fn column(&self, i1: usize) -> Vec<f32> {
        (0..self.shape[0]).map(|i0| self.get([i0, i1, 0, 0])).collect()
    }

    pub fn reshape(&self, shape: &[usize]) -> Tensor {
        assert!(self.is_contiguous(), "Cannot reshape a non-contiguous tensor");
        let shape = expand_shape(shape);
        assert_eq!(
            self.len(),
            shape.iter().product::<usize>(),
            "Cannot reshape {:?} into {shape:?}",
            self.shape
        );

        Self { data: self.data.clone(), strides: contiguous_strides(&shape), shape }
    }

    /// Permutes dimensions: source axis `i` moves to position `axes[i]`.
    pub fn permute(&self, axes: [usize; MAX_DIMS]) -> Tensor {
        let mut seen = [false; MAX_DIMS];
        for &axis in &axes {
            assert!(axis < MAX_DIMS && !seen[axis], "Invalid permutation {axes:?}");
            seen[axis] = true;
        }

        let mut shape = [1; MAX_DIMS];
        let mut strides = [1; MAX_DIMS];
        for (source, &target) in axes.iter().enumerate() {
            shape[target] = self.shape[source];
            strides[target] = self.strides[source];
        }

        Self { data: self.data.clone(), shape, strides }
    }

    fn map(&self, op: impl Fn(f32) -> f32 + Sync) -> Tensor {
        let input = self.contiguous();
        let data = input.as_slice().par_iter().map(|&x| op(x)).collect();
        Self::from_parts(data, input.shape)
    }

    /// Elementwise binary operation; `other` is repeated along every axis it is smaller in.
    fn zip_broadcast(&self, other: &Tensor, op: impl Fn(f32, f32) -> f32 + Sync) -> Tensor {
        let lhs = self.contiguous();
        let rhs = other.contiguous();

        for axis in 0..MAX_DIMS {
            assert!(
                rhs.shape[axis] > 0 && lhs.shape[axis] % rhs.shape[axis] == 0,
                "Cannot broadcast {:?} into {:?}",
                rhs.shape,
                lhs.shape
            );
        }

        let [n0, n1, n2, _] = lhs.shape;
        let data = lhs
            .as_slice()
            .par_iter()
            .enumerate()
            .map(|(i, &x)| {
                let index = [i % n0, (i / n0) % n1, (i / (n0 * n1)) % n2, i / (n0 * n1 * n2)];
                let rhs_index = [
                    index[0] % rhs.shape[0],
                    index[1] % rhs.shape[1],
                    index[2] % rhs.shape[2],
                    index[3] % rhs.shape[3],
                ];
                op(x, rhs.data[rhs.offset(rhs_index)])
            })
            .collect();

        Self::from_parts(data, lhs.shape)
    }

    pub fn add(&self, other: &Tensor) -> Tensor {
        self.zip_broadcast(other, |a, b| a + b)
    }

    pub fn mul(&self, other: &Tensor) -> Tensor {
        self.zip_broadcast(other, |a, b| a * b)
    }

    pub fn scale(&self, factor: f32) -> Tensor {
        self.map(|x| x * factor)
    }

    /// SiLU activation: `x * sigmoid(x)`.
    pub fn silu(&self) -> Tensor {
        self.map(|x| x * (1.0f32 + (-x).exp()).recip())
    }

    /// Applies [`softmax`] to every row along the first dimension.
    pub fn softmax(&self) -> Tensor {
        self.map_rows(|_, row| softmax(row))
    }

    /// Divides every row along the first dimension by its root mean square.
    pub fn rms_norm(&self, eps: f32) -> Tensor {
        self.map_rows(|_, row| {
            let sum_of_squares = row.iter().map(|&x| x * x).sum::<f32>();
            let rms_norm_factor = 1.0f32 / ((sum_of_squares / row.len() as f32) + eps).sqrt();
            row.iter_mut().for_each(|x| *x *= rms_norm_factor);
        })
    }

    fn map_rows(&self, op: impl Fn(usize, &mut [f32]) + Sync) -> Tensor {
        let mut output = self.to_vec();
        let row_len = self.shape[0].max(1);
        output.par_chunks_mut(row_len).enumerate().for_each(|(row_idx, row)| op(row_idx, row));
        Self::from_parts(output, self.shape)
    }

    /// Rotary position embedding over a `[head_dim, n_heads, seq_len]` tensor.
    ///
    /// For position `p` and pair `(2i, 2i + 1)` with `2i < rope_dim` the pair is rotated by
    /// `p * scale * base^(-2i / rope_dim) / factors[i]`. Dimensions past `rope_dim` pass through.
    pub fn rope(
        &self,
        positions: &IndexTensor,
        factors: Option<&Tensor>,
        rope_dim: usize,
        base: f32,
        scale: f32,
    ) -> Tensor {
        let [head_dim, n_heads, seq_len, _] = self.shape;
        assert_eq!(seq_len, positions.len(), "Expected one position per token");
        assert!(rope_dim <= head_dim && rope_dim % 2 == 0, "Invalid rope dimension {rope_dim} for head {head_dim}");

        let factors = factors.map(Tensor::to_vec);
        if let Some(factors) = &factors {
            assert!(factors.len() >= rope_dim / 2, "Expected {} rope factors, got {}", rope_dim / 2, factors.len());
        }

        let inv_freqs: Vec<f32> = (0..rope_dim / 2)
            .map(|pair_idx| {
                let freq = scale * base.powf(-((2 * pair_idx) as f32) / rope_dim as f32);
                match &factors {
                    Some(factors) => freq / factors[pair_idx],
                    None => freq,
                }
            })
            .collect();

        self.map_rows(|row_idx, head| {
            let pos = positions.values()[(row_idx / n_heads) % seq_len] as f32;
            head.chunks_exact_mut(2).zip(inv_freqs.iter()).for_each(|(pair, &inv_freq)| {
                let (sin_theta, cos_theta) = (pos * inv_freq).sin_cos();
                let (x0, x1) = (pair[0], pair[1]);
                pair[0] = x0 * cos_theta - x1 * sin_theta;
                pair[1] = x0 * sin_theta + x1 * cos_theta;
            });
        })
    }

    /// Hides future history slots from attention scores of shape `[total, seq_len, n_heads]`.
    ///
    /// Query `s` sits at history index `past + s`; slots after it are set to `-inf`.
    pub fn mask_causal(&self, past: usize) -> Tensor {
        let n1 = self.shape[1];
        self.map_rows(|row_idx, scores| {
            let visible = past + row_idx % n1 + 1;
            scores.iter_mut().skip(visible).for_each(|score| *score = f32::NEG_INFINITY);
        })
    }

    /// Matrix multiplication with GGML semantics.
    ///
    /// `self` is `[K, M, A2, A3]`, `other` is `[K, N, B2, B3]`, the result is `[M, N, B2, B3]`
    /// with `result[m, n, i2, i3] = sum_k self[k, m, i2 / (B2 / A2), i3 / (B3 / A3)] * other[k, n, i2, i3]`.
    /// Repeating `self` along dims 2 and 3 is what maps query heads onto shared key/value heads.
    pub fn mulmat(&self, other: &Tensor) -> Tensor {
        let a = self.contiguous();
        let b = other.contiguous();

        let [k, m, a2, a3] = a.shape;
        let [bk, n, b2, b3] = b.shape;
        assert_eq!(k, bk, "Inner dimensions differ: {:?} x {:?}", a.shape, b.shape);
        assert!(b2 % a2 == 0 && b3 % a3 == 0, "Cannot broadcast {:?} over {:?}", a.shape, b.shape);

        let (ratio2, ratio3) = (b2 / a2, b3 / a3);
        let mut output = vec![0.0f32; m * n * b2 * b3];

        output.par_iter_mut().enumerate().for_each(|(i, out_val)| {
            let row = i % m;
            let col = (i / m) % n;
            let i2 = (i / (m * n)) % b2;
            let i3 = i / (m * n * b2);

            let a_start = (((i3 / ratio3) * a2 + i2 / ratio2) * m + row) * k;
            let b_start = ((i3 * b2 + i2) * n + col) * k;

            *out_val = a.data[a_start..a_start + k]
                .iter()
                .zip(&b.data[b_start..b_start + k])
                .map(|(&x, &y)| x * y)
                .sum();
        });

        Self::from_parts(output, [m, n, b2, b3])
    }

    /// Gathers columns of a 2D tensor: `[n0, n1]` -> `[n0, ids.len()]`.
    pub fn rows(&self, ids: &IndexTensor) -> Result<Tensor> {
        let [n0, n1, n2, n3] = self.shape;
        if n2 != 1 || n3 != 1 {
            anyhow::bail!("Row selection expects a 2D tensor, got {:?}", self.shape);
        }

        let source = self.contiguous();
        let mut data = Vec::with_capacity(n0 * ids.len());
        for &id in ids.values() {
            if id < 0 || id as usize >= n1 {
                anyhow::bail!("Row index {id} out of range [0, {n1})");
            }
            let start = id as usize * n0;
            data.extend_from_slice(&source.data[start..start + n0]);
        }

        Ok(Self::from_parts(data, [n0, ids.len(), 1, 1]))
    }
}

impl std::fmt::Debug for Tensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tensor")
            .field("shape", &self.shape)
            .field("contiguous", &self.is_contiguous())
            .finish()
    }
}

pub(crate) fn expand_shape(shape: &[usize]) -> [usize; MAX_DIMS] {
    assert!(
        !shape.is_empty() && shape.len() <= MAX_DIMS,
        "Tensor must have 1 to {MAX_DIMS} dimensions, got {}",
        shape.len()
    );
    let mut full = [1; MAX_DIMS];
    full[..shape.len()].copy_from_slice(shape);
    full
}

fn contiguous_strides(shape: &[usize; MAX_DIMS]) -> [usize; MAX_DIMS] {
    let mut strides = [1; MAX_DIMS];
    for axis in 1..MAX_DIMS {
        strides[axis] = strides[axis - 1] * shape[axis - 1];
    }
    strides
}

// Applies softmax normalization to a slice in-place.
pub(crate) fn softmax(x: &mut [f32]) {
    let max_val = x.iter().fold(f32::NEG_INFINITY, |acc, &val| acc.max(val));
    let sum = x
        .iter_mut()
        .map(|val| {
            *val = (*val - max_val).exp();
            *val
        })
        .sum::<f32>();
    let inv_sum = sum.recip();
    x.iter_mut().for_each(|val| *val *= inv_sum);
}
