use anyhow::Result;
use rayon::prelude::*;

/// Dense row-major `f32` tensor as served by a checkpoint.
#[derive(Clone, PartialEq)]
pub struct Tensor {
    shape: Vec<usize>,
    data: Vec<f32>,
}

impl Tensor {
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Result<Self> {
        let expected = shape.iter().product::<usize>();
        if expected != data.len() {
            anyhow::bail!("Tensor of shape {:?} needs {} elements, got {}", shape, expected, data.len());
        }

        Ok(Self { shape, data })
    }

    pub fn filled(shape: Vec<usize>, value: f32) -> Self {
        let len = shape.iter().product::<usize>();
        Self { shape, data: vec![value; len] }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn into_data(self) -> Vec<f32> {
        self.data
    }
}

impl std::fmt::Debug for Tensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tensor").field("shape", &self.shape).finish()
    }
}

/// Matrix-vector product for a batch of rows: `xout[r] = W · x[r]`.
///
/// `w` is `[d, n]` row-major, every row of `x` has `n` elements and every row of
/// `xout` receives `d` elements. Output rows are computed in parallel.
pub fn matmul(xout: &mut [f32], x: &[f32], w: &[f32], n: usize, d: usize) {
    debug_assert_eq!(w.len(), n * d, "Weight must be [d, n]: {} != {} * {}", w.len(), d, n);
    debug_assert_eq!(x.len() / n, xout.len() / d, "Row count mismatch between input and output");

    xout.par_chunks_mut(d).zip(x.par_chunks(n)).for_each(|(out_row, x_row)| {
        out_row.par_iter_mut().enumerate().for_each(|(i, out_val)| {
            *out_val = dot(x_row, &w[i * n..(i + 1) * n]);
        });
    });
}

#[inline]
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(&x, &y)| x * y).sum()
}

/// Applies softmax normalization to a slice in-place.
///
/// Entries equal to negative infinity end up as exact zeros.
pub fn softmax(x: &mut [f32]) {
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

/// Natural-log probability of `index` under `softmax(logits)`.
pub fn log_softmax_at(logits: &[f32], index: usize) -> f32 {
    let max_val = logits.iter().fold(f32::NEG_INFINITY, |acc, &val| acc.max(val));
    let log_sum_exp = logits.iter().map(|&val| ((val - max_val) as f64).exp()).sum::<f64>().ln() as f32 + max_val;
    logits[index] - log_sum_exp
}

/// SiLU (swish): `x * sigmoid(x)`.
#[inline]
pub fn silu(x: f32) -> f32 {
    x * (1.0f32 + (-x).exp()).recip()
}
