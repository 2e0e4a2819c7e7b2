#[cfg(test)]
#[path = "../tests/unit/attention_test.rs"]
mod attention_test;

use crate::configuration::ModelConfig;
use crate::kv_cache::LayerCache;
use crate::layers::{Linear, RMSNorm};
use crate::rope::RotarySlice;
use crate::tensor::{dot, softmax};
use crate::transformer::RunState;
use rayon::prelude::*;

/// Additive causal mask for a step that adds `seq_len` positions after
/// `start_pos` cached ones.
///
/// Shape `[seq_len, start_pos + seq_len]`: zero over the cached prefix and on
/// or below the diagonal of the new block, negative infinity above it.
#[derive(Clone, PartialEq)]
pub struct CausalMask {
    seq_len: usize,
    total_len: usize,
    data: Vec<f32>,
}

impl CausalMask {
    pub fn new(start_pos: usize, seq_len: usize) -> Self {
        let total_len = start_pos + seq_len;
        let data = (0..seq_len)
            .flat_map(|row| {
                (0..total_len).map(move |col| if col > start_pos + row { f32::NEG_INFINITY } else { 0.0 })
            })
            .collect();

        Self { seq_len, total_len, data }
    }

    pub fn row(&self, row: usize) -> &[f32] {
        &self.data[row * self.total_len..(row + 1) * self.total_len]
    }

    pub fn seq_len(&self) -> usize {
        self.seq_len
    }

    pub fn total_len(&self) -> usize {
        self.total_len
    }
}

impl std::fmt::Debug for CausalMask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CausalMask").field("seq_len", &self.seq_len).field("total_len", &self.total_len).finish()
    }
}

/// Everything a layer needs to know about the current forward step.
#[derive(Clone, Copy)]
pub struct StepContext<'a> {
    pub batch_size: usize,
    pub seq_len: usize,
    /// Positions already in the cache.
    pub start_pos: usize,
    pub freqs: RotarySlice<'a>,
    /// Present only when `seq_len > 1`.
    pub mask: Option<&'a CausalMask>,
}

impl StepContext<'_> {
    /// Activation rows in this step (`batch_size * seq_len`).
    pub fn rows(&self) -> usize {
        self.batch_size * self.seq_len
    }

    /// Positions visible to the last query of the step.
    pub fn total_len(&self) -> usize {
        self.start_pos + self.seq_len
    }
}

/// Multi-Head Attention with Grouped Query Attention (GQA)
///
/// **Components**:
/// - **Q, K, V Projections**: Linear transformations to query, key, value spaces
/// - **QK-RMSNorm**: per-head normalization of queries and keys (Qwen3 only)
/// - **RoPE**: rotation of queries and keys by their absolute positions
/// - **KV cache**: keys/values of the step are written first, then the whole
///   valid prefix is read back
/// - **Scaled Dot-Product Attention**: `softmax(QK^T / √d_k + mask)V`
/// - **Output Projection**: Final linear transformation
///
/// With `n_kv_heads < n_heads` every key/value head serves `kv_mul`
/// consecutive query heads, which is the same as repeating each key/value
/// head `kv_mul` times before attention.
pub struct Attention {
    pub wq: Linear,
    pub wk: Linear,
    pub wv: Linear,
    pub wo: Linear,
    pub q_norm: Option<RMSNorm>,
    pub k_norm: Option<RMSNorm>,
    pub n_heads: usize,
    pub n_kv_heads: usize,
    pub head_dim: usize,
    pub kv_mul: usize,
}

impl Attention {
    pub fn new(
        wq: Linear,
        wk: Linear,
        wv: Linear,
        wo: Linear,
        qk_norm: Option<(RMSNorm, RMSNorm)>,
        config: &ModelConfig,
    ) -> Self {
        let (q_norm, k_norm) = qk_norm.unzip();
        Self {
            wq,
            wk,
            wv,
            wo,
            q_norm,
            k_norm,
            n_heads: config.n_heads,
            n_kv_heads: config.n_kv_heads,
            head_dim: config.head_dim,
            kv_mul: config.kv_group(),
        }
    }

    /// Reads normalized rows from `state.xb`, writes the projected output to `state.xb2`.
    pub fn forward(&self, step: &StepContext<'_>, cache: &mut LayerCache, state: &mut RunState) {
        // Compute Q, K, V projections
        self.wq.forward(&mut state.q, &state.xb);
        self.wk.forward(&mut state.k, &state.xb);
        self.wv.forward(&mut state.v, &state.xb);

        self.apply_qk_normalization_and_rope(step, state);

        // Store this step's keys and values, one contiguous block per sequence
        let block = step.seq_len * self.n_kv_heads * self.head_dim;
        for batch_idx in 0..step.batch_size {
            let range = batch_idx * block..(batch_idx + 1) * block;
            cache.write(batch_idx, step.start_pos, &state.k[range.clone()], &state.v[range]);
        }

        self.compute_attention(step, cache, state);

        self.wo.forward(&mut state.xb2, &state.attn);
    }

    fn apply_qk_normalization_and_rope(&self, step: &StepContext<'_>, state: &mut RunState) {
        let q_dim = self.n_heads * self.head_dim;
        let kv_dim = self.n_kv_heads * self.head_dim;

        if let Some(q_norm) = &self.q_norm {
            q_norm.forward_inplace(&mut state.q);
        }
        if let Some(k_norm) = &self.k_norm {
            k_norm.forward_inplace(&mut state.k);
        }

        state.q.chunks_mut(q_dim).enumerate().for_each(|(row, q_row)| {
            let offset = row % step.seq_len;
            q_row.chunks_mut(self.head_dim).for_each(|head| step.freqs.apply(offset, head));
        });

        state.k.chunks_mut(kv_dim).enumerate().for_each(|(row, k_row)| {
            let offset = row % step.seq_len;
            k_row.chunks_mut(self.head_dim).for_each(|head| step.freqs.apply(offset, head));
        });
    }

    fn compute_attention(&self, step: &StepContext<'_>, cache: &LayerCache, state: &mut RunState) {
        let attention_scale = (self.head_dim as f32).sqrt().recip();
        let q_dim = self.n_heads * self.head_dim;
        let kv_dim = self.n_kv_heads * self.head_dim;
        let total_len = step.total_len();
        let q = &state.q;

        state
            .att
            .par_chunks_mut(total_len)
            .zip(state.attn.par_chunks_mut(self.head_dim))
            .enumerate()
            .for_each(|(idx, (att_head, out_head))| {
                let (row, head_idx) = (idx / self.n_heads, idx % self.n_heads);
                let (batch_idx, offset) = (row / step.seq_len, row % step.seq_len);
                let kv_offset = (head_idx / self.kv_mul) * self.head_dim;

                let q_start = row * q_dim + head_idx * self.head_dim;
                let q_head = &q[q_start..q_start + self.head_dim];
                let keys = cache.keys(batch_idx, total_len);
                let values = cache.values(batch_idx, total_len);

                att_head.iter_mut().enumerate().for_each(|(time_step, att_score)| {
                    let k_start = time_step * kv_dim + kv_offset;
                    *att_score = dot(q_head, &keys[k_start..k_start + self.head_dim]) * attention_scale;
                });

                if let Some(mask) = step.mask {
                    att_head.iter_mut().zip(mask.row(offset)).for_each(|(score, &bias)| *score += bias);
                }

                softmax(att_head);

                // Weighted sum of values
                out_head.fill(0.0);
                att_head.iter().enumerate().for_each(|(time_step, &weight)| {
                    let v_start = time_step * kv_dim + kv_offset;
                    out_head
                        .iter_mut()
                        .zip(&values[v_start..v_start + self.head_dim])
                        .for_each(|(out, &value)| *out += weight * value);
                });
            });
    }
}

impl std::fmt::Debug for Attention {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Attention")
            .field("n_heads", &self.n_heads)
            .field("n_kv_heads", &self.n_kv_heads)
            .field("head_dim", &self.head_dim)
            .field("wq", &self.wq)
            .field("wk", &self.wk)
            .field("wv", &self.wv)
            .field("wo", &self.wo)
            .field("q_norm", &self.q_norm)
            .field("k_norm", &self.k_norm)
            .finish()
    }
}
