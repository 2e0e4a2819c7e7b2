use crate::tensor::{matmul, silu};
use crate::transformer::RunState;

/// Token embedding layer - converts token IDs to dense vectors
///
/// **Shape**: [vocab_size, embedding_dim]
/// **Note**: May double as the output projection when embeddings are tied
pub struct TokenEmbedding {
    pub embedding_table: Vec<f32>,
    pub dim: usize,
}

impl TokenEmbedding {
    pub fn new(embedding_table: Vec<f32>, dim: usize) -> Self {
        Self { embedding_table, dim }
    }

    pub fn forward(&self, token: usize, output: &mut [f32]) {
        let start_idx = token * self.dim;
        let end_idx = start_idx + self.dim;
        output[..self.dim].copy_from_slice(&self.embedding_table[start_idx..end_idx]);
    }

    /// Embeds a flat list of tokens, one `dim`-sized row each.
    pub fn forward_tokens(&self, tokens: &[usize], output: &mut [f32]) {
        output.chunks_mut(self.dim).zip(tokens).for_each(|(row, &token)| self.forward(token, row));
    }
}

impl std::fmt::Debug for TokenEmbedding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenEmbedding")
            .field("dim", &self.dim)
            .field("vocab_size", &(self.embedding_table.len() / self.dim))
            .finish()
    }
}

/// RMS Layer Normalization
///
/// **Mathematical Formula**:
/// ```text
/// RMSNorm(x) = x / RMS(x) * γ
/// where RMS(x) = sqrt(mean(x²) + ε)
/// ```
///
/// The mean square and the scaling are evaluated in `f64` and cast back to
/// `f32` before the gain is applied.
///
/// Inputs longer than the gain are treated as consecutive rows of
/// `weight.len()` elements, which serves both whole activations and single
/// attention heads.
pub struct RMSNorm {
    pub weight: Vec<f32>,
    pub eps: f32,
}

impl RMSNorm {
    pub fn new(weight: Vec<f32>, eps: f32) -> Self {
        Self { weight, eps }
    }

    fn scale(&self, row: &[f32]) -> f64 {
        let sum_of_squares = row.iter().map(|&x| (x as f64) * (x as f64)).sum::<f64>();
        1.0f64 / ((sum_of_squares / row.len() as f64) + self.eps as f64).sqrt()
    }

    pub fn forward(&self, output: &mut [f32], input: &[f32]) {
        debug_assert_eq!(output.len(), input.len());
        debug_assert_eq!(input.len() % self.weight.len(), 0);

        let dim = self.weight.len();
        output.chunks_mut(dim).zip(input.chunks(dim)).for_each(|(out_row, in_row)| {
            let rms_norm_factor = self.scale(in_row);
            out_row.iter_mut().zip(in_row).zip(&self.weight).for_each(|((out, &inp), &w)| {
                *out = w * ((inp as f64 * rms_norm_factor) as f32);
            });
        });
    }

    pub fn forward_inplace(&self, x: &mut [f32]) {
        debug_assert_eq!(x.len() % self.weight.len(), 0);

        x.chunks_mut(self.weight.len()).for_each(|row| {
            let rms_norm_factor = self.scale(row);
            row.iter_mut().zip(&self.weight).for_each(|(val, &w)| {
                *val = w * ((*val as f64 * rms_norm_factor) as f32);
            });
        });
    }
}

impl std::fmt::Debug for RMSNorm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RMSNorm").field("dim", &self.weight.len()).field("eps", &self.eps).finish()
    }
}

/// Dense linear projection without bias. Weight is `[out_features, in_features]`.
pub struct Linear {
    pub weight: Vec<f32>,
    pub in_features: usize,
    pub out_features: usize,
}

impl Linear {
    pub fn new(weight: Vec<f32>, in_features: usize, out_features: usize) -> Self {
        Self { weight, in_features, out_features }
    }

    /// Projects every `in_features` row of `input` into the matching row of `output`.
    pub fn forward(&self, output: &mut [f32], input: &[f32]) {
        matmul(output, input, &self.weight, self.in_features, self.out_features);
    }
}

impl std::fmt::Debug for Linear {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Linear")
            .field("in_features", &self.in_features)
            .field("out_features", &self.out_features)
            .finish()
    }
}

/// Feed-Forward Network with SwiGLU activation
///
/// - Formula: FFN(x) = W2 · (Swish(W1·x) ⊙ (W3·x))
/// - Where Swish(x) = x · sigmoid(x)
pub struct FeedForward {
    pub w1: Linear, // Gate projection
    pub w2: Linear, // Down projection
    pub w3: Linear, // Up projection
}

impl FeedForward {
    pub fn new(w1: Linear, w2: Linear, w3: Linear) -> Self {
        Self { w1, w2, w3 }
    }

    /// Reads normalized rows from `state.xb`, writes the block output to `state.xb2`.
    pub fn forward(&self, state: &mut RunState) {
        // Gate and up projections
        self.w1.forward(&mut state.hb, &state.xb);
        self.w3.forward(&mut state.hb2, &state.xb);

        // Apply SwiGLU activation
        state.hb.iter_mut().zip(state.hb2.iter()).for_each(|(gate_val, &linear_val)| {
            *gate_val = silu(*gate_val) * linear_val;
        });

        // Down projection
        self.w2.forward(&mut state.xb2, &state.hb);
    }
}

impl std::fmt::Debug for FeedForward {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedForward")
            .field("hidden_dim", &self.w1.out_features)
            .field("w1", &self.w1)
            .field("w2", &self.w2)
            .field("w3", &self.w3)
            .finish()
    }
}
