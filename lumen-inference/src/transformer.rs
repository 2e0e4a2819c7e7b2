#[cfg(test)]
#[path = "../tests/unit/transformer_test.rs"]
mod transformer_test;

use crate::attention::{Attention, CausalMask, StepContext};
use crate::checkpoint::{Checkpoint, expected_shapes, names};
use crate::configuration::ModelConfig;
use crate::error::EngineError;
use crate::kv_cache::{KVCache, LayerCache};
use crate::layers::{FeedForward, Linear, RMSNorm, TokenEmbedding};
use crate::rope::RotaryTable;
use anyhow::{Context, Result};
use log::debug;
use std::collections::HashMap;

/// Decoder-only transformer with its key/value cache.
///
/// **Structure:**
/// 1. **Token Embedding**: token ids to dense vectors
/// 2. **N Decoder Layers**: pre-norm attention and feed-forward with residual connections
/// 3. **Final Normalization**: RMSNorm over the output hidden states
/// 4. **Output Projection**: hidden states to vocabulary logits
///
/// One forward call processes `seq_len` new positions for every sequence of
/// a batch, after `start_pos` positions that are already cached. Calls for one
/// request must be made in position order.
pub struct TransformerStack {
    config: ModelConfig,
    token_embedding: TokenEmbedding,
    layers: Vec<DecoderLayer>,
    final_norm: RMSNorm,
    lm_head: Linear,
    rope: RotaryTable,
    cache: KVCache,
    state: RunState,
}

impl TransformerStack {
    /// Builds the stack from checkpoint weights, checking every parameter
    /// against the shape `config` implies.
    pub fn from_checkpoint(checkpoint: &dyn Checkpoint, config: ModelConfig) -> Result<Self> {
        let mut weights = WeightLoader::new(checkpoint, &config);

        let token_embedding_table = weights.load(names::TOKEN_EMBEDDINGS)?;
        let layers = (0..config.n_layers)
            .map(|layer_idx| DecoderLayer::load(&mut weights, &config, layer_idx))
            .collect::<Result<Vec<_>>>()?;
        let final_norm = RMSNorm::new(weights.load(names::FINAL_NORM)?, config.norm_eps);

        let lm_head_weight = match weights.load_optional(names::OUTPUT)? {
            Some(weight) => weight,
            None if config.tie_embeddings => {
                debug!("Output projection is tied to the token embeddings");
                token_embedding_table.clone()
            }
            None => return Err(EngineError::MissingParameter { name: names::OUTPUT.to_string() }.into()),
        };
        let lm_head = Linear::new(lm_head_weight, config.dim, config.vocab_size);

        Ok(Self {
            token_embedding: TokenEmbedding::new(token_embedding_table, config.dim),
            layers,
            final_norm,
            lm_head,
            rope: RotaryTable::new(&config),
            cache: KVCache::new(&config),
            state: RunState::default(),
            config,
        })
    }

    /// Forward pass over `tokens`, `batch_size` rows of `seq_len` ids each, laid out row after row.
    ///
    /// **Arguments:**
    /// - `tokens`: new token ids of every sequence for positions `[start_pos, start_pos + seq_len)`
    /// - `start_pos`: number of positions already in the cache
    ///
    /// **Returns:**
    /// - logits of shape `(batch_size, seq_len, vocab_size)`
    pub fn forward(&mut self, tokens: &[usize], batch_size: usize, start_pos: usize) -> Result<Logits<'_>> {
        let seq_len = self.check_step(tokens, batch_size, start_pos)?;
        let rows = batch_size * seq_len;
        let total_len = start_pos + seq_len;

        self.state.prepare(&self.config, rows, total_len);

        // Token embedding
        self.token_embedding.forward_tokens(tokens, &mut self.state.x);

        let mask = (seq_len > 1).then(|| CausalMask::new(start_pos, seq_len));
        let step = StepContext {
            batch_size,
            seq_len,
            start_pos,
            freqs: self.rope.slice(start_pos, seq_len),
            mask: mask.as_ref(),
        };

        // Process through decoder layers
        for (layer, cache) in self.layers.iter().zip(self.cache.layers_mut()) {
            layer.forward(&step, cache, &mut self.state);
        }
        self.cache.commit(total_len);

        // Final normalization
        self.final_norm.forward_inplace(&mut self.state.x);

        // Output projection
        self.lm_head.forward(&mut self.state.logits, &self.state.x);

        Ok(Logits { data: &self.state.logits, batch_size, seq_len, vocab_size: self.config.vocab_size })
    }

    fn check_step(&self, tokens: &[usize], batch_size: usize, start_pos: usize) -> Result<usize> {
        if batch_size == 0 || tokens.is_empty() {
            return Err(EngineError::EmptyBatch.into());
        }
        if batch_size > self.config.max_batch_size {
            return Err(EngineError::BatchTooLarge { batch: batch_size, max: self.config.max_batch_size }.into());
        }
        if tokens.len() % batch_size != 0 {
            anyhow::bail!("{} tokens cannot be split into {} equal rows", tokens.len(), batch_size);
        }

        let seq_len = tokens.len() / batch_size;
        if start_pos + seq_len > self.config.max_seq_len {
            return Err(
                EngineError::SequenceTooLong { requested: start_pos + seq_len, max: self.config.max_seq_len }.into()
            );
        }
        if start_pos > self.cache.len() {
            anyhow::bail!("Cannot start at position {start_pos}: only {} positions are cached", self.cache.len());
        }
        if let Some(&token) = tokens.iter().find(|&&token| token >= self.config.vocab_size) {
            return Err(EngineError::TokenOutOfRange { token, vocab_size: self.config.vocab_size }.into());
        }

        Ok(seq_len)
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn cache(&self) -> &KVCache {
        &self.cache
    }

    pub fn reset_cache(&mut self) {
        self.cache.reset();
    }
}

impl std::fmt::Debug for TransformerStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        struct LayersSummary<'a, T>(&'a [T]);

        impl<T: std::fmt::Debug> std::fmt::Debug for LayersSummary<'_, T> {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.debug_list()
                    .entries(self.0.iter().take(1))
                    .entry(&format_args!("... and {} more", self.0.len().saturating_sub(1)))
                    .finish()
            }
        }

        f.debug_struct("TransformerStack")
            .field("config", &self.config)
            .field("token_embedding", &self.token_embedding)
            .field("layers", &LayersSummary(&self.layers))
            .field("final_norm", &self.final_norm)
            .field("lm_head", &self.lm_head)
            .field("rope", &self.rope)
            .field("cache", &self.cache)
            .finish()
    }
}

/// Logits of one forward step, shape `(batch_size, seq_len, vocab_size)`.
#[derive(Clone, Copy)]
pub struct Logits<'a> {
    data: &'a [f32],
    batch_size: usize,
    seq_len: usize,
    vocab_size: usize,
}

impl<'a> Logits<'a> {
    /// Logits predicting the token after position `offset` of sequence `batch_idx`.
    pub fn row(&self, batch_idx: usize, offset: usize) -> &'a [f32] {
        let start = (batch_idx * self.seq_len + offset) * self.vocab_size;
        &self.data[start..start + self.vocab_size]
    }

    /// Logits of the last position of sequence `batch_idx`.
    pub fn last(&self, batch_idx: usize) -> &'a [f32] {
        self.row(batch_idx, self.seq_len - 1)
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn seq_len(&self) -> usize {
        self.seq_len
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }
}

/// Transformer Block - decoder layer combining self-attention and feed-forward
///
/// **Architecture Pattern**: Pre-norm with residual connections
/// ```text
/// x = x + Attention(RMSNorm(x))
/// x = x + FFN(RMSNorm(x))
/// ```
pub struct DecoderLayer {
    pub attn_norm: RMSNorm,
    pub attention: Attention,
    pub ffn_norm: RMSNorm,
    pub feed_forward: FeedForward,
    pub layer_idx: usize,
}

impl DecoderLayer {
    fn load(weights: &mut WeightLoader<'_>, config: &ModelConfig, layer_idx: usize) -> Result<Self> {
        let ModelConfig { dim, hidden_dim, norm_eps, .. } = *config;
        let (q_dim, kv_dim) = (config.q_dim(), config.kv_dim());

        let attn_norm = RMSNorm::new(weights.load(&names::attention_norm(layer_idx))?, norm_eps);
        let ffn_norm = RMSNorm::new(weights.load(&names::ffn_norm(layer_idx))?, norm_eps);

        // Attention projections
        let wq = Linear::new(weights.load(&names::attention(layer_idx, "wq"))?, dim, q_dim);
        let wk = Linear::new(weights.load(&names::attention(layer_idx, "wk"))?, dim, kv_dim);
        let wv = Linear::new(weights.load(&names::attention(layer_idx, "wv"))?, dim, kv_dim);
        let wo = Linear::new(weights.load(&names::attention(layer_idx, "wo"))?, q_dim, dim);

        let qk_norm = if config.architecture.uses_qk_norm() {
            let q_norm = RMSNorm::new(weights.load(&names::attention(layer_idx, "q_norm"))?, norm_eps);
            let k_norm = RMSNorm::new(weights.load(&names::attention(layer_idx, "k_norm"))?, norm_eps);
            Some((q_norm, k_norm))
        } else {
            None
        };

        let attention = Attention::new(wq, wk, wv, wo, qk_norm, config);

        // Feed-forward projections
        let w1 = Linear::new(weights.load(&names::feed_forward(layer_idx, "w1"))?, dim, hidden_dim);
        let w2 = Linear::new(weights.load(&names::feed_forward(layer_idx, "w2"))?, hidden_dim, dim);
        let w3 = Linear::new(weights.load(&names::feed_forward(layer_idx, "w3"))?, dim, hidden_dim);

        Ok(Self { attn_norm, attention, ffn_norm, feed_forward: FeedForward::new(w1, w2, w3), layer_idx })
    }

    fn forward(&self, step: &StepContext<'_>, cache: &mut LayerCache, state: &mut RunState) {
        // Attention block with residual connection
        self.attn_norm.forward(&mut state.xb, &state.x);
        self.attention.forward(step, cache, state);
        state.x.iter_mut().zip(state.xb2.iter()).for_each(|(x_val, &delta)| *x_val += delta);

        // Feed-forward block with residual connection
        self.ffn_norm.forward(&mut state.xb, &state.x);
        self.feed_forward.forward(state);
        state.x.iter_mut().zip(state.xb2.iter()).for_each(|(x_val, &delta)| *x_val += delta);
    }
}

impl std::fmt::Debug for DecoderLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecoderLayer")
            .field("layer_idx", &self.layer_idx)
            .field("attn_norm", &self.attn_norm)
            .field("attention", &self.attention)
            .field("ffn_norm", &self.ffn_norm)
            .field("feed_forward", &self.feed_forward)
            .finish()
    }
}

/// Reads checkpoint tensors and checks them against the expected shapes.
struct WeightLoader<'a> {
    checkpoint: &'a dyn Checkpoint,
    shapes: HashMap<String, Vec<usize>>,
}

impl<'a> WeightLoader<'a> {
    fn new(checkpoint: &'a dyn Checkpoint, config: &ModelConfig) -> Self {
        Self { checkpoint, shapes: expected_shapes(config).into_iter().collect() }
    }

    fn load(&mut self, name: &str) -> Result<Vec<f32>> {
        self.load_optional(name)?.ok_or_else(|| EngineError::MissingParameter { name: name.to_string() }.into())
    }

    fn load_optional(&mut self, name: &str) -> Result<Option<Vec<f32>>> {
        let expected = self.shapes.remove(name).with_context(|| format!("No expected shape for {name}"))?;

        let Some(tensor) = self.checkpoint.tensor(name).with_context(|| format!("Failed to read {name}"))? else {
            return Ok(None);
        };

        if tensor.shape() != expected.as_slice() {
            return Err(EngineError::ShapeMismatch {
                name: name.to_string(),
                expected,
                actual: tensor.shape().to_vec(),
            }
            .into());
        }

        Ok(Some(tensor.into_data()))
    }
}

/// Scratch buffers of one forward step.
///
/// Resized for `rows = batch_size * seq_len` activation rows at the start of
/// every step. Buffers keep their capacity, so steady-state decoding does not allocate.
#[derive(Debug, Default)]
pub struct RunState {
    /// Residual stream. Shape: [rows, dim]
    pub x: Vec<f32>,
    /// Normalized input of the current sublayer. Shape: [rows, dim]
    pub xb: Vec<f32>,
    /// Output of the current sublayer. Shape: [rows, dim]
    pub xb2: Vec<f32>,
    /// Shape: [rows, n_heads * head_dim]
    pub q: Vec<f32>,
    /// Shape: [rows, n_kv_heads * head_dim]
    pub k: Vec<f32>,
    /// Shape: [rows, n_kv_heads * head_dim]
    pub v: Vec<f32>,
    /// Concatenated attention heads. Shape: [rows, n_heads * head_dim]
    pub attn: Vec<f32>,
    /// Attention weights. Shape: [rows, n_heads, start_pos + seq_len]
    pub att: Vec<f32>,
    /// Shape: [rows, hidden_dim]
    pub hb: Vec<f32>,
    /// Shape: [rows, hidden_dim]
    pub hb2: Vec<f32>,
    /// Shape: [rows, vocab_size]
    pub logits: Vec<f32>,
}

impl RunState {
    pub fn prepare(&mut self, config: &ModelConfig, rows: usize, total_len: usize) {
        let resize = |buffer: &mut Vec<f32>, len: usize| buffer.resize(len, 0.0);

        resize(&mut self.x, rows * config.dim);
        resize(&mut self.xb, rows * config.dim);
        resize(&mut self.xb2, rows * config.dim);
        resize(&mut self.q, rows * config.q_dim());
        resize(&mut self.k, rows * config.kv_dim());
        resize(&mut self.v, rows * config.kv_dim());
        resize(&mut self.attn, rows * config.q_dim());
        resize(&mut self.att, rows * config.n_heads * total_len);
        resize(&mut self.hb, rows * config.hidden_dim);
        resize(&mut self.hb2, rows * config.hidden_dim);
        resize(&mut self.logits, rows * config.vocab_size);
    }
}
