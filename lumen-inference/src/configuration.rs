#[cfg(test)]
#[path = "../tests/unit/configuration_test.rs"]
mod configuration_test;

use crate::error::EngineError;
use anyhow::Result;

/// Default base of the rotary frequency ladder.
pub const DEFAULT_ROPE_BASE: f32 = 10_000.0;

/// Default epsilon added to the mean square in RMS normalization.
pub const DEFAULT_NORM_EPS: f32 = 1e-5;

/// Default rounding multiple for the feed-forward hidden dimension.
pub const DEFAULT_MULTIPLE_OF: usize = 256;

/// Model family. Selects the per-family details of a single attention
/// implementation instead of a separate type per family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Architecture {
    /// LLaMA-style: `head_dim * n_heads == dim`, no query/key normalization.
    Llama,
    /// Qwen3-style: RMS normalization of every query/key head before rotation,
    /// and an explicit head dimension that may differ from `dim / n_heads`.
    Qwen3,
}

impl Architecture {
    pub fn uses_qk_norm(&self) -> bool {
        matches!(self, Architecture::Qwen3)
    }
}

/// Which channels of a head form one rotation pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotaryLayout {
    /// Consecutive channels `(2i, 2i + 1)`.
    Interleaved,
    /// Channels `(i, i + d/2)`, the layout of HuggingFace exported weights.
    HalfSplit,
}

/// How many channels of every head are rotated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotaryCoverage {
    Full,
    /// Only the first `n` channels; the rest pass through unchanged.
    Partial(usize),
}

/// Key/value head sharing, derived from the head counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttentionKind {
    MultiHead,
    /// Each key/value head serves `group` query heads.
    GroupedQuery { group: usize },
}

/// Architecture hyper-parameters as they are stored next to a checkpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelParams {
    pub architecture: Architecture,
    pub dim: usize,
    pub n_layers: usize,
    pub n_heads: usize,
    pub n_kv_heads: usize,
    /// Explicit head dimension; `dim / n_heads` when absent.
    pub head_dim: Option<usize>,
    /// Explicit feed-forward width; derived from `dim` when absent.
    pub hidden_dim: Option<usize>,
    pub multiple_of: usize,
    pub ffn_dim_multiplier: Option<f32>,
    pub norm_eps: f32,
    pub rope_base: f32,
    pub rotary_layout: RotaryLayout,
    pub rotary_coverage: RotaryCoverage,
    /// Reuse the embedding table as output projection when the checkpoint has none.
    pub tie_embeddings: bool,
}

impl ModelParams {
    /// LLaMA-style parameters with default rounding, epsilon and rotary base.
    pub fn new(dim: usize, n_layers: usize, n_heads: usize, n_kv_heads: usize) -> Self {
        Self {
            architecture: Architecture::Llama,
            dim,
            n_layers,
            n_heads,
            n_kv_heads,
            head_dim: None,
            hidden_dim: None,
            multiple_of: DEFAULT_MULTIPLE_OF,
            ffn_dim_multiplier: None,
            norm_eps: DEFAULT_NORM_EPS,
            rope_base: DEFAULT_ROPE_BASE,
            rotary_layout: RotaryLayout::Interleaved,
            rotary_coverage: RotaryCoverage::Full,
            tie_embeddings: false,
        }
    }
}

/// Validated, immutable model configuration.
///
/// Built once from [`ModelParams`] plus the runtime limits and handed by
/// shared reference to every layer constructor.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelConfig {
    pub architecture: Architecture,
    pub dim: usize,
    pub n_layers: usize,
    pub n_heads: usize,
    pub n_kv_heads: usize,
    pub head_dim: usize,
    pub hidden_dim: usize,
    pub vocab_size: usize,
    pub multiple_of: usize,
    pub norm_eps: f32,
    pub rope_base: f32,
    pub rotary_layout: RotaryLayout,
    /// Number of rotated channels per head (always even).
    pub rotary_dim: usize,
    pub max_seq_len: usize,
    pub max_batch_size: usize,
    pub tie_embeddings: bool,
}

impl ModelConfig {
    /// Derives and validates the configuration. All configuration errors are
    /// reported here, so nothing downstream re-checks them.
    pub fn new(params: &ModelParams, vocab_size: usize, max_seq_len: usize, max_batch_size: usize) -> Result<Self> {
        let dimensions = [
            ("dim", params.dim),
            ("n_layers", params.n_layers),
            ("n_heads", params.n_heads),
            ("n_kv_heads", params.n_kv_heads),
            ("multiple_of", params.multiple_of),
            ("vocab_size", vocab_size),
            ("max_seq_len", max_seq_len),
            ("max_batch_size", max_batch_size),
        ];

        for (name, value) in dimensions {
            if value == 0 {
                return Err(EngineError::invalid_config(format!("{name} must be positive")).into());
            }
        }

        if params.n_kv_heads > params.n_heads || params.n_heads % params.n_kv_heads != 0 {
            return Err(EngineError::invalid_config(format!(
                "n_heads ({}) must be a multiple of n_kv_heads ({})",
                params.n_heads, params.n_kv_heads
            ))
            .into());
        }

        let head_dim = match (params.architecture, params.head_dim) {
            (Architecture::Qwen3, Some(head_dim)) => head_dim,
            (_, explicit) => {
                if params.dim % params.n_heads != 0 {
                    return Err(EngineError::invalid_config(format!(
                        "dim ({}) is not divisible by n_heads ({})",
                        params.dim, params.n_heads
                    ))
                    .into());
                }
                let derived = params.dim / params.n_heads;
                if let Some(head_dim) = explicit.filter(|&head_dim| head_dim != derived) {
                    return Err(EngineError::invalid_config(format!(
                        "head_dim ({head_dim}) * n_heads ({}) must equal dim ({})",
                        params.n_heads, params.dim
                    ))
                    .into());
                }
                derived
            }
        };

        if head_dim == 0 || head_dim % 2 != 0 {
            return Err(EngineError::invalid_config(format!("head_dim ({head_dim}) must be positive and even")).into());
        }

        let rotary_dim = match params.rotary_coverage {
            RotaryCoverage::Full => head_dim,
            RotaryCoverage::Partial(n) if n > 0 && n % 2 == 0 && n <= head_dim => n,
            RotaryCoverage::Partial(n) => {
                return Err(EngineError::invalid_config(format!(
                    "partial rotary dimension ({n}) must be even and in 1..={head_dim}"
                ))
                .into());
            }
        };

        if !(params.norm_eps.is_finite() && params.norm_eps > 0.0) {
            return Err(EngineError::invalid_config(format!("norm_eps ({}) must be positive", params.norm_eps)).into());
        }

        if !(params.rope_base.is_finite() && params.rope_base > 1.0) {
            return Err(
                EngineError::invalid_config(format!("rope_base ({}) must be greater than one", params.rope_base)).into()
            );
        }

        if let Some(multiplier) = params.ffn_dim_multiplier {
            if !(multiplier.is_finite() && multiplier > 0.0) {
                return Err(
                    EngineError::invalid_config(format!("ffn_dim_multiplier ({multiplier}) must be positive")).into()
                );
            }
        }

        let hidden_dim = match params.hidden_dim {
            Some(0) => return Err(EngineError::invalid_config("hidden_dim must be positive").into()),
            Some(hidden_dim) => hidden_dim,
            None => feed_forward_hidden_dim(params.dim, params.multiple_of, params.ffn_dim_multiplier),
        };

        Ok(Self {
            architecture: params.architecture,
            dim: params.dim,
            n_layers: params.n_layers,
            n_heads: params.n_heads,
            n_kv_heads: params.n_kv_heads,
            head_dim,
            hidden_dim,
            vocab_size,
            multiple_of: params.multiple_of,
            norm_eps: params.norm_eps,
            rope_base: params.rope_base,
            rotary_layout: params.rotary_layout,
            rotary_dim,
            max_seq_len,
            max_batch_size,
            tie_embeddings: params.tie_embeddings,
        })
    }

    /// Width of all query heads together.
    pub fn q_dim(&self) -> usize {
        self.n_heads * self.head_dim
    }

    /// Width of all key (or value) heads together.
    pub fn kv_dim(&self) -> usize {
        self.n_kv_heads * self.head_dim
    }

    /// Query heads served by one key/value head.
    pub fn kv_group(&self) -> usize {
        self.n_heads / self.n_kv_heads
    }

    pub fn attention_kind(&self) -> AttentionKind {
        match self.kv_group() {
            1 => AttentionKind::MultiHead,
            group => AttentionKind::GroupedQuery { group },
        }
    }
}

/// LLaMA feed-forward sizing: two thirds of `4 * dim`, optionally scaled,
/// rounded up to a multiple of `multiple_of`.
pub fn feed_forward_hidden_dim(dim: usize, multiple_of: usize, multiplier: Option<f32>) -> usize {
    let mut hidden = 2 * (4 * dim) / 3;
    if let Some(multiplier) = multiplier {
        hidden = (multiplier * hidden as f32) as usize;
    }
    hidden.div_ceil(multiple_of) * multiple_of
}
