#[cfg(test)]
#[path = "../tests/unit/config_loader_test.rs"]
mod config_loader_test;

use anyhow::{Context, Result};
use log::info;
use lumen_inference::{
    Architecture, DEFAULT_MULTIPLE_OF, DEFAULT_ROPE_BASE, ModelParams, RotaryCoverage, RotaryLayout, Vocabulary,
};
use serde::Deserialize;
use std::{fs, path::Path};

use crate::models::ArchitectureId;

/// Everything read from a model directory's `config.json`.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelInfo {
    pub architecture: ArchitectureId,
    pub params: ModelParams,
    pub vocabulary: Vocabulary,
    /// Longest context the model was trained for.
    pub max_position_embeddings: usize,
}

/// Token id fields are either a single id or a list of ids.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum TokenIds {
    Single(usize),
    Multiple(Vec<usize>),
}

impl TokenIds {
    fn first(&self) -> Option<usize> {
        match self {
            TokenIds::Single(id) => Some(*id),
            TokenIds::Multiple(ids) => ids.first().copied(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct HFConfig {
    hidden_size: usize,
    intermediate_size: usize,
    num_hidden_layers: usize,
    num_attention_heads: usize,
    #[serde(default)]
    num_key_value_heads: Option<usize>,
    #[serde(default)]
    head_dim: Option<usize>,
    rms_norm_eps: f32,
    #[serde(default)]
    rope_theta: Option<f32>,
    #[serde(default)]
    partial_rotary_factor: Option<f32>,
    vocab_size: usize,
    max_position_embeddings: usize,
    #[serde(default)]
    tie_word_embeddings: bool,
    #[serde(default)]
    bos_token_id: Option<TokenIds>,
    #[serde(default)]
    eos_token_id: Option<TokenIds>,
    #[serde(default)]
    pad_token_id: Option<TokenIds>,
    #[serde(default)]
    architectures: Option<Vec<String>>,
}

/// Loads `config.json` from a model directory.
pub fn load_model_info(model_dir: &Path) -> Result<ModelInfo> {
    let config_path = model_dir.join("config.json");
    if !config_path.exists() {
        anyhow::bail!("config.json not found in {}", model_dir.display());
    }

    load_hf_config(&config_path)
}

/// Parses a HuggingFace `config.json` into engine parameters.
pub fn load_hf_config(config_path: &Path) -> Result<ModelInfo> {
    let contents = fs::read_to_string(config_path)
        .with_context(|| format!("Failed to open config.json at {}", config_path.display()))?;

    let hf_config: HFConfig =
        serde_json::from_str(&contents).map_err(|err| anyhow::anyhow!("Failed to parse config.json: {}", err))?;

    let architecture = match hf_config.architectures.as_deref() {
        Some([single]) => ArchitectureId::try_from(single.as_str())?,
        Some([]) | None => anyhow::bail!("Cannot determine architecture"),
        Some(architectures) => anyhow::bail!("Multiple architectures are not supported: {architectures:?}"),
    };

    let n_heads = hf_config.num_attention_heads;
    let head_dim = hf_config.head_dim.unwrap_or_else(|| hf_config.hidden_size / n_heads.max(1));

    let rotary_coverage = match hf_config.partial_rotary_factor {
        Some(factor) if factor < 1.0 => RotaryCoverage::Partial((head_dim as f32 * factor) as usize),
        _ => RotaryCoverage::Full,
    };

    let params = ModelParams {
        architecture: match architecture {
            ArchitectureId::Qwen3ForCausalLM => Architecture::Qwen3,
            ArchitectureId::LlamaForCausalLM | ArchitectureId::MistralForCausalLM => Architecture::Llama,
        },
        dim: hf_config.hidden_size,
        n_layers: hf_config.num_hidden_layers,
        n_heads,
        n_kv_heads: hf_config.num_key_value_heads.unwrap_or(n_heads),
        head_dim: hf_config.head_dim,
        hidden_dim: Some(hf_config.intermediate_size),
        multiple_of: DEFAULT_MULTIPLE_OF,
        ffn_dim_multiplier: None,
        norm_eps: hf_config.rms_norm_eps,
        rope_base: hf_config.rope_theta.unwrap_or(DEFAULT_ROPE_BASE),
        // HuggingFace checkpoints rotate the two halves of every head against each other
        rotary_layout: RotaryLayout::HalfSplit,
        rotary_coverage,
        tie_embeddings: hf_config.tie_word_embeddings,
    };

    let end_id = hf_config.eos_token_id.as_ref().and_then(TokenIds::first).unwrap_or(0);
    let vocabulary = Vocabulary {
        size: hf_config.vocab_size,
        pad_id: hf_config.pad_token_id.as_ref().and_then(TokenIds::first).unwrap_or(end_id),
        begin_id: hf_config.bos_token_id.as_ref().and_then(TokenIds::first).unwrap_or(0),
        end_id,
    };

    let info = ModelInfo {
        architecture,
        params,
        vocabulary,
        max_position_embeddings: hf_config.max_position_embeddings,
    };

    info!("Model configuration loaded:");
    info!("   • Architecture: {}", info.architecture.name());
    info!("   • Dimensions: {}", info.params.dim);
    info!("   • Layers: {}", info.params.n_layers);
    info!("   • Attention heads: {}", info.params.n_heads);
    info!("   • KV heads: {}", info.params.n_kv_heads);
    info!("   • Head dimension: {head_dim}");
    info!("   • Vocabulary size: {}", info.vocabulary.size);
    info!("   • Max sequence length: {}", info.max_position_embeddings);

    Ok(info)
}
