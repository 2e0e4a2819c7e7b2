use anyhow::Result;
use lumen_inference::names;

use crate::models::{llama::Llama, qwen3::Qwen3};

mod llama;
mod qwen3;

/// Architectures named in the `architectures` field of `config.json`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchitectureId {
    LlamaForCausalLM,
    MistralForCausalLM,
    Qwen3ForCausalLM,
}

impl ArchitectureId {
    pub fn name(&self) -> &'static str {
        match self {
            Self::LlamaForCausalLM => "LlamaForCausalLM",
            Self::MistralForCausalLM => "MistralForCausalLM",
            Self::Qwen3ForCausalLM => "Qwen3ForCausalLM",
        }
    }
}

impl TryFrom<&str> for ArchitectureId {
    type Error = anyhow::Error;

    fn try_from(value: &str) -> Result<Self> {
        match value {
            "LlamaForCausalLM" => Ok(Self::LlamaForCausalLM),
            "MistralForCausalLM" => Ok(Self::MistralForCausalLM),
            "Qwen3ForCausalLM" => Ok(Self::Qwen3ForCausalLM),
            _ => anyhow::bail!("Unknown ArchitectureId: {value}"),
        }
    }
}

/// Maps canonical engine parameter names to the names stored in a checkpoint.
pub trait Architecture {
    fn id(&self) -> ArchitectureId;

    fn embed_tokens_layer(&self) -> &'static str {
        "model.embed_tokens.weight"
    }

    fn final_norm_layer(&self) -> &'static str {
        "model.norm.weight"
    }

    fn lm_head_layer(&self) -> &'static str {
        "lm_head.weight"
    }

    /// Pairs of canonical and stored per-layer component names, both without
    /// the `layers.{i}.` prefix and `.weight` suffix.
    fn layer_components(&self) -> &[(&'static str, &'static str)];

    /// Stored name of a canonical parameter, `None` when the architecture has no such parameter.
    fn tensor_name(&self, canonical: &str) -> Option<String> {
        match canonical {
            names::TOKEN_EMBEDDINGS => return Some(self.embed_tokens_layer().to_string()),
            names::FINAL_NORM => return Some(self.final_norm_layer().to_string()),
            names::OUTPUT => return Some(self.lm_head_layer().to_string()),
            _ => {}
        }

        let (layer_idx, component) = canonical.strip_prefix("layers.")?.strip_suffix(".weight")?.split_once('.')?;
        let layer_idx = layer_idx.parse::<usize>().ok()?;

        self.layer_components()
            .iter()
            .find(|(name, _)| *name == component)
            .map(|(_, stored)| format!("model.layers.{layer_idx}.{stored}.weight"))
    }
}

pub fn create_architecture(id: ArchitectureId) -> Box<dyn Architecture> {
    match id {
        ArchitectureId::LlamaForCausalLM | ArchitectureId::MistralForCausalLM => Box::new(Llama::new(id)),
        ArchitectureId::Qwen3ForCausalLM => Box::new(Qwen3),
    }
}
