use super::*;

/// Qwen3 adds per-head query/key normalization to the LLaMA layout.
pub struct Qwen3;

impl Qwen3 {
    #[rustfmt::skip]
    const LAYER_COMPONENTS: &'static [(&'static str, &'static str)] = &[
        ("attention_norm", "input_layernorm"),
        ("ffn_norm", "post_attention_layernorm"),
        ("attention.wq", "self_attn.q_proj"),
        ("attention.wk", "self_attn.k_proj"),
        ("attention.wv", "self_attn.v_proj"),
        ("attention.wo", "self_attn.o_proj"),
        ("attention.q_norm", "self_attn.q_norm"),
        ("attention.k_norm", "self_attn.k_norm"),
        ("feed_forward.w1", "mlp.gate_proj"),
        ("feed_forward.w2", "mlp.down_proj"),
        ("feed_forward.w3", "mlp.up_proj"),
    ];
}

impl Architecture for Qwen3 {
    fn id(&self) -> ArchitectureId {
        ArchitectureId::Qwen3ForCausalLM
    }

    fn layer_components(&self) -> &[(&'static str, &'static str)] {
        Self::LAYER_COMPONENTS
    }
}
