use super::*;

/// LLaMA and Mistral checkpoints share one layout.
pub struct Llama {
    id: ArchitectureId,
}

impl Llama {
    #[rustfmt::skip]
    const LAYER_COMPONENTS: &'static [(&'static str, &'static str)] = &[
        ("attention_norm", "input_layernorm"),
        ("ffn_norm", "post_attention_layernorm"),
        ("attention.wq", "self_attn.q_proj"),
        ("attention.wk", "self_attn.k_proj"),
        ("attention.wv", "self_attn.v_proj"),
        ("attention.wo", "self_attn.o_proj"),
        ("feed_forward.w1", "mlp.gate_proj"),
        ("feed_forward.w2", "mlp.down_proj"),
        ("feed_forward.w3", "mlp.up_proj"),
    ];

    pub fn new(id: ArchitectureId) -> Self {
        Self { id }
    }
}

impl Architecture for Llama {
    fn id(&self) -> ArchitectureId {
        self.id
    }

    fn layer_components(&self) -> &[(&'static str, &'static str)] {
        Self::LAYER_COMPONENTS
    }
}
