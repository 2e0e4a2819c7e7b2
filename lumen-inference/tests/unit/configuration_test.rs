use super::*;

fn config_error(params: &ModelParams) -> EngineError {
    ModelConfig::new(params, 64, 16, 2)
        .expect_err("configuration should be rejected")
        .downcast::<EngineError>()
        .expect("error should carry an EngineError")
}

#[test]
fn test_feed_forward_hidden_dim_llama_sizes() {
    // LLaMA 7B
    assert_eq!(feed_forward_hidden_dim(4096, 256, None), 11008);
    // LLaMA 2 70B
    assert_eq!(feed_forward_hidden_dim(8192, 4096, Some(1.3)), 28672);
    // Small models round up to one multiple
    assert_eq!(feed_forward_hidden_dim(32, 256, None), 256);
    assert_eq!(feed_forward_hidden_dim(32, 1, None), 85);
}

#[test]
fn test_model_config_derives_dimensions() -> Result<()> {
    let config = ModelConfig::new(&ModelParams::new(32, 2, 4, 2), 64, 16, 3)?;

    assert_eq!(config.head_dim, 8);
    assert_eq!(config.q_dim(), 32);
    assert_eq!(config.kv_dim(), 16);
    assert_eq!(config.kv_group(), 2);
    assert_eq!(config.attention_kind(), AttentionKind::GroupedQuery { group: 2 });
    assert_eq!(config.rotary_dim, 8);
    assert_eq!(config.hidden_dim, 256);
    assert_eq!(config.vocab_size, 64);
    assert_eq!(config.max_seq_len, 16);
    assert_eq!(config.max_batch_size, 3);

    Ok(())
}

#[test]
fn test_model_config_multi_head_and_explicit_hidden_dim() -> Result<()> {
    let params = ModelParams { hidden_dim: Some(96), ..ModelParams::new(32, 1, 4, 4) };
    let config = ModelConfig::new(&params, 64, 16, 1)?;

    assert_eq!(config.attention_kind(), AttentionKind::MultiHead);
    assert_eq!(config.hidden_dim, 96);

    Ok(())
}

#[test]
fn test_model_config_rejects_uneven_head_groups() {
    let error = config_error(&ModelParams::new(32, 2, 4, 3));
    assert!(matches!(error, EngineError::InvalidConfig { .. }));
    assert!(error.is_configuration());

    let error = config_error(&ModelParams::new(32, 2, 2, 4));
    assert!(matches!(error, EngineError::InvalidConfig { .. }));
}

#[test]
fn test_model_config_rejects_indivisible_dim() {
    let error = config_error(&ModelParams::new(30, 1, 4, 4));
    assert!(matches!(error, EngineError::InvalidConfig { .. }));
}

#[test]
fn test_model_config_rejects_odd_head_dim() {
    let error = config_error(&ModelParams::new(12, 1, 4, 4));
    assert!(matches!(error, EngineError::InvalidConfig { .. }));
}

#[test]
fn test_model_config_rejects_zero_dimensions() {
    assert!(matches!(config_error(&ModelParams::new(32, 0, 4, 4)), EngineError::InvalidConfig { .. }));
    assert!(matches!(config_error(&ModelParams::new(32, 1, 0, 0)), EngineError::InvalidConfig { .. }));

    let result = ModelConfig::new(&ModelParams::new(32, 1, 4, 4), 64, 16, 0);
    assert!(result.is_err());
    let result = ModelConfig::new(&ModelParams::new(32, 1, 4, 4), 0, 16, 1);
    assert!(result.is_err());
}

#[test]
fn test_model_config_explicit_head_dim_by_architecture() -> Result<()> {
    // LLaMA requires head_dim * n_heads == dim
    let llama = ModelParams { head_dim: Some(16), ..ModelParams::new(32, 1, 4, 2) };
    assert!(matches!(config_error(&llama), EngineError::InvalidConfig { .. }));

    let matching = ModelParams { head_dim: Some(8), ..ModelParams::new(32, 1, 4, 2) };
    assert_eq!(ModelConfig::new(&matching, 64, 16, 1)?.head_dim, 8);

    // Qwen3 may project queries wider than the model dimension
    let qwen3 = ModelParams { architecture: Architecture::Qwen3, head_dim: Some(16), ..ModelParams::new(32, 1, 4, 2) };
    let config = ModelConfig::new(&qwen3, 64, 16, 1)?;
    assert_eq!(config.head_dim, 16);
    assert_eq!(config.q_dim(), 64);
    assert_eq!(config.kv_dim(), 32);

    Ok(())
}

#[test]
fn test_model_config_partial_rotary() -> Result<()> {
    let partial = ModelParams { rotary_coverage: RotaryCoverage::Partial(4), ..ModelParams::new(32, 1, 4, 4) };
    assert_eq!(ModelConfig::new(&partial, 64, 16, 1)?.rotary_dim, 4);

    let odd = ModelParams { rotary_coverage: RotaryCoverage::Partial(3), ..ModelParams::new(32, 1, 4, 4) };
    assert!(matches!(config_error(&odd), EngineError::InvalidConfig { .. }));

    let too_wide = ModelParams { rotary_coverage: RotaryCoverage::Partial(10), ..ModelParams::new(32, 1, 4, 4) };
    assert!(matches!(config_error(&too_wide), EngineError::InvalidConfig { .. }));

    Ok(())
}

#[test]
fn test_model_config_rejects_bad_numeric_params() {
    let zero_eps = ModelParams { norm_eps: 0.0, ..ModelParams::new(32, 1, 4, 4) };
    assert!(matches!(config_error(&zero_eps), EngineError::InvalidConfig { .. }));

    let low_base = ModelParams { rope_base: 1.0, ..ModelParams::new(32, 1, 4, 4) };
    assert!(matches!(config_error(&low_base), EngineError::InvalidConfig { .. }));

    let negative_multiplier = ModelParams { ffn_dim_multiplier: Some(-1.0), ..ModelParams::new(32, 1, 4, 4) };
    assert!(matches!(config_error(&negative_multiplier), EngineError::InvalidConfig { .. }));

    let zero_hidden = ModelParams { hidden_dim: Some(0), ..ModelParams::new(32, 1, 4, 4) };
    assert!(matches!(config_error(&zero_hidden), EngineError::InvalidConfig { .. }));
}

#[test]
fn test_architecture_qk_norm() {
    assert!(!Architecture::Llama.uses_qk_norm());
    assert!(Architecture::Qwen3.uses_qk_norm());
}
