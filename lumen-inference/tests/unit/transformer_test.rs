use super::*;
use crate::checkpoint::InMemoryCheckpoint;
use crate::configuration::{Architecture, ModelParams};
use crate::tensor::Tensor;

const VOCAB_SIZE: usize = 16;
const MAX_SEQ_LEN: usize = 16;
const MAX_BATCH_SIZE: usize = 2;

fn create_checkpoint(params: ModelParams) -> InMemoryCheckpoint {
    InMemoryCheckpoint::random(params, VOCAB_SIZE, 3).unwrap()
}

fn build_stack(checkpoint: &InMemoryCheckpoint) -> Result<TransformerStack> {
    let config = ModelConfig::new(checkpoint.params(), VOCAB_SIZE, MAX_SEQ_LEN, MAX_BATCH_SIZE)?;
    TransformerStack::from_checkpoint(checkpoint, config)
}

fn engine_error(result: Result<TransformerStack>) -> EngineError {
    result.expect_err("stack should not build").downcast::<EngineError>().unwrap()
}

fn step_error(result: Result<Logits<'_>>) -> Option<EngineError> {
    result.err().and_then(|err| err.downcast::<EngineError>().ok())
}

#[test]
fn test_forward_logits_shape() -> Result<()> {
    let mut stack = build_stack(&create_checkpoint(ModelParams::new(32, 2, 4, 2)))?;

    let logits = stack.forward(&[1, 2, 3, 4, 5, 6], 2, 0)?;
    assert_eq!(logits.batch_size(), 2);
    assert_eq!(logits.seq_len(), 3);
    assert_eq!(logits.vocab_size(), VOCAB_SIZE);
    assert!(logits.row(1, 2).iter().all(|value| value.is_finite()));

    assert_eq!(stack.cache().len(), 3);

    Ok(())
}

#[test]
fn test_incremental_forward_matches_full_recompute() -> Result<()> {
    let checkpoint = create_checkpoint(ModelParams::new(32, 2, 4, 2));
    let tokens = [1, 7, 3, 9, 4];

    let mut full = build_stack(&checkpoint)?;
    let logits = full.forward(&tokens, 1, 0)?;
    let expected = (0..tokens.len()).map(|offset| logits.row(0, offset).to_vec()).collect::<Vec<_>>();

    let mut cached = build_stack(&checkpoint)?;
    let prefill = cached.forward(&tokens[..3], 1, 0)?;
    assert_eq!(prefill.last(0), expected[2].as_slice());

    for pos in 3..tokens.len() {
        let logits = cached.forward(&tokens[pos..pos + 1], 1, pos)?;
        assert_eq!(logits.last(0), expected[pos].as_slice(), "position {pos} differs");
    }

    Ok(())
}

#[test]
fn test_forward_overwrites_cache_after_reset() -> Result<()> {
    let mut stack = build_stack(&create_checkpoint(ModelParams::new(32, 1, 4, 4)))?;

    let first = stack.forward(&[2, 3, 4], 1, 0)?.last(0).to_vec();
    stack.forward(&[5, 6], 1, 3)?;

    stack.reset_cache();
    assert!(stack.cache().is_empty());

    let again = stack.forward(&[2, 3, 4], 1, 0)?.last(0).to_vec();
    assert_eq!(first, again);

    Ok(())
}

#[test]
fn test_forward_rejects_capacity_violations() -> Result<()> {
    let mut stack = build_stack(&create_checkpoint(ModelParams::new(32, 1, 4, 2)))?;

    assert_eq!(step_error(stack.forward(&[], 1, 0)), Some(EngineError::EmptyBatch));
    assert_eq!(step_error(stack.forward(&[1, 2, 3], 3, 0)), Some(EngineError::BatchTooLarge { batch: 3, max: 2 }));
    assert_eq!(
        step_error(stack.forward(&[1; MAX_SEQ_LEN + 1], 1, 0)),
        Some(EngineError::SequenceTooLong { requested: MAX_SEQ_LEN + 1, max: MAX_SEQ_LEN })
    );
    assert_eq!(
        step_error(stack.forward(&[1, VOCAB_SIZE], 1, 0)),
        Some(EngineError::TokenOutOfRange { token: VOCAB_SIZE, vocab_size: VOCAB_SIZE })
    );

    // A gap between the cache and the new positions is a caller error
    assert!(stack.forward(&[1], 1, 2).is_err());
    assert!(stack.forward(&[1, 2, 3], 2, 0).is_err());

    Ok(())
}

#[test]
fn test_missing_parameter_is_reported_by_name() {
    let mut checkpoint = create_checkpoint(ModelParams::new(32, 2, 4, 2));
    checkpoint.remove(&names::feed_forward(1, "w2"));

    assert_eq!(
        engine_error(build_stack(&checkpoint)),
        EngineError::MissingParameter { name: "layers.1.feed_forward.w2.weight".to_string() }
    );
}

#[test]
fn test_shape_mismatch_is_reported() {
    let mut checkpoint = create_checkpoint(ModelParams::new(32, 2, 4, 2));
    checkpoint.insert(names::attention(0, "wk"), Tensor::filled(vec![32, 32], 0.0));

    assert_eq!(
        engine_error(build_stack(&checkpoint)),
        EngineError::ShapeMismatch {
            name: "layers.0.attention.wk.weight".to_string(),
            expected: vec![16, 32],
            actual: vec![32, 32],
        }
    );
}

#[test]
fn test_untied_checkpoint_requires_output() {
    let mut checkpoint = create_checkpoint(ModelParams::new(32, 1, 4, 4));
    checkpoint.remove(names::OUTPUT);

    assert_eq!(
        engine_error(build_stack(&checkpoint)),
        EngineError::MissingParameter { name: names::OUTPUT.to_string() }
    );
}

#[test]
fn test_tied_embeddings_reuse_table() -> Result<()> {
    let params = ModelParams { tie_embeddings: true, ..ModelParams::new(32, 1, 4, 4) };
    let checkpoint = create_checkpoint(params);
    assert!(checkpoint.names().all(|name| name != names::OUTPUT));

    let stack = build_stack(&checkpoint)?;
    assert_eq!(stack.lm_head.weight, stack.token_embedding.embedding_table);

    Ok(())
}

#[test]
fn test_qwen3_stack_runs_with_wide_heads() -> Result<()> {
    let params = ModelParams {
        architecture: Architecture::Qwen3,
        head_dim: Some(16),
        rotary_layout: crate::configuration::RotaryLayout::HalfSplit,
        ..ModelParams::new(32, 2, 4, 2)
    };
    let checkpoint = create_checkpoint(params);
    assert!(checkpoint.names().any(|name| name == names::attention(1, "k_norm")));

    let mut stack = build_stack(&checkpoint)?;
    let full = stack.forward(&[3, 1, 4, 1], 1, 0)?.last(0).to_vec();

    stack.reset_cache();
    stack.forward(&[3, 1, 4], 1, 0)?;
    let incremental = stack.forward(&[1], 1, 3)?.last(0).to_vec();

    assert_eq!(full, incremental);

    Ok(())
}
