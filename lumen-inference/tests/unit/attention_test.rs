use super::*;
use crate::configuration::ModelParams;
use crate::kv_cache::KVCache;
use crate::rope::RotaryTable;

/// Deterministic weights in `[-0.5, 0.5)`.
fn pattern(len: usize, seed: usize) -> Vec<f32> {
    (0..len).map(|i| ((i * 31 + seed * 17) % 23) as f32 / 23.0 - 0.5).collect()
}

fn create_config(n_heads: usize, n_kv_heads: usize) -> ModelConfig {
    ModelConfig::new(&ModelParams::new(32, 1, n_heads, n_kv_heads), 16, 8, 2).unwrap()
}

fn create_attention(config: &ModelConfig, wk: Vec<f32>, wv: Vec<f32>) -> Attention {
    let (dim, q_dim, kv_dim) = (config.dim, config.q_dim(), config.kv_dim());
    Attention::new(
        Linear::new(pattern(q_dim * dim, 1), dim, q_dim),
        Linear::new(wk, dim, kv_dim),
        Linear::new(wv, dim, kv_dim),
        Linear::new(pattern(dim * q_dim, 4), q_dim, dim),
        None,
        config,
    )
}

/// Runs one attention step over `inputs` (normalized rows) and returns the block output.
fn run_step(
    attention: &Attention,
    config: &ModelConfig,
    cache: &mut LayerCache,
    state: &mut RunState,
    inputs: &[f32],
    batch_size: usize,
    start_pos: usize,
) -> Vec<f32> {
    let rope = RotaryTable::new(config);
    let seq_len = inputs.len() / config.dim / batch_size;
    state.prepare(config, batch_size * seq_len, start_pos + seq_len);
    state.xb.copy_from_slice(inputs);

    let mask = (seq_len > 1).then(|| CausalMask::new(start_pos, seq_len));
    let step = StepContext { batch_size, seq_len, start_pos, freqs: rope.slice(start_pos, seq_len), mask: mask.as_ref() };
    attention.forward(&step, cache, state);

    state.xb2.clone()
}

#[test]
fn test_causal_mask_layout() {
    let mask = CausalMask::new(2, 3);
    assert_eq!(mask.seq_len(), 3);
    assert_eq!(mask.total_len(), 5);

    let inf = f32::NEG_INFINITY;
    assert_eq!(mask.row(0), &[0.0, 0.0, 0.0, inf, inf]);
    assert_eq!(mask.row(1), &[0.0, 0.0, 0.0, 0.0, inf]);
    assert_eq!(mask.row(2), &[0.0, 0.0, 0.0, 0.0, 0.0]);
}

#[test]
fn test_future_positions_get_zero_weight() {
    let config = create_config(4, 2);
    let attention = create_attention(&config, pattern(config.kv_dim() * config.dim, 2), pattern(config.kv_dim() * config.dim, 3));
    let mut kv_cache = KVCache::new(&config);
    let cache = kv_cache.layers_mut().next().unwrap();
    let mut state = RunState::default();

    let (batch_size, seq_len) = (2, 4);
    let inputs = pattern(batch_size * seq_len * config.dim, 9);
    run_step(&attention, &config, cache, &mut state, &inputs, batch_size, 0);

    for (idx, weights) in state.att.chunks(seq_len).enumerate() {
        let offset = (idx / config.n_heads) % seq_len;
        for (time_step, &weight) in weights.iter().enumerate() {
            if time_step > offset {
                assert_eq!(weight, 0.0, "row {idx} attends to future position {time_step}");
            }
        }
        let sum = weights.iter().sum::<f32>();
        assert!((sum - 1.0).abs() < 1e-5, "weights of row {idx} sum to {sum}");
    }
}

#[test]
fn test_single_steps_match_one_prefill_step() {
    let config = create_config(4, 2);
    let attention = create_attention(&config, pattern(config.kv_dim() * config.dim, 2), pattern(config.kv_dim() * config.dim, 3));
    let seq_len = 5;
    let inputs = pattern(seq_len * config.dim, 11);

    let mut kv_cache = KVCache::new(&config);
    let mut state = RunState::default();
    let prefill = run_step(&attention, &config, kv_cache.layers_mut().next().unwrap(), &mut state, &inputs, 1, 0);

    let mut kv_cache = KVCache::new(&config);
    for (pos, row) in inputs.chunks(config.dim).enumerate() {
        let output = run_step(&attention, &config, kv_cache.layers_mut().next().unwrap(), &mut state, row, 1, pos);
        assert_eq!(output, prefill[pos * config.dim..(pos + 1) * config.dim], "position {pos} differs");
    }
}

#[test]
fn test_grouped_query_matches_repeated_kv_heads() {
    let gqa_config = create_config(4, 2);
    let mha_config = create_config(4, 4);
    let dim = gqa_config.dim;
    let head_block = gqa_config.head_dim * dim;

    let wk = pattern(gqa_config.kv_dim() * dim, 2);
    let wv = pattern(gqa_config.kv_dim() * dim, 3);

    // Query head h reads key/value head h / 2, so repeat every kv head twice
    let repeat = |weights: &[f32]| {
        (0..mha_config.n_heads)
            .flat_map(|head| {
                let kv_head = head / gqa_config.kv_group();
                weights[kv_head * head_block..(kv_head + 1) * head_block].to_vec()
            })
            .collect::<Vec<_>>()
    };

    let gqa = create_attention(&gqa_config, wk.clone(), wv.clone());
    let mha = create_attention(&mha_config, repeat(&wk), repeat(&wv));

    let inputs = pattern(3 * dim, 5);
    let mut gqa_cache = KVCache::new(&gqa_config);
    let mut mha_cache = KVCache::new(&mha_config);
    let mut state = RunState::default();

    let expected = run_step(&mha, &mha_config, mha_cache.layers_mut().next().unwrap(), &mut state, &inputs, 1, 0);
    let actual = run_step(&gqa, &gqa_config, gqa_cache.layers_mut().next().unwrap(), &mut state, &inputs, 1, 0);

    for (a, e) in actual.iter().zip(&expected) {
        assert!((a - e).abs() < 1e-5, "{a} != {e}");
    }
}

#[test]
fn test_batch_rows_do_not_interact() {
    let config = create_config(4, 2);
    let attention = create_attention(&config, pattern(config.kv_dim() * config.dim, 2), pattern(config.kv_dim() * config.dim, 3));
    let seq_len = 3;
    let first = pattern(seq_len * config.dim, 7);
    let second = pattern(seq_len * config.dim, 8);

    let mut state = RunState::default();
    let mut kv_cache = KVCache::new(&config);
    let alone = run_step(&attention, &config, kv_cache.layers_mut().next().unwrap(), &mut state, &first, 1, 0);

    let batched_inputs = [first, second].concat();
    let mut kv_cache = KVCache::new(&config);
    let batched = run_step(&attention, &config, kv_cache.layers_mut().next().unwrap(), &mut state, &batched_inputs, 2, 0);

    assert_eq!(alone, batched[..seq_len * config.dim]);
}
