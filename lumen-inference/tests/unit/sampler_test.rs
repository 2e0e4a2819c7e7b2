use super::*;

fn candidates(sampler: &Sampler, probs: &[f32]) -> Vec<usize> {
    sampler.nucleus(probs).iter().map(|candidate| candidate.index).collect()
}

#[test]
fn test_greedy_picks_lowest_index_of_maximum() {
    let mut rng = ChaCha8Rng::seed_from_u64(0);
    let sampler = Sampler::greedy();

    assert!(sampler.is_greedy());
    assert_eq!(sampler.sample(&[1.0, 3.0, 3.0, 2.0], &mut rng), 1);
    assert_eq!(sampler.sample(&[-5.0, -1.0, -3.0], &mut rng), 1);
}

#[test]
fn test_non_positive_temperature_is_greedy() -> Result<()> {
    let mut rng = ChaCha8Rng::seed_from_u64(0);
    let logits = [0.5, 0.1, 2.0, 1.9];

    for temperature in [0.0, -1.0] {
        let sampler = Sampler::new(temperature, 0.5)?;
        assert!(sampler.is_greedy());
        assert_eq!(sampler.sample(&logits, &mut rng), 2);
    }

    Ok(())
}

#[test]
fn test_invalid_sampling_parameters() {
    for (temperature, top_p) in [(f32::NAN, 0.9), (f32::INFINITY, 0.9), (1.0, 1.5), (1.0, -0.1), (1.0, f32::NAN)] {
        let error = Sampler::new(temperature, top_p).unwrap_err();
        assert!(
            matches!(error.downcast_ref::<EngineError>(), Some(EngineError::InvalidSampling { .. })),
            "({temperature}, {top_p}) should be rejected"
        );
    }
}

#[test]
fn test_probabilities_apply_temperature() -> Result<()> {
    let logits = [1.0, 2.0];

    let sharp = Sampler::new(0.5, 1.0)?.probabilities(&logits);
    let flat = Sampler::new(2.0, 1.0)?.probabilities(&logits);

    assert!(sharp[1] > flat[1]);
    assert!((sharp.iter().sum::<f32>() - 1.0).abs() < 1e-6);
    // softmax([2, 4])[1] = 1 / (1 + e^-2)
    assert!((sharp[1] - 1.0 / (1.0 + (-2.0f32).exp())).abs() < 1e-6);

    Ok(())
}

#[test]
fn test_nucleus_keeps_token_that_crosses_threshold() -> Result<()> {
    let probs = [0.15, 0.5, 0.05, 0.3];

    // 0.5 alone is below 0.7, the 0.3 that crosses it is kept, 0.15 is not
    let nucleus = Sampler::new(1.0, 0.7)?.nucleus(&probs);
    assert_eq!(nucleus.iter().map(|candidate| candidate.index).collect::<Vec<_>>(), vec![1, 3]);
    assert!((nucleus[0].prob - 0.625).abs() < 1e-6);
    assert!((nucleus[1].prob - 0.375).abs() < 1e-6);

    // Mass before the second token equals top-p exactly, so it survives
    assert_eq!(candidates(&Sampler::new(1.0, 0.5)?, &probs), vec![1, 3]);

    // Below the top probability only the top token is left
    assert_eq!(candidates(&Sampler::new(1.0, 0.3)?, &probs), vec![1]);

    Ok(())
}

#[test]
fn test_nucleus_full_and_empty_mass() -> Result<()> {
    let probs = [0.1, 0.2, 0.3, 0.4];

    assert_eq!(candidates(&Sampler::new(1.0, 1.0)?, &probs), vec![3, 2, 1, 0]);
    assert_eq!(candidates(&Sampler::new(1.0, 0.0)?, &probs), vec![3]);

    Ok(())
}

#[test]
fn test_nucleus_shrinks_as_top_p_decreases() -> Result<()> {
    let logits = [0.3, -1.2, 2.5, 0.9, 1.7, -0.4, 0.0, 1.1];
    let probs = Sampler::new(0.8, 1.0)?.probabilities(&logits);

    let mut previous = usize::MAX;
    for step in (0..=20).rev() {
        let top_p = step as f32 / 20.0;
        let count = Sampler::new(0.8, top_p)?.nucleus(&probs).len();
        assert!(count <= previous, "top-p {top_p} kept {count} > {previous} candidates");
        assert!(count >= 1);
        previous = count;
    }

    Ok(())
}

#[test]
fn test_nucleus_guards_against_underflow() -> Result<()> {
    let nucleus = Sampler::new(1.0, 0.5)?.nucleus(&[0.0, 0.0, 0.0]);

    assert_eq!(nucleus, vec![ProbIndex { prob: 1.0, index: 0 }]);

    Ok(())
}

#[test]
fn test_single_candidate_draws_no_randomness() -> Result<()> {
    let sampler = Sampler::new(1.0, 0.1)?;
    let logits = [0.0, 8.0, 1.0];

    let mut rng = ChaCha8Rng::seed_from_u64(11);
    let mut untouched = rng.clone();
    assert_eq!(sampler.sample(&logits, &mut rng), 1);
    assert_eq!(rng.r#gen::<u64>(), untouched.r#gen::<u64>());

    Ok(())
}

#[test]
fn test_sampling_only_returns_nucleus_tokens() -> Result<()> {
    let sampler = Sampler::new(1.0, 0.8)?;
    // softmax puts roughly 0.72 on token 2 and 0.27 on token 0
    let logits = [1.0, -3.0, 2.0, -3.0];
    let allowed = candidates(&sampler, &sampler.probabilities(&logits));

    assert_eq!(allowed, vec![2, 0]);

    let mut rng = ChaCha8Rng::seed_from_u64(5);
    for _ in 0..200 {
        assert!(allowed.contains(&sampler.sample(&logits, &mut rng)));
    }

    Ok(())
}

#[test]
fn test_seeded_sampling_is_reproducible() -> Result<()> {
    let sampler = Sampler::new(1.2, 0.95)?;
    let logits = [0.1, 0.4, 0.3, 0.2, 0.5, 0.0];

    let draw = |seed: u64| {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        (0..32).map(|_| sampler.sample(&logits, &mut rng)).collect::<Vec<_>>()
    };

    assert_eq!(draw(42), draw(42));
    assert_ne!(draw(42), draw(43));

    Ok(())
}

#[test]
fn test_sampling_context_streams() {
    let mut context = SamplingContext::new(9, 3);
    assert_eq!(context.len(), 3);
    assert!(!context.is_empty());
    assert!(context.get_mut(3).is_none());

    let first = context.rng(0).r#gen::<u64>();
    let second = context.rng(1).r#gen::<u64>();
    assert_ne!(first, second);

    // Slot streams do not depend on the batch size
    let mut single = SamplingContext::new(9, 1);
    assert_eq!(single.rng(0).r#gen::<u64>(), first);

    let mut explicit = SamplingContext::from_seeds(&[9, 9]);
    let (a, b) = (explicit.rng(0).r#gen::<u64>(), explicit.rng(1).r#gen::<u64>());
    assert_eq!(a, b);
}

#[test]
fn test_tiny_temperature_approaches_argmax() -> Result<()> {
    let mut rng = ChaCha8Rng::seed_from_u64(0);
    let sampler = Sampler::new(1e-40, 0.9)?;
    let logits = [1.0, 5.0, 2.0];

    let probs = sampler.probabilities(&logits);
    assert!(probs.iter().all(|prob| prob.is_finite()));
    assert_eq!(probs, vec![0.0, 1.0, 0.0]);
    assert_eq!(sampler.sample(&logits, &mut rng), 1);

    Ok(())
}
