#[cfg(test)]
#[path = "../tests/unit/sampler_test.rs"]
mod sampler_test;

use crate::error::EngineError;
use crate::tensor::softmax;
use anyhow::Result;
use rand::distributions::{Distribution, WeightedIndex};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Stores a probability and its associated index (token id).
#[derive(Clone, Debug, PartialEq)]
pub struct ProbIndex {
    pub prob: f32,
    pub index: usize,
}

/// Temperature and top-p (nucleus) sampler.
///
/// - `temperature <= 0`: greedy arg-max, no randomness.
/// - otherwise: softmax of `logits / temperature`, keep the most probable
///   tokens while the probability mass before them is at most `top_p`
///   (so the token that crosses `top_p` is kept), renormalize and draw one.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sampler {
    pub temperature: f32,
    pub top_p: f32,
}

impl Sampler {
    pub fn new(temperature: f32, top_p: f32) -> Result<Self> {
        if temperature.is_nan() || temperature.is_infinite() {
            return Err(EngineError::InvalidSampling { reason: format!("temperature {temperature} is not finite") }.into());
        }
        if !(0.0..=1.0).contains(&top_p) {
            return Err(EngineError::InvalidSampling { reason: format!("top-p {top_p} is outside [0, 1]") }.into());
        }

        Ok(Self { temperature, top_p })
    }

    pub fn greedy() -> Self {
        Self { temperature: 0.0, top_p: 1.0 }
    }

    pub fn is_greedy(&self) -> bool {
        self.temperature <= 0.0
    }

    /// Picks the next token id from one row of logits.
    pub fn sample<R: Rng + ?Sized>(&self, logits: &[f32], rng: &mut R) -> usize {
        if self.is_greedy() {
            return Self::argmax(logits);
        }

        let candidates = self.nucleus(&self.probabilities(logits));
        match candidates.as_slice() {
            [] => Self::argmax(logits),
            [only] => only.index,
            _ => Self::sample_weighted(&candidates, rng),
        }
    }

    /// Temperature-scaled softmax of `logits`.
    pub fn probabilities(&self, logits: &[f32]) -> Vec<f32> {
        let temperature = if self.is_greedy() { 1.0 } else { self.temperature };
        // Shift before scaling so a tiny temperature cannot overflow to +inf.
        let max_logit = logits.iter().fold(f32::NEG_INFINITY, |acc, &logit| acc.max(logit));
        let shift = if max_logit.is_finite() { max_logit } else { 0.0 };
        let mut probs = logits.iter().map(|&logit| (logit - shift) / temperature).collect::<Vec<_>>();
        softmax(&mut probs);
        probs
    }

    /// Candidates that survive top-p truncation, most probable first, with
    /// their probabilities renormalized to sum to one.
    pub fn nucleus(&self, probs: &[f32]) -> Vec<ProbIndex> {
        let mut sorted = probs.iter().enumerate().map(|(index, &prob)| ProbIndex { prob, index }).collect::<Vec<_>>();
        sorted.sort_by(|a, b| b.prob.total_cmp(&a.prob).then(a.index.cmp(&b.index)));

        if self.top_p < 1.0 {
            // Keep an entry while the mass before it is still within top-p.
            let mut cumulative_prob = 0.0f32;
            let keep = sorted
                .iter()
                .take_while(|candidate| {
                    let within = cumulative_prob <= self.top_p;
                    cumulative_prob += candidate.prob;
                    within
                })
                .count();
            sorted.truncate(keep.max(1));
        }

        let mass = sorted.iter().map(|candidate| candidate.prob).sum::<f32>();
        if mass.is_finite() && mass > 0.0 {
            let inv_mass = mass.recip();
            sorted.iter_mut().for_each(|candidate| candidate.prob *= inv_mass);
        } else {
            // Underflow: fall back to the single most likely token.
            sorted.truncate(1);
            if let Some(first) = sorted.first_mut() {
                first.prob = 1.0;
            }
        }

        sorted
    }

    /// Returns the index of the maximum logit, the lowest index on ties.
    pub fn argmax(logits: &[f32]) -> usize {
        logits
            .iter()
            .enumerate()
            .fold(None, |best: Option<(usize, f32)>, (i, &logit)| match best {
                Some((_, best_logit)) if best_logit >= logit => best,
                _ => Some((i, logit)),
            })
            .map(|(i, _)| i)
            .unwrap_or_default()
    }

    fn sample_weighted<R: Rng + ?Sized>(candidates: &[ProbIndex], rng: &mut R) -> usize {
        match WeightedIndex::new(candidates.iter().map(|candidate| candidate.prob)) {
            Ok(distribution) => candidates[distribution.sample(rng)].index,
            Err(_) => candidates[0].index,
        }
    }
}

/// Random state for sampling: one seeded generator per batch slot.
///
/// Each sequence draws only from its own generator, and only for positions
/// after its prompt, so its tokens do not depend on the rest of the batch.
#[derive(Debug, Clone)]
pub struct SamplingContext {
    rngs: Vec<ChaCha8Rng>,
}

impl SamplingContext {
    /// `batch_size` independent streams derived from one seed; slot `k` uses stream `k`.
    pub fn new(seed: u64, batch_size: usize) -> Self {
        let rngs = (0..batch_size)
            .map(|slot| {
                let mut rng = ChaCha8Rng::seed_from_u64(seed);
                rng.set_stream(slot as u64);
                rng
            })
            .collect();

        Self { rngs }
    }

    /// One generator per sequence, seeded explicitly.
    pub fn from_seeds(seeds: &[u64]) -> Self {
        Self { rngs: seeds.iter().map(|&seed| ChaCha8Rng::seed_from_u64(seed)).collect() }
    }

    pub fn len(&self) -> usize {
        self.rngs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rngs.is_empty()
    }

    pub fn rng(&mut self, slot: usize) -> &mut ChaCha8Rng {
        &mut self.rngs[slot]
    }

    pub fn get_mut(&mut self, slot: usize) -> Option<&mut ChaCha8Rng> {
        self.rngs.get_mut(slot)
    }
}
