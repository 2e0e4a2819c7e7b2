//! The checkpoint contract: named weight tensors plus the hyper-parameters
//! they were trained with.

use crate::configuration::{ModelConfig, ModelParams};
use crate::tensor::Tensor;
use anyhow::Result;
use rand::SeedableRng;
use rand::distributions::{Distribution, Uniform};
use rand_chacha::ChaCha8Rng;
use std::collections::HashMap;

/// Source of model weights.
///
/// Names follow the canonical scheme in [`names`]; shapes are validated by
/// the engine against the [`ModelConfig`] it derives from [`Checkpoint::params`].
pub trait Checkpoint {
    fn params(&self) -> &ModelParams;

    /// Returns `None` when the checkpoint has no parameter with this name.
    fn tensor(&self, name: &str) -> Result<Option<Tensor>>;
}

/// Canonical parameter names.
pub mod names {
    pub const TOKEN_EMBEDDINGS: &str = "tok_embeddings.weight";
    pub const FINAL_NORM: &str = "norm.weight";
    pub const OUTPUT: &str = "output.weight";

    pub fn attention_norm(layer: usize) -> String {
        format!("layers.{layer}.attention_norm.weight")
    }

    pub fn ffn_norm(layer: usize) -> String {
        format!("layers.{layer}.ffn_norm.weight")
    }

    /// `component` is one of `wq`, `wk`, `wv`, `wo`, `q_norm`, `k_norm`.
    pub fn attention(layer: usize, component: &str) -> String {
        format!("layers.{layer}.attention.{component}.weight")
    }

    /// `component` is one of `w1` (gate), `w2` (down), `w3` (up).
    pub fn feed_forward(layer: usize, component: &str) -> String {
        format!("layers.{layer}.feed_forward.{component}.weight")
    }
}

/// Every parameter the engine reads for `config`, with its expected shape.
/// The output projection is listed even when embeddings are tied.
pub fn expected_shapes(config: &ModelConfig) -> Vec<(String, Vec<usize>)> {
    let ModelConfig { dim, hidden_dim, head_dim, vocab_size, n_layers, .. } = *config;
    let (q_dim, kv_dim) = (config.q_dim(), config.kv_dim());

    let mut shapes = vec![(names::TOKEN_EMBEDDINGS.to_string(), vec![vocab_size, dim])];

    for layer in 0..n_layers {
        shapes.push((names::attention_norm(layer), vec![dim]));
        shapes.push((names::attention(layer, "wq"), vec![q_dim, dim]));
        shapes.push((names::attention(layer, "wk"), vec![kv_dim, dim]));
        shapes.push((names::attention(layer, "wv"), vec![kv_dim, dim]));
        shapes.push((names::attention(layer, "wo"), vec![dim, q_dim]));
        if config.architecture.uses_qk_norm() {
            shapes.push((names::attention(layer, "q_norm"), vec![head_dim]));
            shapes.push((names::attention(layer, "k_norm"), vec![head_dim]));
        }
        shapes.push((names::ffn_norm(layer), vec![dim]));
        shapes.push((names::feed_forward(layer, "w1"), vec![hidden_dim, dim]));
        shapes.push((names::feed_forward(layer, "w2"), vec![dim, hidden_dim]));
        shapes.push((names::feed_forward(layer, "w3"), vec![hidden_dim, dim]));
    }

    shapes.push((names::FINAL_NORM.to_string(), vec![dim]));
    shapes.push((names::OUTPUT.to_string(), vec![vocab_size, dim]));
    shapes
}

/// Checkpoint held entirely in memory.
#[derive(Debug, Clone)]
pub struct InMemoryCheckpoint {
    params: ModelParams,
    tensors: HashMap<String, Tensor>,
}

impl InMemoryCheckpoint {
    pub fn new(params: ModelParams) -> Self {
        Self { params, tensors: HashMap::new() }
    }

    pub fn insert(&mut self, name: impl Into<String>, tensor: Tensor) -> Option<Tensor> {
        self.tensors.insert(name.into(), tensor)
    }

    pub fn remove(&mut self, name: &str) -> Option<Tensor> {
        self.tensors.remove(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tensors.keys().map(String::as_str)
    }

    /// A complete checkpoint with reproducible random weights.
    ///
    /// Projections are drawn uniformly from `±1/sqrt(fan_in)`, normalization
    /// gains are ones. Useful for tests and benchmarks that need a working
    /// model but not a trained one.
    pub fn random(params: ModelParams, vocab_size: usize, seed: u64) -> Result<Self> {
        // Shapes only depend on the architecture, so any valid limits do.
        let config = ModelConfig::new(&params, vocab_size, 1, 1)?;
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let mut checkpoint = Self::new(params);

        for (name, shape) in expected_shapes(&config) {
            if name == names::OUTPUT && config.tie_embeddings {
                continue;
            }

            let tensor = match shape.as_slice() {
                [_] => Tensor::filled(shape, 1.0),
                [rows, cols] => {
                    let bound = (*cols as f32).sqrt().recip();
                    let uniform = Uniform::new_inclusive(-bound, bound);
                    let data = (0..rows * cols).map(|_| uniform.sample(&mut rng)).collect();
                    Tensor::new(shape, data)?
                }
                _ => anyhow::bail!("Unexpected parameter rank for {name}"),
            };
            checkpoint.insert(name, tensor);
        }

        Ok(checkpoint)
    }
}

impl Checkpoint for InMemoryCheckpoint {
    fn params(&self) -> &ModelParams {
        &self.params
    }

    fn tensor(&self, name: &str) -> Result<Option<Tensor>> {
        Ok(self.tensors.get(name).cloned())
    }
}
