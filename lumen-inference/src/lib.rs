//! Decoder-only transformer inference on the CPU.
//!
//! The engine is built from a [`Checkpoint`] and runs batched, cached
//! autoregressive generation: one prefill pass over the shared prompt prefix,
//! then one position per step until every sequence has produced the end
//! token or the length budget is spent.
//!
//! ```no_run
//! use lumen_inference::{ByteTokenizer, Engine, GenerationRequest, InMemoryCheckpoint, ModelParams};
//! use lumen_inference::{SamplingContext, Tokenizer};
//!
//! # fn main() -> anyhow::Result<()> {
//! let checkpoint = InMemoryCheckpoint::random(ModelParams::new(32, 2, 4, 2), ByteTokenizer::VOCAB_SIZE, 7)?;
//! let mut engine = Engine::builder(&checkpoint)
//!     .with_vocabulary(ByteTokenizer.vocabulary())
//!     .with_max_seq_len(64)
//!     .build()?;
//!
//! let request = GenerationRequest::new(vec![vec![ByteTokenizer::BEGIN_ID, 104, 105]]).with_max_new_tokens(8);
//! let result = engine.generate(&request, &mut SamplingContext::new(42, 1))?;
//! println!("{:?}", result.tokens());
//! # Ok(())
//! # }
//! ```

mod attention;
mod checkpoint;
mod configuration;
mod engine;
mod error;
mod generation;
mod kv_cache;
mod layers;
mod rope;
mod sampler;
mod tensor;
mod tokenizer;
mod transformer;

pub use crate::attention::CausalMask;
pub use crate::checkpoint::{Checkpoint, InMemoryCheckpoint, expected_shapes, names};
pub use crate::configuration::{
    Architecture, AttentionKind, DEFAULT_MULTIPLE_OF, DEFAULT_NORM_EPS, DEFAULT_ROPE_BASE, ModelConfig, ModelParams,
    RotaryCoverage, RotaryLayout, feed_forward_hidden_dim,
};
pub use crate::engine::{Engine, EngineBuilder};
pub use crate::error::EngineError;
pub use crate::generation::{Completion, Generation, GenerationRequest, GenerationResult, Phase, StopReason};
pub use crate::kv_cache::KVCache;
pub use crate::layers::RMSNorm;
pub use crate::rope::RotaryTable;
pub use crate::sampler::{ProbIndex, Sampler, SamplingContext};
pub use crate::tensor::Tensor;
pub use crate::tokenizer::{ByteTokenizer, Tokenizer, Vocabulary};
pub use crate::transformer::{Logits, TransformerStack};
