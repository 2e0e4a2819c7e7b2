use crate::checkpoint::Checkpoint;
use crate::configuration::ModelConfig;
use crate::generation::{Generation, GenerationRequest, GenerationResult};
use crate::sampler::SamplingContext;
use crate::tokenizer::{Tokenizer, Vocabulary};
use crate::transformer::{Logits, TransformerStack};
use anyhow::{Context, Result};
use log::{debug, info};

/// A built model ready to serve generation requests.
///
/// Requests take `&mut self`, so at most one is in flight per engine. Each
/// request starts from an empty cache.
#[derive(Debug)]
pub struct Engine {
    stack: TransformerStack,
    vocabulary: Vocabulary,
}

impl Engine {
    pub fn builder(checkpoint: &dyn Checkpoint) -> EngineBuilder<'_> {
        EngineBuilder::new(checkpoint)
    }

    /// Validates the checkpoint parameters against the runtime limits and loads every weight.
    pub fn build(
        checkpoint: &dyn Checkpoint,
        vocabulary: Vocabulary,
        max_seq_len: usize,
        max_batch_size: usize,
    ) -> Result<Self> {
        let config = ModelConfig::new(checkpoint.params(), vocabulary.size, max_seq_len, max_batch_size)
            .context("Failed to derive model configuration")?;

        info!(
            "Model: {:?}, {} layers, dim {}, {} heads ({} kv, head dim {}), ffn {}, vocab {}",
            config.architecture,
            config.n_layers,
            config.dim,
            config.n_heads,
            config.n_kv_heads,
            config.head_dim,
            config.hidden_dim,
            config.vocab_size
        );
        info!(
            "Limits: max sequence length {}, max batch size {}, attention {:?}",
            config.max_seq_len,
            config.max_batch_size,
            config.attention_kind()
        );

        let stack = TransformerStack::from_checkpoint(checkpoint, config)?;
        debug!("{stack:#?}");
        info!("KV cache: {:.2} MiB", stack.cache().size_in_bytes() as f64 / (1024.0 * 1024.0));

        Ok(Self { stack, vocabulary })
    }

    pub fn config(&self) -> &ModelConfig {
        self.stack.config()
    }

    pub fn vocabulary(&self) -> Vocabulary {
        self.vocabulary
    }

    /// Validates `request`, resets the cache and returns the generation in
    /// [`Phase::Prefill`](crate::Phase::Prefill) (or already done when no new
    /// tokens are requested).
    pub fn start<'a>(
        &'a mut self,
        request: &GenerationRequest,
        sampling: &'a mut SamplingContext,
    ) -> Result<Generation<'a>> {
        Generation::new(&mut self.stack, sampling, self.vocabulary, request)
    }

    /// Runs `request` to completion.
    pub fn generate(&mut self, request: &GenerationRequest, sampling: &mut SamplingContext) -> Result<GenerationResult> {
        self.start(request, sampling)?.run()
    }

    /// Encodes every prompt with the begin token, generates with the
    /// parameters of `template` and decodes the completions.
    pub fn generate_text(
        &mut self,
        tokenizer: &dyn Tokenizer,
        prompts: &[&str],
        template: &GenerationRequest,
        sampling: &mut SamplingContext,
    ) -> Result<Vec<String>> {
        let request = GenerationRequest {
            prompts: prompts.iter().map(|prompt| tokenizer.encode(prompt, true, false)).collect(),
            ..template.clone()
        };

        let result = self.generate(&request, sampling)?;

        Ok(result.completions.iter().map(|completion| tokenizer.decode(&completion.tokens)).collect())
    }

    /// Single forward step on the underlying stack, continuing from the cache.
    pub fn forward(&mut self, tokens: &[usize], batch_size: usize, start_pos: usize) -> Result<Logits<'_>> {
        self.stack.forward(tokens, batch_size, start_pos)
    }

    pub fn reset_cache(&mut self) {
        self.stack.reset_cache();
    }
}

/// Builder for [`Engine`] with default runtime limits.
pub struct EngineBuilder<'a> {
    checkpoint: &'a dyn Checkpoint,
    vocabulary: Option<Vocabulary>,
    max_seq_len: Option<usize>,
    max_batch_size: usize,
}

impl<'a> EngineBuilder<'a> {
    pub fn new(checkpoint: &'a dyn Checkpoint) -> Self {
        Self { checkpoint, vocabulary: None, max_seq_len: None, max_batch_size: 1 }
    }

    pub fn with_vocabulary(mut self, vocabulary: Vocabulary) -> Self {
        self.vocabulary = Some(vocabulary);
        self
    }

    pub fn with_max_seq_len(mut self, max_seq_len: usize) -> Self {
        self.max_seq_len = Some(max_seq_len);
        self
    }

    pub fn with_max_batch_size(mut self, max_batch_size: usize) -> Self {
        self.max_batch_size = max_batch_size;
        self
    }

    pub fn build(self) -> Result<Engine> {
        let vocabulary = self.vocabulary.context("Vocabulary is required to build an engine")?;
        let max_seq_len = self.max_seq_len.context("Maximum sequence length is required to build an engine")?;

        Engine::build(self.checkpoint, vocabulary, max_seq_len, self.max_batch_size)
    }
}
