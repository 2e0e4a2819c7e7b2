use thiserror::Error;

/// Errors raised by the engine itself.
///
/// Every fallible function in this crate returns `anyhow::Result`; when the
/// failure belongs to the engine's own taxonomy the payload is an
/// `EngineError`, so callers can tell configuration problems from capacity
/// problems with `err.downcast_ref::<EngineError>()`.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    /// Model hyper-parameters are inconsistent. Raised at build time.
    #[error("invalid model configuration: {reason}")]
    InvalidConfig { reason: String },

    /// A required parameter is absent from the checkpoint.
    #[error("checkpoint is missing parameter '{name}'")]
    MissingParameter { name: String },

    /// A checkpoint tensor does not have the shape implied by the config.
    #[error("parameter '{name}' has shape {actual:?}, expected {expected:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("batch of {batch} sequences exceeds the maximum batch size {max}")]
    BatchTooLarge { batch: usize, max: usize },

    /// `start_pos + seq_len` (or prompt plus new tokens) does not fit the cache.
    #[error("sequence of {requested} positions exceeds the maximum sequence length {max}")]
    SequenceTooLong { requested: usize, max: usize },

    #[error("prompt {index} is empty")]
    EmptyPrompt { index: usize },

    #[error("no prompts were given")]
    EmptyBatch,

    #[error("token id {token} is outside the vocabulary of {vocab_size} tokens")]
    TokenOutOfRange { token: usize, vocab_size: usize },

    #[error("sampling context has {streams} random streams for a batch of {batch}")]
    SamplingContextTooSmall { batch: usize, streams: usize },

    #[error("invalid sampling parameters: {reason}")]
    InvalidSampling { reason: String },
}

impl EngineError {
    pub(crate) fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig { reason: reason.into() }
    }

    /// Returns true for errors that are raised while building an engine.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::InvalidConfig { .. } | Self::MissingParameter { .. } | Self::ShapeMismatch { .. }
        )
    }

    /// Returns true for errors that reject a single request.
    pub fn is_capacity(&self) -> bool {
        matches!(
            self,
            Self::BatchTooLarge { .. }
                | Self::SequenceTooLong { .. }
                | Self::EmptyPrompt { .. }
                | Self::EmptyBatch
                | Self::TokenOutOfRange { .. }
                | Self::SamplingContextTooSmall { .. }
        )
    }
}
