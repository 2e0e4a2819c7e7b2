//! # lumen-loader
//!
//! Serves HuggingFace model directories (`config.json` plus `*.safetensors`)
//! to the lumen inference engine under canonical parameter names.
//!
//! ```rust,no_run
//! use lumen_loader::SafeTensorsCheckpoint;
//!
//! # fn main() -> anyhow::Result<()> {
//! let checkpoint = SafeTensorsCheckpoint::open("path/to/huggingface/model")?;
//! let mut engine = checkpoint.build_engine(Some(512), 4)?;
//! # Ok(())
//! # }
//! ```

pub mod config_loader;
pub mod models;
mod tensor_reader;

pub use config_loader::{ModelInfo, load_hf_config, load_model_info};
pub use models::ArchitectureId;

use anyhow::Result;
use log::{debug, warn};
use lumen_inference::{Checkpoint, Engine, ModelParams, Tensor};
use std::path::Path;

use crate::models::{Architecture, create_architecture};
use crate::tensor_reader::TensorReader;

/// A model directory opened as an engine [`Checkpoint`].
pub struct SafeTensorsCheckpoint {
    info: ModelInfo,
    architecture: Box<dyn Architecture>,
    reader: TensorReader,
}

impl SafeTensorsCheckpoint {
    pub fn open(model_dir: impl AsRef<Path>) -> Result<Self> {
        let model_dir = model_dir.as_ref();
        if !model_dir.exists() {
            anyhow::bail!("Model directory does not exist: {}", model_dir.display());
        }

        let info = load_model_info(model_dir)?;
        let architecture = create_architecture(info.architecture);
        let reader = TensorReader::new(model_dir)?;

        Ok(Self { info, architecture, reader })
    }

    pub fn info(&self) -> &ModelInfo {
        &self.info
    }

    /// Names of all tensors stored in the directory.
    pub fn stored_names(&self) -> impl Iterator<Item = &str> {
        self.reader.tensor_names()
    }

    /// Builds an engine with the model's own vocabulary.
    ///
    /// `ctx_length` limits the cache; it defaults to (and is capped at) the
    /// model's `max_position_embeddings`.
    pub fn build_engine(&self, ctx_length: Option<usize>, max_batch_size: usize) -> Result<Engine> {
        let max_positions = self.info.max_position_embeddings;
        let max_seq_len = match ctx_length {
            Some(ctx_length) if ctx_length > max_positions => {
                warn!("Context length {ctx_length} exceeds the model maximum {max_positions}, using {max_positions}");
                max_positions
            }
            Some(ctx_length) => ctx_length,
            None => max_positions,
        };

        Engine::build(self, self.info.vocabulary, max_seq_len, max_batch_size)
    }
}

impl Checkpoint for SafeTensorsCheckpoint {
    fn params(&self) -> &ModelParams {
        &self.info.params
    }

    fn tensor(&self, name: &str) -> Result<Option<Tensor>> {
        let Some(stored_name) = self.architecture.tensor_name(name) else {
            return Ok(None);
        };

        if !self.reader.contains(&stored_name) {
            debug!("{name} ({stored_name}) is not stored in the checkpoint");
            return Ok(None);
        }

        self.reader.load_tensor(&stored_name)
    }
}

impl std::fmt::Debug for SafeTensorsCheckpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SafeTensorsCheckpoint")
            .field("info", &self.info)
            .field("architecture", &self.architecture.id())
            .finish()
    }
}
