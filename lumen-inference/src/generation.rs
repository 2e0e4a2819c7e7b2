use crate::error::EngineError;
use crate::sampler::{Sampler, SamplingContext};
use crate::tensor::log_softmax_at;
use crate::tokenizer::Vocabulary;
use crate::transformer::TransformerStack;
use anyhow::Result;
use log::{debug, info};
use std::time::Instant;

/// A batch of prompts and the parameters to complete them with.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub prompts: Vec<Vec<usize>>,
    pub max_new_tokens: usize,
    pub temperature: f32,
    pub top_p: f32,
    /// Return the prompt in front of the generated tokens.
    pub echo: bool,
    /// Return the log-probability of every returned token.
    pub logprobs: bool,
}

impl GenerationRequest {
    pub fn new(prompts: Vec<Vec<usize>>) -> Self {
        Self { prompts, max_new_tokens: 64, temperature: 0.6, top_p: 0.9, echo: false, logprobs: false }
    }

    pub fn with_max_new_tokens(mut self, max_new_tokens: usize) -> Self {
        self.max_new_tokens = max_new_tokens;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_top_p(mut self, top_p: f32) -> Self {
        self.top_p = top_p;
        self
    }

    pub fn with_echo(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }

    pub fn with_logprobs(mut self, logprobs: bool) -> Self {
        self.logprobs = logprobs;
        self
    }
}

/// Why a sequence stopped growing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    EndOfSequence,
    Length,
}

/// Output for one prompt.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    /// Generated ids (prompt first when echoed), cut before the first end id.
    pub tokens: Vec<usize>,
    /// One entry per token when requested.
    pub logprobs: Option<Vec<f32>>,
    pub stop: StopReason,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationResult {
    pub completions: Vec<Completion>,
}

impl GenerationResult {
    /// Token ids of every completion.
    pub fn tokens(&self) -> Vec<Vec<usize>> {
        self.completions.iter().map(|completion| completion.tokens.clone()).collect()
    }
}

/// State of a [`Generation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Next step runs the shared prompt prefix through the model in one pass.
    Prefill,
    /// Next step adds exactly one position per sequence.
    Decode,
    Done,
}

/// Step-wise generation over a batch of prompts.
///
/// All sequences advance one position per step in lock-step. Until a
/// sequence's own prompt is exhausted its known prompt token is used in place
/// of a sampled one. Generation ends when every sequence has produced the end
/// id past its prompt or the length budget is spent.
///
/// Dropping a `Generation` before [`Phase::Done`] abandons the request; the
/// next request resets the cache.
pub struct Generation<'a> {
    stack: &'a mut TransformerStack,
    sampling: &'a mut SamplingContext,
    sampler: Sampler,
    vocabulary: Vocabulary,
    /// Every sequence prompt-first, right-padded to `total_len` with the pad id.
    tokens: Vec<Vec<usize>>,
    prompt_lens: Vec<usize>,
    logprobs: Option<Vec<Vec<f32>>>,
    reached_end: Vec<bool>,
    max_new_tokens: usize,
    echo: bool,
    prev_pos: usize,
    cur_pos: usize,
    total_len: usize,
    phase: Phase,
    metrics: TokenMetrics,
}

impl<'a> Generation<'a> {
    pub(crate) fn new(
        stack: &'a mut TransformerStack,
        sampling: &'a mut SamplingContext,
        vocabulary: Vocabulary,
        request: &GenerationRequest,
    ) -> Result<Self> {
        let config = stack.config();
        let batch_size = request.prompts.len();
        let sampler = Sampler::new(request.temperature, request.top_p)?;

        if batch_size == 0 {
            return Err(EngineError::EmptyBatch.into());
        }
        if batch_size > config.max_batch_size {
            return Err(EngineError::BatchTooLarge { batch: batch_size, max: config.max_batch_size }.into());
        }
        if let Some(index) = request.prompts.iter().position(Vec::is_empty) {
            return Err(EngineError::EmptyPrompt { index }.into());
        }
        if let Some(&token) = request.prompts.iter().flatten().find(|&&token| token >= config.vocab_size) {
            return Err(EngineError::TokenOutOfRange { token, vocab_size: config.vocab_size }.into());
        }
        if !sampler.is_greedy() && sampling.len() < batch_size {
            return Err(EngineError::SamplingContextTooSmall { batch: batch_size, streams: sampling.len() }.into());
        }

        let prompt_lens = request.prompts.iter().map(Vec::len).collect::<Vec<_>>();
        let min_prompt_len = prompt_lens.iter().copied().min().unwrap_or_default();
        let max_prompt_len = prompt_lens.iter().copied().max().unwrap_or_default();

        let total_len = max_prompt_len + request.max_new_tokens;
        if total_len > config.max_seq_len {
            return Err(EngineError::SequenceTooLong { requested: total_len, max: config.max_seq_len }.into());
        }

        let tokens = request
            .prompts
            .iter()
            .map(|prompt| {
                let mut row = vec![vocabulary.pad_id; total_len];
                row[..prompt.len()].copy_from_slice(prompt);
                row
            })
            .collect();

        let phase = if request.max_new_tokens == 0 { Phase::Done } else { Phase::Prefill };
        debug!(
            "Generation of {batch_size} sequences: prompts {min_prompt_len}..={max_prompt_len} tokens, total length {total_len}"
        );

        stack.reset_cache();

        Ok(Self {
            stack,
            sampling,
            sampler,
            vocabulary,
            tokens,
            logprobs: request.logprobs.then(|| vec![vec![0.0; total_len]; batch_size]),
            reached_end: vec![false; batch_size],
            prompt_lens,
            max_new_tokens: request.max_new_tokens,
            echo: request.echo,
            prev_pos: 0,
            cur_pos: min_prompt_len,
            total_len,
            phase,
            metrics: TokenMetrics::new(),
        })
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Number of positions filled in every sequence.
    pub fn position(&self) -> usize {
        self.cur_pos
    }

    /// Runs one forward pass and fills position `position()` of every sequence.
    pub fn step(&mut self) -> Result<Phase> {
        if self.phase == Phase::Done {
            return Ok(Phase::Done);
        }

        let (prev_pos, cur_pos) = (self.prev_pos, self.cur_pos);
        let batch_size = self.tokens.len();
        let chunk = self.tokens.iter().flat_map(|row| row[prev_pos..cur_pos].iter().copied()).collect::<Vec<_>>();

        self.metrics.start_generation();
        let logits = self.stack.forward(&chunk, batch_size, prev_pos)?;

        for (batch_idx, row) in self.tokens.iter_mut().enumerate() {
            if cur_pos < self.prompt_lens[batch_idx] {
                // Still inside this sequence's prompt: keep the known token.
                continue;
            }

            let next_token = match self.sampling.get_mut(batch_idx) {
                Some(rng) => self.sampler.sample(logits.last(batch_idx), rng),
                None => Sampler::argmax(logits.last(batch_idx)),
            };

            row[cur_pos] = next_token;
            self.reached_end[batch_idx] |= next_token == self.vocabulary.end_id;
            self.metrics.increment_token();
        }

        if let Some(logprobs) = &mut self.logprobs {
            for (batch_idx, (row, row_logprobs)) in self.tokens.iter().zip(logprobs.iter_mut()).enumerate() {
                for offset in 0..cur_pos - prev_pos {
                    let target_pos = prev_pos + offset + 1;
                    let target = row[target_pos];
                    row_logprobs[target_pos] = if target == self.vocabulary.pad_id {
                        0.0
                    } else {
                        log_softmax_at(logits.row(batch_idx, offset), target)
                    };
                }
            }
        }

        self.prev_pos = cur_pos;
        self.cur_pos = cur_pos + 1;

        let next_phase = if self.cur_pos == self.total_len || self.reached_end.iter().all(|&reached| reached) {
            Phase::Done
        } else {
            Phase::Decode
        };

        if next_phase != self.phase {
            debug!("Generation phase {:?} -> {:?} at position {}", self.phase, next_phase, self.cur_pos);
        }
        self.phase = next_phase;

        Ok(self.phase)
    }

    /// Steps until [`Phase::Done`] and returns the completions.
    pub fn run(mut self) -> Result<GenerationResult> {
        while self.step()? != Phase::Done {}
        Ok(self.finish())
    }

    /// Returns the completions produced so far.
    pub fn finish(mut self) -> GenerationResult {
        self.metrics.report();

        let completions = self
            .tokens
            .iter()
            .enumerate()
            .map(|(batch_idx, row)| {
                let prompt_len = self.prompt_lens[batch_idx];
                let filled = self.cur_pos.max(prompt_len);
                let end = filled.min(prompt_len + self.max_new_tokens);
                let start = if self.echo { 0 } else { prompt_len };

                let (end, stop) = match row[prompt_len..end].iter().position(|&token| token == self.vocabulary.end_id) {
                    Some(eos_offset) => (prompt_len + eos_offset, StopReason::EndOfSequence),
                    None => (end, StopReason::Length),
                };

                Completion {
                    tokens: row[start..end].to_vec(),
                    logprobs: self.logprobs.as_ref().map(|logprobs| logprobs[batch_idx][start..end].to_vec()),
                    stop,
                }
            })
            .collect();

        GenerationResult { completions }
    }
}

/// Tracks token generation throughput
struct TokenMetrics {
    start_time: Option<Instant>,
    generated_count: usize,
}

impl TokenMetrics {
    fn new() -> Self {
        Self { start_time: None, generated_count: 0 }
    }

    fn start_generation(&mut self) {
        if self.start_time.is_none() {
            self.start_time = Some(Instant::now());
        }
    }

    fn increment_token(&mut self) {
        self.generated_count += 1;
    }

    fn report(&mut self) {
        if let Some(start_time) = self.start_time.take() {
            let duration = start_time.elapsed();
            if self.generated_count > 0 && duration.as_secs_f64() > 0.0 {
                let tps = self.generated_count as f64 / duration.as_secs_f64();
                info!(
                    "[Generated {} tokens in {:.2}s - {:.2} tokens/sec]",
                    self.generated_count,
                    duration.as_secs_f64(),
                    tps
                );
            }
        }
        self.generated_count = 0;
    }
}
