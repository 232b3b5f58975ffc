use std::collections::VecDeque;
use std::time::Instant;

use futures::Stream;

use crate::error::Result;
use crate::pipeline::ModelPipeline;
use crate::sampling::{apply_repetition_penalty, sample};
use crate::tokenizer::{ChatMessage, TokenizerAdapter};

/// Options for one `generate` call (spec §6 "Public generate API").
#[derive(Debug, Clone)]
pub struct GenerateOptions {
    pub max_tokens: usize,
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: usize,
    pub repetition_penalty: f32,
    pub stop_sequences: Vec<String>,
    pub use_chat_template: bool,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            max_tokens: 256,
            temperature: 1.0,
            top_p: 1.0,
            top_k: 0,
            repetition_penalty: 1.0,
            stop_sequences: Vec::new(),
            use_chat_template: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    Length,
    Eos,
}

#[derive(Debug, Clone)]
pub struct GeneratedToken {
    pub token_id: u32,
    pub token_text: String,
}

#[derive(Debug, Clone)]
pub struct GenerateResult {
    pub all_token_ids: Vec<u32>,
    pub output_text: String,
    pub finish_reason: FinishReason,
    pub prefill_ms: f64,
    pub decode_ms: f64,
    pub total_ms: f64,
    pub tokens_generated: usize,
}

/// One item out of the `generate` stream: either a newly sampled token, or
/// the terminal summary (spec §6 "stream of (token_id, token_text) ...
/// final result").
#[derive(Debug, Clone)]
pub enum GenerateEvent {
    Token(GeneratedToken),
    Done(GenerateResult),
}

/// Independent, stateful stop-condition evaluators combined with OR
/// semantics (spec §4.9 "Repeat: ... apply stop conditions").
struct StopState {
    max_tokens: usize,
    stop_token_ids: Vec<u32>,
    stop_sequences: Vec<String>,
    tail: String,
    tail_budget: usize,
    generated: usize,
}

impl StopState {
    fn new(max_tokens: usize, stop_token_ids: Vec<u32>, stop_sequences: Vec<String>) -> Self {
        let tail_budget = stop_sequences.iter().map(|s| s.len()).max().unwrap_or(0).max(64);
        Self {
            max_tokens,
            stop_token_ids,
            stop_sequences,
            tail: String::new(),
            tail_budget,
            generated: 0,
        }
    }

    /// Record one sampled token; returns `Some(reason)` once a stop
    /// condition fires (max length, single-token stop set, multi-char
    /// suffix match over a sliding text tail).
    fn observe(&mut self, token_id: u32, token_text: &str) -> Option<FinishReason> {
        self.generated += 1;

        if self.stop_token_ids.contains(&token_id) {
            return Some(FinishReason::Eos);
        }

        self.tail.push_str(token_text);
        if self.tail.len() > self.tail_budget * 2 {
            let cut = self.tail.len() - self.tail_budget;
            let boundary = (0..=cut).rev().find(|&i| self.tail.is_char_boundary(i)).unwrap_or(0);
            self.tail.drain(..boundary);
        }
        for seq in &self.stop_sequences {
            if !seq.is_empty() && self.tail.ends_with(seq.as_str()) {
                return Some(FinishReason::Stop);
            }
        }

        if self.generated >= self.max_tokens {
            return Some(FinishReason::Length);
        }
        None
    }
}

/// Tokenize, prefill, then decode-and-sample in a loop, streaming each
/// token as it is produced (spec §4.9 "Generation"). The terminal
/// `GenerateEvent::Done` carries the same summary the non-streaming caller
/// would get from awaiting the whole stream.
pub fn generate<'a>(
    pipeline: &'a mut ModelPipeline,
    tokenizer: &'a dyn TokenizerAdapter,
    prompt: &'a str,
    opts: GenerateOptions,
) -> impl Stream<Item = Result<GenerateEvent>> + 'a {
    async_stream::try_stream! {
        let total_start = Instant::now();

        let prompt_ids = if opts.use_chat_template {
            tokenizer.apply_chat_template(&[ChatMessage { role: "user".to_string(), content: prompt.to_string() }])?
        } else {
            tokenizer.encode(prompt)?
        };

        let special = tokenizer.special_tokens();
        let mut stop_token_ids = pipeline.config().eos_token_ids.clone();
        if let Some(eos) = special.eos {
            stop_token_ids.push(eos);
        }

        pipeline.reset_kv_cache();

        let prefill_start = Instant::now();
        let logits_buf = pipeline.prefill(&prompt_ids).await?;
        let mut logits = pipeline.read_logits(&logits_buf, tokenizer.vocab_size()).await?;
        let prefill_ms = prefill_start.elapsed().as_secs_f64() * 1000.0;

        let mut all_token_ids = prompt_ids.clone();
        let mut recent: VecDeque<u32> = VecDeque::with_capacity(100);
        let mut stop_state = StopState::new(opts.max_tokens, stop_token_ids, opts.stop_sequences.clone());

        let mut decode_ms = 0.0f64;
        let mut finish_reason = FinishReason::Length;

        'outer: loop {
            apply_repetition_penalty(&mut logits, recent.make_contiguous(), opts.repetition_penalty);
            let token_id = sample(&logits, opts.temperature, opts.top_k, opts.top_p);
            let token_text = tokenizer.decode(&[token_id], true, false)?;

            all_token_ids.push(token_id);
            recent.push_back(token_id);
            if recent.len() > 100 {
                recent.pop_front();
            }

            yield GenerateEvent::Token(GeneratedToken { token_id, token_text: token_text.clone() });

            if let Some(reason) = stop_state.observe(token_id, &token_text) {
                finish_reason = reason;
                break 'outer;
            }

            let decode_start = Instant::now();
            let next_logits_buf = pipeline.decode(token_id).await?;
            logits = pipeline.read_logits(&next_logits_buf, tokenizer.vocab_size()).await?;
            decode_ms += decode_start.elapsed().as_secs_f64() * 1000.0;
        }

        let output_text = tokenizer.decode(&all_token_ids[prompt_ids.len()..], true, true)?;
        let total_ms = total_start.elapsed().as_secs_f64() * 1000.0;
        yield GenerateEvent::Done(GenerateResult {
            tokens_generated: all_token_ids.len() - prompt_ids.len(),
            all_token_ids,
            output_text,
            finish_reason,
            prefill_ms,
            decode_ms,
            total_ms,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_state_fires_on_max_tokens() {
        let mut state = StopState::new(2, vec![], vec![]);
        assert!(state.observe(1, "a").is_none());
        assert_eq!(state.observe(2, "b"), Some(FinishReason::Length));
    }

    #[test]
    fn stop_state_fires_on_stop_token() {
        let mut state = StopState::new(100, vec![7], vec![]);
        assert_eq!(state.observe(7, "x"), Some(FinishReason::Eos));
    }

    #[test]
    fn stop_state_fires_on_suffix_match_across_multiple_tokens() {
        let mut state = StopState::new(100, vec![], vec!["STOP".to_string()]);
        assert!(state.observe(1, "prefix S").is_none());
        assert!(state.observe(2, "TO").is_none());
        assert_eq!(state.observe(3, "P"), Some(FinishReason::Stop));
    }
}
