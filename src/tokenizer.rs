use crate::error::{CoreError, Result};

/// One message in a chat-formatted prompt (spec §4.9 "apply chat template").
#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

/// Special token ids a tokenizer adapter may expose (spec §6 "Tokenizer
/// adapter"). All optional: a tokenizer without a BOS/EOS/PAD convention
/// returns `None` for that field.
#[derive(Debug, Clone, Copy, Default)]
pub struct SpecialTokens {
    pub bos: Option<u32>,
    pub eos: Option<u32>,
    pub pad: Option<u32>,
}

/// The tokenizer boundary the core consumes (spec §6): `encode`, `decode`,
/// `special_tokens`. Object-safe so callers can plug in any tokenizer
/// without the core depending on a concrete crate at the API boundary.
pub trait TokenizerAdapter: Send + Sync {
    fn encode(&self, text: &str) -> Result<Vec<u32>>;
    fn decode(&self, ids: &[u32], skip_special: bool, clean: bool) -> Result<String>;
    fn special_tokens(&self) -> SpecialTokens;

    /// Apply a chat template to a message list, producing token ids ready
    /// for prefill. Not part of the spec's minimal adapter surface, but
    /// every generation caller that sets `use_chat_template` needs it, so
    /// it is provided with a sane plain-text fallback that adapters may
    /// override.
    fn apply_chat_template(&self, messages: &[ChatMessage]) -> Result<Vec<u32>> {
        let text: String = messages.iter().map(|m| m.content.as_str()).collect::<Vec<_>>().join("\n");
        self.encode(&text)
    }

    /// Vocabulary size as the tokenizer understands it — may exceed the
    /// model's embedding matrix row count (spec §4.8 "vocab padding").
    fn vocab_size(&self) -> usize;
}

/// Default `TokenizerAdapter` wrapping the HuggingFace `tokenizers` crate,
/// grounded on the teacher's BPE + byte-level pre/post-processing setup.
/// Auto-detects ChatML vs LLaMA-3-style special tokens for
/// `apply_chat_template`, falling back to plain-text joining if neither is
/// present in the vocabulary.
pub struct StaticTokenizerAdapter {
    inner: tokenizers::Tokenizer,
    bos_id: Option<u32>,
    eos_id: Option<u32>,
    pad_id: Option<u32>,
}

impl StaticTokenizerAdapter {
    /// Load from a `tokenizer.json` file (HuggingFace format).
    pub fn from_file(path: &str) -> Result<Self> {
        let inner = tokenizers::Tokenizer::from_file(path).map_err(|e| CoreError::Tokenizer(format!("failed to load tokenizer: {e}")))?;
        Ok(Self::from_inner(inner))
    }

    /// Load from an in-memory `tokenizer.json` document.
    pub fn from_json(json: &str) -> Result<Self> {
        let inner = tokenizers::Tokenizer::from_bytes(json.as_bytes()).map_err(|e| CoreError::Tokenizer(format!("failed to parse tokenizer: {e}")))?;
        Ok(Self::from_inner(inner))
    }

    fn from_inner(inner: tokenizers::Tokenizer) -> Self {
        let bos_id = inner.token_to_id("<s>").or_else(|| inner.token_to_id("<|begin_of_text|>"));
        let eos_id = inner.token_to_id("</s>").or_else(|| inner.token_to_id("<|end_of_text|>"));
        let pad_id = inner.token_to_id("<pad>");
        Self { inner, bos_id, eos_id, pad_id }
    }

    fn encode_raw(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self.inner.encode(text, false).map_err(|e| CoreError::Tokenizer(format!("encode failed: {e}")))?;
        Ok(encoding.get_ids().to_vec())
    }
}

impl TokenizerAdapter for StaticTokenizerAdapter {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        self.encode_raw(text)
    }

    fn decode(&self, ids: &[u32], skip_special: bool, clean: bool) -> Result<String> {
        self.inner
            .decode(ids, skip_special)
            .map(|s| if clean { s.trim().to_string() } else { s })
            .map_err(|e| CoreError::Tokenizer(format!("decode failed: {e}")))
    }

    fn special_tokens(&self) -> SpecialTokens {
        SpecialTokens {
            bos: self.bos_id,
            eos: self.eos_id,
            pad: self.pad_id,
        }
    }

    fn apply_chat_template(&self, messages: &[ChatMessage]) -> Result<Vec<u32>> {
        let im_start = self.inner.token_to_id("<|im_start|>");
        let im_end = self.inner.token_to_id("<|im_end|>");
        if let (Some(im_start), Some(im_end)) = (im_start, im_end) {
            return self.apply_chatml(messages, im_start, im_end);
        }

        let start_header = self.inner.token_to_id("<|start_header_id|>");
        let end_header = self.inner.token_to_id("<|end_header_id|>");
        let eot = self.inner.token_to_id("<|eot_id|>");
        let (Some(start_header), Some(end_header), Some(eot)) = (start_header, end_header, eot) else {
            let text: String = messages.iter().map(|m| m.content.as_str()).collect::<Vec<_>>().join("\n");
            let mut ids = self.bos_id.map(|b| vec![b]).unwrap_or_default();
            ids.extend(self.encode_raw(&text)?);
            return Ok(ids);
        };

        let mut tokens = self.bos_id.map(|b| vec![b]).unwrap_or_default();
        for msg in messages {
            tokens.push(start_header);
            tokens.extend(self.encode_raw(&msg.role)?);
            tokens.push(end_header);
            tokens.extend(self.encode_raw(&format!("\n\n{}", msg.content))?);
            tokens.push(eot);
        }
        tokens.push(start_header);
        tokens.extend(self.encode_raw("assistant")?);
        tokens.push(end_header);
        tokens.extend(self.encode_raw("\n\n")?);
        Ok(tokens)
    }

    fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }
}

impl StaticTokenizerAdapter {
    fn apply_chatml(&self, messages: &[ChatMessage], im_start: u32, im_end: u32) -> Result<Vec<u32>> {
        let mut tokens = self.bos_id.map(|b| vec![b]).unwrap_or_default();
        for msg in messages {
            tokens.push(im_start);
            tokens.extend(self.encode_raw(&format!("{}\n{}", msg.role, msg.content))?);
            tokens.push(im_end);
            tokens.extend(self.encode_raw("\n")?);
        }
        tokens.push(im_start);
        tokens.extend(self.encode_raw("assistant\n")?);
        Ok(tokens)
    }
}
