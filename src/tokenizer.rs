//! The tokenizer seam (spec.md §1: the tokenizer registry itself is an
//! out-of-scope external collaborator). This module defines the trait the
//! rest of the crate depends on, plus a concrete BPE-backed implementation
//! used by tests and the demo CLI so the crate is exercisable standalone.

use thiserror::Error;
use tiktoken_rs::{cl100k_base, CoreBPE};

#[derive(Debug, Error)]
pub enum TokenizerError {
    #[error("failed to initialize tokenizer: {0}")]
    Init(String),
    #[error("failed to decode token ids: {0}")]
    Decode(String),
}

/// A registered tokenizer, addressed by name from [`crate::controller::Controller`].
pub trait Tokenizer: Send + Sync {
    /// Name this tokenizer is registered under (matches `Engine::tokenizer_name`).
    fn name(&self) -> &str;

    /// Tokenize `text`. Constant pieces are always tokenized with
    /// `add_special_tokens=false` per spec.md §4.4 step 1; this trait has no
    /// special-token concept, so implementations simply never add them.
    fn encode(&self, text: &str) -> Vec<u32>;

    /// Decode a full token sequence back to text.
    fn decode(&self, tokens: &[u32]) -> Result<String, TokenizerError>;

    /// The tokenizer's end-of-sequence token id, appended to
    /// `stop_token_ids` unless a call opts out (spec.md §4.4 step 3).
    fn eos_token_id(&self) -> u32;
}

/// A `cl100k_base` BPE tokenizer, reusing the teacher crate's token-counting
/// dependency (`tiktoken-rs`) as a concrete, testable stand-in for the real
/// (out-of-scope) tokenizer registry.
pub struct BpeTokenizer {
    name: String,
    bpe: CoreBPE,
    eos_token_id: u32,
}

impl BpeTokenizer {
    pub fn new(name: impl Into<String>) -> Result<Self, TokenizerError> {
        let bpe = cl100k_base().map_err(|e| TokenizerError::Init(e.to_string()))?;
        // cl100k_base's <|endoftext|> token id.
        let eos_token_id = 100257;
        Ok(Self {
            name: name.into(),
            bpe,
            eos_token_id,
        })
    }
}

impl Tokenizer for BpeTokenizer {
    fn name(&self) -> &str {
        &self.name
    }

    fn encode(&self, text: &str) -> Vec<u32> {
        self.bpe.encode_ordinary(text)
    }

    fn decode(&self, tokens: &[u32]) -> Result<String, TokenizerError> {
        self.bpe
            .decode(tokens.to_vec())
            .map_err(|e| TokenizerError::Decode(e.to_string()))
    }

    fn eos_token_id(&self) -> u32 {
        self.eos_token_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_simple_text() {
        let tok = BpeTokenizer::new("test").unwrap();
        let ids = tok.encode("hello world");
        let text = tok.decode(&ids).unwrap();
        assert_eq!(text, "hello world");
    }

    #[test]
    fn encode_is_deterministic() {
        let tok = BpeTokenizer::new("test").unwrap();
        assert_eq!(tok.encode("abc"), tok.encode("abc"));
    }
}
