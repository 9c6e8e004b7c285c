//! Variables, sampling parameters, and the instruction set a session
//! executes (spec.md §3, §6).

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Sentinel token id marking end-of-stream in a [`crate::data_holder::DataHolder`]
/// fan-out pipe. Never appended to the holder's token buffer, only fanned
/// out to subscribers.
pub const STREAMING_END_TOKEN_ID: u32 = u32::MAX;

/// Disables fill-chunking: the whole fill-coalescing buffer is sent as one
/// `fill` RPC.
pub const FILL_NO_CHUNK: usize = 0;

/// Marker embedded when serializing a [`Variable`] inside a call payload, so
/// the receiving side can distinguish a plain string from a future
/// reference.
pub const FUTURE_MAGIC_HEADER: &str = "__parrot_future__";

/// Globally unique identifier for a [`Variable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VariableId(u64);

static NEXT_VARIABLE_ID: AtomicU64 = AtomicU64::new(0);

impl VariableId {
    pub fn fresh() -> Self {
        VariableId(NEXT_VARIABLE_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

/// A value bound at a call site: either a constant string, or a lazy slot
/// filled by a producing session's output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Variable {
    /// A plain, already-known value — stringified and tokenized at
    /// translation time.
    Constant(String),
    /// A lazy slot; the id is shared with the `DataHolder` that will carry
    /// its tokens.
    Future {
        id: VariableId,
        name: Option<String>,
    },
}

impl Variable {
    pub fn new_future(name: Option<String>) -> Self {
        Variable::Future {
            id: VariableId::fresh(),
            name,
        }
    }

    pub fn as_future_id(&self) -> Option<VariableId> {
        match self {
            Variable::Future { id, .. } => Some(*id),
            Variable::Constant(_) => None,
        }
    }
}

/// Sampling configuration for a `PlaceholderGeneration` instruction
/// (spec.md §6).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    pub temperature: f32,
    pub top_p: f32,
    pub max_gen_length: u32,
    pub stop_token_ids: Vec<u32>,
    pub ignore_tokenizer_eos: bool,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 0.8,
            top_p: 0.95,
            max_gen_length: 512,
            stop_token_ids: Vec::new(),
            ignore_tokenizer_eos: false,
        }
    }
}

impl SamplingParams {
    /// Append the tokenizer's EOS id to `stop_token_ids`, unless the caller
    /// opted out via `ignore_tokenizer_eos` (spec.md §4.4 step 2).
    pub fn with_tokenizer_eos(mut self, eos_token_id: u32) -> Self {
        if !self.ignore_tokenizer_eos && !self.stop_token_ids.contains(&eos_token_id) {
            self.stop_token_ids.push(eos_token_id);
        }
        self
    }
}

/// One primitive operation in a session's instruction queue (spec.md §3).
#[derive(Debug, Clone)]
pub enum Instruction {
    /// Feed a fixed token array into the current context.
    ConstantFill { tokens: Vec<u32> },
    /// Feed the tokens of another holder; may block until the producer
    /// streams.
    PlaceholderFill { input_holder: VariableId },
    /// Generate into an output holder.
    PlaceholderGeneration {
        output_holder: VariableId,
        sampling: SamplingParams,
    },
}

impl Instruction {
    pub fn is_generation(&self) -> bool {
        matches!(self, Instruction::PlaceholderGeneration { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn variable_ids_are_unique() {
        let a = VariableId::fresh();
        let b = VariableId::fresh();
        assert_ne!(a, b);
    }

    #[test]
    fn sampling_params_append_eos_unless_ignored() {
        let params = SamplingParams::default().with_tokenizer_eos(50256);
        assert!(params.stop_token_ids.contains(&50256));

        let params = SamplingParams {
            ignore_tokenizer_eos: true,
            ..SamplingParams::default()
        }
        .with_tokenizer_eos(50256);
        assert!(!params.stop_token_ids.contains(&50256));
    }

    #[test]
    fn sampling_params_eos_not_duplicated() {
        let params = SamplingParams {
            stop_token_ids: vec![50256],
            ..SamplingParams::default()
        }
        .with_tokenizer_eos(50256);
        assert_eq!(
            params.stop_token_ids.iter().filter(|&&t| t == 50256).count(),
            1
        );
    }

    #[test]
    fn future_variable_exposes_its_id() {
        let v = Variable::new_future(Some("x".into()));
        assert!(v.as_future_id().is_some());
        let c = Variable::Constant("hi".into());
        assert!(c.as_future_id().is_none());
    }
}
