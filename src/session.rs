//! A session is a running call: a FIFO instruction queue pulled from one
//! engine with a fill-coalescing buffer in front of it (spec.md §3, §4.2).
//!
//! Closely grounded on `original_source/parrot/executor/session.py`'s
//! `Session.execute_coroutine`/`_flush_fill_tokens_buffer` — the constant,
//! placeholder-fill, and placeholder-generation branches below are the same
//! three cases in the same order.

use crate::context::ContextId;
use crate::data_holder::{detokenize, DataHolder};
use crate::engine_client::EngineClient;
use crate::errors::{AssertionFailure, FatalSessionError};
use crate::executor::HolderRegistry;
use crate::ids::SessionId;
use crate::instruction::{Instruction, VariableId, FILL_NO_CHUNK, STREAMING_END_TOKEN_ID};
use crate::stats::Stats;
use crate::tokenizer::Tokenizer;
use futures::StreamExt;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Groups sessions that share Variables and therefore belong to the same
/// calling program instance (spec.md Glossary). Used by the dispatcher's
/// app-FIFO policy to order work fairly across concurrent callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AppId(u64);

static NEXT_APP_ID: AtomicU64 = AtomicU64::new(0);

impl AppId {
    pub fn fresh() -> Self {
        AppId(NEXT_APP_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn for_test(raw: u64) -> Self {
        AppId(raw)
    }
}

fn get_or_create_holder(
    holders: &HolderRegistry,
    id: VariableId,
    tokenizer_name: &str,
) -> Arc<DataHolder> {
    let mut map = holders.lock().unwrap();
    map.entry(id)
        .or_insert_with(|| Arc::new(DataHolder::new(id, tokenizer_name)))
        .clone()
}

pub struct Session {
    pub session_id: SessionId,
    pub app_id: AppId,
    /// Producer sessions this session's instructions read a `Future` from;
    /// carried through to the dispatcher's `PendingSession::upstream`.
    pub upstream: Vec<SessionId>,
    instructions: VecDeque<Instruction>,
    fill_buffer: Vec<u32>,
    engine_id: String,
    tokenizer_name: String,
    fill_chunk_size: usize,
    context_id: ContextId,
    parent_context_id: Option<ContextId>,
}

impl Session {
    pub fn new(
        session_id: SessionId,
        app_id: AppId,
        engine_id: impl Into<String>,
        tokenizer_name: impl Into<String>,
        fill_chunk_size: usize,
        context_id: ContextId,
        parent_context_id: Option<ContextId>,
    ) -> Self {
        Self {
            session_id,
            app_id,
            upstream: Vec::new(),
            instructions: VecDeque::new(),
            fill_buffer: Vec::new(),
            engine_id: engine_id.into(),
            tokenizer_name: tokenizer_name.into(),
            fill_chunk_size,
            context_id,
            parent_context_id,
        }
    }

    pub fn push_instruction(&mut self, inst: Instruction) {
        self.instructions.push_back(inst);
    }

    fn context_id_u64(&self) -> u64 {
        self.context_id.raw() as u64
    }

    fn parent_context_id_u64(&self) -> Option<u64> {
        self.parent_context_id.map(|p| p.raw() as u64)
    }

    async fn flush_fill_buffer(
        &mut self,
        instruction_index: usize,
        client: &Arc<dyn EngineClient>,
        stats: &Arc<Stats>,
    ) -> Result<(), FatalSessionError> {
        let buffer_len = self.fill_buffer.len();
        if buffer_len == 0 {
            return Ok(());
        }
        let chunk_size = if self.fill_chunk_size == FILL_NO_CHUNK {
            buffer_len
        } else {
            self.fill_chunk_size
        };

        let mut num_filled_tokens = 0usize;
        let chunks: Vec<Vec<u32>> = self
            .fill_buffer
            .chunks(chunk_size)
            .map(|c| c.to_vec())
            .collect();
        for chunk in &chunks {
            let resp = client
                .fill(
                    &self.engine_id,
                    self.session_id,
                    self.context_id_u64(),
                    self.parent_context_id_u64(),
                    chunk,
                )
                .await
                .map_err(|e| FatalSessionError::new(self.session_id, instruction_index, e))?;
            num_filled_tokens += resp.num_filled_tokens;
        }

        if num_filled_tokens != buffer_len {
            return Err(FatalSessionError::new(
                self.session_id,
                instruction_index,
                AssertionFailure::FillCountMismatch {
                    session_id: self.session_id,
                    instruction_index,
                    filled: num_filled_tokens,
                    expected: buffer_len,
                },
            ));
        }
        stats.record_fill(num_filled_tokens as u64);
        self.fill_buffer.clear();
        Ok(())
    }

    /// Run every queued instruction to completion against `client`,
    /// resolving `Future` references through the shared `holders` registry.
    pub async fn run(
        mut self,
        client: Arc<dyn EngineClient>,
        holders: Arc<HolderRegistry>,
        tokenizer: Arc<dyn Tokenizer>,
        stats: Arc<Stats>,
    ) -> Result<(), FatalSessionError> {
        let mut instruction_index = 0usize;
        while let Some(inst) = self.instructions.pop_front() {
            match inst {
                Instruction::ConstantFill { tokens } => {
                    self.fill_buffer.extend(tokens);
                }
                Instruction::PlaceholderFill { input_holder } => {
                    let holder = get_or_create_holder(&holders, input_holder, &self.tokenizer_name);
                    holder.wait_streaming().await;

                    if holder.is_ready() {
                        self.fill_buffer.extend(holder.tokens_snapshot());
                    } else {
                        self.flush_fill_buffer(instruction_index, &client, &stats).await?;
                        // The producer is still streaming: pipeline fills one
                        // token at a time as they arrive, rather than the
                        // chunked-pipe batching the original implementation
                        // used (this crate's replay pipe yields single
                        // tokens, not producer-defined chunks).
                        let mut pipe = holder.subscribe();
                        let mut num_filled_tokens = 0usize;
                        while let Some(token) = pipe.next().await {
                            let resp = client
                                .fill(
                                    &self.engine_id,
                                    self.session_id,
                                    self.context_id_u64(),
                                    self.parent_context_id_u64(),
                                    &[token],
                                )
                                .await
                                .map_err(|e| {
                                    FatalSessionError::new(self.session_id, instruction_index, e)
                                })?;
                            num_filled_tokens += resp.num_filled_tokens;
                        }
                        stats.record_fill(num_filled_tokens as u64);
                        let expected = holder.token_count();
                        if num_filled_tokens != expected {
                            return Err(FatalSessionError::new(
                                self.session_id,
                                instruction_index,
                                AssertionFailure::FillCountMismatch {
                                    session_id: self.session_id,
                                    instruction_index,
                                    filled: num_filled_tokens,
                                    expected,
                                },
                            ));
                        }
                    }
                }
                Instruction::PlaceholderGeneration {
                    output_holder,
                    sampling,
                } => {
                    self.flush_fill_buffer(instruction_index, &client, &stats).await?;

                    let holder = get_or_create_holder(&holders, output_holder, &self.tokenizer_name);
                    if holder.is_ready() {
                        return Err(FatalSessionError::new(
                            self.session_id,
                            instruction_index,
                            AssertionFailure::OutputHolderAlreadyReady {
                                session_id: self.session_id,
                            },
                        ));
                    }

                    let detok_holder = holder.clone();
                    let detok_tokenizer = tokenizer.clone();
                    tokio::spawn(async move {
                        detokenize(detok_holder, detok_tokenizer).await;
                    });

                    holder.streaming_event.set();
                    let mut stream = client
                        .generate(
                            &self.engine_id,
                            self.session_id,
                            self.context_id_u64(),
                            self.parent_context_id_u64(),
                            &sampling,
                        )
                        .await
                        .map_err(|e| {
                            FatalSessionError::new(self.session_id, instruction_index, e)
                        })?;

                    let mut num_generated = 0u64;
                    while let Some(token) = stream.next().await {
                        match token {
                            Ok(t) => {
                                holder.send_token(t, true);
                                num_generated += 1;
                            }
                            Err(e) => {
                                return Err(FatalSessionError::new(
                                    self.session_id,
                                    instruction_index,
                                    e,
                                ))
                            }
                        }
                    }
                    stats.record_generated(num_generated);
                    holder.send_token(STREAMING_END_TOKEN_ID, false);
                    holder.ready_event.set();
                }
            }
            instruction_index += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
impl Session {
    pub fn instruction_count_for_test(&self) -> usize {
        self.instructions.len()
    }

    pub fn take_generation_sampling_for_test(
        &self,
        holder: VariableId,
    ) -> Option<crate::instruction::SamplingParams> {
        self.instructions.iter().find_map(|inst| match inst {
            Instruction::PlaceholderGeneration {
                output_holder,
                sampling,
            } if *output_holder == holder => Some(sampling.clone()),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine_client::SimulatedEngineClient;
    use crate::instruction::SamplingParams;
    use crate::latency::LatencyProfile;
    use crate::tokenizer::BpeTokenizer;
    use std::collections::HashMap;
    use std::sync::Mutex;

    fn holders() -> Arc<HolderRegistry> {
        Arc::new(Mutex::new(HashMap::new()))
    }

    fn stats() -> Arc<Stats> {
        Arc::new(Stats::new())
    }

    #[tokio::test]
    async fn constant_fill_then_generation_produces_bounded_tokens() {
        let client: Arc<dyn EngineClient> =
            Arc::new(SimulatedEngineClient::new(LatencyProfile::instant()));
        let tokenizer: Arc<dyn Tokenizer> = Arc::new(BpeTokenizer::new("test").unwrap());
        let holders = holders();

        let output_id = VariableId::fresh();
        let mut session = Session::new(
            SessionId::for_test(0),
            AppId::for_test(0),
            "e0",
            "test",
            FILL_NO_CHUNK,
            ContextId::raw_for_test(0),
            None,
        );
        session.push_instruction(Instruction::ConstantFill {
            tokens: vec![1, 2, 3],
        });
        session.push_instruction(Instruction::PlaceholderGeneration {
            output_holder: output_id,
            sampling: SamplingParams {
                max_gen_length: 4,
                ..SamplingParams::default()
            },
        });

        session.run(client, holders.clone(), tokenizer, stats()).await.unwrap();

        let holder = get_or_create_holder(&holders, output_id, "test");
        assert!(holder.is_ready());
        assert_eq!(holder.token_count(), 4);
    }

    #[tokio::test]
    async fn placeholder_fill_forwards_ready_producer_tokens() {
        let client: Arc<dyn EngineClient> =
            Arc::new(SimulatedEngineClient::new(LatencyProfile::instant()));
        let tokenizer: Arc<dyn Tokenizer> = Arc::new(BpeTokenizer::new("test").unwrap());
        let holders = holders();

        let input_id = VariableId::fresh();
        let producer_holder = get_or_create_holder(&holders, input_id, "test");
        producer_holder.send_token(10, true);
        producer_holder.send_token(11, true);
        producer_holder.send_token(STREAMING_END_TOKEN_ID, false);
        producer_holder.streaming_event.set();
        producer_holder.ready_event.set();

        let output_id = VariableId::fresh();
        let mut session = Session::new(
            SessionId::for_test(1),
            AppId::for_test(0),
            "e0",
            "test",
            FILL_NO_CHUNK,
            ContextId::raw_for_test(0),
            None,
        );
        session.push_instruction(Instruction::PlaceholderFill {
            input_holder: input_id,
        });
        session.push_instruction(Instruction::PlaceholderGeneration {
            output_holder: output_id,
            sampling: SamplingParams {
                max_gen_length: 2,
                ..SamplingParams::default()
            },
        });

        session.run(client, holders, tokenizer, stats()).await.unwrap();
    }

    #[tokio::test]
    async fn engine_failure_surfaces_as_fatal_session_error() {
        let client = Arc::new(SimulatedEngineClient::new(LatencyProfile::instant()));
        client.fail_engine("e0");
        let client: Arc<dyn EngineClient> = client;
        let tokenizer: Arc<dyn Tokenizer> = Arc::new(BpeTokenizer::new("test").unwrap());
        let holders = holders();

        let mut session = Session::new(
            SessionId::for_test(2),
            AppId::for_test(0),
            "e0",
            "test",
            FILL_NO_CHUNK,
            ContextId::raw_for_test(0),
            None,
        );
        session.push_instruction(Instruction::ConstantFill { tokens: vec![1] });
        session.push_instruction(Instruction::PlaceholderGeneration {
            output_holder: VariableId::fresh(),
            sampling: SamplingParams::default(),
        });

        let err = session.run(client, holders, tokenizer, stats()).await.unwrap_err();
        assert_eq!(err.session_id, SessionId::for_test(2));
        assert_eq!(err.instruction_index, 1);
    }
}
