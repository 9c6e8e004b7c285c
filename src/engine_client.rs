//! The three engine RPCs a session drives (spec.md §6). The engine fleet
//! itself is an out-of-scope external collaborator; this module defines the
//! seam (`EngineClient`) plus a `SimulatedEngineClient` so the crate is
//! exercisable without a real inference backend.

use crate::errors::EngineRpcError;
use crate::ids::SessionId;
use crate::instruction::SamplingParams;
use crate::latency::LatencyProfile;
use async_stream::stream;
use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use tokio::time::sleep;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FillResponse {
    pub num_filled_tokens: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeResponse {
    pub num_freed_tokens: usize,
}

pub type TokenStream = Pin<Box<dyn Stream<Item = Result<u32, EngineRpcError>> + Send>>;

/// Transport-level seam to a backend inference engine.
#[async_trait]
pub trait EngineClient: Send + Sync {
    async fn fill(
        &self,
        engine_id: &str,
        session_id: SessionId,
        context_id: u64,
        parent_context_id: Option<u64>,
        token_ids: &[u32],
    ) -> Result<FillResponse, EngineRpcError>;

    async fn generate(
        &self,
        engine_id: &str,
        session_id: SessionId,
        context_id: u64,
        parent_context_id: Option<u64>,
        sampling: &SamplingParams,
    ) -> Result<TokenStream, EngineRpcError>;

    async fn free_context(
        &self,
        engine_id: &str,
        context_id: u64,
    ) -> Result<FreeResponse, EngineRpcError>;
}

/// A test/demo double that accepts fills unconditionally and generates a
/// bounded run of synthetic tokens with simulated per-token latency,
/// honoring `max_gen_length` and `stop_token_ids`.
pub struct SimulatedEngineClient {
    latency: LatencyProfile,
    next_token: AtomicU32,
    fail_engines: Mutex<Vec<String>>,
}

impl SimulatedEngineClient {
    pub fn new(latency: LatencyProfile) -> Self {
        Self {
            latency,
            next_token: AtomicU32::new(1),
            fail_engines: Mutex::new(Vec::new()),
        }
    }

    /// Make subsequent RPCs against `engine_id` fail, to exercise the
    /// fail-fast path in tests.
    pub fn fail_engine(&self, engine_id: impl Into<String>) {
        self.fail_engines.lock().unwrap().push(engine_id.into());
    }

    fn should_fail(&self, engine_id: &str) -> bool {
        self.fail_engines.lock().unwrap().iter().any(|e| e == engine_id)
    }
}

#[async_trait]
impl EngineClient for SimulatedEngineClient {
    async fn fill(
        &self,
        engine_id: &str,
        _session_id: SessionId,
        _context_id: u64,
        _parent_context_id: Option<u64>,
        token_ids: &[u32],
    ) -> Result<FillResponse, EngineRpcError> {
        if self.should_fail(engine_id) {
            return Err(EngineRpcError::Transport {
                engine_id: engine_id.to_string(),
                message: "simulated transport failure".to_string(),
            });
        }
        Ok(FillResponse {
            num_filled_tokens: token_ids.len(),
        })
    }

    async fn generate(
        &self,
        engine_id: &str,
        _session_id: SessionId,
        _context_id: u64,
        _parent_context_id: Option<u64>,
        sampling: &SamplingParams,
    ) -> Result<TokenStream, EngineRpcError> {
        if self.should_fail(engine_id) {
            return Err(EngineRpcError::Transport {
                engine_id: engine_id.to_string(),
                message: "simulated transport failure".to_string(),
            });
        }
        let latency = self.latency.clone();
        let max_len = sampling.max_gen_length.max(1) as usize;
        let stop_ids = sampling.stop_token_ids.clone();
        let start = self.next_token.fetch_add(max_len as u32 + 1, Ordering::Relaxed);

        Ok(Box::pin(stream! {
            let ttft = latency.sample_ttft();
            if !ttft.is_zero() {
                sleep(ttft).await;
            }
            for i in 0..max_len {
                if i > 0 {
                    let tbt = latency.sample_tbt();
                    if !tbt.is_zero() {
                        sleep(tbt).await;
                    }
                }
                let token = start + i as u32;
                if stop_ids.contains(&token) {
                    break;
                }
                yield Ok(token);
            }
        }))
    }

    async fn free_context(
        &self,
        engine_id: &str,
        _context_id: u64,
    ) -> Result<FreeResponse, EngineRpcError> {
        if self.should_fail(engine_id) {
            return Err(EngineRpcError::Transport {
                engine_id: engine_id.to_string(),
                message: "simulated transport failure".to_string(),
            });
        }
        Ok(FreeResponse {
            num_freed_tokens: 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn fill_echoes_token_count() {
        let client = SimulatedEngineClient::new(LatencyProfile::instant());
        let resp = client
            .fill("e0", SessionId::for_test(0), 0, None, &[1, 2, 3])
            .await
            .unwrap();
        assert_eq!(resp.num_filled_tokens, 3);
    }

    #[tokio::test]
    async fn generate_respects_max_gen_length() {
        let client = SimulatedEngineClient::new(LatencyProfile::instant());
        let sampling = SamplingParams {
            max_gen_length: 5,
            ..SamplingParams::default()
        };
        let mut stream = client
            .generate("e0", SessionId::for_test(0), 0, None, &sampling)
            .await
            .unwrap();
        let mut count = 0;
        while let Some(tok) = stream.next().await {
            tok.unwrap();
            count += 1;
        }
        assert_eq!(count, 5);
    }

    #[tokio::test]
    async fn failing_engine_surfaces_rpc_error() {
        let client = SimulatedEngineClient::new(LatencyProfile::instant());
        client.fail_engine("e0");
        let err = client
            .fill("e0", SessionId::for_test(0), 0, None, &[1])
            .await
            .unwrap_err();
        assert!(matches!(err, EngineRpcError::Transport { .. }));
    }
}
