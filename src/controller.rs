//! Runtime registry and call entrypoint (spec.md §2, §9).
//!
//! Grounded on `original_source/parrot/global_user_api.py`'s
//! `parrot_running_environment` and `parrot/vm/executor.py`'s
//! `MainExecutor.submit`: own the engine/tokenizer registries, the function
//! prefix cache, and the single `run()` call that threads a call through
//! context setup, dispatch, execution, and teardown.

use crate::context::{ContextArena, ContextId, ContextLifetime};
use crate::dispatcher::{Dispatcher, DispatcherConfig, Engine, PendingSession};
use crate::engine_client::EngineClient;
use crate::errors::{DispatchError, ParrotError};
use crate::executor::{Call, Executor};
use crate::function::Function;
use crate::ids::{RecyclePool, SessionId, RECYCLE_POOL_SIZE};
use crate::instruction::{Variable, VariableId};
use crate::session::{AppId, Session};
use crate::stats::Stats;
use crate::tokenizer::Tokenizer;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

/// Report returned from a completed `run()`, the `timeit` diagnostic
/// spec.md's CLI surface prints (spec.md §8.4).
#[derive(Debug, Clone)]
pub struct RunReport {
    pub session_id: SessionId,
    pub engine_id: String,
    pub elapsed: std::time::Duration,
}

pub struct Controller {
    engine_clients: HashMap<String, Arc<dyn EngineClient>>,
    executor: Executor,
    dispatcher: Dispatcher,
    contexts: ContextArena,
    /// Shared root context holding a `cached_prefix` function's leading
    /// constant piece, keyed by (function name, tokenizer group) since the
    /// same template tokenizes differently under a different tokenizer.
    /// Populated by `cache_function_prefixes`/`ensure_function_prefix_context`
    /// and torn down by `free_function_prefixes` (spec.md §6, §9 Open
    /// Question 1).
    function_prefix: HashMap<(String, String), ContextId>,
    /// The session whose `PlaceholderGeneration` produces a given `Future`,
    /// so a later call binding that `Future` as input can record a DAG edge
    /// for the dispatcher's eligibility check (spec.md §9 supplement).
    future_producers: HashMap<VariableId, SessionId>,
    id_pool: RecyclePool,
    active: HashMap<SessionId, ActiveSession>,
    pub stats: Arc<Stats>,
}

struct ActiveSession {
    context_id: ContextId,
    engine_id: String,
    token_demand: u64,
    is_throughput: bool,
}

impl Controller {
    pub fn new(
        engines: Vec<Engine>,
        engine_clients: HashMap<String, Arc<dyn EngineClient>>,
        dispatcher_config: DispatcherConfig,
    ) -> Self {
        Self {
            engine_clients,
            executor: Executor::new(),
            dispatcher: Dispatcher::new(dispatcher_config, engines),
            contexts: ContextArena::new(),
            function_prefix: HashMap::new(),
            future_producers: HashMap::new(),
            id_pool: RecyclePool::new(RECYCLE_POOL_SIZE),
            active: HashMap::new(),
            stats: Arc::new(Stats::new()),
        }
    }

    pub fn register_tokenizer(&mut self, tokenizer_name: impl Into<String>, tokenizer: Arc<dyn Tokenizer>) {
        self.executor.register_tokenizer(tokenizer_name, tokenizer);
    }

    /// Execute `function` bound with `bindings` under the named tokenizer
    /// group, from context setup through teardown. The per-call context is
    /// released on every exit path, success or failure (spec.md §9 Open
    /// Questions: resolved as "always release" — see DESIGN.md). If
    /// `function.cached_prefix` is set and its prefix hasn't been warmed by
    /// `cache_function_prefixes` yet, it is primed here on first use.
    pub async fn run(
        &mut self,
        tokenizer_name: &str,
        function: Arc<Function>,
        bindings: HashMap<String, Variable>,
        app_id: AppId,
    ) -> Result<RunReport, ParrotError> {
        let start = Instant::now();
        let session_id = self.id_pool.allocate()?;

        let (context_id, parent_context_id) = match self.setup_context(tokenizer_name, &function).await {
            Ok(ids) => ids,
            Err(e) => {
                self.id_pool.free(session_id);
                return Err(e);
            }
        };
        self.contexts.retain(context_id);

        let result = self
            .run_inner(
                tokenizer_name,
                &function,
                bindings,
                app_id,
                session_id,
                context_id,
                parent_context_id,
            )
            .await;

        self.teardown(session_id, context_id, result.is_ok()).await;

        result.map(|engine_id| RunReport {
            session_id,
            engine_id,
            elapsed: start.elapsed(),
        })
    }

    async fn setup_context(
        &mut self,
        tokenizer_name: &str,
        function: &Function,
    ) -> Result<(ContextId, Option<ContextId>), ParrotError> {
        if function.cached_prefix {
            let prefix_ctx = self.ensure_function_prefix_context(tokenizer_name, function).await?;
            let child = self.contexts.fork(prefix_ctx, ContextLifetime::Temporary);
            Ok((child, Some(prefix_ctx)))
        } else {
            Ok((self.contexts.create_root(ContextLifetime::Temporary), None))
        }
    }

    /// Pre-materialize every `cached_prefix` function's leading constant
    /// piece across every tokenizer-compatible engine, so individual calls
    /// can skip re-filling it and the dispatcher gets prefix affinity from
    /// the very first call (spec.md §6, §4.4 step 2). Call once per program
    /// before executing its calls; a function not covered here is primed
    /// lazily on its first `run()` instead.
    pub async fn cache_function_prefixes(
        &mut self,
        functions: &[(String, Arc<Function>)],
    ) -> Result<(), ParrotError> {
        for (tokenizer_name, function) in functions {
            if function.cached_prefix {
                self.ensure_function_prefix_context(tokenizer_name, function).await?;
            }
        }
        Ok(())
    }

    /// Tear down every cached function prefix context, issuing
    /// `free_context` to each engine it was materialized on, and forget it.
    /// Called unconditionally at program teardown, success or failure
    /// (spec.md §9 Open Question 1: "always release").
    pub async fn free_function_prefixes(&mut self) {
        let contexts: Vec<ContextId> = std::mem::take(&mut self.function_prefix)
            .into_values()
            .collect();
        for ctx in contexts {
            let Some(engines) = self.contexts.force_free(ctx) else {
                continue;
            };
            for engine_id in engines {
                if let Some(client) = self.engine_clients.get(&engine_id) {
                    if let Err(e) = client.free_context(&engine_id, ctx.raw() as u64).await {
                        tracing::warn!(
                            context_id = ctx.raw(),
                            %engine_id,
                            error = %e,
                            "cached function prefix did not free correctly"
                        );
                    }
                }
            }
        }
    }

    /// Return the already-cached prefix context for `(function, tokenizer)`,
    /// or fill it now: tokenize the function's leading constant piece and
    /// `fill` it onto every engine serving that tokenizer, marking each one
    /// materialized so dispatch sees prefix affinity immediately.
    async fn ensure_function_prefix_context(
        &mut self,
        tokenizer_name: &str,
        function: &Function,
    ) -> Result<ContextId, ParrotError> {
        let key = (function.name.clone(), tokenizer_name.to_string());
        if let Some(&ctx) = self.function_prefix.get(&key) {
            return Ok(ctx);
        }

        let tokenizer = self
            .executor
            .tokenizer(tokenizer_name)
            .ok_or_else(|| crate::errors::UserError::UnknownTokenizer(tokenizer_name.to_string()))?;
        let prefix_tokens = match function.body.first() {
            Some(crate::function::Piece::Constant(text)) => tokenizer.encode(text),
            _ => Vec::new(),
        };

        let ctx = self.contexts.create_root(ContextLifetime::Shared);
        if !prefix_tokens.is_empty() {
            let priming_session = self.id_pool.allocate()?;
            for engine_id in self.dispatcher.engine_ids_for_tokenizer(tokenizer_name) {
                let Some(client) = self.engine_clients.get(&engine_id).cloned() else {
                    continue;
                };
                match client
                    .fill(&engine_id, priming_session, ctx.raw() as u64, None, &prefix_tokens)
                    .await
                {
                    Ok(resp) if resp.num_filled_tokens == prefix_tokens.len() => {
                        self.contexts.mark_materialized(ctx, engine_id);
                        self.stats.record_fill(resp.num_filled_tokens as u64);
                    }
                    Ok(resp) => {
                        tracing::warn!(
                            function = %function.name,
                            %engine_id,
                            filled = resp.num_filled_tokens,
                            expected = prefix_tokens.len(),
                            "cached function prefix filled an unexpected token count"
                        );
                    }
                    Err(e) => {
                        tracing::warn!(
                            function = %function.name,
                            %engine_id,
                            error = %e,
                            "failed to materialize cached function prefix on engine"
                        );
                    }
                }
            }
            self.id_pool.free(priming_session);
        }

        self.function_prefix.insert(key, ctx);
        Ok(ctx)
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_inner(
        &mut self,
        tokenizer_name: &str,
        function: &Arc<Function>,
        bindings: HashMap<String, Variable>,
        app_id: AppId,
        session_id: SessionId,
        context_id: ContextId,
        parent_context_id: Option<ContextId>,
    ) -> Result<String, ParrotError> {
        let tokenizer = self
            .executor
            .tokenizer(tokenizer_name)
            .ok_or_else(|| DispatchError::NoFeasibleEngine { session_id })?;

        let mut input_tokens = 0u64;
        let mut max_gen_length = 0u64;
        let mut requests_num_upperbound = None;
        let mut upstream = Vec::new();

        for piece in &function.body {
            if let crate::function::Piece::Constant(text) = piece {
                input_tokens += tokenizer.encode(text).len() as u64;
            }
        }
        for (name, value) in &bindings {
            let Some(param) = function.parameter(name) else {
                continue;
            };
            match value {
                Variable::Constant(text) => {
                    input_tokens += tokenizer.encode(text).len() as u64;
                }
                Variable::Future { id, .. } => match param.direction {
                    crate::function::Direction::Input => {
                        if let Some(producer) = self.future_producers.get(id) {
                            upstream.push(*producer);
                        }
                    }
                    crate::function::Direction::Output => {
                        max_gen_length += param
                            .sampling
                            .as_ref()
                            .map(|s| s.max_gen_length as u64)
                            .unwrap_or(512);
                        requests_num_upperbound =
                            requests_num_upperbound.max(param.requests_num_upperbound);
                        self.future_producers.insert(*id, session_id);
                    }
                },
            }
        }

        let preferred_engines = parent_context_id
            .map(|p| self.contexts.cached_engines(p))
            .unwrap_or_default();
        let is_throughput = self
            .dispatcher
            .is_throughput_class_for(requests_num_upperbound);

        let max_queue_size = self.dispatcher.max_queue_size();
        self.dispatcher
            .push(PendingSession {
                session_id,
                tokenizer_name: tokenizer_name.to_string(),
                input_tokens,
                max_gen_length,
                requests_num_upperbound,
                upstream,
                preferred_engines,
            })
            .map_err(|_| {
                self.stats.record_queue_full();
                DispatchError::QueueFull { max_queue_size }
            })?;

        let dispatched = self.dispatcher.dispatch();
        let Some(placement) = dispatched.iter().find(|d| d.session_id == session_id) else {
            self.dispatcher.cancel(session_id);
            return Err(DispatchError::NoFeasibleEngine { session_id }.into());
        };
        let engine_index = placement.engine_id_index;
        let engine_id = self.dispatcher.engine_id(engine_index).to_string();
        let fill_chunk_size = self.dispatcher.engine(engine_index).fill_chunk_size;
        let token_demand = input_tokens + max_gen_length;

        self.stats.record_dispatch(&engine_id, 1, token_demand);
        self.active.insert(
            session_id,
            ActiveSession {
                context_id,
                engine_id: engine_id.clone(),
                token_demand,
                is_throughput,
            },
        );

        self.contexts.mark_materialized(context_id, engine_id.clone());
        if let Some(parent) = parent_context_id {
            self.contexts.mark_materialized(parent, engine_id.clone());
        }

        let mut session = Session::new(
            session_id,
            app_id,
            engine_id.clone(),
            tokenizer_name.to_string(),
            fill_chunk_size,
            context_id,
            parent_context_id,
        );

        // A true user-shared-context call (explicit read/write against a
        // caller-supplied shared context, spec.md §4.5) isn't implemented by
        // this crate — every `parent_context_id` here is a cached-prefix
        // fork, already primed by `ensure_function_prefix_context`, so the
        // leading constant piece should always be skipped for it.
        let in_shared_context = false;
        let call = Call {
            function: function.clone(),
            bindings,
            in_shared_context,
        };
        self.executor
            .translate_call(tokenizer_name, &call, &mut session)?;

        let client = self
            .engine_clients
            .get(&engine_id)
            .expect("dispatcher selected an engine with no registered client")
            .clone();
        let holders = self
            .executor
            .holders(tokenizer_name)
            .expect("tokenizer group validated above");

        session.run(client, holders, tokenizer, self.stats.clone()).await?;
        Ok(engine_id)
    }

    async fn teardown(&mut self, session_id: SessionId, context_id: ContextId, success: bool) {
        if let Some(active) = self.active.remove(&session_id) {
            self.dispatcher
                .remove_thread(session_id, active.token_demand, active.is_throughput);
            if success {
                self.stats
                    .record_completion(&active.engine_id, 1, active.token_demand);
            } else {
                self.stats.record_failure();
            }
        } else {
            self.dispatcher.remove_thread(session_id, 0, false);
            if !success {
                self.stats.record_failure();
            }
        }
        self.id_pool.free(session_id);

        if let Some(engines_to_free) = self.contexts.release(context_id) {
            self.stats.record_context_freed();
            for engine_id in engines_to_free {
                if let Some(client) = self.engine_clients.get(&engine_id) {
                    if let Err(e) = client.free_context(&engine_id, context_id.raw() as u64).await {
                        tracing::warn!(
                            context_id = context_id.raw(),
                            %engine_id,
                            error = %e,
                            "context did not free correctly"
                        );
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine_client::SimulatedEngineClient;
    use crate::function::{Parameter, Piece};
    use crate::instruction::SamplingParams;
    use crate::latency::LatencyProfile;
    use crate::tokenizer::BpeTokenizer;

    fn controller_with_one_engine() -> Controller {
        let engine = Engine::new("e0", "test", "sim://e0", 8, 1_000_000);
        let mut clients: HashMap<String, Arc<dyn EngineClient>> = HashMap::new();
        clients.insert(
            "e0".to_string(),
            Arc::new(SimulatedEngineClient::new(LatencyProfile::instant())),
        );
        let mut controller = Controller::new(vec![engine], clients, DispatcherConfig::default());
        controller.register_tokenizer("test", Arc::new(BpeTokenizer::new("test").unwrap()));
        controller
    }

    #[tokio::test]
    async fn run_simple_function_completes_and_frees_context() {
        let mut controller = controller_with_one_engine();
        let function = Arc::new(Function {
            name: "greet".into(),
            body: vec![
                Piece::Constant("Hello, ".into()),
                Piece::ParameterLoc("name".into()),
                Piece::ParameterLoc("reply".into()),
            ],
            parameters: vec![
                Parameter::input("name"),
                Parameter::output(
                    "reply",
                    SamplingParams {
                        max_gen_length: 4,
                        ..SamplingParams::default()
                    },
                ),
            ],
            cached_prefix: false,
        });
        let mut bindings = HashMap::new();
        bindings.insert("name".to_string(), Variable::Constant("world".into()));
        bindings.insert("reply".to_string(), Variable::new_future(Some("reply".into())));

        let report = controller
            .run("test", function, bindings, AppId::for_test(0))
            .await
            .unwrap();
        assert_eq!(report.engine_id, "e0");
        assert!(controller.active.is_empty());
    }

    #[tokio::test]
    async fn queue_full_rejected_before_context_leaks() {
        let engine = Engine::new("e0", "test", "sim://e0", 1, 10);
        let mut clients: HashMap<String, Arc<dyn EngineClient>> = HashMap::new();
        clients.insert(
            "e0".to_string(),
            Arc::new(SimulatedEngineClient::new(LatencyProfile::instant())),
        );
        let config = DispatcherConfig {
            max_queue_size: 0,
            ..DispatcherConfig::default()
        };
        let mut controller = Controller::new(vec![engine], clients, config);
        controller.register_tokenizer("test", Arc::new(BpeTokenizer::new("test").unwrap()));

        let function = Arc::new(Function {
            name: "f".into(),
            body: vec![Piece::Constant("hi".into())],
            parameters: vec![],
            cached_prefix: false,
        });

        let err = controller
            .run("test", function, HashMap::new(), AppId::for_test(0))
            .await
            .unwrap_err();
        assert!(matches!(err, ParrotError::Dispatch(DispatchError::QueueFull { .. })));
    }

    #[tokio::test]
    async fn cache_function_prefixes_fills_once_then_free_tears_it_down() {
        let mut controller = controller_with_one_engine();
        let function = Arc::new(Function {
            name: "templated".into(),
            body: vec![
                Piece::Constant("You are a helpful assistant. ".into()),
                Piece::ParameterLoc("name".into()),
            ],
            parameters: vec![Parameter::input("name")],
            cached_prefix: true,
        });

        controller
            .cache_function_prefixes(&[("test".to_string(), function.clone())])
            .await
            .unwrap();
        let after_cache = controller.stats.snapshot().tokens_filled;
        assert!(after_cache > 0, "the leading constant piece should have been filled");

        for name in ["alice", "bob"] {
            let mut bindings = HashMap::new();
            bindings.insert("name".to_string(), Variable::Constant(name.into()));
            controller
                .run("test", function.clone(), bindings, AppId::for_test(0))
                .await
                .unwrap();
        }

        // The prefix was materialized once at cache time; neither call
        // re-fills it, so the only additional fills are each call's "name".
        let tokenizer = BpeTokenizer::new("test").unwrap();
        let expected_additional =
            tokenizer.encode("alice").len() as u64 + tokenizer.encode("bob").len() as u64;
        let after_calls = controller.stats.snapshot().tokens_filled;
        assert_eq!(after_calls, after_cache + expected_additional);

        controller.free_function_prefixes().await;
        assert!(controller.function_prefix.is_empty());
    }
}
