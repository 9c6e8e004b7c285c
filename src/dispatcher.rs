//! Assigns pending sessions to engines under a configurable policy
//! (spec.md §4.3).
//!
//! DAG-dependency eligibility (a session may not dispatch before every
//! upstream producer it reads a `Future` from has itself dispatched or
//! completed) is an unconditional baseline — see spec.md §8 scenario S3,
//! which holds even with every policy flag off. `app_fifo` additionally
//! orders the eligible candidate set by arrival rank; `dag_aware` then picks
//! which engine an eligible candidate lands on. See DESIGN.md Open Question
//! 3 for the full precedence argument.

use crate::ids::SessionId;
use std::collections::{HashMap, HashSet, VecDeque};

/// A pending request to place one session on an engine.
#[derive(Debug, Clone)]
pub struct PendingSession {
    pub session_id: SessionId,
    pub tokenizer_name: String,
    /// Projected prefill tokens this session will submit.
    pub input_tokens: u64,
    /// Projected generation length; together with `input_tokens` this forms
    /// the token demand `engine.tokens_capacity` is checked against.
    pub max_gen_length: u64,
    /// Dispatch annotation from the function's output parameter (spec.md §6).
    pub requests_num_upperbound: Option<u32>,
    /// Sessions whose output this session reads via `PlaceholderFill`/
    /// `PlaceholderGeneration` — DAG predecessors for app-FIFO eligibility.
    pub upstream: Vec<SessionId>,
    /// Engines already hosting this session's context (prefix affinity,
    /// spec.md §4.3 step 2), most-preferred first.
    pub preferred_engines: Vec<String>,
}

impl PendingSession {
    pub fn token_demand(&self) -> u64 {
        self.input_tokens + self.max_gen_length
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DispatchedSession {
    pub session_id: SessionId,
    pub engine_id_index: usize,
}

/// Configuration for the dispatch policy (spec.md §4.3).
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub dag_aware: bool,
    pub app_fifo: bool,
    pub max_queue_size: usize,
    /// A session whose `requests_num_upperbound` is at least this value is
    /// "throughput-class" under `dag_aware`; below it (or unset), it is
    /// "latency-class".
    pub throughput_threshold: u32,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            dag_aware: false,
            app_fifo: false,
            max_queue_size: 1024,
            throughput_threshold: 16,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Engine {
    pub id: String,
    pub tokenizer_name: String,
    pub address: String,
    pub threads_capacity: usize,
    pub tokens_capacity: u64,
    pub requests_num_upperbound: Option<u32>,
    /// Fill-coalescing chunk size a session assigned to this engine should
    /// use (`instruction::FILL_NO_CHUNK` disables chunking entirely).
    pub fill_chunk_size: usize,
    assigned_threads: usize,
    assigned_tokens: u64,
    throughput_sessions: usize,
}

impl Engine {
    pub fn new(
        id: impl Into<String>,
        tokenizer_name: impl Into<String>,
        address: impl Into<String>,
        threads_capacity: usize,
        tokens_capacity: u64,
    ) -> Self {
        Self {
            id: id.into(),
            tokenizer_name: tokenizer_name.into(),
            address: address.into(),
            threads_capacity,
            tokens_capacity,
            requests_num_upperbound: None,
            fill_chunk_size: crate::instruction::FILL_NO_CHUNK,
            assigned_threads: 0,
            assigned_tokens: 0,
            throughput_sessions: 0,
        }
    }

    pub fn with_fill_chunk_size(mut self, fill_chunk_size: usize) -> Self {
        self.fill_chunk_size = fill_chunk_size;
        self
    }

    pub fn assigned_threads(&self) -> usize {
        self.assigned_threads
    }

    pub fn assigned_tokens(&self) -> u64 {
        self.assigned_tokens
    }

    fn remaining_threads(&self) -> usize {
        self.threads_capacity.saturating_sub(self.assigned_threads)
    }

    fn remaining_tokens(&self) -> u64 {
        self.tokens_capacity.saturating_sub(self.assigned_tokens)
    }

    fn fits(&self, demand: u64) -> bool {
        self.assigned_threads + 1 <= self.threads_capacity
            && self.assigned_tokens + demand <= self.tokens_capacity
    }
}

/// Error returned when a `push` would exceed `max_queue_size`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFull;

pub struct Dispatcher {
    config: DispatcherConfig,
    engines: Vec<Engine>,
    pending: VecDeque<(u64, PendingSession)>,
    next_arrival_rank: u64,
    assigned: HashMap<SessionId, usize>,
    completed: HashSet<SessionId>,
}

impl Dispatcher {
    pub fn new(config: DispatcherConfig, engines: Vec<Engine>) -> Self {
        Self {
            config,
            engines,
            pending: VecDeque::new(),
            next_arrival_rank: 0,
            assigned: HashMap::new(),
            completed: HashSet::new(),
        }
    }

    pub fn engine(&self, index: usize) -> &Engine {
        &self.engines[index]
    }

    pub fn engine_id(&self, index: usize) -> &str {
        &self.engines[index].id
    }

    /// Every engine's id accepting `tokenizer_name`, for priming a cached
    /// function prefix across the whole fleet before any call runs.
    pub fn engine_ids_for_tokenizer(&self, tokenizer_name: &str) -> Vec<String> {
        self.engines
            .iter()
            .filter(|e| e.tokenizer_name == tokenizer_name)
            .map(|e| e.id.clone())
            .collect()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn max_queue_size(&self) -> usize {
        self.config.max_queue_size
    }

    /// Accept a pending session. Fails with `QueueFull` once the pending
    /// queue would exceed `max_queue_size`.
    pub fn push(&mut self, session: PendingSession) -> Result<(), QueueFull> {
        if self.pending.len() >= self.config.max_queue_size {
            return Err(QueueFull);
        }
        let rank = self.next_arrival_rank;
        self.next_arrival_rank += 1;
        self.pending.push_back((rank, session));
        Ok(())
    }

    /// Withdraw a not-yet-dispatched session (e.g. a caller that wants
    /// immediate placement and treats "still pending" as `NoFeasibleEngine`).
    /// No-op if the session already dispatched or was never pushed.
    pub fn cancel(&mut self, session_id: SessionId) {
        self.pending.retain(|(_, s)| s.session_id != session_id);
    }

    /// Whether a session with this dispatch annotation is throughput-class
    /// under `dag_aware` packing (spec.md §4.3).
    pub fn is_throughput_class_for(&self, requests_num_upperbound: Option<u32>) -> bool {
        requests_num_upperbound
            .map(|n| n >= self.config.throughput_threshold)
            .unwrap_or(false)
    }

    fn is_eligible(&self, session: &PendingSession) -> bool {
        session
            .upstream
            .iter()
            .all(|up| self.assigned.contains_key(up) || self.completed.contains(up))
    }

    fn is_throughput_class(&self, session: &PendingSession) -> bool {
        session
            .requests_num_upperbound
            .map(|n| n >= self.config.throughput_threshold)
            .unwrap_or(false)
    }

    /// Select a feasible engine for `session`, honoring prefix affinity,
    /// tokenizer compatibility, capacity, and (if enabled) DAG-aware
    /// packing (spec.md §4.3 steps 1-4).
    fn select_engine(&self, session: &PendingSession) -> Option<usize> {
        let demand = session.token_demand();
        let tokenizer_ok = |e: &Engine| e.tokenizer_name == session.tokenizer_name;

        // Step 2: prefix affinity — prefer engines already hosting the
        // session's cached context, ties by lowest current load.
        if !session.preferred_engines.is_empty() {
            let mut best: Option<usize> = None;
            for preferred_id in &session.preferred_engines {
                for (idx, e) in self.engines.iter().enumerate() {
                    if &e.id != preferred_id || !tokenizer_ok(e) || !e.fits(demand) {
                        continue;
                    }
                    let better = match best {
                        None => true,
                        Some(cur) => e.assigned_threads < self.engines[cur].assigned_threads,
                    };
                    if better {
                        best = Some(idx);
                    }
                }
                if best.is_some() {
                    return best;
                }
            }
        }

        if self.config.dag_aware && self.is_throughput_class(session) {
            return self.select_throughput_engine(tokenizer_ok, demand);
        }
        if self.config.dag_aware {
            if let Some(idx) = self.select_latency_engine(tokenizer_ok, demand) {
                return Some(idx);
            }
        }

        // Step 3/4: most remaining threads_capacity, tie-broken by tokens.
        let mut best: Option<usize> = None;
        for (idx, e) in self.engines.iter().enumerate() {
            if !tokenizer_ok(e) || !e.fits(demand) {
                continue;
            }
            let score = (e.remaining_threads(), e.remaining_tokens());
            let is_better = match best {
                None => true,
                Some(cur) => {
                    let cur_score = (
                        self.engines[cur].remaining_threads(),
                        self.engines[cur].remaining_tokens(),
                    );
                    score > cur_score
                }
            };
            if is_better {
                best = Some(idx);
            }
        }
        best
    }

    fn select_throughput_engine(
        &self,
        tokenizer_ok: impl Fn(&Engine) -> bool,
        demand: u64,
    ) -> Option<usize> {
        let mut best: Option<usize> = None;
        for (idx, e) in self.engines.iter().enumerate() {
            if !tokenizer_ok(e) || !e.fits(demand) {
                continue;
            }
            let is_better = match best {
                None => true,
                Some(cur) => e.throughput_sessions > self.engines[cur].throughput_sessions,
            };
            if is_better {
                best = Some(idx);
            }
        }
        best
    }

    fn select_latency_engine(
        &self,
        tokenizer_ok: impl Fn(&Engine) -> bool,
        demand: u64,
    ) -> Option<usize> {
        let has_throughput_engine = self.engines.iter().any(|e| e.throughput_sessions > 0);
        let mut best: Option<usize> = None;
        for (idx, e) in self.engines.iter().enumerate() {
            if !tokenizer_ok(e) || !e.fits(demand) {
                continue;
            }
            if has_throughput_engine && e.throughput_sessions > 0 {
                continue;
            }
            let score = (e.remaining_threads(), e.remaining_tokens());
            let is_better = match best {
                None => true,
                Some(cur) => {
                    let cur_score = (
                        self.engines[cur].remaining_threads(),
                        self.engines[cur].remaining_tokens(),
                    );
                    score > cur_score
                }
            };
            if is_better {
                best = Some(idx);
            }
        }
        best
    }

    /// Assign as many eligible pending sessions to engines as current
    /// capacity allows. Returns the newly bound sessions; anything left
    /// over (ineligible, or no feasible engine) stays pending for the next
    /// call.
    pub fn dispatch(&mut self) -> Vec<DispatchedSession> {
        let mut candidates: Vec<(u64, PendingSession)> = self.pending.drain(..).collect();

        // Unconditional DAG-dependency eligibility gate.
        let (mut eligible, ineligible): (Vec<_>, Vec<_>) = candidates
            .drain(..)
            .partition(|(_, s)| self.is_eligible(s));

        if self.config.app_fifo {
            eligible.sort_by_key(|(rank, _)| *rank);
        }

        let mut results = Vec::new();
        let mut still_pending = Vec::new();

        for (rank, session) in eligible {
            match self.select_engine(&session) {
                Some(idx) => {
                    let demand = session.token_demand();
                    let is_throughput = self.is_throughput_class(&session);
                    let engine = &mut self.engines[idx];
                    engine.assigned_threads += 1;
                    engine.assigned_tokens += demand;
                    if is_throughput {
                        engine.throughput_sessions += 1;
                    }
                    self.assigned.insert(session.session_id, idx);
                    results.push(DispatchedSession {
                        session_id: session.session_id,
                        engine_id_index: idx,
                    });
                }
                None => still_pending.push((rank, session)),
            }
        }

        still_pending.extend(ineligible);
        self.pending = still_pending.into();
        results
    }

    /// Record that a dispatched session has finished, freeing its engine's
    /// accounted capacity. This also satisfies app-FIFO/DAG eligibility for
    /// any downstream consumer waiting on it (spec.md §4.3 step 5).
    pub fn remove_thread(&mut self, session_id: SessionId, token_demand: u64, was_throughput: bool) {
        if let Some(idx) = self.assigned.remove(&session_id) {
            let engine = &mut self.engines[idx];
            engine.assigned_threads = engine.assigned_threads.saturating_sub(1);
            engine.assigned_tokens = engine.assigned_tokens.saturating_sub(token_demand);
            if was_throughput {
                engine.throughput_sessions = engine.throughput_sessions.saturating_sub(1);
            }
        }
        self.completed.insert(session_id);
    }
}
