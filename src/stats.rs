//! Runtime metrics for the session executor and dispatcher.
//!
//! Structurally mirrors the teacher crate's `Stats`/`StatsSnapshot` pair
//! (atomic counters plus an `RwLock`-guarded map, exposed as a serializable
//! snapshot) but tracks this crate's own domain: sessions dispatched and
//! completed, tokens filled and generated, and per-engine load.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;

const ORDERING: Ordering = Ordering::Relaxed;

/// Global statistics tracker for a running `Controller`.
#[derive(Debug)]
pub struct Stats {
    start_time: Instant,

    pub sessions_dispatched: AtomicU64,
    pub sessions_completed: AtomicU64,
    pub sessions_failed: AtomicU64,

    pub tokens_filled: AtomicU64,
    pub tokens_generated: AtomicU64,

    pub contexts_freed: AtomicU64,
    pub queue_full_rejections: AtomicU64,

    engine_load: RwLock<HashMap<String, EngineLoad>>,
}

#[derive(Debug, Clone, Copy, Default)]
struct EngineLoad {
    assigned_threads: u64,
    assigned_tokens: u64,
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

impl Stats {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            sessions_dispatched: AtomicU64::new(0),
            sessions_completed: AtomicU64::new(0),
            sessions_failed: AtomicU64::new(0),
            tokens_filled: AtomicU64::new(0),
            tokens_generated: AtomicU64::new(0),
            contexts_freed: AtomicU64::new(0),
            queue_full_rejections: AtomicU64::new(0),
            engine_load: RwLock::new(HashMap::new()),
        }
    }

    pub fn record_dispatch(&self, engine_id: &str, threads: u64, tokens: u64) {
        self.sessions_dispatched.fetch_add(1, ORDERING);
        if let Ok(mut map) = self.engine_load.write() {
            let load = map.entry(engine_id.to_string()).or_default();
            load.assigned_threads += threads;
            load.assigned_tokens += tokens;
        }
    }

    pub fn record_completion(&self, engine_id: &str, threads: u64, tokens: u64) {
        self.sessions_completed.fetch_add(1, ORDERING);
        if let Ok(mut map) = self.engine_load.write() {
            if let Some(load) = map.get_mut(engine_id) {
                load.assigned_threads = load.assigned_threads.saturating_sub(threads);
                load.assigned_tokens = load.assigned_tokens.saturating_sub(tokens);
            }
        }
    }

    pub fn record_failure(&self) {
        self.sessions_failed.fetch_add(1, ORDERING);
    }

    pub fn record_fill(&self, num_tokens: u64) {
        self.tokens_filled.fetch_add(num_tokens, ORDERING);
    }

    pub fn record_generated(&self, num_tokens: u64) {
        self.tokens_generated.fetch_add(num_tokens, ORDERING);
    }

    pub fn record_context_freed(&self) {
        self.contexts_freed.fetch_add(1, ORDERING);
    }

    pub fn record_queue_full(&self) {
        self.queue_full_rejections.fetch_add(1, ORDERING);
    }

    pub fn uptime(&self) -> std::time::Duration {
        self.start_time.elapsed()
    }

    pub fn engine_load(&self) -> HashMap<String, (u64, u64)> {
        self.engine_load
            .read()
            .map(|m| {
                m.iter()
                    .map(|(k, v)| (k.clone(), (v.assigned_threads, v.assigned_tokens)))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            uptime_secs: self.uptime().as_secs(),
            sessions_dispatched: self.sessions_dispatched.load(ORDERING),
            sessions_completed: self.sessions_completed.load(ORDERING),
            sessions_failed: self.sessions_failed.load(ORDERING),
            tokens_filled: self.tokens_filled.load(ORDERING),
            tokens_generated: self.tokens_generated.load(ORDERING),
            contexts_freed: self.contexts_freed.load(ORDERING),
            queue_full_rejections: self.queue_full_rejections.load(ORDERING),
            engine_load: self.engine_load(),
        }
    }
}

/// A serializable snapshot of statistics.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct StatsSnapshot {
    pub uptime_secs: u64,
    pub sessions_dispatched: u64,
    pub sessions_completed: u64,
    pub sessions_failed: u64,
    pub tokens_filled: u64,
    pub tokens_generated: u64,
    pub contexts_freed: u64,
    pub queue_full_rejections: u64,
    pub engine_load: HashMap<String, (u64, u64)>,
}

pub type SharedStats = Arc<Stats>;

pub fn new_shared_stats() -> SharedStats {
    Arc::new(Stats::new())
}
