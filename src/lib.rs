//! # parrot-core
//!
//! The session executor, thread dispatcher, and context/data-holder model for
//! a serving layer that turns semantic-function calls into ordered
//! primitives (prefill, generate) dispatched across a pool of heterogeneous
//! inference backends.
//!
//! This crate owns:
//! - Translating a call into an ordered instruction sequence ([`executor`]).
//! - Per-call execution state, including streaming token flow between
//!   producer and consumer calls ([`session`], [`data_holder`]).
//! - Dispatching calls to engines under configurable policy — load
//!   balancing, DAG-awareness, prefix affinity, and app-FIFO — while
//!   enforcing per-engine capacity ([`dispatcher`]).
//! - The lifecycle of model-side contexts (KV-cache regions), including
//!   prefix sharing and safe reclamation ([`context`]).
//!
//! Out of scope, treated as external collaborators: the function template
//! parser, the tokenizer registry, the HTTP engine clients, process-level
//! auth, and the inference engine itself. [`tokenizer::Tokenizer`] and
//! [`engine_client::EngineClient`] are the seams to those collaborators;
//! this crate ships simulated implementations of both so it is exercisable
//! standalone.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use parrot_core::cli::{build_controller, run_program, Program};
//! use parrot_core::config::Config;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::from_file("engines.yaml")?;
//! let program = Program::from_file("program.yaml")?;
//! let mut controller = build_controller(&config);
//! let reports = run_program(&mut controller, &program).await?;
//! # Ok(())
//! # }
//! ```

pub mod cli;
pub mod config;
pub mod context;
pub mod controller;
pub mod data_holder;
pub mod dispatcher;
pub mod engine_client;
pub mod errors;
pub mod event;
pub mod executor;
pub mod function;
pub mod ids;
pub mod instruction;
pub mod latency;
pub mod session;
pub mod stats;
pub mod tokenizer;

pub use controller::{Controller, RunReport};
pub use dispatcher::{Dispatcher, DispatcherConfig, Engine};
pub use errors::ParrotError;
pub use stats::{new_shared_stats, SharedStats, Stats, StatsSnapshot};
