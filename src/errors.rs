//! Error types for the session executor, dispatcher, and context model.
//!
//! Propagation follows spec.md §7: `UserError` surfaces synchronously at call
//! construction without aborting the runtime; `DispatchError` either keeps a
//! session pending (capacity) or returns to the caller (`QueueFull`); RPC
//! errors inside a session task are fatal and drive a fail-fast process exit.

use crate::ids::SessionId;

/// Bad function declaration or call-site misuse, raised synchronously.
#[derive(Debug, Clone, thiserror::Error)]
pub enum UserError {
    #[error("parameter `{0}` is declared as an output but was bound a caller-supplied value")]
    OutputBoundByCaller(String),
    #[error("placeholder for parameter `{0}` has conflicting fields: {1}")]
    ConflictingPlaceholderFields(String, String),
    #[error("call references unknown parameter `{0}`")]
    UnknownParameter(String),
    #[error("function `{0}` has no piece sequence")]
    EmptyFunctionBody(String),
    #[error("no tokenizer registered under the name `{0}`")]
    UnknownTokenizer(String),
}

/// Failure to place a session onto an engine.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DispatchError {
    #[error("dispatcher pending queue is full (max_queue_size={max_queue_size})")]
    QueueFull { max_queue_size: usize },
    #[error("no engine can host session {session_id:?} under current capacity/tokenizer constraints")]
    NoFeasibleEngine { session_id: SessionId },
}

/// Transport or protocol-level failure from an engine RPC.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineRpcError {
    #[error("transport error talking to engine {engine_id}: {message}")]
    Transport { engine_id: String, message: String },
    #[error("engine {engine_id} returned a protocol error: {message}")]
    Protocol { engine_id: String, message: String },
}

/// An internal invariant was violated — always a fatal, unrecoverable bug.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AssertionFailure {
    #[error(
        "session {session_id:?} instruction #{instruction_index}: filled {filled} tokens but expected {expected}"
    )]
    FillCountMismatch {
        session_id: SessionId,
        instruction_index: usize,
        filled: usize,
        expected: usize,
    },
    #[error("output holder for session {session_id:?} was already ready before generation started")]
    OutputHolderAlreadyReady { session_id: SessionId },
}

/// The recyclable id pool has no ids left to allocate.
#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("id pool exhausted (capacity={capacity})")]
pub struct PoolExhausted {
    pub capacity: usize,
}

/// Aggregate error type surfaced at the process boundary (`main.rs`, `run()`).
#[derive(Debug, thiserror::Error)]
pub enum ParrotError {
    #[error(transparent)]
    User(#[from] UserError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error(transparent)]
    EngineRpc(#[from] EngineRpcError),
    #[error(transparent)]
    Assertion(#[from] AssertionFailure),
    #[error(transparent)]
    Pool(#[from] PoolExhausted),
    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),
    #[error(transparent)]
    Fatal(#[from] FatalSessionError),
}

/// A fatal error raised inside a session's execution task, carrying the
/// context the diagnostic in spec.md §7 requires: session id and the
/// instruction index that triggered it.
#[derive(Debug, thiserror::Error)]
#[error("session {session_id:?} failed at instruction #{instruction_index}: {source}")]
pub struct FatalSessionError {
    pub session_id: SessionId,
    pub instruction_index: usize,
    #[source]
    pub source: SessionFailureCause,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionFailureCause {
    #[error(transparent)]
    EngineRpc(#[from] EngineRpcError),
    #[error(transparent)]
    Assertion(#[from] AssertionFailure),
}

impl FatalSessionError {
    pub fn new(
        session_id: SessionId,
        instruction_index: usize,
        source: impl Into<SessionFailureCause>,
    ) -> Self {
        Self {
            session_id,
            instruction_index,
            source: source.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_error_messages_are_actionable() {
        let err = DispatchError::QueueFull { max_queue_size: 16 };
        assert!(err.to_string().contains("16"));
    }

    #[test]
    fn fatal_session_error_reports_instruction_index() {
        let err = FatalSessionError::new(
            SessionId::for_test(3),
            2,
            EngineRpcError::Transport {
                engine_id: "e0".into(),
                message: "connection reset".into(),
            },
        );
        let msg = err.to_string();
        assert!(msg.contains("instruction #2"));
    }
}
