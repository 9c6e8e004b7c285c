//! `DataHolder` — binds a [`Variable`](crate::instruction::Variable) to an
//! execution-side token buffer (spec.md §3, §4.1).

use crate::event::OneShotEvent;
use crate::instruction::{VariableId, STREAMING_END_TOKEN_ID};
use crate::tokenizer::Tokenizer;
use async_stream::stream;
use futures::{Stream, StreamExt};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

enum PipeMsg {
    Token(u32),
    End,
}

struct Inner {
    tokens: Vec<u32>,
    subscribers: Vec<mpsc::UnboundedSender<PipeMsg>>,
    ended: bool,
    text: String,
}

/// Runtime binding of a Variable to a streaming token buffer.
///
/// Invariant: at most one producer calls [`DataHolder::send_token`]; many
/// consumers may [`DataHolder::subscribe`].
pub struct DataHolder {
    variable_id: VariableId,
    tokenizer_name: String,
    inner: Mutex<Inner>,
    /// Fires once the producer begins emitting tokens.
    pub streaming_event: OneShotEvent,
    /// Fires once the producer has finished (after the END sentinel).
    pub ready_event: OneShotEvent,
    /// Fires once `detokenize` has consumed the whole stream.
    pub text_ready_event: OneShotEvent,
}

impl DataHolder {
    pub fn new(variable_id: VariableId, tokenizer_name: impl Into<String>) -> Self {
        Self {
            variable_id,
            tokenizer_name: tokenizer_name.into(),
            inner: Mutex::new(Inner {
                tokens: Vec::new(),
                subscribers: Vec::new(),
                ended: false,
                text: String::new(),
            }),
            streaming_event: OneShotEvent::new(),
            ready_event: OneShotEvent::new(),
            text_ready_event: OneShotEvent::new(),
        }
    }

    pub fn variable_id(&self) -> VariableId {
        self.variable_id
    }

    pub fn tokenizer_name(&self) -> &str {
        &self.tokenizer_name
    }

    /// Producer appends a token (if `put_into_holder`) and fans it out to
    /// subscribers. Passing `STREAMING_END_TOKEN_ID` signals end-of-stream;
    /// it is never appended to the token buffer, only fanned out.
    pub fn send_token(&self, token_id: u32, put_into_holder: bool) {
        let mut inner = self.inner.lock().unwrap();
        if token_id == STREAMING_END_TOKEN_ID {
            inner.subscribers.retain(|tx| tx.send(PipeMsg::End).is_ok());
            inner.ended = true;
            return;
        }
        if put_into_holder {
            inner.tokens.push(token_id);
        }
        inner
            .subscribers
            .retain(|tx| tx.send(PipeMsg::Token(token_id)).is_ok());
    }

    /// A snapshot of the tokens appended so far.
    pub fn tokens_snapshot(&self) -> Vec<u32> {
        self.inner.lock().unwrap().tokens.clone()
    }

    pub fn token_count(&self) -> usize {
        self.inner.lock().unwrap().tokens.len()
    }

    pub fn is_ready(&self) -> bool {
        self.ready_event.is_set()
    }

    pub async fn wait_streaming(&self) {
        self.streaming_event.wait().await;
    }

    pub async fn wait_ready(&self) {
        self.ready_event.wait().await;
    }

    pub fn set_text(&self, text: String) {
        self.inner.lock().unwrap().text = text;
    }

    pub fn text_snapshot(&self) -> String {
        self.inner.lock().unwrap().text.clone()
    }

    /// Returns a lazy sequence of token chunks for a consumer. Ordering is
    /// append order; the sequence terminates when the producer publishes
    /// `END`. A consumer that subscribes before the producer begins
    /// receives every token; a consumer that subscribes after the stream
    /// already ended drains the final backlog and terminates immediately.
    pub fn subscribe(self: &Arc<Self>) -> Pin<Box<dyn Stream<Item = u32> + Send>> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (backlog, already_ended) = {
            let mut inner = self.inner.lock().unwrap();
            if !inner.ended {
                inner.subscribers.push(tx);
            }
            (inner.tokens.clone(), inner.ended)
        };

        Box::pin(stream! {
            for token in backlog {
                yield token;
            }
            if already_ended {
                return;
            }
            while let Some(msg) = rx.recv().await {
                match msg {
                    PipeMsg::Token(t) => yield t,
                    PipeMsg::End => break,
                }
            }
        })
    }
}

/// Background task consuming a holder's pipe, producing incremental text
/// and marking the text buffer ready on completion (spec.md §4.1, §4.2).
pub async fn detokenize(holder: Arc<DataHolder>, tokenizer: Arc<dyn Tokenizer>) {
    let mut seen = Vec::new();
    let mut pipe = holder.subscribe();
    while let Some(token) = pipe.next().await {
        seen.push(token);
        if let Ok(text) = tokenizer.decode(&seen) {
            holder.set_text(text);
        }
    }
    holder.text_ready_event.set();
}
