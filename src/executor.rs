//! Translates a bound call into a session's instruction sequence (spec.md
//! §4.4), grouping sessions by tokenizer the way
//! `original_source/parrot/vm/executor.py`'s `NativeExecutor` groups them
//! under one `dataholder_map` per tokenizer.

use crate::data_holder::DataHolder;
use crate::errors::UserError;
use crate::function::{Direction, Function, Piece};
use crate::instruction::{Instruction, Variable, VariableId};
use crate::session::Session;
use crate::tokenizer::Tokenizer;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Shared token-buffer registry every session dispatched to a given
/// tokenizer group reads and writes `Future`s through.
pub type HolderRegistry = Mutex<HashMap<VariableId, Arc<DataHolder>>>;

/// A call site: a function with its parameters bound to either constant
/// values or `Future`s.
pub struct Call {
    pub function: Arc<Function>,
    pub bindings: HashMap<String, Variable>,
    /// True if this call executes inside an already-materialized shared
    /// context (so the function's cached leading constant piece must still
    /// be emitted, rather than skipped as already-filled).
    pub in_shared_context: bool,
}

struct SubExecutor {
    tokenizer: Arc<dyn Tokenizer>,
    holders: Arc<HolderRegistry>,
}

/// Groups sessions by tokenizer and translates calls into instructions for
/// them (spec.md §4.4).
#[derive(Default)]
pub struct Executor {
    sub_executors: HashMap<String, SubExecutor>,
}

impl Executor {
    pub fn new() -> Self {
        Self {
            sub_executors: HashMap::new(),
        }
    }

    pub fn register_tokenizer(&mut self, tokenizer_name: impl Into<String>, tokenizer: Arc<dyn Tokenizer>) {
        self.sub_executors.insert(
            tokenizer_name.into(),
            SubExecutor {
                tokenizer,
                holders: Arc::new(Mutex::new(HashMap::new())),
            },
        );
    }

    pub fn holders(&self, tokenizer_name: &str) -> Option<Arc<HolderRegistry>> {
        self.sub_executors.get(tokenizer_name).map(|s| s.holders.clone())
    }

    pub fn tokenizer(&self, tokenizer_name: &str) -> Option<Arc<dyn Tokenizer>> {
        self.sub_executors.get(tokenizer_name).map(|s| s.tokenizer.clone())
    }

    /// Tokenize every constant piece of `function`'s body, keyed by piece
    /// index, leaving `ParameterLoc` slots as empty vectors. Returned rather
    /// than discarded (spec.md §9 Open Questions: `tokenize_all`), so
    /// callers can assert round-trip tokenization without re-deriving it.
    pub fn tokenize_pieces(&self, tokenizer_name: &str, function: &Function) -> Option<Vec<Vec<u32>>> {
        let sub = self.sub_executors.get(tokenizer_name)?;
        Some(
            function
                .body
                .iter()
                .map(|piece| match piece {
                    Piece::Constant(text) => sub.tokenizer.encode(text),
                    Piece::ParameterLoc(_) => Vec::new(),
                })
                .collect(),
        )
    }

    /// Translate `call` into `session`'s instruction queue.
    pub fn translate_call(
        &self,
        tokenizer_name: &str,
        call: &Call,
        session: &mut Session,
    ) -> Result<(), UserError> {
        let sub = self
            .sub_executors
            .get(tokenizer_name)
            .expect("session assigned to an engine with no registered tokenizer");
        let eos_token_id = sub.tokenizer.eos_token_id();
        let tokenized = self.tokenize_pieces(tokenizer_name, &call.function).unwrap();

        if call.function.body.is_empty() {
            return Err(UserError::EmptyFunctionBody(call.function.name.clone()));
        }

        for (i, piece) in call.function.body.iter().enumerate() {
            match piece {
                Piece::Constant(_) => {
                    let is_cached_leading_piece =
                        i == 0 && call.function.cached_prefix && !call.in_shared_context;
                    if is_cached_leading_piece {
                        continue;
                    }
                    session.push_instruction(Instruction::ConstantFill {
                        tokens: tokenized[i].clone(),
                    });
                }
                Piece::ParameterLoc(name) => {
                    let param = call
                        .function
                        .parameter(name)
                        .ok_or_else(|| UserError::UnknownParameter(name.clone()))?;
                    let value = call
                        .bindings
                        .get(name)
                        .ok_or_else(|| UserError::UnknownParameter(name.clone()))?;

                    match value {
                        Variable::Constant(text) => {
                            if param.direction == Direction::Output {
                                return Err(UserError::OutputBoundByCaller(name.clone()));
                            }
                            session.push_instruction(Instruction::ConstantFill {
                                tokens: sub.tokenizer.encode(text),
                            });
                        }
                        Variable::Future { id, .. } => match param.direction {
                            Direction::Input => {
                                if param.sampling.is_some() {
                                    return Err(UserError::ConflictingPlaceholderFields(
                                        name.clone(),
                                        "an input parameter cannot declare sampling params".into(),
                                    ));
                                }
                                session.push_instruction(Instruction::PlaceholderFill {
                                    input_holder: *id,
                                });
                            }
                            Direction::Output => {
                                let sampling = param
                                    .sampling
                                    .clone()
                                    .unwrap_or_default()
                                    .with_tokenizer_eos(eos_token_id);
                                session.push_instruction(Instruction::PlaceholderGeneration {
                                    output_holder: *id,
                                    sampling,
                                });
                            }
                        },
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextId;
    use crate::function::Parameter;
    use crate::ids::SessionId;
    use crate::instruction::{SamplingParams, FILL_NO_CHUNK};
    use crate::session::AppId;
    use crate::tokenizer::BpeTokenizer;

    fn executor_with_test_tokenizer() -> Executor {
        let mut executor = Executor::new();
        executor.register_tokenizer("test", Arc::new(BpeTokenizer::new("test").unwrap()));
        executor
    }

    fn new_session() -> Session {
        Session::new(
            SessionId::for_test(0),
            AppId::for_test(0),
            "e0",
            "test",
            FILL_NO_CHUNK,
            ContextId::raw_for_test(0),
            None,
        )
    }

    #[test]
    fn cached_prefix_skips_leading_constant_piece_outside_shared_context() {
        let executor = executor_with_test_tokenizer();
        let function = Arc::new(Function {
            name: "greet".into(),
            body: vec![
                Piece::Constant("prefix ".into()),
                Piece::ParameterLoc("name".into()),
            ],
            parameters: vec![Parameter::input("name")],
            cached_prefix: true,
        });
        let mut bindings = HashMap::new();
        bindings.insert("name".to_string(), Variable::Constant("world".into()));
        let call = Call {
            function,
            bindings,
            in_shared_context: false,
        };

        let mut session = new_session();
        executor.translate_call("test", &call, &mut session).unwrap();

        // Only one ConstantFill instruction should have been produced: the
        // bound "world" value. The cached leading piece was skipped.
        let count = session_instruction_count(&session);
        assert_eq!(count, 1);
    }

    fn session_instruction_count(session: &Session) -> usize {
        session.instruction_count_for_test()
    }

    #[test]
    fn output_parameter_bound_to_constant_is_rejected() {
        let executor = executor_with_test_tokenizer();
        let function = Arc::new(Function {
            name: "f".into(),
            body: vec![Piece::ParameterLoc("out".into())],
            parameters: vec![Parameter::output("out", SamplingParams::default())],
            cached_prefix: false,
        });
        let mut bindings = HashMap::new();
        bindings.insert("out".to_string(), Variable::Constant("nope".into()));
        let call = Call {
            function,
            bindings,
            in_shared_context: false,
        };

        let mut session = new_session();
        let err = executor.translate_call("test", &call, &mut session).unwrap_err();
        assert!(matches!(err, UserError::OutputBoundByCaller(_)));
    }

    #[test]
    fn output_future_gets_tokenizer_eos_appended() {
        let executor = executor_with_test_tokenizer();
        let function = Arc::new(Function {
            name: "f".into(),
            body: vec![Piece::ParameterLoc("out".into())],
            parameters: vec![Parameter::output("out", SamplingParams::default())],
            cached_prefix: false,
        });
        let future = Variable::new_future(Some("out".into()));
        let future_id = future.as_future_id().unwrap();
        let mut bindings = HashMap::new();
        bindings.insert("out".to_string(), future);
        let call = Call {
            function,
            bindings,
            in_shared_context: false,
        };

        let mut session = new_session();
        executor.translate_call("test", &call, &mut session).unwrap();

        let sampling = session.take_generation_sampling_for_test(future_id);
        assert!(sampling.unwrap().stop_token_ids.contains(&100257));
    }

    #[test]
    fn tokenize_pieces_returns_per_piece_dictionary() {
        let executor = executor_with_test_tokenizer();
        let function = Function {
            name: "f".into(),
            body: vec![
                Piece::Constant("hello".into()),
                Piece::ParameterLoc("x".into()),
            ],
            parameters: vec![Parameter::input("x")],
            cached_prefix: false,
        };
        let dict = executor.tokenize_pieces("test", &function).unwrap();
        assert_eq!(dict.len(), 2);
        assert!(!dict[0].is_empty());
        assert!(dict[1].is_empty());
    }
}
