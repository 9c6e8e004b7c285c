//! Thin orchestration glue used by `main.rs`: loads a [`Config`], builds a
//! [`Controller`], and runs a small declarative program end-to-end. Mirrors
//! the teacher's `cli::run_server` naming without the HTTP surface — the
//! "server" here is the in-process dispatch loop, not a network listener.
//!
//! The program format below is *not* the function-template language from
//! spec.md §1 (that parser is out of scope); it is just enough piece/
//! parameter/binding structure to drive the Executor/Dispatcher/Session
//! pipeline end-to-end for manual smoke-testing (spec.md §9 Design Notes,
//! SPEC_FULL.md §8.4).

use crate::config::Config;
use crate::controller::{Controller, RunReport};
use crate::engine_client::{EngineClient, SimulatedEngineClient};
use crate::errors::ParrotError;
use crate::function::{Direction, Function, Parameter, Piece};
use crate::instruction::{SamplingParams, Variable, FUTURE_MAGIC_HEADER};
use crate::session::AppId;
use crate::tokenizer::{BpeTokenizer, Tokenizer};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

/// A declarative program: named function bodies plus an ordered sequence of
/// calls against them. Loaded from YAML alongside a [`Config`].
#[derive(Debug, Clone, Deserialize)]
pub struct Program {
    pub functions: HashMap<String, FunctionSpec>,
    pub calls: Vec<CallSpec>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FunctionSpec {
    #[serde(default)]
    pub cached_prefix: bool,
    #[serde(default)]
    pub parameters: Vec<ParameterSpec>,
    /// Body pieces: a leading `$` marks a parameter reference (e.g. `"$name"`
    /// emits `Piece::ParameterLoc("name")`); everything else is a constant.
    pub body: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ParameterSpec {
    pub name: String,
    pub direction: DirectionSpec,
    #[serde(default)]
    pub sampling: Option<SamplingParams>,
    #[serde(default)]
    pub requests_num_upperbound: Option<u32>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DirectionSpec {
    Input,
    Output,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CallSpec {
    pub function: String,
    pub tokenizer: String,
    /// Parameter name -> raw binding. A value prefixed with
    /// [`FUTURE_MAGIC_HEADER`] names a `Future`: declaring one under an
    /// output parameter registers it for later calls to bind as input under
    /// the same name; everything else is a plain constant string.
    #[serde(default)]
    pub bindings: HashMap<String, String>,
}

impl Program {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ProgramError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ProgramError::Io(e.to_string()))?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self, ProgramError> {
        serde_yaml::from_str(yaml).map_err(|e| ProgramError::Parse(e.to_string()))
    }

    fn compile_function(name: &str, spec: &FunctionSpec) -> Function {
        let body = spec
            .body
            .iter()
            .map(|piece| match piece.strip_prefix('$') {
                Some(param_name) => Piece::ParameterLoc(param_name.to_string()),
                None => Piece::Constant(piece.clone()),
            })
            .collect();
        let parameters = spec
            .parameters
            .iter()
            .map(|p| {
                let mut param = match p.direction {
                    DirectionSpec::Input => Parameter::input(&p.name),
                    DirectionSpec::Output => {
                        Parameter::output(&p.name, p.sampling.clone().unwrap_or_default())
                    }
                };
                if let Some(upperbound) = p.requests_num_upperbound {
                    param = param.with_requests_num_upperbound(upperbound);
                }
                param
            })
            .collect();
        Function {
            name: name.to_string(),
            body,
            parameters,
            cached_prefix: spec.cached_prefix,
        }
    }
}

/// Errors loading or running a demo [`Program`]; kept separate from
/// [`ParrotError`] since this is CLI-demo surface, not core semantics.
#[derive(Debug, thiserror::Error)]
pub enum ProgramError {
    #[error("failed to read program file: {0}")]
    Io(String),
    #[error("failed to parse program: {0}")]
    Parse(String),
    #[error("call references unknown function `{0}`")]
    UnknownFunction(String),
    #[error("input parameter `{0}` binds future `{1}`, which no prior call produced")]
    DanglingFuture(String, String),
    #[error(transparent)]
    Core(#[from] ParrotError),
}

/// Build a [`Controller`] wired with a [`SimulatedEngineClient`] and a
/// [`BpeTokenizer`] per distinct tokenizer name declared in `config`.
pub fn build_controller(config: &Config) -> Controller {
    let mut clients: HashMap<String, Arc<dyn EngineClient>> = HashMap::new();
    let mut tokenizer_names = std::collections::HashSet::new();
    for engine in &config.engines {
        let latency = engine.latency.resolve();
        clients.insert(engine.id.clone(), Arc::new(SimulatedEngineClient::new(latency)));
        tokenizer_names.insert(engine.tokenizer.clone());
    }

    let mut controller = Controller::new(config.engines(), clients, config.dispatcher_config());
    for name in tokenizer_names {
        let tokenizer: Arc<dyn Tokenizer> = Arc::new(
            BpeTokenizer::new(name.clone()).expect("failed to initialize demo tokenizer"),
        );
        controller.register_tokenizer(name, tokenizer);
    }
    controller
}

/// Every distinct (function, tokenizer) pair in `program` whose function
/// declares `cached_prefix`, deduplicated, for priming via
/// [`Controller::cache_function_prefixes`] before the program's calls run.
fn cached_prefix_targets(program: &Program) -> Vec<(String, Arc<Function>)> {
    let mut seen = std::collections::HashSet::new();
    program
        .calls
        .iter()
        .filter_map(|call| {
            let spec = program.functions.get(&call.function)?;
            if !spec.cached_prefix {
                return None;
            }
            if !seen.insert((call.function.clone(), call.tokenizer.clone())) {
                return None;
            }
            Some((
                call.tokenizer.clone(),
                Arc::new(Program::compile_function(&call.function, spec)),
            ))
        })
        .collect()
}

/// Run every call in `program` against `controller` in order, threading
/// `Future` bindings between calls by name. Returns one [`RunReport`] per
/// call, in call order.
///
/// Brackets the run with the program-scoped prefix-cache lifecycle (spec.md
/// §6): every `cached_prefix` function's leading constant piece is primed
/// once up front, and every cached prefix is freed on the way out — success
/// or failure (spec.md §9 Open Question 1: "always release").
pub async fn run_program(
    controller: &mut Controller,
    program: &Program,
) -> Result<Vec<RunReport>, ProgramError> {
    controller
        .cache_function_prefixes(&cached_prefix_targets(program))
        .await?;
    let result = run_calls(controller, program).await;
    controller.free_function_prefixes().await;
    result
}

async fn run_calls(
    controller: &mut Controller,
    program: &Program,
) -> Result<Vec<RunReport>, ProgramError> {
    let app_id = AppId::fresh();
    let mut named_futures: HashMap<String, Variable> = HashMap::new();
    let mut reports = Vec::with_capacity(program.calls.len());

    for call in &program.calls {
        let spec = program
            .functions
            .get(&call.function)
            .ok_or_else(|| ProgramError::UnknownFunction(call.function.clone()))?;
        let function = Arc::new(Program::compile_function(&call.function, spec));

        let mut bindings = HashMap::new();
        for (param_name, raw) in &call.bindings {
            let Some(param) = function.parameter(param_name) else {
                continue;
            };
            let value = match raw.strip_prefix(FUTURE_MAGIC_HEADER) {
                Some(future_name) => match param.direction {
                    Direction::Output => {
                        let future = Variable::new_future(Some(future_name.to_string()));
                        named_futures.insert(future_name.to_string(), future.clone());
                        future
                    }
                    Direction::Input => named_futures.get(future_name).cloned().ok_or_else(|| {
                        ProgramError::DanglingFuture(param_name.clone(), future_name.to_string())
                    })?,
                },
                None => Variable::Constant(raw.clone()),
            };
            bindings.insert(param_name.clone(), value);
        }

        let report = controller
            .run(&call.tokenizer, function, bindings, app_id)
            .await?;
        reports.push(report);
    }

    Ok(reports)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn demo_config() -> Config {
        Config::from_yaml(
            r#"
engines:
  - id: e0
    tokenizer: demo
    threads_capacity: 4
    tokens_capacity: 100000
    latency:
      profile: instant
"#,
        )
        .unwrap()
    }

    fn demo_program() -> Program {
        Program::from_yaml(
            r#"
functions:
  greet:
    parameters:
      - { name: name, direction: input }
      - { name: reply, direction: output, sampling: { max_gen_length: 4 } }
    body:
      - "Hello, "
      - "$name"
      - "$reply"
calls:
  - function: greet
    tokenizer: demo
    bindings:
      name: "world"
      reply: "__parrot_future__reply"
"#,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn runs_a_simple_program_to_completion() {
        let mut controller = build_controller(&demo_config());
        let reports = run_program(&mut controller, &demo_program()).await.unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].engine_id, "e0");
    }

    #[tokio::test]
    async fn chained_calls_thread_futures_by_name() {
        let mut controller = build_controller(&demo_config());
        let program = Program::from_yaml(
            r#"
functions:
  ask:
    parameters:
      - { name: reply, direction: output, sampling: { max_gen_length: 3 } }
    body:
      - "Say hi: "
      - "$reply"
  echo:
    parameters:
      - { name: prior, direction: input }
      - { name: result, direction: output, sampling: { max_gen_length: 3 } }
    body:
      - "Echoing: "
      - "$prior"
      - "$result"
calls:
  - function: ask
    tokenizer: demo
    bindings:
      reply: "__parrot_future__reply"
  - function: echo
    tokenizer: demo
    bindings:
      prior: "__parrot_future__reply"
      result: "__parrot_future__result"
"#,
        )
        .unwrap();

        let reports = run_program(&mut controller, &program).await.unwrap();
        assert_eq!(reports.len(), 2);
    }

    #[tokio::test]
    async fn dangling_future_reference_is_rejected() {
        let mut controller = build_controller(&demo_config());
        let program = Program::from_yaml(
            r#"
functions:
  echo:
    parameters:
      - { name: prior, direction: input }
    body:
      - "$prior"
calls:
  - function: echo
    tokenizer: demo
    bindings:
      prior: "__parrot_future__never_produced"
"#,
        )
        .unwrap();

        let err = run_program(&mut controller, &program).await.unwrap_err();
        assert!(matches!(err, ProgramError::DanglingFuture(_, _)));
    }
}
