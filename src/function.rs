//! Function declarations consumed from the program layer (spec.md §6). The
//! template parser that produces these is out of scope (spec.md §1); this
//! module only models the shape the Executor consumes.

use crate::instruction::SamplingParams;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Input,
    Output,
}

/// A named hole in a function's prompt template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    pub direction: Direction,
    #[serde(default)]
    pub sampling: Option<SamplingParams>,
    /// Dispatch annotation: an estimate of how many requests this parameter's
    /// generation will fan out into downstream, used by the dag_aware policy
    /// to classify a session as throughput- vs. latency-class (spec.md §4.3).
    /// Mirrors `original_source`'s `DispatchAnnotation.requests_num_upperbound`,
    /// defaulting to `None` (treated as latency-class) when a function
    /// doesn't declare it.
    #[serde(default)]
    pub requests_num_upperbound: Option<u32>,
}

impl Parameter {
    pub fn input(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            direction: Direction::Input,
            sampling: None,
            requests_num_upperbound: None,
        }
    }

    pub fn output(name: impl Into<String>, sampling: SamplingParams) -> Self {
        Self {
            name: name.into(),
            direction: Direction::Output,
            sampling: Some(sampling),
            requests_num_upperbound: None,
        }
    }

    pub fn with_requests_num_upperbound(mut self, upperbound: u32) -> Self {
        self.requests_num_upperbound = Some(upperbound);
        self
    }
}

/// One piece of a function's body: fixed text, or a reference to a
/// parameter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Piece {
    Constant(String),
    ParameterLoc(String),
}

/// A semantic function declaration: a templated prompt with typed holes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Function {
    pub name: String,
    pub body: Vec<Piece>,
    pub parameters: Vec<Parameter>,
    /// Whether this function's constant leading segment is cached as a
    /// shared prefix context (spec.md §4.4 step 2, §4.5).
    #[serde(default)]
    pub cached_prefix: bool,
}

impl Function {
    pub fn parameter(&self, name: &str) -> Option<&Parameter> {
        self.parameters.iter().find(|p| p.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialize_then_deserialize_preserves_body_and_directions() {
        let func = Function {
            name: "greet".into(),
            body: vec![
                Piece::Constant("Hello, ".into()),
                Piece::ParameterLoc("name".into()),
                Piece::Constant("! Say something: ".into()),
                Piece::ParameterLoc("reply".into()),
            ],
            parameters: vec![
                Parameter::input("name"),
                Parameter::output("reply", SamplingParams::default()),
            ],
            cached_prefix: false,
        };

        let json = serde_json::to_string(&func).unwrap();
        let restored: Function = serde_json::from_str(&json).unwrap();

        assert_eq!(restored.body.len(), func.body.len());
        assert_eq!(restored.parameters.len(), func.parameters.len());
        assert_eq!(
            restored.parameter("reply").unwrap().direction,
            Direction::Output
        );
        assert_eq!(
            restored.parameter("name").unwrap().direction,
            Direction::Input
        );
    }

    #[test]
    fn requests_num_upperbound_defaults_to_none() {
        let p = Parameter::input("a");
        assert_eq!(p.requests_num_upperbound, None);
    }
}
