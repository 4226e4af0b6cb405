//! Signal intake: tokenizing, extraction, edit merging and validation.

mod config;
mod grammar;
mod heuristic;
mod interpreter;
mod lexer;
mod validator;

pub use config::{ConfidenceWeights, InterpreterConfig, ValidatorConfig};
pub use grammar::Extraction;
pub use interpreter::{confidence, Interpreter, SweepOutcome};
pub use validator::Validator;
