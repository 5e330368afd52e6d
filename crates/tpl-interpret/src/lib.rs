//! Reference tree-walking evaluator for the template toolkit.
//!
//! This backend executes the ATST directly, without identifier rewriting
//! or lowering. It is the semantic baseline the compiling backends are
//! tested against, and a usable engine in its own right for hosts that
//! render templates rarely enough that lowering does not pay off.

pub mod interpreter;
pub mod state;

pub use interpreter::{render, Flow, Interpreter};
pub use state::{BlockExec, InterpreterState};
