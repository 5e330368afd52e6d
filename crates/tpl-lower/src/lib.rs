//! Lowering backend: rewrites the template tree into a flat host program
//! over generated identifiers, plus an executor for such programs.
//!
//! Lowering runs identifier tracking over the whole tree first, then
//! emits one statement list per template with explicit scope prologues
//! (entry aliases, hoisted function definitions, context lookups). The
//! result has no name resolution left in it: every variable reference is
//! a generated local, every context fetch is an explicit instruction.

pub mod host;
pub mod lower;
pub mod vm;

pub use host::Program;
pub use lower::{lower, LowerOptions};
pub use vm::render;
