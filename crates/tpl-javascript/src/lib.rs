//! JavaScript source generation.
//!
//! Templates are lowered first; the generator then renders the lowered
//! program as a JavaScript module factory. The emitted source expects a
//! host runtime passed in as `rt` and a per-render state `rtstate`; the
//! runtime owns value semantics (truthiness, operators, escaping), the
//! generated code owns control flow and name plumbing.
//!
//! Not everything the other backends execute can be expressed here:
//! tuple unpacking, splatted call arguments and slicing report
//! [`tpl_core::error::Error::UnsupportedNode`].

pub mod generator;
pub mod writer;

pub use generator::{generate, generate_program};
pub use writer::JsWriter;
