//! Core of the template toolkit.
//!
//! This crate holds everything the execution backends share: the abstract
//! template syntax tree (ATST), the runtime value model and its operators,
//! the configuration trait, the runtime-info bookkeeping, and the
//! identifier-tracking / frame-state machinery that decides how every name
//! in a template is stored, aliased or looked up.

#[macro_use]
pub mod macros;

pub mod config;
pub mod error;
pub mod fstate;
pub mod idents;
pub mod idtracking;
pub mod nodes;
pub mod ops;
pub mod runtime;
pub mod unpack;
pub mod value;

// Re-export commonly used items for convenience
pub use tracing;

pub type Error = crate::error::Error;
pub type Result<T> = crate::error::Result<T>;
