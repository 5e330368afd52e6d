use std::result;
use thiserror::Error;

/// Errors a host application is expected to be able to catch.
///
/// Internal-consistency failures (identifier tracking skipped, storing to a
/// name without a binding, assigning to a non-assignable node) are *not*
/// represented here; those are contract violations and panic.
#[derive(Error, Debug)]
pub enum Error {
    #[error("template not found: {}", tried.join(", "))]
    TemplateNotFound { tried: Vec<String> },
    #[error("block {0:?} is not registered")]
    BlockNotFound(String),
    #[error("block {name:?} has no executor at level {level} (chain depth {depth})")]
    BlockLevelOverflow {
        name: String,
        level: usize,
        depth: usize,
    },
    #[error("unpacking error: {0}")]
    Unpack(String),
    #[error("type error: {0}")]
    Type(String),
    #[error("filter {0:?} not found")]
    FilterNotFound(String),
    #[error("test {0:?} not found")]
    TestNotFound(String),
    #[error("{backend} backend cannot lower {node} nodes")]
    UnsupportedNode {
        backend: &'static str,
        node: &'static str,
    },
    #[error("Generic error: {0}")]
    Generic(eyre::Report),
}

pub type Result<T> = result::Result<T, Error>;

impl From<eyre::Report> for Error {
    fn from(err: eyre::Report) -> Self {
        Error::Generic(err)
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Generic(eyre::Report::msg(s))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Generic(eyre::Report::msg(e.to_string()))
    }
}

impl Error {
    /// True for the not-found condition that `include ignore missing`
    /// is allowed to swallow. Nothing else qualifies.
    pub fn is_template_not_found(&self) -> bool {
        matches!(self, Error::TemplateNotFound { .. })
    }
}
