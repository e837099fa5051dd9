//! Compiler error types

use thiserror::Error;

/// The single error kind the front end produces. Every variant carries
/// enough position information for a driver to point at the source.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CompileError {
    /// The grammar rejected the input
    #[error("syntax error at line {line}, column {column}: {message}")]
    Syntax {
        line: usize,
        column: usize,
        message: String,
    },

    /// The input parsed but violates a semantic constraint
    #[error("error at line {line}, column {column} near '{fragment}': {message}")]
    Semantic {
        line: usize,
        column: usize,
        fragment: String,
        message: String,
    },

    /// A parse tree node was missing a child the grammar guarantees
    #[error("malformed parse tree: expected {0}")]
    MissingNode(String),
}

pub type ParseResult<T> = Result<T, CompileError>;
