//! Mesh error types.
//!
//! Per-node failures (`Parse`, `Protocol`, `Communication`) are isolated by the graph
//! builder; only `NoReachableNodes` and `Cancelled` end a convergence run early.

use thiserror::Error;

pub type MeshResult<T> = Result<T, MeshError>;

/// A single membership line could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("malformed membership line ({reason}): {line:?}")]
pub struct ParseError {
    pub line: String,
    pub reason: String,
}

impl ParseError {
    pub fn new(line: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            line: line.into(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum MeshError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    /// The node answered, but the reply lacked required structure.
    #[error("protocol error from {node}: {reason}")]
    Protocol { node: String, reason: String },

    /// Connection, timeout or command failure talking to one node.
    #[error("communication error with {node}: {reason}")]
    Communication { node: String, reason: String },

    #[error("none of the {0} target nodes could be reached")]
    NoReachableNodes(usize),

    #[error("operation cancelled")]
    Cancelled,
}

impl MeshError {
    pub fn protocol(node: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Protocol {
            node: node.into(),
            reason: reason.into(),
        }
    }

    pub fn communication(node: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Communication {
            node: node.into(),
            reason: reason.into(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
