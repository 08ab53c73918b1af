use thiserror::Error;

use crate::ir::NodeId;

/// Errors raised while building, matching or rewriting a graph.
#[derive(Debug, Error)]
pub enum Error {
    /// Structural corruption, e.g. a consumer left without a producer.
    #[error("invalid graph{}: {reason}", fmt_node(.node))]
    InvalidGraph {
        node: Option<NodeId>,
        reason: String,
    },

    /// A precondition rejected a match. Passes skip the match and continue.
    #[error("unsupported configuration at node {node}: {reason}")]
    UnsupportedConfiguration { node: NodeId, reason: String },

    /// Declared shapes disagree with the shapes implied by op attributes.
    #[error("shape mismatch at node {node}: {reason}")]
    ShapeMismatch { node: NodeId, reason: String },

    /// Missing or malformed attribute value.
    #[error("attribute `{name}` of node {node}: {reason}")]
    Attribute {
        node: NodeId,
        name: String,
        reason: String,
    },

    #[error("unknown pass `{0}`")]
    UnknownPass(String),

    #[error("program parse error: {0}")]
    Parse(String),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

fn fmt_node(node: &Option<NodeId>) -> String {
    match node {
        Some(id) => format!(" at node {id}"),
        None => String::new(),
    }
}

impl Error {
    pub(crate) fn invalid(node: Option<NodeId>, reason: impl Into<String>) -> Self {
        Error::InvalidGraph {
            node,
            reason: reason.into(),
        }
    }

    /// True for errors a pass may recover from by skipping the offending match.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::UnsupportedConfiguration { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
