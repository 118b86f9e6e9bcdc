use std::{
    error::Error,
    fmt::{self, Display},
};

/// The result type used in the entire graph module.
pub type Result<T> = std::result::Result<T, GraphErr>;

/// The graph module's error type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphErr {
    UnknownNodeType(String),
    UnknownEdgeType(String),
    DuplicateEdgeType(String),
    NodeOutOfBounds {
        what: &'static str,
        id: usize,
        len: usize,
    },
    SizeMismatch {
        what: &'static str,
        got: usize,
        expected: usize,
    },
    EmptyMetapath,
    DisconnectedMetapath {
        prev: String,
        next: String,
    },
    DuplicateSeed(usize),
}

impl Display for GraphErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GraphErr::UnknownNodeType(ntype) => write!(f, "unknown node type '{ntype}'"),
            GraphErr::UnknownEdgeType(etype) => write!(f, "unknown edge type '{etype}'"),
            GraphErr::DuplicateEdgeType(etype) => {
                write!(f, "edge type '{etype}' was already added to the graph")
            }
            GraphErr::NodeOutOfBounds { what, id, len } => {
                write!(f, "{what} id {id} is out of bounds, there are only {len}")
            }
            GraphErr::SizeMismatch {
                what,
                got,
                expected,
            } => write!(
                f,
                "There's a size mismatch in {what}, got {got} and expected {expected}"
            ),
            GraphErr::EmptyMetapath => write!(f, "a metapath needs at least one edge type"),
            GraphErr::DisconnectedMetapath { prev, next } => write!(
                f,
                "edge type '{next}' does not start where edge type '{prev}' ends"
            ),
            GraphErr::DuplicateSeed(id) => write!(f, "seed node {id} was given more than once"),
        }
    }
}

impl Error for GraphErr {}
