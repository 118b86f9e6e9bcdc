use std::{
    error::Error,
    fmt::{self, Display},
    io,
};

use hetgraph::GraphErr;
use ndarray::ShapeError;
use rand_distr::{NormalError, uniform::Error as UniformError};

use crate::arch::GroupId;

/// The result type used in the entire HAN module.
pub type Result<T> = std::result::Result<T, HanErr>;

/// The HAN module's error type.
#[derive(Debug)]
pub enum HanErr {
    SizeMismatch {
        what: &'static str,
        got: usize,
        expected: usize,
    },
    NodeOutOfBounds {
        id: usize,
        len: usize,
    },
    UnknownLabel {
        label: usize,
        classes: usize,
    },
    MissingForward(&'static str),
    UnregisteredGroup(GroupId),
    DuplicateGroup(GroupId),
    InvalidConfig(String),
    Init(String),
    Graph(GraphErr),
    Shape(ShapeError),
    Json(serde_json::Error),
    Io(io::Error),
}

impl Display for HanErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HanErr::SizeMismatch {
                what,
                got,
                expected,
            } => write!(
                f,
                "There's a size mismatch in {what}, got {got} and expected {expected}"
            ),
            HanErr::NodeOutOfBounds { id, len } => write!(
                f,
                "node {id} has no features, the feature matrix only has {len} rows"
            ),
            HanErr::UnknownLabel { label, classes } => {
                write!(f, "label {label} is not one of the {classes} classes")
            }
            HanErr::MissingForward(what) => {
                write!(f, "tried to run {what} backwards without a forward pass")
            }
            HanErr::UnregisteredGroup(id) => {
                write!(f, "parameter group {id} was never added to the optimizer")
            }
            HanErr::DuplicateGroup(id) => {
                write!(f, "parameter group {id} was already added to the optimizer")
            }
            HanErr::InvalidConfig(msg) => write!(f, "invalid config: {msg}"),
            HanErr::Init(msg) => write!(f, "failed to initialize parameters: {msg}"),
            HanErr::Graph(e) => write!(f, "graph error: {e}"),
            HanErr::Shape(e) => write!(f, "shape error: {e}"),
            HanErr::Json(e) => write!(f, "json error: {e}"),
            HanErr::Io(e) => write!(f, "io error: {e}"),
        }
    }
}

impl Error for HanErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            HanErr::Graph(e) => Some(e),
            HanErr::Shape(e) => Some(e),
            HanErr::Json(e) => Some(e),
            HanErr::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<GraphErr> for HanErr {
    fn from(value: GraphErr) -> Self {
        Self::Graph(value)
    }
}

impl From<ShapeError> for HanErr {
    fn from(value: ShapeError) -> Self {
        Self::Shape(value)
    }
}

impl From<NormalError> for HanErr {
    fn from(value: NormalError) -> Self {
        Self::Init(value.to_string())
    }
}

impl From<UniformError> for HanErr {
    fn from(value: UniformError) -> Self {
        Self::Init(value.to_string())
    }
}

impl From<serde_json::Error> for HanErr {
    fn from(value: serde_json::Error) -> Self {
        Self::Json(value)
    }
}

impl From<io::Error> for HanErr {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

/// Boundary conversion for binaries.
impl From<HanErr> for io::Error {
    fn from(value: HanErr) -> Self {
        match value {
            HanErr::Io(e) => e,
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}
