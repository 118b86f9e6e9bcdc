use std::fmt::{self, Display};

use hetgraph::Metapath;
use rayon::prelude::*;

/// Identifies a group of parameters that an optimizer updates as a unit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum GroupId {
    /// The final classification layer.
    Predict,
    /// The semantic attention of a HAN layer.
    Semantic { layer: usize },
    /// The graph attention sublayer of a HAN layer for one metapath.
    Gat { layer: usize, metapath: Metapath },
}

impl Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GroupId::Predict => write!(f, "predict"),
            GroupId::Semantic { layer } => write!(f, "layer{layer}/semantic"),
            GroupId::Gat { layer, metapath } => write!(f, "layer{layer}/gat/{metapath}"),
        }
    }
}

/// A flat buffer of parameters and the gradient accumulated for them.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamSlab {
    pub params: Vec<f32>,
    pub grad: Vec<f32>,
}

impl ParamSlab {
    /// Creates a new `ParamSlab` with a zeroed gradient.
    pub fn new(params: Vec<f32>) -> Self {
        Self {
            grad: vec![0.0; params.len()],
            params,
        }
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }
}

/// Something owning groups of trainable parameters.
pub trait Parameterized {
    /// Returns the id and size of every parameter group.
    fn param_groups(&self) -> Vec<(GroupId, usize)>;

    /// Returns every parameter group for in place updates.
    fn groups_mut(&mut self) -> Vec<(GroupId, &mut ParamSlab)>;

    /// Zeroes out the gradient of every group.
    fn zero_grad(&mut self) {
        self.groups_mut()
            .into_par_iter()
            .for_each(|(_, slab)| slab.grad.fill(0.0));
    }
}
