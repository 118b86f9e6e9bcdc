pub mod activations;
mod gradcheck;
mod han;
mod han_layer;
pub mod layers;
pub mod loss;
mod params;

pub use han::{FeatureDict, Han};
pub use han_layer::HanLayer;
pub use params::{GroupId, ParamSlab, Parameterized};

/// Whether a forward pass is part of training, dropout is only applied in `Train`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Train,
    Eval,
}
