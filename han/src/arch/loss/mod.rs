mod cross_entropy;
mod loss_fn;

pub use cross_entropy::{CrossEntropy, one_hot};
pub use loss_fn::LossFn;
