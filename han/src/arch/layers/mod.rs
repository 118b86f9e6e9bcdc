mod dense;
mod dropout;
mod gat;
mod semantic;

pub use dense::Dense;
pub(crate) use dropout::dropout_mask;
pub use gat::GatConv;
pub use semantic::SemanticAttention;
