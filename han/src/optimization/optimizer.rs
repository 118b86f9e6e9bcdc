use crate::{HanErr, Result};

/// Defines the strategy for updating a group of parameters based on its gradient.
pub trait Optimizer {
    /// Updates `params` in place using the accumulated gradient.
    ///
    /// # Arguments
    /// * `grad` - The gradient of the group.
    /// * `params` - The parameters to update.
    ///
    /// # Returns
    /// An error if the sizes of `grad`, `params` and the optimizer's state don't match.
    fn update_params(&mut self, grad: &[f32], params: &mut [f32]) -> Result<()>;
}

/// Checks that a gradient, its parameters and an optimizer's state all have `len` entries.
pub fn check_sizes(len: usize, grad: &[f32], params: &[f32]) -> Result<()> {
    for got in [grad.len(), params.len()] {
        if got != len {
            return Err(HanErr::SizeMismatch {
                what: "optimizer update",
                got,
                expected: len,
            });
        }
    }

    Ok(())
}
