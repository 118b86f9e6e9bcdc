use super::{Optimizer, check_sizes};
use crate::Result;

/// Adam, with bias corrected first and second moment estimates.
///
/// `m` holds the running mean of the gradient (the first moment) and `v` the running mean of
/// its square (the second moment), one entry per parameter of the group.
#[derive(Debug)]
pub struct Adam {
    learning_rate: f32,
    beta1: f32,
    beta2: f32,
    beta1_t: f32,
    beta2_t: f32,
    m: Box<[f32]>,
    v: Box<[f32]>,
    epsilon: f32,
}

impl Adam {
    /// Creates a new `Adam` optimizer.
    ///
    /// # Arguments
    /// * `len` - The size of the parameter group this instance updates.
    /// * `learning_rate` - The small coefficient that modulates the amount of training per update.
    /// * `beta1` - The decay rate of the first moment `m`.
    /// * `beta2` - The decay rate of the second moment `v`.
    /// * `epsilon` - Added to the denominator to keep the update finite.
    ///
    /// # Returns
    /// A new `Adam` with both moments zeroed.
    pub fn new(len: usize, learning_rate: f32, beta1: f32, beta2: f32, epsilon: f32) -> Self {
        Self {
            learning_rate,
            beta1,
            beta2,
            beta1_t: 1.,
            beta2_t: 1.,
            m: vec![0.; len].into_boxed_slice(),
            v: vec![0.; len].into_boxed_slice(),
            epsilon,
        }
    }
}

impl Optimizer for Adam {
    fn update_params(&mut self, grad: &[f32], params: &mut [f32]) -> Result<()> {
        check_sizes(self.m.len(), grad, params)?;

        let Self {
            learning_rate: lr,
            beta1: b1,
            beta2: b2,
            epsilon: eps,
            ..
        } = *self;

        self.beta1_t *= b1;
        self.beta2_t *= b2;
        let (bc1, bc2) = (1. - self.beta1_t, 1. - self.beta2_t);

        for (i, (p, &g)) in params.iter_mut().zip(grad).enumerate() {
            let m = &mut self.m[i];
            let v = &mut self.v[i];
            *m = b1 * *m + (1. - b1) * g;
            *v = b2 * *v + (1. - b2) * g * g;

            let (m_hat, v_hat) = (*m / bc1, *v / bc2);
            *p -= lr * m_hat / (v_hat.sqrt() + eps);
        }

        Ok(())
    }
}
