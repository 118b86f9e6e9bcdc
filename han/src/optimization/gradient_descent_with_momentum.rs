use super::{Optimizer, check_sizes};
use crate::Result;

/// Gradient descent with a velocity term, `v = mu * v + g` and `p -= lr * v`.
#[derive(Debug)]
pub struct GradientDescentWithMomentum {
    learning_rate: f32,
    momentum: f32,
    velocity: Box<[f32]>,
}

impl GradientDescentWithMomentum {
    /// Creates a new `GradientDescentWithMomentum` optimizer.
    ///
    /// # Arguments
    /// * `len` - The size of the parameter group this instance updates.
    /// * `learning_rate` - The small coefficient that modulates the amount of training per update.
    /// * `momentum` - How much of the previous velocity is kept.
    ///
    /// # Returns
    /// A new `GradientDescentWithMomentum` starting at rest.
    pub fn new(len: usize, learning_rate: f32, momentum: f32) -> Self {
        Self {
            learning_rate,
            momentum,
            velocity: vec![0.; len].into_boxed_slice(),
        }
    }
}

impl Optimizer for GradientDescentWithMomentum {
    fn update_params(&mut self, grad: &[f32], params: &mut [f32]) -> Result<()> {
        check_sizes(self.velocity.len(), grad, params)?;

        let lr = self.learning_rate;
        let mu = self.momentum;

        for ((p, &g), v) in params.iter_mut().zip(grad).zip(self.velocity.iter_mut()) {
            *v = mu * *v + g;
            *p -= lr * *v;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn velocity_builds_up() {
        let mut optimizer = GradientDescentWithMomentum::new(1, 0.1, 0.5);
        let mut params = [0.0];

        optimizer.update_params(&[1.0], &mut params).unwrap();
        optimizer.update_params(&[1.0], &mut params).unwrap();

        // v1 = 1, v2 = 1.5
        assert!((params[0] + 0.25).abs() < 1e-6);
    }

    #[test]
    fn state_is_sized_per_group() {
        let mut optimizer = GradientDescentWithMomentum::new(2, 0.1, 0.5);
        let mut params = [0.0; 3];

        assert!(optimizer.update_params(&[1.0; 3], &mut params).is_err());
    }
}
