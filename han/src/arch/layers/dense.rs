use ndarray::{linalg, prelude::*};
use rand::Rng;

use crate::{HanErr, Result, arch::activations::ActFn, init::RandWeightGen};

/// A fully connected layer, `act(x W + b)`.
///
/// The parameters are laid out as the `in x out` weights in row major order followed by the
/// biases, if any.
#[derive(Clone, Debug)]
pub struct Dense {
    dim: (usize, usize),
    bias: bool,
    act_fn: Option<ActFn>,
    size: usize,

    // Forward metadata
    x: Option<Array2<f32>>,
    z: Array2<f32>,
}

impl Dense {
    /// Creates a new `Dense` layer with biases.
    ///
    /// # Arguments
    /// * `dim` - The `(input, output)` sizes.
    /// * `act_fn` - The activation applied to the output, if any.
    pub fn new(dim: (usize, usize), act_fn: Option<ActFn>) -> Self {
        Self::with_bias(dim, act_fn, true)
    }

    /// Creates a new `Dense` layer that only has weights.
    pub fn without_bias(dim: (usize, usize), act_fn: Option<ActFn>) -> Self {
        Self::with_bias(dim, act_fn, false)
    }

    fn with_bias(dim: (usize, usize), act_fn: Option<ActFn>, bias: bool) -> Self {
        let size = dim.0 * dim.1 + if bias { dim.1 } else { 0 };

        Self {
            dim,
            bias,
            act_fn,
            size,
            x: None,
            z: Array2::zeros((0, dim.1)),
        }
    }

    /// Returns the size of this layer.
    ///
    /// # Returns
    /// The amount of parameters this layer has.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Returns the `(input, output)` sizes of this layer.
    pub fn dim(&self) -> (usize, usize) {
        self.dim
    }

    /// Draws a fresh set of parameters from `U(-1/sqrt(in), 1/sqrt(in))`.
    pub fn init<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<Vec<f32>> {
        Ok(RandWeightGen::fan_in_uniform(self.dim.0)?.sample(rng, self.size))
    }

    /// Makes a forward pass, keeping what the backward pass needs.
    ///
    /// # Arguments
    /// * `params` - This layer's parameters.
    /// * `x` - The input, one row per sample.
    ///
    /// # Returns
    /// The activated output or an error if the sizes don't match.
    pub fn forward(&mut self, params: &[f32], x: ArrayView2<f32>) -> Result<Array2<f32>> {
        if x.ncols() != self.dim.0 {
            return Err(HanErr::SizeMismatch {
                what: "dense input",
                got: x.ncols(),
                expected: self.dim.0,
            });
        }

        let (w, b) = self.view_params(params)?;
        let mut z = x.dot(&w);
        if let Some(b) = b {
            z += &b;
        }

        self.x = Some(x.to_owned());

        let a = match &self.act_fn {
            Some(act_fn) => z.mapv(|z| act_fn.f(z)),
            None => z.clone(),
        };
        self.z = z;

        Ok(a)
    }

    /// Makes a backward pass, **accumulating** the gradient of the parameters onto `grad`.
    ///
    /// # Arguments
    /// * `params` - This layer's parameters.
    /// * `grad` - This layer's gradient.
    /// * `d` - The gradient of the loss with respect to this layer's output.
    ///
    /// # Returns
    /// The gradient of the loss with respect to this layer's input.
    pub fn backward(
        &mut self,
        params: &[f32],
        grad: &mut [f32],
        mut d: Array2<f32>,
    ) -> Result<Array2<f32>> {
        self.check_backward(params.len(), grad.len(), d.dim())?;
        let x = self.x.take().ok_or(HanErr::MissingForward("dense"))?;

        if let Some(act_fn) = &self.act_fn {
            d.zip_mut_with(&self.z, |d, &z| *d *= act_fn.df(z));
        }

        let (mut dw, db) = self.view_grad(grad)?;
        linalg::general_mat_mul(1.0, &x.t(), &d, 1.0, &mut dw);
        if let Some(mut db) = db {
            db += &d.sum_axis(Axis(0));
        }

        let (w, _) = self.view_params(params)?;
        Ok(d.dot(&w.t()))
    }

    /// Checks that a backward pass with an output gradient of shape `dim` can run, leaving the
    /// forward metadata untouched.
    pub(crate) fn check_backward(
        &self,
        params_len: usize,
        grad_len: usize,
        dim: (usize, usize),
    ) -> Result<()> {
        if self.x.is_none() {
            return Err(HanErr::MissingForward("dense"));
        }

        self.check_len("dense parameters", params_len)?;
        self.check_len("dense gradient", grad_len)?;

        if dim != self.z.dim() {
            return Err(HanErr::SizeMismatch {
                what: "dense output gradient",
                got: dim.0 * dim.1,
                expected: self.z.len(),
            });
        }

        Ok(())
    }

    /// Gives a view of the raw gradient slice as the delta weights and delta biases of this layer.
    fn view_grad<'a>(
        &self,
        grad: &'a mut [f32],
    ) -> Result<(ArrayViewMut2<'a, f32>, Option<ArrayViewMut1<'a, f32>>)> {
        self.check_len("dense gradient", grad.len())?;

        let (dw_raw, db_raw) = grad.split_at_mut(self.dim.0 * self.dim.1);
        let dw = ArrayViewMut2::from_shape(self.dim, dw_raw)?;
        let db = match self.bias {
            true => Some(ArrayViewMut1::from_shape(self.dim.1, db_raw)?),
            false => None,
        };

        Ok((dw, db))
    }

    /// Gives a view of the raw parameter slice as the weights and biases of this layer.
    fn view_params<'a>(
        &self,
        params: &'a [f32],
    ) -> Result<(ArrayView2<'a, f32>, Option<ArrayView1<'a, f32>>)> {
        self.check_len("dense parameters", params.len())?;

        let (w_raw, b_raw) = params.split_at(self.dim.0 * self.dim.1);
        let w = ArrayView2::from_shape(self.dim, w_raw)?;
        let b = match self.bias {
            true => Some(ArrayView1::from_shape(self.dim.1, b_raw)?),
            false => None,
        };

        Ok((w, b))
    }

    fn check_len(&self, what: &'static str, got: usize) -> Result<()> {
        if got != self.size {
            return Err(HanErr::SizeMismatch {
                what,
                got,
                expected: self.size,
            });
        }

        Ok(())
    }
}
