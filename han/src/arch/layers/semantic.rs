use ndarray::prelude::*;
use rand::Rng;

use super::Dense;
use crate::{HanErr, Result, arch::activations::ActFn};

/// Fuses the embeddings produced for every metapath into one.
///
/// Each embedding is scored by `q . tanh(z W + b)`, the scores are averaged over the nodes and
/// turned into weights with a softmax across metapaths. The output is the weighted sum of the
/// embeddings.
#[derive(Clone, Debug)]
pub struct SemanticAttention {
    in_size: usize,
    project: Dense,
    score: Dense,

    // Forward metadata
    z: Option<Array2<f32>>,
    beta: Option<Array1<f32>>,
}

impl SemanticAttention {
    /// Creates a new `SemanticAttention`.
    ///
    /// # Arguments
    /// * `in_size` - The size of the metapath embeddings.
    /// * `hidden_size` - The size of the projection the scores are computed on.
    pub fn new(in_size: usize, hidden_size: usize) -> Self {
        Self {
            in_size,
            project: Dense::new((in_size, hidden_size), Some(ActFn::tanh())),
            score: Dense::without_bias((hidden_size, 1), None),
            z: None,
            beta: None,
        }
    }

    pub fn size(&self) -> usize {
        self.project.size() + self.score.size()
    }

    pub fn init<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<Vec<f32>> {
        let mut params = self.project.init(rng)?;
        params.extend(self.score.init(rng)?);
        Ok(params)
    }

    /// Returns the metapath weights of the last forward pass.
    pub fn last_weights(&self) -> Option<ArrayView1<'_, f32>> {
        self.beta.as_ref().map(|beta| beta.view())
    }

    /// Makes a forward pass.
    ///
    /// # Arguments
    /// * `params` - This layer's parameters.
    /// * `zs` - One `(nodes, in_size)` embedding per metapath, all over the same nodes.
    ///
    /// # Returns
    /// The fused `(nodes, in_size)` embedding.
    pub fn forward(&mut self, params: &[f32], zs: &[Array2<f32>]) -> Result<Array2<f32>> {
        let Some(first) = zs.first() else {
            return Err(HanErr::SizeMismatch {
                what: "semantic attention inputs",
                got: 0,
                expected: 1,
            });
        };

        let n = first.nrows();
        for z in zs {
            if z.dim() != (n, self.in_size) {
                return Err(HanErr::SizeMismatch {
                    what: "metapath embedding",
                    got: z.len(),
                    expected: n * self.in_size,
                });
            }
        }

        let (project_params, score_params) = self.split(params)?;
        let views: Vec<_> = zs.iter().map(|z| z.view()).collect();
        let stacked = ndarray::concatenate(Axis(0), &views)?;

        let hidden = self.project.forward(project_params, stacked.view())?;
        let scores = self.score.forward(score_params, hidden.view())?;

        let w = Array1::from_shape_fn(zs.len(), |m| match n {
            0 => 0.,
            _ => scores.slice(s![m * n..(m + 1) * n, 0]).sum() / n as f32,
        });
        let beta = softmax(&w);

        let mut out = Array2::zeros((n, self.in_size));
        for (z, &b) in zs.iter().zip(&beta) {
            out.scaled_add(b, z);
        }

        self.z = Some(stacked);
        self.beta = Some(beta);

        Ok(out)
    }

    /// Makes a backward pass, **accumulating** the gradient of the parameters onto `grad`.
    ///
    /// # Returns
    /// The gradient of the loss with respect to every metapath embedding, in the forward order.
    pub fn backward(
        &mut self,
        params: &[f32],
        grad: &mut [f32],
        d: ArrayView2<f32>,
    ) -> Result<Vec<Array2<f32>>> {
        let (nmetapaths, n) = self.check_backward(params.len(), grad.len(), d.dim())?;
        let z = self.z.take().ok_or(HanErr::MissingForward("semantic attention"))?;
        let beta = self
            .beta
            .as_ref()
            .ok_or(HanErr::MissingForward("semantic attention"))?;

        let block = |m: usize| z.slice(s![m * n..(m + 1) * n, ..]);

        let d_beta = Array1::from_shape_fn(nmetapaths, |m| (&block(m) * &d).sum());
        let weighted = beta.dot(&d_beta);
        let d_w = beta * &(&d_beta - weighted);

        let mut d_scores = Array2::zeros((nmetapaths * n, 1));
        for m in 0..nmetapaths {
            d_scores
                .slice_mut(s![m * n..(m + 1) * n, ..])
                .fill(d_w[m] / n as f32);
        }

        let (project_params, score_params) = self.split(params)?;
        let (project_grad, score_grad) = grad.split_at_mut(self.project.size());

        let d_hidden = self.score.backward(score_params, score_grad, d_scores)?;
        let dz = self.project.backward(project_params, project_grad, d_hidden)?;

        let d_zs = (0..nmetapaths)
            .map(|m| {
                let mut d_z = dz.slice(s![m * n..(m + 1) * n, ..]).to_owned();
                d_z.scaled_add(beta[m], &d);
                d_z
            })
            .collect();

        Ok(d_zs)
    }

    /// Checks that a backward pass can run, leaving the forward metadata untouched.
    ///
    /// # Returns
    /// The amount of metapaths and nodes of the last forward pass.
    pub(crate) fn check_backward(
        &self,
        params_len: usize,
        grad_len: usize,
        dim: (usize, usize),
    ) -> Result<(usize, usize)> {
        let (Some(z), Some(beta)) = (&self.z, &self.beta) else {
            return Err(HanErr::MissingForward("semantic attention"));
        };

        let nmetapaths = beta.len();
        let n = z.nrows() / nmetapaths;
        if dim != (n, self.in_size) {
            return Err(HanErr::SizeMismatch {
                what: "semantic attention output gradient",
                got: dim.0 * dim.1,
                expected: n * self.in_size,
            });
        }

        for (what, got) in [
            ("semantic attention parameters", params_len),
            ("semantic attention gradient", grad_len),
        ] {
            if got != self.size() {
                return Err(HanErr::SizeMismatch {
                    what,
                    got,
                    expected: self.size(),
                });
            }
        }

        let (score_len, project_len) = (self.score.size(), self.project.size());
        self.score.check_backward(score_len, score_len, (z.nrows(), 1))?;
        self.project
            .check_backward(project_len, project_len, (z.nrows(), self.project.dim().1))?;

        Ok((nmetapaths, n))
    }

    fn split<'a>(&self, params: &'a [f32]) -> Result<(&'a [f32], &'a [f32])> {
        if params.len() != self.size() {
            return Err(HanErr::SizeMismatch {
                what: "semantic attention parameters",
                got: params.len(),
                expected: self.size(),
            });
        }

        Ok(params.split_at(self.project.size()))
    }
}

fn softmax(w: &Array1<f32>) -> Array1<f32> {
    let max = w.fold(f32::NEG_INFINITY, |acc, &x| acc.max(x));
    let e = w.mapv(|x| (x - max).exp());
    let sum = e.sum();
    e / sum
}
