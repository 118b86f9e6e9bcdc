use hetgraph::Block;
use ndarray::{Zip, linalg, prelude::*};
use rand::Rng;

use super::dropout_mask;
use crate::{
    HanErr, Result,
    arch::{Mode, activations::ActFn},
    init::{RELU_GAIN, RandWeightGen},
};

const NEGATIVE_SLOPE: f32 = 0.2;

struct GatParams<'a> {
    w: ArrayView2<'a, f32>,
    attn_l: ArrayView2<'a, f32>,
    attn_r: ArrayView2<'a, f32>,
    bias: ArrayView1<'a, f32>,
}

struct GatGrad<'a> {
    w: ArrayViewMut2<'a, f32>,
    attn_l: ArrayViewMut2<'a, f32>,
    attn_r: ArrayViewMut2<'a, f32>,
    bias: ArrayViewMut1<'a, f32>,
}

#[derive(Clone, Debug)]
struct GatCache {
    x: Array2<f32>,
    x_mask: Option<Array2<f32>>,
    feat: Array2<f32>,
    scores: Array2<f32>,
    alpha: Array2<f32>,
    alpha_mask: Option<Array2<f32>>,
}

/// Multi head graph attention convolution over a `Block`.
///
/// Every source is projected by `W`, each destination attends over its incoming edges with
/// `softmax(leaky_relu(<feat_u, attn_l> + <feat_v, attn_r>))` and sums up the projected
/// sources. Destinations without incoming edges only get the bias.
///
/// The parameters are laid out as `W (in x heads * out)`, `attn_l (heads x out)`,
/// `attn_r (heads x out)` and `bias (heads * out)`.
#[derive(Clone, Debug)]
pub struct GatConv {
    in_size: usize,
    out_size: usize,
    num_heads: usize,
    dropout: f32,
    act_fn: ActFn,
    size: usize,
    cache: Option<GatCache>,
}

impl GatConv {
    /// Creates a new `GatConv`.
    ///
    /// # Arguments
    /// * `in_size` - The size of the source features.
    /// * `out_size` - The size of the output of every head.
    /// * `num_heads` - The amount of attention heads.
    /// * `dropout` - The dropout probability of both the features and the attention weights.
    pub fn new(in_size: usize, out_size: usize, num_heads: usize, dropout: f32) -> Self {
        let hd = num_heads * out_size;

        Self {
            in_size,
            out_size,
            num_heads,
            dropout,
            act_fn: ActFn::leaky_relu(NEGATIVE_SLOPE),
            size: in_size * hd + 3 * hd,
            cache: None,
        }
    }

    /// Returns the amount of parameters this layer has.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Returns the size of the flattened output, `heads * out`.
    pub fn out_dim(&self) -> usize {
        self.num_heads * self.out_size
    }

    /// Draws a fresh set of parameters, Xavier normal for the projection and attention vectors
    /// and zeroed biases.
    pub fn init<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<Vec<f32>> {
        let hd = self.out_dim();

        let fc = RandWeightGen::xavier(self.in_size, hd, RELU_GAIN)?;
        let attn = RandWeightGen::xavier(hd, self.out_size, RELU_GAIN)?;

        let mut params = Vec::with_capacity(self.size);
        params.extend(fc.sample(rng, self.in_size * hd));
        params.extend(attn.sample(rng, hd));
        params.extend(attn.sample(rng, hd));
        params.extend(std::iter::repeat_n(0., hd));

        Ok(params)
    }

    /// Returns the attention weights of the last forward pass, one row per edge of the block and
    /// one column per head.
    pub fn last_attention(&self) -> Option<ArrayView2<'_, f32>> {
        self.cache.as_ref().map(|cache| cache.alpha.view())
    }

    /// Makes a forward pass over `block`.
    ///
    /// # Arguments
    /// * `params` - This layer's parameters.
    /// * `block` - The sampled edges.
    /// * `x` - The features of the block's source nodes, in the block's order.
    /// * `mode` - Dropout is only applied in training.
    /// * `rng` - The random source of the dropout masks.
    ///
    /// # Returns
    /// The `(dst nodes, heads * out)` embeddings or an error if the sizes don't match.
    pub fn forward<R: Rng + ?Sized>(
        &mut self,
        params: &[f32],
        block: &Block,
        x: ArrayView2<f32>,
        mode: Mode,
        rng: &mut R,
    ) -> Result<Array2<f32>> {
        if x.dim() != (block.num_src(), self.in_size) {
            return Err(HanErr::SizeMismatch {
                what: "gat input",
                got: x.len(),
                expected: block.num_src() * self.in_size,
            });
        }

        let p = self.view_params(params)?;
        let (nheads, out) = (self.num_heads, self.out_size);
        let (nsrc, ndst, nedges) = (block.num_src(), block.num_dst(), block.num_edges());

        let x_mask = dropout_mask(x.dim(), self.dropout, mode, rng);
        let x = match &x_mask {
            Some(mask) => &x * mask,
            None => x.to_owned(),
        };

        let feat = x.dot(&p.w);
        let feat3 = feat.view().into_shape_with_order((nsrc, nheads, out))?;
        let el = (&feat3 * &p.attn_l).sum_axis(Axis(2));
        let er = (&feat3.slice(s![..ndst, .., ..]) * &p.attn_r).sum_axis(Axis(2));

        let mut scores = Array2::zeros((nedges, nheads));
        let mut alpha = Array2::zeros((nedges, nheads));

        for v in 0..ndst {
            let offset = block.edge_offset(v);
            let srcs = block.in_edges(v);

            for h in 0..nheads {
                let mut max = f32::NEG_INFINITY;
                for (k, &u) in srcs.iter().enumerate() {
                    let s = el[[u, h]] + er[[v, h]];
                    scores[[offset + k, h]] = s;
                    max = max.max(self.act_fn.f(s));
                }

                let mut sum = 0.;
                for k in 0..srcs.len() {
                    let e = (self.act_fn.f(scores[[offset + k, h]]) - max).exp();
                    alpha[[offset + k, h]] = e;
                    sum += e;
                }

                for k in 0..srcs.len() {
                    alpha[[offset + k, h]] /= sum;
                }
            }
        }

        let alpha_mask = dropout_mask(alpha.dim(), self.dropout, mode, rng);
        let attn = match &alpha_mask {
            Some(mask) => &alpha * mask,
            None => alpha.clone(),
        };

        let mut rst = Array2::zeros((ndst, nheads * out));
        Zip::indexed(rst.rows_mut()).par_for_each(|v, mut row| {
            let offset = block.edge_offset(v);

            for (k, &u) in block.in_edges(v).iter().enumerate() {
                for h in 0..nheads {
                    let a = attn[[offset + k, h]];
                    let cols = h * out..(h + 1) * out;
                    row.slice_mut(s![cols.clone()])
                        .scaled_add(a, &feat.slice(s![u, cols]));
                }
            }
        });
        rst += &p.bias;

        self.cache = Some(GatCache {
            x,
            x_mask,
            feat,
            scores,
            alpha,
            alpha_mask,
        });

        Ok(rst)
    }

    /// Makes a backward pass, **accumulating** the gradient of the parameters onto `grad`.
    ///
    /// # Arguments
    /// * `params` - This layer's parameters.
    /// * `grad` - This layer's gradient.
    /// * `block` - The block used in the last forward pass.
    /// * `d` - The gradient of the loss with respect to the output.
    ///
    /// # Returns
    /// The gradient of the loss with respect to the source features.
    pub fn backward(
        &mut self,
        params: &[f32],
        grad: &mut [f32],
        block: &Block,
        d: ArrayView2<f32>,
    ) -> Result<Array2<f32>> {
        self.check_backward(params.len(), grad.len(), block, d.dim())?;
        let p = self.view_params(params)?;
        let mut g = self.view_grad(grad)?;
        let cache = self.cache.take().ok_or(HanErr::MissingForward("gat"))?;

        let (nheads, out) = (self.num_heads, self.out_size);
        let (nsrc, ndst, nedges) = (block.num_src(), block.num_dst(), block.num_edges());
        g.bias += &d.sum_axis(Axis(0));

        let feat = &cache.feat;
        let mut d_feat = Array2::<f32>::zeros((nsrc, nheads * out));
        let mut d_alpha = Array2::<f32>::zeros((nedges, nheads));

        for v in 0..ndst {
            let offset = block.edge_offset(v);

            for (k, &u) in block.in_edges(v).iter().enumerate() {
                let e = offset + k;

                for h in 0..nheads {
                    let keep = cache.alpha_mask.as_ref().map_or(1., |mask| mask[[e, h]]);
                    let a = cache.alpha[[e, h]] * keep;
                    let mut dot = 0.;

                    for c in h * out..(h + 1) * out {
                        dot += d[[v, c]] * feat[[u, c]];
                        d_feat[[u, c]] += a * d[[v, c]];
                    }

                    d_alpha[[e, h]] = dot * keep;
                }
            }
        }

        let mut d_el = Array2::<f32>::zeros((nsrc, nheads));
        let mut d_er = Array2::<f32>::zeros((ndst, nheads));

        for v in 0..ndst {
            let offset = block.edge_offset(v);
            let srcs = block.in_edges(v);

            for h in 0..nheads {
                let weighted: f32 = (0..srcs.len())
                    .map(|k| cache.alpha[[offset + k, h]] * d_alpha[[offset + k, h]])
                    .sum();

                for (k, &u) in srcs.iter().enumerate() {
                    let e = offset + k;
                    let d_e = cache.alpha[[e, h]] * (d_alpha[[e, h]] - weighted);
                    let d_s = d_e * self.act_fn.df(cache.scores[[e, h]]);

                    d_el[[u, h]] += d_s;
                    d_er[[v, h]] += d_s;
                }
            }
        }

        for (rows, d_side, attn, d_attn) in [
            (nsrc, &d_el, &p.attn_l, &mut g.attn_l),
            (ndst, &d_er, &p.attn_r, &mut g.attn_r),
        ] {
            for u in 0..rows {
                for h in 0..nheads {
                    let ds = d_side[[u, h]];
                    if ds == 0. {
                        continue;
                    }

                    for k in 0..out {
                        let c = h * out + k;
                        d_feat[[u, c]] += ds * attn[[h, k]];
                        d_attn[[h, k]] += ds * feat[[u, c]];
                    }
                }
            }
        }

        linalg::general_mat_mul(1.0, &cache.x.t(), &d_feat, 1.0, &mut g.w);

        let mut dx = d_feat.dot(&p.w.t());
        if let Some(mask) = &cache.x_mask {
            dx *= mask;
        }

        Ok(dx)
    }

    /// Checks that a backward pass over `block` with an output gradient of shape `dim` can run,
    /// leaving the forward metadata untouched.
    pub(crate) fn check_backward(
        &self,
        params_len: usize,
        grad_len: usize,
        block: &Block,
        dim: (usize, usize),
    ) -> Result<()> {
        let cache = self.cache.as_ref().ok_or(HanErr::MissingForward("gat"))?;
        self.check_len("gat parameters", params_len)?;
        self.check_len("gat gradient", grad_len)?;

        let expected = (block.num_dst(), self.out_dim());

        if dim != expected || cache.alpha.nrows() != block.num_edges() {
            return Err(HanErr::SizeMismatch {
                what: "gat output gradient",
                got: dim.0 * dim.1,
                expected: expected.0 * expected.1,
            });
        }

        Ok(())
    }

    fn view_params<'a>(&self, params: &'a [f32]) -> Result<GatParams<'a>> {
        self.check_len("gat parameters", params.len())?;

        let hd = self.out_dim();
        let heads = (self.num_heads, self.out_size);
        let (w, rest) = params.split_at(self.in_size * hd);
        let (attn_l, rest) = rest.split_at(hd);
        let (attn_r, bias) = rest.split_at(hd);

        Ok(GatParams {
            w: ArrayView2::from_shape((self.in_size, hd), w)?,
            attn_l: ArrayView2::from_shape(heads, attn_l)?,
            attn_r: ArrayView2::from_shape(heads, attn_r)?,
            bias: ArrayView1::from_shape(hd, bias)?,
        })
    }

    fn view_grad<'a>(&self, grad: &'a mut [f32]) -> Result<GatGrad<'a>> {
        self.check_len("gat gradient", grad.len())?;

        let hd = self.out_dim();
        let heads = (self.num_heads, self.out_size);
        let (w, rest) = grad.split_at_mut(self.in_size * hd);
        let (attn_l, rest) = rest.split_at_mut(hd);
        let (attn_r, bias) = rest.split_at_mut(hd);

        Ok(GatGrad {
            w: ArrayViewMut2::from_shape((self.in_size, hd), w)?,
            attn_l: ArrayViewMut2::from_shape(heads, attn_l)?,
            attn_r: ArrayViewMut2::from_shape(heads, attn_r)?,
            bias: ArrayViewMut1::from_shape(hd, bias)?,
        })
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

#[cfg(test)]
mod tests {
    use hetgraph::{Graph, NeighborSampler};
    use rand::{SeedableRng, rngs::StdRng};

    use super::*;
    use crate::arch::gradcheck::assert_grad_close;

    const IN: usize = 3;
    const OUT: usize = 2;
    const HEADS: usize = 2;

    // 0 <- {1, 2, 3}, 1 <- {0}, 4 has no incoming edges
    fn block() -> Block {
        let graph = Graph::from_edges(5, [(1, 0), (2, 0), (3, 0), (0, 1)]).unwrap();
        let mut rng = StdRng::seed_from_u64(0);
        NeighborSampler::default()
            .sample(&graph, &[0, 1, 4], &mut rng)
            .unwrap()
    }

    fn params(conv: &GatConv) -> Vec<f32> {
        (0..conv.size())
            .map(|i| ((i as f32) * 0.71).sin() * 0.6)
            .collect()
    }

    fn features(block: &Block) -> Array2<f32> {
        Array2::from_shape_fn((block.num_src(), IN), |(i, j)| {
            ((i * IN + j) as f32 * 1.3).cos()
        })
    }

    #[test]
    fn attention_is_normalized_per_destination() {
        let block = block();
        let mut conv = GatConv::new(IN, OUT, HEADS, 0.);
        let mut rng = StdRng::seed_from_u64(1);

        let y = conv
            .forward(&params(&conv), &block, features(&block).view(), Mode::Eval, &mut rng)
            .unwrap();
        assert_eq!(y.dim(), (3, HEADS * OUT));

        let alpha = conv.last_attention().unwrap();
        for h in 0..HEADS {
            let first: f32 = (0..3).map(|e| alpha[[e, h]]).sum();
            assert!((first - 1.).abs() < 1e-5);
            assert!((alpha[[3, h]] - 1.).abs() < 1e-5);
        }
    }

    #[test]
    fn isolated_destination_only_gets_bias() {
        let block = block();
        let mut conv = GatConv::new(IN, OUT, HEADS, 0.);
        let params = params(&conv);
        let mut rng = StdRng::seed_from_u64(1);

        let y = conv
            .forward(&params, &block, features(&block).view(), Mode::Eval, &mut rng)
            .unwrap();

        let bias = &params[conv.size() - HEADS * OUT..];
        assert_eq!(y.row(2).to_vec(), bias.to_vec());
    }

    #[test]
    fn gradients_match_finite_differences() {
        let block = block();
        let x = features(&block);
        let conv = GatConv::new(IN, OUT, HEADS, 0.);
        let params = params(&conv);
        let weights = Array2::from_shape_fn((3, HEADS * OUT), |(i, j)| 0.5 - (i + 2 * j) as f32 * 0.2);

        let loss = |params: &[f32], x: ArrayView2<f32>| {
            let mut conv = GatConv::new(IN, OUT, HEADS, 0.);
            let mut rng = StdRng::seed_from_u64(1);
            let y = conv.forward(params, &block, x, Mode::Eval, &mut rng).unwrap();
            (&y * &weights).sum()
        };

        let mut conv = conv;
        let mut rng = StdRng::seed_from_u64(1);
        conv.forward(&params, &block, x.view(), Mode::Eval, &mut rng)
            .unwrap();
        let mut grad = vec![0.; params.len()];
        let dx = conv
            .backward(&params, &mut grad, &block, weights.view())
            .unwrap();

        assert_grad_close(&params, &grad, |p| loss(p, x.view()));

        let flat_x: Vec<f32> = x.iter().copied().collect();
        assert_grad_close(&flat_x, dx.as_slice().unwrap(), |xs| {
            loss(&params, ArrayView2::from_shape(x.dim(), xs).unwrap())
        });
    }

    #[test]
    fn gradients_match_finite_differences_through_dropout() {
        let block = block();
        let x = features(&block);
        let conv = GatConv::new(IN, OUT, HEADS, 0.3);
        let params = params(&conv);
        let weights = Array2::from_shape_fn((3, HEADS * OUT), |(i, j)| 0.4 - (2 * i + j) as f32 * 0.15);

        // Reseeding draws the same masks on every pass.
        let loss = |params: &[f32], x: ArrayView2<f32>| {
            let mut conv = GatConv::new(IN, OUT, HEADS, 0.3);
            let mut rng = StdRng::seed_from_u64(7);
            let y = conv.forward(params, &block, x, Mode::Train, &mut rng).unwrap();
            (&y * &weights).sum()
        };

        let mut conv = conv;
        let mut rng = StdRng::seed_from_u64(7);
        conv.forward(&params, &block, x.view(), Mode::Train, &mut rng)
            .unwrap();
        let mut grad = vec![0.; params.len()];
        let dx = conv
            .backward(&params, &mut grad, &block, weights.view())
            .unwrap();

        assert_grad_close(&params, &grad, |p| loss(p, x.view()));

        let flat_x: Vec<f32> = x.iter().copied().collect();
        assert_grad_close(&flat_x, dx.as_slice().unwrap(), |xs| {
            loss(&params, ArrayView2::from_shape(x.dim(), xs).unwrap())
        });
    }

    #[test]
    fn rejected_backward_keeps_the_forward_pass() {
        let block = block();
        let mut conv = GatConv::new(IN, OUT, HEADS, 0.);
        let params = params(&conv);
        let mut grad = vec![0.; params.len()];
        let mut rng = StdRng::seed_from_u64(1);
        conv.forward(&params, &block, features(&block).view(), Mode::Eval, &mut rng)
            .unwrap();

        let wrong = Array2::ones((2, HEADS * OUT));
        assert!(matches!(
            conv.backward(&params, &mut grad, &block, wrong.view()),
            Err(HanErr::SizeMismatch { .. })
        ));
        assert!(matches!(
            conv.backward(&params, &mut grad[1..], &block, Array2::ones((3, HEADS * OUT)).view()),
            Err(HanErr::SizeMismatch { .. })
        ));
        assert!(grad.iter().all(|&g| g == 0.));

        let right = Array2::ones((3, HEADS * OUT));
        assert!(conv.backward(&params, &mut grad, &block, right.view()).is_ok());
    }

    #[test]
    fn dropout_only_in_training() {
        let block = block();
        let mut conv = GatConv::new(IN, OUT, HEADS, 0.5);
        let params = params(&conv);
        let x = features(&block);
        let mut rng = StdRng::seed_from_u64(1);

        let eval_a = conv
            .forward(&params, &block, x.view(), Mode::Eval, &mut rng)
            .unwrap();
        let eval_b = conv
            .forward(&params, &block, x.view(), Mode::Eval, &mut rng)
            .unwrap();
        assert_eq!(eval_a, eval_b);

        let train = conv
            .forward(&params, &block, x.view(), Mode::Train, &mut rng)
            .unwrap();
        assert_ne!(train, eval_a);
    }

    #[test]
    fn backward_without_forward() {
        let block = block();
        let mut conv = GatConv::new(IN, OUT, HEADS, 0.);
        let params = params(&conv);
        let mut grad = vec![0.; params.len()];
        let d = Array2::zeros((3, HEADS * OUT));

        assert!(matches!(
            conv.backward(&params, &mut grad, &block, d.view()),
            Err(HanErr::MissingForward("gat"))
        ));
    }
}
