use std::collections::HashMap;

use hetgraph::{HeteroGraph, Metapath};
use log::debug;
use ndarray::prelude::*;
use rand::{SeedableRng, rngs::StdRng};

use super::{GroupId, HanLayer, Mode, ParamSlab, Parameterized, layers::Dense};
use crate::{HanErr, Result, config::HanConfig, optimization::ParamRegistry};

/// Named node feature matrices that can stand in for the input features.
pub type FeatureDict = HashMap<String, Array2<f32>>;

/// A heterogeneous graph attention network: stacked `HanLayer`s followed by a linear classifier.
#[derive(Clone, Debug)]
pub struct Han {
    config: HanConfig,
    layers: Vec<HanLayer>,
    predict: Dense,
    predict_params: ParamSlab,
    rng: StdRng,
    mode: Mode,
}

impl Han {
    /// Creates a new `Han` model in training mode.
    ///
    /// # Returns
    /// A new `Han` or an error if `config` is invalid.
    pub fn new(config: HanConfig) -> Result<Self> {
        config.validate()?;

        let mut rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };

        let mut layers = Vec::with_capacity(config.num_heads.len());
        let mut in_size = config.in_size;
        for (index, &num_heads) in config.num_heads.iter().enumerate() {
            let layer = HanLayer::new(
                index,
                in_size,
                config.hidden_size,
                num_heads,
                &config,
                &mut rng,
            )?;
            in_size = layer.out_dim();
            layers.push(layer);
        }

        let predict = Dense::new((in_size, config.out_size), None);
        let predict_params = ParamSlab::new(predict.init(&mut rng)?);

        Ok(Self {
            config,
            layers,
            predict,
            predict_params,
            rng,
            mode: Mode::Train,
        })
    }

    pub fn config(&self) -> &HanConfig {
        &self.config
    }

    pub fn layers(&self) -> &[HanLayer] {
        &self.layers
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Turns dropout on.
    pub fn train(&mut self) {
        self.mode = Mode::Train;
    }

    /// Turns dropout off.
    pub fn eval(&mut self) {
        self.mode = Mode::Eval;
    }

    /// Computes the logits of `b_ids`.
    ///
    /// # Arguments
    /// * `g` - The heterogeneous graph.
    /// * `h` - The features of the target nodes, one row per node id.
    /// * `metapaths` - The metapaths to use, dense ones get removed.
    /// * `registry` - Where the parameters of new metapaths are added.
    /// * `b_ids` - The nodes to classify, in the order of the output rows.
    /// * `features` - Overrides `h` when it has an entry named `config.feature_key`.
    ///
    /// # Returns
    /// The `(b_ids, out_size)` logits.
    pub fn forward<P: ParamRegistry + ?Sized>(
        &mut self,
        g: &HeteroGraph,
        h: ArrayView2<f32>,
        metapaths: &mut Vec<Metapath>,
        registry: &mut P,
        b_ids: &[usize],
        features: Option<&FeatureDict>,
    ) -> Result<Array2<f32>> {
        let emb = self.embedding(g, h, metapaths, registry, b_ids, features)?;
        self.predict.forward(&self.predict_params.params, emb.view())
    }

    /// Computes the embeddings of `b_ids`, the output of the last `HanLayer`.
    ///
    /// Every layer but the last embeds all the rows of its input, so the next one can look up
    /// any neighbor. The last one only embeds `b_ids`.
    pub fn embedding<P: ParamRegistry + ?Sized>(
        &mut self,
        g: &HeteroGraph,
        h: ArrayView2<f32>,
        metapaths: &mut Vec<Metapath>,
        registry: &mut P,
        b_ids: &[usize],
        features: Option<&FeatureDict>,
    ) -> Result<Array2<f32>> {
        let h = match features.and_then(|dict| dict.get(&self.config.feature_key)) {
            Some(overridden) => overridden.view(),
            None => h,
        };

        let nlayers = self.layers.len();
        let mut current: Option<Array2<f32>> = None;

        for (l, layer) in self.layers.iter_mut().enumerate() {
            let input = current.as_ref().map_or(h, |x| x.view());

            let all: Vec<usize>;
            let seeds = if l + 1 == nlayers {
                b_ids
            } else {
                all = (0..input.nrows()).collect();
                &all
            };

            let out = layer.forward(
                g,
                input,
                metapaths,
                registry,
                seeds,
                self.mode,
                &mut self.rng,
            )?;
            debug!(
                layer = l,
                rows = out.nrows(),
                metapaths = metapaths.len(),
                pruned = layer.pruned();
                "han layer forward"
            );

            current = Some(out);
        }

        current.ok_or(HanErr::InvalidConfig(
            "num_heads must have at least one layer".to_string(),
        ))
    }

    /// Backpropagates the gradient of the loss with respect to the logits of the last forward
    /// pass, **accumulating** the gradient of every parameter group.
    ///
    /// Nothing is accumulated when `d` is rejected, and the forward pass stays available.
    ///
    /// # Returns
    /// The gradient of the loss with respect to the input features.
    pub fn backward(&mut self, d: ArrayView2<f32>) -> Result<Array2<f32>> {
        let predict = &self.predict_params;
        self.predict
            .check_backward(predict.params.len(), predict.grad.len(), d.dim())?;

        let mut dim = (d.nrows(), self.predict.dim().0);
        for layer in self.layers.iter().rev() {
            dim = layer.check_backward(dim)?;
        }

        let mut d = self.predict.backward(
            &self.predict_params.params,
            &mut self.predict_params.grad,
            d.to_owned(),
        )?;

        for layer in self.layers.iter_mut().rev() {
            d = layer.backward(d.view())?;
        }

        Ok(d)
    }

    /// Restores the metapath convolutions of every layer to their initial parameters.
    pub fn reset(&mut self) {
        for layer in &mut self.layers {
            layer.reset();
        }
    }
}

impl Parameterized for Han {
    fn param_groups(&self) -> Vec<(GroupId, usize)> {
        let mut groups = vec![(GroupId::Predict, self.predict_params.len())];
        for layer in &self.layers {
            groups.extend(layer.param_groups());
        }

        groups
    }

    fn groups_mut(&mut self) -> Vec<(GroupId, &mut ParamSlab)> {
        let mut groups = vec![(GroupId::Predict, &mut self.predict_params)];
        for layer in &mut self.layers {
            groups.extend(layer.groups_mut());
        }

        groups
    }
}
