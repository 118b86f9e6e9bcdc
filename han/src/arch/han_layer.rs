use std::{collections::HashMap, time::Instant};

use hetgraph::{
    Block, Graph, HeteroGraph, Metapath, NeighborSampler, Reachability, ReachabilityConfig,
    metapath_reachable_graph,
};
use log::{info, warn};
use ndarray::prelude::*;
use ndarray_rand::RandomExt;
use rand::Rng;
use rand_distr::Uniform;

use super::{
    GroupId, Mode, ParamSlab, Parameterized,
    layers::{GatConv, SemanticAttention},
};
use crate::{HanErr, Result, config::HanConfig, optimization::ParamRegistry};

#[derive(Clone, Debug)]
struct GatEntry {
    graph: Graph,
    conv: GatConv,
    params: ParamSlab,
    initial: Vec<f32>,
}

/// What a metapath's forward pass leaves behind for the backward pass.
#[derive(Clone, Debug)]
struct Pass {
    metapath: Metapath,
    block: Block,
    // Row of the block's destinations that each seed reads from.
    gather: Vec<usize>,
}

#[derive(Clone, Debug)]
struct ForwardCache {
    passes: Vec<Pass>,
    input_dim: (usize, usize),
}

/// One layer of a heterogeneous graph attention network.
///
/// Every metapath gets its own reachable graph and graph attention convolution, both built
/// lazily the first time the metapath shows up. The per metapath embeddings are then fused by
/// semantic attention.
#[derive(Clone, Debug)]
pub struct HanLayer {
    index: usize,
    in_size: usize,
    out_size: usize,
    num_heads: usize,
    dropout: f32,
    reachability: ReachabilityConfig,
    sampler: NeighborSampler,

    gat_layers: HashMap<Metapath, GatEntry>,
    large_graph: HashMap<Metapath, f64>,
    semantic: SemanticAttention,
    semantic_params: ParamSlab,
    pruned: bool,

    active: Vec<Metapath>,
    cache: Option<ForwardCache>,
}

impl HanLayer {
    /// Creates a new `HanLayer` without any metapath.
    ///
    /// # Arguments
    /// * `index` - The position of the layer in the model, it names the parameter groups.
    /// * `in_size` - The size of the input features.
    /// * `out_size` - The output size of every attention head.
    /// * `num_heads` - The amount of attention heads.
    /// * `config` - Where dropout, the semantic attention size and the graph bounds come from.
    /// * `rng` - The random source of the semantic attention's parameters.
    pub fn new<R: Rng + ?Sized>(
        index: usize,
        in_size: usize,
        out_size: usize,
        num_heads: usize,
        config: &HanConfig,
        rng: &mut R,
    ) -> Result<Self> {
        let semantic = SemanticAttention::new(out_size * num_heads, config.semantic_hidden);
        let semantic_params = ParamSlab::new(semantic.init(rng)?);

        Ok(Self {
            index,
            in_size,
            out_size,
            num_heads,
            dropout: config.dropout,
            reachability: config.reachability(),
            sampler: NeighborSampler::new(config.fanout),
            gat_layers: HashMap::new(),
            large_graph: HashMap::new(),
            semantic,
            semantic_params,
            pruned: false,
            active: Vec::new(),
            cache: None,
        })
    }

    pub fn in_size(&self) -> usize {
        self.in_size
    }

    /// Returns the size of the embeddings this layer produces, `heads * out`.
    pub fn out_dim(&self) -> usize {
        self.out_size * self.num_heads
    }

    /// Whether the last forward pass found a metapath too dense to use.
    pub fn pruned(&self) -> bool {
        self.pruned
    }

    /// Returns the metapaths that were pruned and their density.
    pub fn dense_metapaths(&self) -> &HashMap<Metapath, f64> {
        &self.large_graph
    }

    /// Returns the cached reachable graph of `metapath`, if it was ever built.
    pub fn graph(&self, metapath: &Metapath) -> Option<&Graph> {
        self.gat_layers.get(metapath).map(|entry| &entry.graph)
    }

    /// Returns the weight semantic attention gave each metapath on the last forward pass.
    pub fn semantic_weights(&self) -> Vec<(&Metapath, f32)> {
        match self.semantic.last_weights() {
            Some(beta) => self.active.iter().zip(beta.iter().copied()).collect(),
            None => Vec::new(),
        }
    }

    /// Computes the embeddings of `seeds`.
    ///
    /// Metapaths seen for the first time get their reachable graph built. The dense ones are
    /// pruned, that is remembered and **removed from `metapaths`**, the rest get a new
    /// convolution whose parameters are added to `registry`. Metapaths pruned on an earlier pass
    /// are removed again.
    ///
    /// # Arguments
    /// * `g` - The heterogeneous graph.
    /// * `h` - The features of the target nodes, one row per node id.
    /// * `metapaths` - The metapaths shared by every layer.
    /// * `registry` - Where the parameters of new metapaths are added.
    /// * `seeds` - The nodes to embed, in the order of the output rows. May repeat.
    /// * `mode` - Dropout is only applied in training.
    /// * `rng` - The random source of sampling, dropout and initialization.
    ///
    /// # Returns
    /// The `(seeds, heads * out)` embeddings.
    #[allow(clippy::too_many_arguments)]
    pub fn forward<P, R>(
        &mut self,
        g: &HeteroGraph,
        h: ArrayView2<f32>,
        metapaths: &mut Vec<Metapath>,
        registry: &mut P,
        seeds: &[usize],
        mode: Mode,
        rng: &mut R,
    ) -> Result<Array2<f32>>
    where
        P: ParamRegistry + ?Sized,
        R: Rng + ?Sized,
    {
        self.pruned = false;
        self.cache = None;
        self.active.clear();

        if h.ncols() != self.in_size {
            return Err(HanErr::SizeMismatch {
                what: "han layer input",
                got: h.ncols(),
                expected: self.in_size,
            });
        }

        for metapath in metapaths.iter() {
            if self.large_graph.contains_key(metapath) {
                self.pruned = true;
            } else if !self.gat_layers.contains_key(metapath) {
                self.prepare(g, metapath, registry, rng)?;
            }
        }
        metapaths.retain(|metapath| !self.large_graph.contains_key(metapath));

        let mut uniq = seeds.to_vec();
        uniq.sort_unstable();
        uniq.dedup();
        let gather: Vec<usize> = seeds
            .iter()
            .map(|seed| uniq.partition_point(|u| u < seed))
            .collect();

        let mut passes = Vec::with_capacity(metapaths.len());
        let mut embeddings = Vec::with_capacity(metapaths.len());

        for metapath in metapaths.iter() {
            let entry = self.gat_layers.get_mut(metapath).ok_or_else(|| {
                HanErr::UnregisteredGroup(GroupId::Gat {
                    layer: self.index,
                    metapath: metapath.clone(),
                })
            })?;

            let block = self.sampler.sample(&entry.graph, &uniq, rng)?;
            if let Some(&id) = block.src_nodes().iter().find(|&&id| id >= h.nrows()) {
                return Err(HanErr::NodeOutOfBounds { id, len: h.nrows() });
            }

            let x = h.select(Axis(0), block.src_nodes());
            let emb = entry
                .conv
                .forward(&entry.params.params, &block, x.view(), mode, rng)?;

            embeddings.push(emb.select(Axis(0), &gather));
            passes.push(Pass {
                metapath: metapath.clone(),
                block,
                gather: gather.clone(),
            });
        }

        if embeddings.is_empty() {
            warn!(layer = self.index; "no usable metapath, falling back to a random embedding");
            let fallback = Array2::random_using(
                (seeds.len(), self.out_dim()),
                Uniform::new(0f32, 1f32)?,
                rng,
            );
            embeddings.push(fallback);
        }

        let out = self
            .semantic
            .forward(&self.semantic_params.params, &embeddings)?;

        self.active = metapaths.clone();
        self.cache = Some(ForwardCache {
            passes,
            input_dim: h.dim(),
        });

        Ok(out)
    }

    fn prepare<P, R>(
        &mut self,
        g: &HeteroGraph,
        metapath: &Metapath,
        registry: &mut P,
        rng: &mut R,
    ) -> Result<()>
    where
        P: ParamRegistry + ?Sized,
        R: Rng + ?Sized,
    {
        let start = Instant::now();

        match metapath_reachable_graph(g, metapath, &self.reachability)? {
            Reachability::Dense { density } => {
                info!(
                    layer = self.index,
                    metapath:% = metapath,
                    density = density,
                    elapsed_s = start.elapsed().as_secs_f64();
                    "pruned dense metapath"
                );

                self.large_graph.insert(metapath.clone(), density);
                self.pruned = true;
            }
            Reachability::Sparse(graph) => {
                let conv = GatConv::new(self.in_size, self.out_size, self.num_heads, self.dropout);
                let params = conv.init(rng)?;

                let id = GroupId::Gat {
                    layer: self.index,
                    metapath: metapath.clone(),
                };
                registry.add_param_group(id, params.len())?;

                info!(
                    layer = self.index,
                    metapath:% = metapath,
                    avg_degree = graph.average_degree(),
                    elapsed_s = start.elapsed().as_secs_f64();
                    "prepared metapath graph"
                );

                self.gat_layers.insert(
                    metapath.clone(),
                    GatEntry {
                        graph,
                        conv,
                        initial: params.clone(),
                        params: ParamSlab::new(params),
                    },
                );
            }
        }

        Ok(())
    }

    /// Backpropagates through the last forward pass, **accumulating** the gradient of every
    /// parameter group.
    ///
    /// # Returns
    /// The gradient of the loss with respect to the input features, shaped like them.
    pub fn backward(&mut self, d: ArrayView2<f32>) -> Result<Array2<f32>> {
        self.check_backward(d.dim())?;
        let cache = self
            .cache
            .take()
            .ok_or(HanErr::MissingForward("han layer"))?;

        let d_zs = self.semantic.backward(
            &self.semantic_params.params,
            &mut self.semantic_params.grad,
            d,
        )?;

        let out_dim = self.out_dim();
        let mut dh = Array2::zeros(cache.input_dim);

        // The random fallback has no pass, so its gradient is dropped here.
        for (pass, d_z) in cache.passes.iter().zip(d_zs) {
            let entry = self.gat_layers.get_mut(&pass.metapath).ok_or_else(|| {
                HanErr::UnregisteredGroup(GroupId::Gat {
                    layer: self.index,
                    metapath: pass.metapath.clone(),
                })
            })?;

            let mut d_emb = Array2::zeros((pass.block.num_dst(), out_dim));
            for (row, &dst) in d_z.rows().into_iter().zip(&pass.gather) {
                d_emb.row_mut(dst).scaled_add(1.0, &row);
            }

            let dx = entry.conv.backward(
                &entry.params.params,
                &mut entry.params.grad,
                &pass.block,
                d_emb.view(),
            )?;

            for (row, &src) in dx.rows().into_iter().zip(pass.block.src_nodes()) {
                dh.row_mut(src).scaled_add(1.0, &row);
            }
        }

        Ok(dh)
    }

    /// Checks that a backward pass with an output gradient of shape `dim` can run, leaving the
    /// forward metadata untouched.
    ///
    /// # Returns
    /// The shape of the input gradient that backward pass would return.
    pub(crate) fn check_backward(&self, dim: (usize, usize)) -> Result<(usize, usize)> {
        let cache = self
            .cache
            .as_ref()
            .ok_or(HanErr::MissingForward("han layer"))?;

        let semantic = &self.semantic_params;
        self.semantic
            .check_backward(semantic.params.len(), semantic.grad.len(), dim)?;

        for pass in &cache.passes {
            let entry = self.gat_layers.get(&pass.metapath).ok_or_else(|| {
                HanErr::UnregisteredGroup(GroupId::Gat {
                    layer: self.index,
                    metapath: pass.metapath.clone(),
                })
            })?;

            let (params, grad) = (&entry.params.params, &entry.params.grad);
            let out = (pass.block.num_dst(), self.out_dim());
            entry
                .conv
                .check_backward(params.len(), grad.len(), &pass.block, out)?;
        }

        Ok(cache.input_dim)
    }

    /// Restores every metapath convolution to the parameters it was created with.
    pub fn reset(&mut self) {
        for entry in self.gat_layers.values_mut() {
            entry.params.params.copy_from_slice(&entry.initial);
        }
    }
}

impl Parameterized for HanLayer {
    fn param_groups(&self) -> Vec<(GroupId, usize)> {
        let mut groups: Vec<_> = self
            .gat_layers
            .iter()
            .map(|(metapath, entry)| {
                let id = GroupId::Gat {
                    layer: self.index,
                    metapath: metapath.clone(),
                };
                (id, entry.params.len())
            })
            .collect();

        groups.push((
            GroupId::Semantic { layer: self.index },
            self.semantic_params.len(),
        ));
        groups.sort();

        groups
    }

    fn groups_mut(&mut self) -> Vec<(GroupId, &mut ParamSlab)> {
        let layer = self.index;
        let mut groups = vec![(GroupId::Semantic { layer }, &mut self.semantic_params)];

        groups.extend(self.gat_layers.iter_mut().map(|(metapath, entry)| {
            let id = GroupId::Gat {
                layer,
                metapath: metapath.clone(),
            };
            (id, &mut entry.params)
        }));

        groups
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use rand::{SeedableRng, rngs::StdRng};

    use super::*;
    use crate::{
        arch::gradcheck::assert_grad_close, config::OptimizerConfig, optimization::ParamGroups,
    };

    // 4 papers, 2 authors, 2 subjects. Every paper has subject 0, so PSP is fully connected.
    fn graph() -> HeteroGraph {
        let pa = [(0, 0), (1, 0), (2, 1), (3, 1)];
        let ps = [(0, 0), (1, 0), (2, 0), (3, 0), (3, 1)];

        HeteroGraph::builder()
            .add_nodes("paper", 4)
            .add_nodes("author", 2)
            .add_nodes("subject", 2)
            .add_edges("paper", "pa", "author", pa)
            .unwrap()
            .add_edges("author", "ap", "paper", pa.map(|(p, a)| (a, p)))
            .unwrap()
            .add_edges("paper", "ps", "subject", ps)
            .unwrap()
            .add_edges("subject", "sp", "paper", ps.map(|(p, s)| (s, p)))
            .unwrap()
            .build()
    }

    fn pap() -> Metapath {
        Metapath::new(["pa", "ap"]).unwrap()
    }

    fn psp() -> Metapath {
        Metapath::new(["ps", "sp"]).unwrap()
    }

    fn features() -> Array2<f32> {
        Array2::from_shape_fn((4, 3), |(i, j)| ((i * 3 + j) as f32 * 0.7).sin())
    }

    struct Fixture {
        layer: HanLayer,
        groups: ParamGroups,
        rng: StdRng,
    }

    impl Fixture {
        fn new(threshold: f64) -> Self {
            let mut rng = StdRng::seed_from_u64(7);
            let mut config = HanConfig::new(3, 2, 2, vec![2]);
            config.threshold = threshold;

            let layer = HanLayer::new(0, 3, 2, 2, &config, &mut rng).unwrap();
            let groups = ParamGroups::new(OptimizerConfig::adam(0.1), &layer).unwrap();

            Self { layer, groups, rng }
        }

        fn forward(
            &mut self,
            h: ArrayView2<f32>,
            metapaths: &mut Vec<Metapath>,
            seeds: &[usize],
            mode: Mode,
        ) -> Result<Array2<f32>> {
            let g = graph();
            self.layer
                .forward(&g, h, metapaths, &mut self.groups, seeds, mode, &mut self.rng)
        }
    }

    #[test]
    fn dense_metapaths_are_pruned_once_and_for_all() {
        let mut fx = Fixture::new(0.75);
        let mut metapaths = vec![pap(), psp()];

        let out = fx
            .forward(features().view(), &mut metapaths, &[0, 2], Mode::Eval)
            .unwrap();

        assert_eq!(out.dim(), (2, 4));
        assert!(fx.layer.pruned());
        assert_eq!(metapaths, vec![pap()]);
        assert_eq!(fx.layer.dense_metapaths().get(&psp()), Some(&1.0));
        assert_eq!(fx.groups.len(), 2);

        let mut again = vec![pap(), psp()];
        fx.forward(features().view(), &mut again, &[1], Mode::Eval)
            .unwrap();

        assert!(fx.layer.pruned());
        assert_eq!(again, vec![pap()]);
        assert_eq!(fx.groups.len(), 2);
    }

    #[test]
    fn graphs_are_built_once() {
        let mut fx = Fixture::new(0.75);
        let mut metapaths = vec![pap()];

        for seeds in [[0, 1], [2, 3]] {
            fx.forward(features().view(), &mut metapaths, &seeds, Mode::Eval)
                .unwrap();
            assert!(!fx.layer.pruned());
        }

        let graph = fx.layer.graph(&pap()).unwrap();
        assert_eq!(graph.num_nodes(), 8);
        assert_eq!(graph.in_neighbors(0), &[0, 1]);
        assert_eq!(fx.layer.param_groups().len(), 2);
        assert_eq!(fx.groups.len(), 2);
    }

    #[test]
    fn repeated_seeds_get_the_same_row() {
        let mut fx = Fixture::new(0.75);
        let mut metapaths = vec![pap()];

        let out = fx
            .forward(features().view(), &mut metapaths, &[3, 0, 3], Mode::Eval)
            .unwrap();

        assert_eq!(out.row(0), out.row(2));
        assert_ne!(out.row(0), out.row(1));
    }

    fn set_group(layer: &mut HanLayer, id: &GroupId, params: &[f32]) {
        for (other, slab) in layer.groups_mut() {
            if other == *id {
                slab.params.copy_from_slice(params);
            }
        }
    }

    #[test]
    fn gradients_match_finite_differences() {
        let fx = RefCell::new(Fixture::new(1.5));
        let seeds = [3, 0, 3, 1];
        let h = features();
        let weights = Array2::from_shape_fn((4, 4), |(i, j)| 0.3 - (i + 3 * j) as f32 * 0.1);

        let loss = |h: ArrayView2<f32>| {
            let mut metapaths = vec![pap(), psp()];
            let out = fx
                .borrow_mut()
                .forward(h, &mut metapaths, &seeds, Mode::Eval)
                .unwrap();
            (&out * &weights).sum()
        };

        loss(h.view());
        assert_eq!(fx.borrow().layer.semantic_weights().len(), 2);
        let dh = fx.borrow_mut().layer.backward(weights.view()).unwrap();
        assert_eq!(dh.dim(), (4, fx.borrow().layer.in_size()));

        let flat_h: Vec<f32> = h.iter().copied().collect();
        assert_grad_close(&flat_h, dh.as_slice().unwrap(), |xs| {
            loss(ArrayView2::from_shape(h.dim(), xs).unwrap())
        });

        let groups: Vec<_> = fx
            .borrow_mut()
            .layer
            .groups_mut()
            .into_iter()
            .map(|(id, slab)| (id, slab.params.clone(), slab.grad.clone()))
            .collect();
        assert_eq!(groups.len(), 3);

        for (id, params, grad) in &groups {
            assert_grad_close(params, grad, |p| {
                set_group(&mut fx.borrow_mut().layer, id, p);
                let value = loss(h.view());
                set_group(&mut fx.borrow_mut().layer, id, params);
                value
            });
        }
    }

    #[test]
    fn rejected_backward_keeps_the_forward_pass() {
        let mut fx = Fixture::new(1.5);
        let mut metapaths = vec![pap(), psp()];

        fx.forward(features().view(), &mut metapaths, &[0, 2], Mode::Eval)
            .unwrap();

        assert!(matches!(
            fx.layer.backward(Array2::ones((3, 4)).view()),
            Err(HanErr::SizeMismatch { .. })
        ));
        for (_, slab) in fx.layer.groups_mut() {
            assert!(slab.grad.iter().all(|&g| g == 0.));
        }

        assert!(fx.layer.backward(Array2::ones((2, 4)).view()).is_ok());
    }

    #[test]
    fn random_fallback_without_metapaths() {
        let mut fx = Fixture::new(0.75);
        let mut metapaths = vec![psp()];

        let out = fx
            .forward(features().view(), &mut metapaths, &[0, 1, 2], Mode::Eval)
            .unwrap();

        assert!(metapaths.is_empty());
        assert_eq!(out.dim(), (3, 4));
        assert!(out.iter().all(|&x| (0. ..1.).contains(&x)));
        assert!(fx.layer.semantic_weights().is_empty());

        let dh = fx.layer.backward(Array2::ones((3, 4)).view()).unwrap();
        assert!(dh.iter().all(|&x| x == 0.));
        assert_eq!(dh.dim(), (4, 3));
    }

    #[test]
    fn backward_accumulates_and_reset_restores() {
        let mut fx = Fixture::new(1.5);
        let mut metapaths = vec![pap(), psp()];
        let h = features();

        fx.forward(h.view(), &mut metapaths, &[0, 2], Mode::Train)
            .unwrap();
        assert_eq!(fx.layer.semantic_weights().len(), 2);

        let before: Vec<_> = fx
            .layer
            .groups_mut()
            .into_iter()
            .map(|(id, slab)| (id, slab.params.clone()))
            .collect();

        let dh = fx.layer.backward(Array2::ones((2, 4)).view()).unwrap();
        assert_eq!(dh.dim(), h.dim());
        assert!(fx.layer.backward(Array2::ones((2, 4)).view()).is_err());

        fx.groups.step(&mut fx.layer).unwrap();
        fx.layer.reset();

        for (id, slab) in fx.layer.groups_mut() {
            let (_, params) = before.iter().find(|(other, _)| *other == id).unwrap();
            match id {
                GroupId::Gat { .. } => assert_eq!(&slab.params, params),
                _ => assert_ne!(&slab.params, params),
            }
        }
    }

    #[test]
    fn seeds_without_features() {
        let mut fx = Fixture::new(0.75);
        let mut metapaths = vec![pap()];
        let h = features().slice(s![..2, ..]).to_owned();

        assert!(matches!(
            fx.forward(h.view(), &mut metapaths, &[2], Mode::Eval),
            Err(HanErr::NodeOutOfBounds { id: 2, len: 2 })
        ));
    }
}
