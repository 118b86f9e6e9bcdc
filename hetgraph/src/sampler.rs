use std::collections::HashMap;

use rand::{Rng, seq::index};

use crate::{Graph, GraphErr, Result};

/// A bipartite message flow graph between a set of source nodes and a set of destination nodes.
///
/// The destination nodes are a prefix of the source nodes, so local id `i < num_dst` names the
/// same node on both sides.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    src_nodes: Vec<usize>,
    num_dst: usize,
    indptr: Vec<usize>,
    indices: Vec<usize>,
}

impl Block {
    /// Returns the global ids of the source nodes.
    pub fn src_nodes(&self) -> &[usize] {
        &self.src_nodes
    }

    /// Returns the global ids of the destination nodes.
    pub fn dst_nodes(&self) -> &[usize] {
        &self.src_nodes[..self.num_dst]
    }

    pub fn num_src(&self) -> usize {
        self.src_nodes.len()
    }

    pub fn num_dst(&self) -> usize {
        self.num_dst
    }

    pub fn num_edges(&self) -> usize {
        self.indices.len()
    }

    /// Returns the local source ids of the edges pointing to the `dst`-th destination.
    ///
    /// # Panics
    /// If `dst` is not a destination of the block.
    pub fn in_edges(&self, dst: usize) -> &[usize] {
        &self.indices[self.indptr[dst]..self.indptr[dst + 1]]
    }

    /// Returns the position of the first edge of the `dst`-th destination, edges are numbered
    /// consecutively by destination.
    pub fn edge_offset(&self, dst: usize) -> usize {
        self.indptr[dst]
    }
}

/// Samples a bounded amount of incoming neighbors for a set of seed nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NeighborSampler {
    fanout: usize,
}

impl Default for NeighborSampler {
    fn default() -> Self {
        Self { fanout: 500 }
    }
}

impl NeighborSampler {
    /// Creates a new `NeighborSampler`.
    ///
    /// # Arguments
    /// * `fanout` - The maximum amount of incoming neighbors kept per seed.
    pub fn new(fanout: usize) -> Self {
        Self { fanout }
    }

    pub fn fanout(&self) -> usize {
        self.fanout
    }

    /// Samples the one hop block whose destinations are `seeds`.
    ///
    /// Seeds with at most `fanout` incoming edges keep all of them, the rest get `fanout` edges
    /// picked uniformly without replacement.
    ///
    /// # Arguments
    /// * `graph` - The graph to sample from.
    /// * `seeds` - The destination nodes, unique.
    /// * `rng` - The random source used when a seed has to be subsampled.
    ///
    /// # Returns
    /// The sampled block or an error if a seed is repeated or out of the graph.
    pub fn sample<R: Rng + ?Sized>(
        &self,
        graph: &Graph,
        seeds: &[usize],
        rng: &mut R,
    ) -> Result<Block> {
        let mut local: HashMap<usize, usize> = HashMap::with_capacity(seeds.len());
        let mut src_nodes = Vec::with_capacity(seeds.len());

        for &seed in seeds {
            if seed >= graph.num_nodes() {
                return Err(GraphErr::NodeOutOfBounds {
                    what: "seed",
                    id: seed,
                    len: graph.num_nodes(),
                });
            }

            if local.insert(seed, src_nodes.len()).is_some() {
                return Err(GraphErr::DuplicateSeed(seed));
            }
            src_nodes.push(seed);
        }

        let mut indptr = Vec::with_capacity(seeds.len() + 1);
        let mut indices = Vec::new();
        indptr.push(0);

        for &seed in seeds {
            let neighbors = graph.in_neighbors(seed);

            let picked: Vec<usize> = if neighbors.len() <= self.fanout {
                neighbors.to_vec()
            } else {
                let mut idx = index::sample(rng, neighbors.len(), self.fanout).into_vec();
                idx.sort_unstable();
                idx.into_iter().map(|i| neighbors[i]).collect()
            };

            for u in picked {
                let id = *local.entry(u).or_insert_with(|| {
                    src_nodes.push(u);
                    src_nodes.len() - 1
                });
                indices.push(id);
            }

            indptr.push(indices.len());
        }

        Ok(Block {
            src_nodes,
            num_dst: seeds.len(),
            indptr,
            indices,
        })
    }
}

#[cfg(test)]
mod tests {
    use rand::{SeedableRng, rngs::StdRng};

    use super::*;

    fn star() -> Graph {
        // everyone points to 0, 1 points to 2
        Graph::from_edges(6, [(1, 0), (2, 0), (3, 0), (4, 0), (5, 0), (1, 2)]).unwrap()
    }

    #[test]
    fn dst_nodes_prefix_src_nodes() {
        let mut rng = StdRng::seed_from_u64(42);
        let block = NeighborSampler::default()
            .sample(&star(), &[2, 0], &mut rng)
            .unwrap();

        assert_eq!(block.dst_nodes(), &[2, 0]);
        assert_eq!(block.src_nodes(), &[2, 0, 1, 3, 4, 5]);
        assert_eq!(block.num_edges(), 6);

        let srcs: Vec<_> = block
            .in_edges(1)
            .iter()
            .map(|&i| block.src_nodes()[i])
            .collect();
        assert_eq!(srcs, vec![1, 2, 3, 4, 5]);
        assert_eq!(block.in_edges(0), &[2]);
        assert_eq!(block.edge_offset(1), 1);
    }

    #[test]
    fn fanout_bounds_neighbors() {
        assert_eq!(NeighborSampler::default().fanout(), 500);

        let mut rng = StdRng::seed_from_u64(7);
        let sampler = NeighborSampler::new(2);
        assert_eq!(sampler.fanout(), 2);
        let block = sampler.sample(&star(), &[0], &mut rng).unwrap();

        let edges = block.in_edges(0);
        assert_eq!(edges.len(), 2);
        assert_ne!(edges[0], edges[1]);
        assert_eq!(block.num_src(), 3);
    }

    #[test]
    fn zero_in_degree_seed() {
        let mut rng = StdRng::seed_from_u64(0);
        let block = NeighborSampler::default()
            .sample(&star(), &[3], &mut rng)
            .unwrap();

        assert!(block.in_edges(0).is_empty());
        assert_eq!(block.num_src(), 1);
    }

    #[test]
    fn invalid_seeds() {
        let mut rng = StdRng::seed_from_u64(0);
        let sampler = NeighborSampler::default();

        assert_eq!(
            sampler.sample(&star(), &[1, 1], &mut rng),
            Err(GraphErr::DuplicateSeed(1))
        );
        assert!(matches!(
            sampler.sample(&star(), &[6], &mut rng),
            Err(GraphErr::NodeOutOfBounds { id: 6, .. })
        ));
    }
}
