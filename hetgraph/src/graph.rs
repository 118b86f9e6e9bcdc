use crate::{GraphErr, Result};

/// A homogeneous directed graph stored by incoming edges.
///
/// For every destination node, its sources are kept sorted, so repeated edges are adjacent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Graph {
    num_nodes: usize,
    indptr: Vec<usize>,
    sources: Vec<usize>,
}

impl Graph {
    /// Creates a new `Graph`.
    ///
    /// # Arguments
    /// * `num_nodes` - The amount of nodes, ids go from 0 to `num_nodes - 1`.
    /// * `edges` - The `(source, destination)` pairs, repeated pairs become parallel edges.
    ///
    /// # Returns
    /// A new `Graph` or an error if an edge touches a node that doesn't exist.
    pub fn from_edges<I>(num_nodes: usize, edges: I) -> Result<Self>
    where
        I: IntoIterator<Item = (usize, usize)>,
    {
        let mut incoming = vec![Vec::new(); num_nodes];

        for (u, v) in edges {
            for id in [u, v] {
                if id >= num_nodes {
                    return Err(GraphErr::NodeOutOfBounds {
                        what: "node",
                        id,
                        len: num_nodes,
                    });
                }
            }

            incoming[v].push(u);
        }

        Ok(Self::from_incoming(incoming))
    }

    fn from_incoming(mut incoming: Vec<Vec<usize>>) -> Self {
        let num_nodes = incoming.len();
        let mut indptr = Vec::with_capacity(num_nodes + 1);
        let mut sources = Vec::with_capacity(incoming.iter().map(Vec::len).sum());

        indptr.push(0);
        for srcs in &mut incoming {
            srcs.sort_unstable();
            sources.extend_from_slice(srcs);
            indptr.push(sources.len());
        }

        Self {
            num_nodes,
            indptr,
            sources,
        }
    }

    /// Returns a copy of this graph without parallel edges.
    pub fn to_simple(&self) -> Self {
        let incoming = (0..self.num_nodes)
            .map(|v| {
                let mut srcs = self.in_neighbors(v).to_vec();
                srcs.dedup();
                srcs
            })
            .collect();

        Self::from_incoming(incoming)
    }

    /// Returns a simple graph holding every edge of this one in both directions.
    pub fn to_bidirected(&self) -> Self {
        let mut incoming: Vec<Vec<usize>> = (0..self.num_nodes)
            .map(|v| self.in_neighbors(v).to_vec())
            .collect();

        for (u, v) in self.edges() {
            incoming[u].push(v);
        }

        for srcs in &mut incoming {
            srcs.sort_unstable();
            srcs.dedup();
        }

        Self::from_incoming(incoming)
    }

    /// Returns the amount of nodes.
    pub fn num_nodes(&self) -> usize {
        self.num_nodes
    }

    /// Returns the amount of edges.
    pub fn num_edges(&self) -> usize {
        self.sources.len()
    }

    /// Returns the sorted sources of the edges pointing to `v`.
    ///
    /// # Panics
    /// If `v` is not a node of the graph.
    pub fn in_neighbors(&self, v: usize) -> &[usize] {
        &self.sources[self.indptr[v]..self.indptr[v + 1]]
    }

    /// Returns the amount of edges pointing to `v`.
    pub fn in_degree(&self, v: usize) -> usize {
        self.indptr[v + 1] - self.indptr[v]
    }

    /// Returns the amount of edges per node, 0 for a graph without nodes.
    pub fn average_degree(&self) -> f64 {
        if self.num_nodes == 0 {
            return 0.0;
        }

        self.num_edges() as f64 / self.num_nodes as f64
    }

    /// Iterates the `(source, destination)` pairs, grouped by destination.
    pub fn edges(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        (0..self.num_nodes).flat_map(move |v| self.in_neighbors(v).iter().map(move |&u| (u, v)))
    }
}
