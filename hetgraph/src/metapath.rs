use std::fmt::{self, Display};

use log::debug;

use crate::{Graph, GraphErr, HeteroGraph, Result};

/// An ordered sequence of edge type names describing a composite relation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Metapath(Vec<String>);

impl Metapath {
    /// Creates a new `Metapath`.
    ///
    /// # Arguments
    /// * `etypes` - The edge type names in traversal order.
    ///
    /// # Returns
    /// A new `Metapath` or an error if no edge type was given.
    pub fn new<I, S>(etypes: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let etypes: Vec<String> = etypes.into_iter().map(Into::into).collect();

        if etypes.is_empty() {
            return Err(GraphErr::EmptyMetapath);
        }

        Ok(Self(etypes))
    }

    /// Returns the edge type names.
    pub fn etypes(&self) -> &[String] {
        &self.0
    }

    /// Returns the amount of hops.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Display for Metapath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join("-"))
    }
}

/// Bounds applied when materializing a metapath reachable graph.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReachabilityConfig {
    /// Metapaths whose reachability density goes above this value are not materialized.
    pub threshold: f64,
    /// Multi hop metapaths keep at most `(rows + cols) * topk_factor` of their strongest pairs.
    pub topk_factor: usize,
}

impl Default for ReachabilityConfig {
    fn default() -> Self {
        Self {
            threshold: 0.75,
            topk_factor: 5000,
        }
    }
}

/// The outcome of materializing a metapath.
#[derive(Debug, Clone, PartialEq)]
pub enum Reachability {
    /// The reachable graph, simple and bidirected.
    Sparse(Graph),
    /// The metapath connects too many pairs to be useful.
    Dense { density: f64 },
}

/// Builds the graph connecting every pair of nodes joined by an instance of `metapath`.
///
/// The adjacency matrices along the metapath are multiplied, so the entries of the product count
/// the metapath instances between each pair. If the product is denser than `cfg.threshold` no
/// graph is built. Otherwise, metapaths with more than one hop keep only their
/// `(rows + cols) * cfg.topk_factor` most connected pairs.
///
/// The nodes of the resulting graph are `rows + cols`. Source and destination ids share that
/// single id space.
///
/// # Arguments
/// * `g` - The heterogeneous graph.
/// * `metapath` - The metapath to materialize.
/// * `cfg` - The density threshold and sparsification factor.
///
/// # Returns
/// The reachable graph, a dense marker or an error if the metapath doesn't fit the graph.
pub fn metapath_reachable_graph(
    g: &HeteroGraph,
    metapath: &Metapath,
    cfg: &ReachabilityConfig,
) -> Result<Reachability> {
    let mut etypes = metapath.etypes().iter();
    let first = etypes.next().ok_or(GraphErr::EmptyMetapath)?;

    let mut prev = g.to_canonical_etype(first)?;
    let mut adj = g.adj(first)?.clone();

    for etype in etypes {
        let next = g.to_canonical_etype(etype)?;
        if next.src != prev.dst {
            return Err(GraphErr::DisconnectedMetapath {
                prev: prev.etype.clone(),
                next: next.etype.clone(),
            });
        }

        adj = adj.matmul(g.adj(etype)?)?;
        prev = next;
    }

    let (nrows, ncols) = adj.shape();
    let density = if nrows == 0 {
        0.0
    } else {
        adj.nnz() as f64 / nrows as f64 / nrows as f64
    };

    debug!(metapath:% = metapath, density = density; "computed reachability density");

    if density > cfg.threshold {
        return Ok(Reachability::Dense { density });
    }

    let mut pairs: Vec<(usize, usize, u64)> = adj.iter().collect();

    if metapath.len() > 1 {
        let k = (nrows + ncols).saturating_mul(cfg.topk_factor);
        if pairs.len() > k {
            pairs.sort_unstable_by(|a, b| b.2.cmp(&a.2).then((a.0, a.1).cmp(&(b.0, b.1))));
            pairs.truncate(k);
        }
    }

    debug!(metapath:% = metapath, edges = pairs.len(); "kept reachable pairs");

    let graph = Graph::from_edges(nrows + ncols, pairs.into_iter().map(|(r, c, _)| (r, c)))?;

    Ok(Reachability::Sparse(graph.to_simple().to_bidirected()))
}

#[cfg(test)]
mod tests {
    use super::*;

    // papers 0..4, authors 0..3
    fn graph() -> HeteroGraph {
        let writes = [(0, 0), (1, 0), (1, 1), (2, 1), (3, 2)];

        HeteroGraph::builder()
            .add_nodes("paper", 4)
            .add_nodes("author", 3)
            .add_edges("paper", "pa", "author", writes)
            .unwrap()
            .add_edges("author", "ap", "paper", writes.map(|(p, a)| (a, p)))
            .unwrap()
            .build()
    }

    fn sparse(reach: Reachability) -> Graph {
        match reach {
            Reachability::Sparse(g) => g,
            Reachability::Dense { density } => panic!("unexpected dense metapath ({density})"),
        }
    }

    #[test]
    fn empty_metapath() {
        assert_eq!(
            Metapath::new(Vec::<String>::new()),
            Err(GraphErr::EmptyMetapath)
        );
    }

    #[test]
    fn display() {
        let mp = Metapath::new(["pa", "ap"]).unwrap();
        assert_eq!(mp.to_string(), "pa-ap");
        assert_eq!(mp.len(), 2);
    }

    #[test]
    fn pap_connects_coauthored_papers() {
        let mp = Metapath::new(["pa", "ap"]).unwrap();
        let reach = metapath_reachable_graph(&graph(), &mp, &ReachabilityConfig::default());
        let g = sparse(reach.unwrap());

        assert_eq!(g.num_nodes(), 8);
        assert_eq!(g.in_neighbors(0), &[0, 1]);
        assert_eq!(g.in_neighbors(1), &[0, 1, 2]);
        assert_eq!(g.in_neighbors(2), &[1, 2]);
        assert_eq!(g.in_neighbors(3), &[3]);
        assert_eq!(g.in_degree(7), 0);
    }

    #[test]
    fn dense_metapath_is_pruned() {
        let mp = Metapath::new(["pa", "ap"]).unwrap();
        let cfg = ReachabilityConfig {
            threshold: 0.25,
            ..Default::default()
        };

        // 8 non zero entries over 4 * 4 papers
        let reach = metapath_reachable_graph(&graph(), &mp, &cfg).unwrap();
        assert_eq!(reach, Reachability::Dense { density: 0.5 });
    }

    #[test]
    fn topk_keeps_strongest_pairs() {
        let writes = [(0, 0), (1, 0), (2, 0), (0, 1), (1, 1), (0, 2)];
        let g = HeteroGraph::builder()
            .add_nodes("paper", 3)
            .add_nodes("author", 3)
            .add_edges("paper", "pa", "author", writes)
            .unwrap()
            .add_edges("author", "ap", "paper", writes.map(|(p, a)| (a, p)))
            .unwrap()
            .build();
        let mp = Metapath::new(["pa", "ap"]).unwrap();

        let cfg = ReachabilityConfig {
            threshold: 1.0,
            topk_factor: 0,
        };
        let reach = sparse(metapath_reachable_graph(&g, &mp, &cfg).unwrap());
        assert_eq!(reach.num_edges(), 0);

        // all 9 pairs are reachable, (0, 0) three times and the {0, 1} block twice, only
        // (3 + 3) * 1 of them survive
        let cfg = ReachabilityConfig {
            threshold: 1.0,
            topk_factor: 1,
        };
        let reach = sparse(metapath_reachable_graph(&g, &mp, &cfg).unwrap());
        assert_eq!(reach.in_neighbors(0), &[0, 1, 2]);
        assert_eq!(reach.in_neighbors(1), &[0, 1, 2]);
        assert_eq!(reach.in_neighbors(2), &[0, 1]);
    }

    #[test]
    fn single_hop_is_not_sparsified() {
        let mp = Metapath::new(["pa"]).unwrap();
        let cfg = ReachabilityConfig {
            threshold: 1.0,
            topk_factor: 0,
        };

        let g = sparse(metapath_reachable_graph(&graph(), &mp, &cfg).unwrap());
        assert_eq!(g.num_nodes(), 7);
        // 5 edges in both directions, paper 0 -> author 0 overlaps author 0 -> paper 0
        assert!(g.num_edges() > 0);
    }

    #[test]
    fn disconnected_metapath() {
        let mp = Metapath::new(["pa", "pa"]).unwrap();
        let err = metapath_reachable_graph(&graph(), &mp, &ReachabilityConfig::default())
            .unwrap_err();

        assert_eq!(
            err,
            GraphErr::DisconnectedMetapath {
                prev: "pa".to_string(),
                next: "pa".to_string(),
            }
        );
    }
}
