mod csr;
mod error;
mod graph;
mod hetero;
pub mod metapath;
pub mod sampler;

pub use csr::CsrMatrix;
pub use error::{GraphErr, Result};
pub use graph::Graph;
pub use hetero::{CanonicalEdgeType, HeteroGraph, HeteroGraphBuilder};
pub use metapath::{Metapath, Reachability, ReachabilityConfig, metapath_reachable_graph};
pub use sampler::{Block, NeighborSampler};
