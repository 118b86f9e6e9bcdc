use std::collections::HashMap;

use crate::{CsrMatrix, GraphErr, Result};

/// A fully qualified edge type: `(source node type, edge type, destination node type)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CanonicalEdgeType {
    pub src: String,
    pub etype: String,
    pub dst: String,
}

#[derive(Debug, Clone)]
struct Relation {
    canonical: CanonicalEdgeType,
    adj: CsrMatrix,
}

/// A heterogeneous graph: typed nodes connected by typed edges.
///
/// Edge type names are unique, so a bare name identifies its canonical triple.
#[derive(Debug, Clone, Default)]
pub struct HeteroGraph {
    node_counts: HashMap<String, usize>,
    relations: HashMap<String, Relation>,
}

impl HeteroGraph {
    /// Creates a new `HeteroGraphBuilder`.
    pub fn builder() -> HeteroGraphBuilder {
        HeteroGraphBuilder::default()
    }

    /// Returns the amount of nodes of the given type.
    pub fn num_nodes(&self, ntype: &str) -> Result<usize> {
        self.node_counts
            .get(ntype)
            .copied()
            .ok_or_else(|| GraphErr::UnknownNodeType(ntype.to_string()))
    }

    /// Resolves an edge type name into its canonical triple.
    pub fn to_canonical_etype(&self, etype: &str) -> Result<&CanonicalEdgeType> {
        self.relation(etype).map(|rel| &rel.canonical)
    }

    /// Returns the adjacency matrix of an edge type, rows are sources and columns destinations.
    pub fn adj(&self, etype: &str) -> Result<&CsrMatrix> {
        self.relation(etype).map(|rel| &rel.adj)
    }

    /// Returns the amount of edges of the given type, counting repeated edges.
    pub fn num_edges(&self, etype: &str) -> Result<usize> {
        let adj = self.adj(etype)?;
        Ok(adj.iter().map(|(_, _, count)| count as usize).sum())
    }

    /// Returns every edge type name, sorted.
    pub fn etypes(&self) -> Vec<&str> {
        let mut etypes: Vec<_> = self.relations.keys().map(String::as_str).collect();
        etypes.sort_unstable();
        etypes
    }

    fn relation(&self, etype: &str) -> Result<&Relation> {
        self.relations
            .get(etype)
            .ok_or_else(|| GraphErr::UnknownEdgeType(etype.to_string()))
    }
}

/// Incrementally assembles a `HeteroGraph`.
#[derive(Debug, Default)]
pub struct HeteroGraphBuilder {
    graph: HeteroGraph,
}

impl HeteroGraphBuilder {
    /// Declares a node type with `n` nodes, redeclaring a type overrides its count.
    pub fn add_nodes(mut self, ntype: &str, n: usize) -> Self {
        self.graph.node_counts.insert(ntype.to_string(), n);
        self
    }

    /// Adds an edge type and its edges.
    ///
    /// # Arguments
    /// * `src` - The source node type, it must have been declared.
    /// * `etype` - The name of the edge type, unique in the graph.
    /// * `dst` - The destination node type, it must have been declared.
    /// * `edges` - The `(source id, destination id)` pairs.
    ///
    /// # Returns
    /// The builder or an error if a type is unknown, the name is taken or an id is out of bounds.
    pub fn add_edges<I>(mut self, src: &str, etype: &str, dst: &str, edges: I) -> Result<Self>
    where
        I: IntoIterator<Item = (usize, usize)>,
    {
        if self.graph.relations.contains_key(etype) {
            return Err(GraphErr::DuplicateEdgeType(etype.to_string()));
        }

        let nsrc = self.graph.num_nodes(src)?;
        let ndst = self.graph.num_nodes(dst)?;
        let adj = CsrMatrix::from_entries(nsrc, ndst, edges)?;

        let canonical = CanonicalEdgeType {
            src: src.to_string(),
            etype: etype.to_string(),
            dst: dst.to_string(),
        };

        self.graph
            .relations
            .insert(etype.to_string(), Relation { canonical, adj });

        Ok(self)
    }

    /// Finishes the graph.
    pub fn build(self) -> HeteroGraph {
        self.graph
    }
}
