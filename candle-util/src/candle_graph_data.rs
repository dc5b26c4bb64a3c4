use crate::candle_scatter::GraphMembership;

use candle_core::{Device, Tensor};
use rand::prelude::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// A featurized molecular graph kept on the host.
///
/// * `nodes` - atom features, one row per atom
/// * `edges` - undirected bonds `[u, v]`
/// * `edge_features` - bond features, one row per bond (may be empty)
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MolGraph {
    pub nodes: Vec<Vec<f32>>,
    #[serde(default)]
    pub edges: Vec<[u32; 2]>,
    #[serde(default)]
    pub edge_features: Vec<Vec<f32>>,
}

impl MolGraph {
    pub fn num_atoms(&self) -> usize {
        self.nodes.len()
    }

    pub fn num_bonds(&self) -> usize {
        self.edges.len()
    }

    /// check feature widths and bond endpoints
    pub fn validate(&self, dims: &GraphDims) -> anyhow::Result<()> {
        if let Some(row) = self.nodes.iter().find(|r| r.len() != dims.node) {
            return Err(anyhow::anyhow!(
                "atom feature width {} vs. expected {}",
                row.len(),
                dims.node
            ));
        }
        let n = self.num_atoms() as u32;
        if let Some([u, v]) = self.edges.iter().find(|[u, v]| *u >= n || *v >= n) {
            return Err(anyhow::anyhow!(
                "bond ({}, {}) out of range for {} atoms",
                u,
                v,
                n
            ));
        }
        if !self.edge_features.is_empty() {
            if self.edge_features.len() != self.num_bonds() {
                return Err(anyhow::anyhow!(
                    "{} bond feature rows vs. {} bonds",
                    self.edge_features.len(),
                    self.num_bonds()
                ));
            }
            if let Some(row) = self.edge_features.iter().find(|r| r.len() != dims.edge) {
                return Err(anyhow::anyhow!(
                    "bond feature width {} vs. expected {}",
                    row.len(),
                    dims.edge
                ));
            }
        }
        Ok(())
    }
}

/// atom and bond feature widths
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GraphDims {
    pub node: usize,
    pub edge: usize,
}

/// A batch of molecular graphs stacked into one disconnected graph.
///
/// Bonds appear in both directions.
pub struct GraphBatch {
    pub node_features: Tensor,
    pub edge_src: Tensor,
    pub edge_dst: Tensor,
    pub edge_features: Tensor,
    pub incidence_dst: Tensor,
    pub membership: GraphMembership,
    pub sizes: Vec<usize>,
}

impl GraphBatch {
    ///
    /// Stack `graphs` into tensors on `device`
    ///
    /// * `node_features` - N x dims.node
    /// * `edge_src`, `edge_dst` - directed bond endpoints (E,)
    /// * `edge_features` - E x dims.edge
    /// * `incidence_dst` - N x E, 1 where the bond points to the atom
    ///
    pub fn collate(graphs: &[&MolGraph], dims: GraphDims, device: &Device) -> anyhow::Result<Self> {
        let mut nodes = vec![];
        let mut src = vec![];
        let mut dst = vec![];
        let mut bond_feats = vec![];
        let mut graph_of_atom = vec![];
        let mut sizes = Vec::with_capacity(graphs.len());

        let mut offset = 0u32;
        for (g, graph) in graphs.iter().enumerate() {
            graph.validate(&dims)?;
            for row in graph.nodes.iter() {
                nodes.extend_from_slice(row);
                graph_of_atom.push(g as u32);
            }
            for (b, &[u, v]) in graph.edges.iter().enumerate() {
                let feat = graph.edge_features.get(b);
                for (s, d) in [(u, v), (v, u)] {
                    src.push(offset + s);
                    dst.push(offset + d);
                    match feat {
                        Some(row) => bond_feats.extend_from_slice(row),
                        None => bond_feats.extend(std::iter::repeat_n(0f32, dims.edge)),
                    }
                }
            }
            offset += graph.num_atoms() as u32;
            sizes.push(graph.num_atoms());
        }

        let natoms = graph_of_atom.len();
        let nedges = src.len();

        let mut incidence = vec![0f32; natoms * nedges];
        for (e, &d) in dst.iter().enumerate() {
            incidence[d as usize * nedges + e] = 1.;
        }

        Ok(GraphBatch {
            node_features: Tensor::from_vec(nodes, (natoms, dims.node), device)?,
            edge_src: Tensor::from_vec(src, nedges, device)?,
            edge_dst: Tensor::from_vec(dst, nedges, device)?,
            edge_features: Tensor::from_vec(bond_feats, (nedges, dims.edge), device)?,
            incidence_dst: Tensor::from_vec(incidence, (natoms, nedges), device)?,
            membership: GraphMembership::new(&graph_of_atom, graphs.len(), device)?,
            sizes,
        })
    }

    pub fn num_graphs(&self) -> usize {
        self.sizes.len()
    }

    pub fn num_atoms(&self) -> usize {
        self.membership.num_atoms()
    }

    pub fn num_edges(&self) -> usize {
        self.edge_src.dims1().unwrap_or(0)
    }
}

///
/// A helper `struct` for shuffling and creating minibatch indexes;
/// after `shuffle_minibatch` is called, `chunks` partition indexes.
///
pub struct Minibatches {
    samples: Vec<usize>,
    pub chunks: Vec<Vec<usize>>,
}

impl Minibatches {
    pub fn new(size: usize) -> Self {
        Self {
            samples: (0..size).collect(),
            chunks: vec![],
        }
    }

    /// shuffle samples and partition them into chunks of `batch_size`
    /// (the last chunk may be smaller)
    pub fn shuffle_minibatch<R: Rng + ?Sized>(&mut self, batch_size: usize, rng: &mut R) {
        self.samples.shuffle(rng);
        self.chunk(batch_size);
    }

    /// partition samples in their current order
    pub fn chunk(&mut self, batch_size: usize) {
        let batch_size = batch_size.max(1);
        self.chunks = self
            .samples
            .chunks(batch_size)
            .map(|c| c.to_vec())
            .collect();
    }

    pub fn size(&self) -> usize {
        self.samples.len()
    }

    pub fn num_minibatch(&self) -> usize {
        self.chunks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain(natoms: usize, dims: GraphDims) -> MolGraph {
        MolGraph {
            nodes: vec![vec![1.; dims.node]; natoms],
            edges: (1..natoms as u32).map(|i| [i - 1, i]).collect(),
            edge_features: vec![],
        }
    }

    #[test]
    fn collate_offsets_bonds_and_membership() -> anyhow::Result<()> {
        let dims = GraphDims { node: 4, edge: 2 };
        let a = chain(3, dims);
        let b = chain(2, dims);
        let batch = GraphBatch::collate(&[&a, &b], dims, &Device::Cpu)?;

        assert_eq!(batch.node_features.dims(), &[5, 4]);
        assert_eq!(batch.num_edges(), 6);
        assert_eq!(batch.edge_features.dims(), &[6, 2]);
        assert_eq!(batch.incidence_dst.dims(), &[5, 6]);
        assert_eq!(batch.sizes, vec![3, 2]);

        let src: Vec<u32> = batch.edge_src.to_vec1()?;
        let dst: Vec<u32> = batch.edge_dst.to_vec1()?;
        // the bond of the second graph is shifted by three atoms
        assert_eq!(&src[4..], &[3, 4]);
        assert_eq!(&dst[4..], &[4, 3]);

        let memb: Vec<u32> = batch.membership.index().to_vec1()?;
        assert_eq!(memb, vec![0, 0, 0, 1, 1]);
        Ok(())
    }

    #[test]
    fn collate_rejects_bad_bond() {
        let dims = GraphDims { node: 2, edge: 1 };
        let mut g = chain(2, dims);
        g.edges.push([0, 7]);
        assert!(GraphBatch::collate(&[&g], dims, &Device::Cpu).is_err());
    }

    #[test]
    fn minibatches_cover_every_sample_once() {
        let mut mb = Minibatches::new(10);
        let mut rng = rand::rng();
        mb.shuffle_minibatch(4, &mut rng);
        assert_eq!(mb.num_minibatch(), 3);
        let mut all: Vec<usize> = mb.chunks.iter().flatten().copied().collect();
        all.sort();
        assert_eq!(all, (0..10).collect::<Vec<_>>());
    }
}
