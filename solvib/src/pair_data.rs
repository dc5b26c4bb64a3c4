use crate::common_io::open_buf_reader;

use candle_core::{Device, Tensor};
use candle_util::candle_graph_data::{GraphBatch, GraphDims, Minibatches, MolGraph};
use candle_util::candle_scatter::{expand_pairing, identity_pairing};
use log::info;
use rand::Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::io::BufRead;

/// bond feature width assumed when no record carries bond features
pub const DEFAULT_EDGE_DIM: usize = 10;

/// One solute-solvent record with its measured property
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MolPair {
    pub solute: MolGraph,
    pub solvent: MolGraph,
    pub target: f32,
}

/// Read one `MolPair` per line; blank lines are skipped
/// * `input_file` - JSON lines, optionally gzipped
pub fn read_pairs_jsonl(input_file: &str) -> anyhow::Result<Vec<MolPair>> {
    let mut ret = vec![];
    for (i, line) in open_buf_reader(input_file)?.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let pair: MolPair = serde_json::from_str(&line)
            .map_err(|e| anyhow::anyhow!("{}:{}: {}", input_file, i + 1, e))?;
        ret.push(pair);
    }
    info!("read {} pairs from {}", ret.len(), input_file);
    Ok(ret)
}

/// Take feature widths from the first atom and the first bond found
pub fn infer_graph_dims(pairs: &[MolPair]) -> anyhow::Result<GraphDims> {
    let node = pairs
        .iter()
        .flat_map(|p| [&p.solute, &p.solvent])
        .find_map(|g| g.nodes.first().map(|r| r.len()))
        .ok_or(anyhow::anyhow!("no atoms in the data"))?;

    let edge = pairs
        .iter()
        .flat_map(|p| [&p.solute, &p.solvent])
        .find_map(|g| g.edge_features.first().map(|r| r.len()))
        .unwrap_or(DEFAULT_EDGE_DIM);

    Ok(GraphDims { node, edge })
}

/// A minibatch of paired graphs, solute graph `i` pairs with solvent
/// graph `i`
pub struct PairBatch {
    pub solute: GraphBatch,
    pub solvent: GraphBatch,
    /// graph-level pairing indicator (B x B)
    pub pairing: Tensor,
    /// observed property (B x 1)
    pub target: Tensor,
}

impl PairBatch {
    pub fn collate(pairs: &[&MolPair], dims: GraphDims, device: &Device) -> anyhow::Result<Self> {
        if pairs.is_empty() {
            return Err(anyhow::anyhow!("empty minibatch"));
        }
        let solute: Vec<&MolGraph> = pairs.iter().map(|p| &p.solute).collect();
        let solvent: Vec<&MolGraph> = pairs.iter().map(|p| &p.solvent).collect();
        let target: Vec<f32> = pairs.iter().map(|p| p.target).collect();
        let npairs = pairs.len();

        Ok(Self {
            solute: GraphBatch::collate(&solute, dims, device)?,
            solvent: GraphBatch::collate(&solvent, dims, device)?,
            pairing: identity_pairing(npairs, device)?,
            target: Tensor::from_vec(target, (npairs, 1), device)?,
        })
    }

    pub fn num_pairs(&self) -> usize {
        self.solute.num_graphs()
    }

    /// pairing expanded to atoms (solute atoms x solvent atoms)
    pub fn pairing_mask(&self) -> candle_core::Result<Tensor> {
        expand_pairing(&self.solute.membership, &self.pairing, &self.solvent.membership)
    }
}

/// Paired graphs with minibatch bookkeeping
pub struct PairDataset {
    pairs: Vec<MolPair>,
    dims: GraphDims,
    minibatches: Minibatches,
}

impl PairDataset {
    /// Check every record against `dims`
    pub fn new(pairs: Vec<MolPair>, dims: GraphDims) -> anyhow::Result<Self> {
        if pairs.is_empty() {
            return Err(anyhow::anyhow!("empty data set"));
        }
        for (i, p) in pairs.iter().enumerate() {
            p.solute
                .validate(&dims)
                .map_err(|e| anyhow::anyhow!("record {} solute: {}", i, e))?;
            p.solvent
                .validate(&dims)
                .map_err(|e| anyhow::anyhow!("record {} solvent: {}", i, e))?;
        }
        let minibatches = Minibatches::new(pairs.len());
        Ok(Self {
            pairs,
            dims,
            minibatches,
        })
    }

    pub fn from_jsonl(input_file: &str, dims: GraphDims) -> anyhow::Result<Self> {
        Self::new(read_pairs_jsonl(input_file)?, dims)
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn dims(&self) -> GraphDims {
        self.dims
    }

    pub fn pairs(&self) -> &[MolPair] {
        &self.pairs
    }

    /// Partition into shuffled minibatches without replacement
    pub fn shuffle_minibatch<R: Rng + ?Sized>(&mut self, batch_size: usize, rng: &mut R) {
        self.minibatches.shuffle_minibatch(batch_size, rng);
    }

    /// Partition in file order
    pub fn ordered_minibatch(&mut self, batch_size: usize) {
        self.minibatches = Minibatches::new(self.pairs.len());
        self.minibatches.chunk(batch_size);
    }

    pub fn num_minibatch(&self) -> usize {
        self.minibatches.num_minibatch()
    }

    /// indexes of the records in the `b`-th minibatch
    pub fn minibatch_indexes(&self, b: usize) -> Option<&[usize]> {
        self.minibatches.chunks.get(b).map(|c| c.as_slice())
    }

    pub fn minibatch(&self, b: usize, device: &Device) -> anyhow::Result<PairBatch> {
        let idx = self
            .minibatch_indexes(b)
            .ok_or(anyhow::anyhow!("minibatch {} out of {}", b, self.num_minibatch()))?;
        let pairs: Vec<&MolPair> = idx.iter().map(|&i| &self.pairs[i]).collect();
        PairBatch::collate(&pairs, self.dims, device)
    }

    /// Collate all current minibatches in parallel
    pub fn collate_minibatches(&self, device: &Device) -> anyhow::Result<Vec<PairBatch>> {
        (0..self.num_minibatch())
            .into_par_iter()
            .map(|b| self.minibatch(b, device))
            .collect()
    }
}
