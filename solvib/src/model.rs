use crate::bottleneck::BottleneckCompressor;
use crate::interaction::{interact, InteractionOutput};
use crate::pair_data::PairBatch;
use crate::predictor::Predictor;

use candle_core::{Result, Tensor};
use candle_nn::{Linear, VarBuilder};
use candle_util::candle_graph_encoder::{MessagePassingEncoder, MessagePassingEncoderArgs};
use candle_util::candle_model_traits::{GraphEncoderT, SetPoolT};
use candle_util::candle_set2set::Set2Set;

pub struct GibModelArgs {
    pub n_node_features: usize,
    pub n_edge_features: usize,
    pub n_hidden: usize,
    pub num_message_passing: usize,
    pub num_set2set_steps: usize,
}

impl Default for GibModelArgs {
    fn default() -> Self {
        Self {
            n_node_features: 52,
            n_edge_features: 10,
            n_hidden: 52,
            num_message_passing: 3,
            num_set2set_steps: 2,
        }
    }
}

/// Per-side tensors kept by an introspection pass, all detached
pub struct Checkpoints {
    /// pooled solute embeddings (B x 4h)
    pub solute_embedding: Tensor,
    /// pooled solvent embeddings (B x 4h)
    pub solvent_embedding: Tensor,
    /// compressor logits of solute atoms (solute atoms x 1)
    pub solute_importance: Tensor,
    /// compressor logits of solvent atoms (solvent atoms x 1)
    pub solvent_importance: Tensor,
}

pub struct PlainOutput {
    /// B x 1
    pub prediction: Tensor,
    /// solute atoms x solvent atoms, detached
    pub interaction_map: Tensor,
    checkpoints: Option<Checkpoints>,
}

impl PlainOutput {
    /// Only available when the forward pass asked for introspection
    pub fn checkpoints(&self) -> Result<&Checkpoints> {
        match self.checkpoints.as_ref() {
            Some(ckpt) => Ok(ckpt),
            None => candle_core::bail!("no checkpoints: forward_plain was called without introspection"),
        }
    }

    pub fn into_checkpoints(self) -> Result<Checkpoints> {
        match self.checkpoints {
            Some(ckpt) => Ok(ckpt),
            None => candle_core::bail!("no checkpoints: forward_plain was called without introspection"),
        }
    }
}

pub struct BottleneckOutput {
    /// B x 1
    pub prediction: Tensor,
    pub solute_kl: Tensor,
    pub solvent_kl: Tensor,
    pub solute_preserve_rate: Tensor,
    pub solvent_preserve_rate: Tensor,
}

/// Solute-solvent property model with a variational atom bottleneck.
///
/// Both molecules are encoded separately, then every solute atom is
/// contrasted against the atoms of its paired solvent (and vice
/// versa). In the plain mode the interacted atoms are pooled by
/// Set2Set and fed to the predictor. In the bottleneck mode each side
/// first passes through its own compressor, and the predictor sees
/// pooled noisy atoms instead.
pub struct GibModel<Enc = MessagePassingEncoder>
where
    Enc: GraphEncoderT,
{
    solute_encoder: Enc,
    solvent_encoder: Enc,
    solute_compressor: BottleneckCompressor,
    solvent_compressor: BottleneckCompressor,
    solute_pool: Set2Set,
    solvent_pool: Set2Set,
    predictor: Predictor,
}

impl GibModel<MessagePassingEncoder> {
    /// Will create the message passing encoders under `solute.` and
    /// `solvent.` and the rest of the model next to them
    pub fn new(args: &GibModelArgs, vb: VarBuilder) -> Result<Self> {
        let enc_args = || MessagePassingEncoderArgs {
            n_node_features: args.n_node_features,
            n_edge_features: args.n_edge_features,
            n_hidden: args.n_hidden,
            num_steps: args.num_message_passing,
        };
        let solute_encoder = MessagePassingEncoder::new(enc_args(), vb.pp("solute"))?;
        let solvent_encoder = MessagePassingEncoder::new(enc_args(), vb.pp("solvent"))?;
        Self::from_encoders(solute_encoder, solvent_encoder, args.num_set2set_steps, vb)
    }
}

impl<Enc> GibModel<Enc>
where
    Enc: GraphEncoderT,
{
    /// Assemble the model around two encoders of the same width
    ///
    /// * `num_set2set_steps` - attention rounds of each pooling layer
    pub fn from_encoders(
        solute_encoder: Enc,
        solvent_encoder: Enc,
        num_set2set_steps: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let h = solute_encoder.dim_hidden();
        if solvent_encoder.dim_hidden() != h {
            candle_core::bail!(
                "solute encoder width {} vs. solvent encoder width {}",
                h,
                solvent_encoder.dim_hidden()
            );
        }

        // atoms are [x, x'] after the interaction
        let d_atom = 2 * h;

        let solute_compressor = BottleneckCompressor::new(d_atom, h, vb.pp("compressor.solute"))?;
        let solvent_compressor = BottleneckCompressor::new(d_atom, h, vb.pp("compressor.solvent"))?;
        let solute_pool = Set2Set::new(d_atom, num_set2set_steps, vb.pp("set2set.solute"))?;
        let solvent_pool = Set2Set::new(d_atom, num_set2set_steps, vb.pp("set2set.solvent"))?;
        let predictor = Predictor::new(
            solute_pool.dim_out() + solvent_pool.dim_out(),
            vb.pp("predictor"),
        )?;

        Ok(Self {
            solute_encoder,
            solvent_encoder,
            solute_compressor,
            solvent_compressor,
            solute_pool,
            solvent_pool,
            predictor,
        })
    }

    pub fn dim_hidden(&self) -> usize {
        self.solute_encoder.dim_hidden()
    }

    pub fn predictor(&self) -> &Predictor {
        &self.predictor
    }

    /// Every dense layer in the model, in construction order
    pub fn dense_layers(&self) -> Vec<&Linear> {
        let mut ret = self.solute_encoder.dense_layers();
        ret.extend(self.solvent_encoder.dense_layers());
        ret.extend(self.solute_compressor.dense_layers());
        ret.extend(self.solvent_compressor.dense_layers());
        ret.extend(self.predictor.dense_layers());
        ret
    }

    fn encode_and_interact(&self, batch: &PairBatch, train: bool) -> Result<InteractionOutput> {
        let solute_mk = self.solute_encoder.encode(&batch.solute, train)?;
        let solvent_nk = self.solvent_encoder.encode(&batch.solvent, train)?;
        interact(&solute_mk, &solvent_nk, &batch.pairing_mask()?)
    }

    /// Encode, interact, pool and predict
    ///
    /// * `train` - batch statistics in the normalization layers
    /// * `introspect` - also keep pooled embeddings and per-atom
    ///   importance logits (see [`PlainOutput::checkpoints`])
    pub fn forward_plain(&self, batch: &PairBatch, train: bool, introspect: bool) -> Result<PlainOutput> {
        let inter = self.encode_and_interact(batch, train)?;

        let solute_emb = self
            .solute_pool
            .pool(&inter.solute_features, &batch.solute.membership)?;
        let solvent_emb = self
            .solvent_pool
            .pool(&inter.solvent_features, &batch.solvent.membership)?;

        let prediction = self.predictor.predict(&solute_emb, &solvent_emb)?;

        let checkpoints = if introspect {
            let solute_importance = self
                .solute_compressor
                .logits(&inter.solute_features.detach(), false)?
                .detach();
            let solvent_importance = self
                .solvent_compressor
                .logits(&inter.solvent_features.detach(), false)?
                .detach();
            Some(Checkpoints {
                solute_embedding: solute_emb.detach(),
                solvent_embedding: solvent_emb.detach(),
                solute_importance,
                solvent_importance,
            })
        } else {
            None
        };

        Ok(PlainOutput {
            prediction,
            interaction_map: inter.interaction_map,
            checkpoints,
        })
    }

    /// Encode, interact, compress each side, pool the noisy atoms and
    /// predict
    pub fn forward_bottleneck(&self, batch: &PairBatch, train: bool) -> Result<BottleneckOutput> {
        let inter = self.encode_and_interact(batch, train)?;

        let solute = self.solute_compressor.compress(
            &inter.solute_features,
            &batch.solute.membership,
            train,
        )?;
        let solvent = self.solvent_compressor.compress(
            &inter.solvent_features,
            &batch.solvent.membership,
            train,
        )?;

        let solute_emb = self
            .solute_pool
            .pool(&solute.noisy_features, &batch.solute.membership)?;
        let solvent_emb = self
            .solvent_pool
            .pool(&solvent.noisy_features, &batch.solvent.membership)?;

        Ok(BottleneckOutput {
            prediction: self.predictor.predict(&solute_emb, &solvent_emb)?,
            solute_kl: solute.kl,
            solvent_kl: solvent.kl,
            solute_preserve_rate: solute.preserve_rate,
            solvent_preserve_rate: solvent.preserve_rate,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pair_data::MolPair;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;
    use candle_util::candle_graph_data::{GraphDims, MolGraph};

    fn small_args() -> GibModelArgs {
        GibModelArgs {
            n_node_features: 6,
            n_edge_features: 2,
            n_hidden: 8,
            num_message_passing: 2,
            num_set2set_steps: 2,
        }
    }

    fn ring(natoms: usize) -> MolGraph {
        MolGraph {
            nodes: (0..natoms).map(|i| vec![i as f32 * 0.1; 6]).collect(),
            edges: (0..natoms as u32).map(|i| [i, (i + 1) % natoms as u32]).collect(),
            edge_features: vec![vec![1., 0.]; natoms],
        }
    }

    fn batch(dev: &Device) -> anyhow::Result<PairBatch> {
        let a = MolPair {
            solute: ring(3),
            solvent: ring(4),
            target: 1.,
        };
        let b = MolPair {
            solute: ring(5),
            solvent: ring(2),
            target: -1.,
        };
        PairBatch::collate(&[&a, &b], GraphDims { node: 6, edge: 2 }, dev)
    }

    #[test]
    fn plain_output_without_introspection_refuses_checkpoints() -> anyhow::Result<()> {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let model = GibModel::new(&small_args(), VarBuilder::from_varmap(&varmap, DType::F32, &dev))?;
        let batch = batch(&dev)?;

        let out = model.forward_plain(&batch, false, false)?;
        assert_eq!(out.prediction.dims(), &[2, 1]);
        assert_eq!(out.interaction_map.dims(), &[8, 6]);
        assert!(out.checkpoints().is_err());

        let out = model.forward_plain(&batch, false, true)?;
        let ckpt = out.checkpoints()?;
        assert_eq!(ckpt.solute_embedding.dims(), &[2, 32]);
        assert_eq!(ckpt.solvent_embedding.dims(), &[2, 32]);
        assert_eq!(ckpt.solute_importance.dims(), &[8, 1]);
        assert_eq!(ckpt.solvent_importance.dims(), &[6, 1]);
        Ok(())
    }

    #[test]
    fn dense_layers_are_enumerated() -> anyhow::Result<()> {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let model = GibModel::new(&small_args(), VarBuilder::from_varmap(&varmap, DType::F32, &dev))?;
        // 2 per encoder, 2 per compressor, 3 in the predictor
        assert_eq!(model.dense_layers().len(), 11);
        assert_eq!(model.predictor().dim_in(), 64);
        Ok(())
    }
}
