use crate::candle_aux_linear::xavier_linear;
use crate::candle_graph_data::GraphBatch;
use crate::candle_model_traits::GraphEncoderT;

use candle_core::{Result, Tensor};
use candle_nn::rnn::{GRUConfig, GRUState, GRU, RNN};
use candle_nn::{Linear, Module, VarBuilder};

/// Edge-aware message passing encoder with GRU updates
///
/// ```text
/// h(0)   = relu(W0 x)
/// m[i]   = sum_{j -> i} relu(Wm [h(t)[j], e(j,i)])
/// h(t+1) = GRU(m, h(t))
/// out    = h(T) + h(0)
/// ```
pub struct MessagePassingEncoder {
    n_node_features: usize,
    n_hidden: usize,
    num_steps: usize,
    input_layer: Linear,
    message_layer: Linear,
    update: GRU,
}

pub struct MessagePassingEncoderArgs {
    pub n_node_features: usize,
    pub n_edge_features: usize,
    pub n_hidden: usize,
    pub num_steps: usize,
}

impl MessagePassingEncoder {
    /// Will create a new message passing encoder
    /// with these variables:
    ///
    /// * `nn.enc.input.{weight,bias}`
    /// * `nn.enc.message.{weight,bias}`
    /// * `nn.enc.gru.*`
    pub fn new(args: MessagePassingEncoderArgs, vs: VarBuilder) -> Result<Self> {
        let input_layer = xavier_linear(args.n_node_features, args.n_hidden, vs.pp("nn.enc.input"))?;
        let message_layer = xavier_linear(
            args.n_hidden + args.n_edge_features,
            args.n_hidden,
            vs.pp("nn.enc.message"),
        )?;
        let update = candle_nn::gru(
            args.n_hidden,
            args.n_hidden,
            GRUConfig::default(),
            vs.pp("nn.enc.gru"),
        )?;

        Ok(Self {
            n_node_features: args.n_node_features,
            n_hidden: args.n_hidden,
            num_steps: args.num_steps,
            input_layer,
            message_layer,
            update,
        })
    }

    pub fn num_steps(&self) -> usize {
        self.num_steps
    }

    fn aggregate_messages(&self, h_nd: &Tensor, graphs: &GraphBatch) -> Result<Tensor> {
        if graphs.num_edges() == 0 {
            return h_nd.zeros_like();
        }
        let h_src = h_nd.index_select(&graphs.edge_src, 0)?;
        let msg_ed = self
            .message_layer
            .forward(&Tensor::cat(&[&h_src, &graphs.edge_features], 1)?)?
            .relu()?;
        graphs.incidence_dst.matmul(&msg_ed)
    }
}

impl GraphEncoderT for MessagePassingEncoder {
    fn encode(&self, graphs: &GraphBatch, _train: bool) -> Result<Tensor> {
        let (_, d) = graphs.node_features.dims2()?;
        if d != self.n_node_features {
            candle_core::bail!(
                "atom feature width {} vs. encoder input {}",
                d,
                self.n_node_features
            );
        }

        let h0_nd = self.input_layer.forward(&graphs.node_features)?.relu()?;
        let mut state = GRUState { h: h0_nd.clone() };

        for _ in 0..self.num_steps {
            let m_nd = self.aggregate_messages(state.h(), graphs)?;
            state = self.update.step(&m_nd, &state)?;
        }

        state.h().add(&h0_nd)
    }

    fn dim_node(&self) -> usize {
        self.n_node_features
    }

    fn dim_hidden(&self) -> usize {
        self.n_hidden
    }

    fn dense_layers(&self) -> Vec<&Linear> {
        vec![&self.input_layer, &self.message_layer]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candle_graph_data::{GraphDims, MolGraph};
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn encodes_every_atom() -> anyhow::Result<()> {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let enc = MessagePassingEncoder::new(
            MessagePassingEncoderArgs {
                n_node_features: 5,
                n_edge_features: 3,
                n_hidden: 8,
                num_steps: 2,
            },
            vb,
        )?;

        let dims = GraphDims { node: 5, edge: 3 };
        let water = MolGraph {
            nodes: vec![vec![0.5; 5]; 3],
            edges: vec![[0, 1], [0, 2]],
            edge_features: vec![vec![1., 0., 0.]; 2],
        };
        let ion = MolGraph {
            nodes: vec![vec![-0.5; 5]],
            edges: vec![],
            edge_features: vec![],
        };

        let batch = GraphBatch::collate(&[&water, &ion], dims, &dev)?;
        let h = enc.encode(&batch, true)?;
        assert_eq!(h.dims(), &[4, 8]);

        // bond-free batches still encode
        let lone = GraphBatch::collate(&[&ion], dims, &dev)?;
        assert_eq!(enc.encode(&lone, false)?.dims(), &[1, 8]);
        Ok(())
    }
}
