use candle_core::{Result, Tensor};
use candle_nn::{Activation, Linear, Module, VarBuilder};
use candle_util::candle_aux_layers::{xavier_stack, StackLayers};

pub const PREDICTOR_LAYERS: [usize; 3] = [256, 128, 1];

/// Feed-forward head on concatenated solute and solvent embeddings:
/// `8h -> 256 -> relu -> 128 -> relu -> 1`
pub struct Predictor {
    dim_in: usize,
    fc: StackLayers<Linear>,
}

impl Predictor {
    /// * `dim_in` - width of `[solute, solvent]` graph embeddings
    pub fn new(dim_in: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            dim_in,
            fc: xavier_stack(dim_in, &PREDICTOR_LAYERS, Activation::Relu, vb)?,
        })
    }

    pub fn dim_in(&self) -> usize {
        self.dim_in
    }

    /// `[solute_bk, solvent_bk] -> y_b1`
    pub fn predict(&self, solute_bk: &Tensor, solvent_bk: &Tensor) -> Result<Tensor> {
        self.fc.forward(&Tensor::cat(&[solute_bk, solvent_bk], 1)?)
    }

    pub fn dense_layers(&self) -> Vec<&Linear> {
        self.fc.layers().collect()
    }

    /// weight of the output layer
    pub fn output_weight(&self) -> Option<&Tensor> {
        self.fc.layers().next_back().map(|l| l.weight())
    }
}
