use candle_core::{Result, Tensor};
use candle_nn::{Activation, Module};

/// Dense layers applied in sequence, each optionally followed by an
/// activation
pub struct StackLayers<M>
where
    M: Module,
{
    stages: Vec<(M, Option<Activation>)>,
}

impl<M> Module for StackLayers<M>
where
    M: Module,
{
    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        self.stages.iter().try_fold(input.clone(), |x, (layer, act)| {
            let y = layer.forward(&x)?;
            match act {
                Some(act) => act.forward(&y),
                None => Ok(y),
            }
        })
    }
}

impl<M> StackLayers<M>
where
    M: Module,
{
    pub fn new() -> Self {
        Self { stages: vec![] }
    }

    pub fn push_with_act(&mut self, layer: M, activation: Activation) {
        self.stages.push((layer, Some(activation)));
    }

    pub fn push(&mut self, layer: M) {
        self.stages.push((layer, None));
    }

    /// layers in the order they are applied
    pub fn layers(&self) -> impl DoubleEndedIterator<Item = &M> + '_ {
        self.stages.iter().map(|(layer, _)| layer)
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

impl<M> Default for StackLayers<M>
where
    M: Module,
{
    fn default() -> Self {
        Self::new()
    }
}

/// A fully-connected stack `d_in -> layers[0] -> ... -> layers[L-1]`
/// with Xavier-initialized weights; every hidden layer is followed by
/// `activation`, the last one is left linear.
///
/// * `d_in` - input dimension
/// * `layers` - output dimension of each dense layer
/// * `activation` - nonlinearity between layers
/// * `vb` - variables are named `fc.{j}.weight`, `fc.{j}.bias`
pub fn xavier_stack(
    d_in: usize,
    layers: &[usize],
    activation: Activation,
    vb: candle_nn::VarBuilder,
) -> Result<StackLayers<candle_nn::Linear>> {
    use crate::candle_aux_linear::xavier_linear;

    let mut fc = StackLayers::new();
    let mut prev_dim = d_in;
    for (j, &next_dim) in layers.iter().enumerate() {
        let layer = xavier_linear(prev_dim, next_dim, vb.pp(format!("fc.{}", j)))?;
        if j + 1 < layers.len() {
            fc.push_with_act(layer, activation);
        } else {
            fc.push(layer);
        }
        prev_dim = next_dim;
    }
    Ok(fc)
}
