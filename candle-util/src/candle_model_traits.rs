use crate::candle_graph_data::GraphBatch;
use crate::candle_scatter::GraphMembership;

use candle_core::{Result, Tensor};
use candle_nn::Linear;

pub trait GraphEncoderT {
    /// An encoder that maps a batch of graphs to atom-level features
    ///
    /// # Arguments
    /// * `graphs` - collated molecular graphs (N atoms)
    /// * `train` - whether to use dropout/batchnorm or not
    ///
    /// # Returns `h_nd`
    /// * `h_nd` - atom features (N x dim_hidden)
    fn encode(&self, graphs: &GraphBatch, train: bool) -> Result<Tensor>;

    fn dim_node(&self) -> usize;

    fn dim_hidden(&self) -> usize;

    /// dense layers owned by this encoder
    fn dense_layers(&self) -> Vec<&Linear>;
}

pub trait SetPoolT {
    /// Reduce a variable-size set of atom features to one vector per graph
    ///
    /// # Arguments
    /// * `x_nd` - atom features (N x dim_in)
    /// * `membership` - graph membership of the N atoms
    ///
    /// # Returns `y_gk` (G x dim_out)
    fn pool(&self, x_nd: &Tensor, membership: &GraphMembership) -> Result<Tensor>;

    fn dim_in(&self) -> usize;

    fn dim_out(&self) -> usize;
}
