pub mod candle_aux_layers;
pub mod candle_aux_linear;
pub mod candle_graph_data;
pub mod candle_graph_encoder;
pub mod candle_inference;
pub mod candle_loss_functions;
pub mod candle_lr_scheduler;
pub mod candle_model_traits;
pub mod candle_scatter;
pub mod candle_set2set;

pub use candle_core;
pub use candle_nn;
