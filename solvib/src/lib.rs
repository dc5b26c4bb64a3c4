pub mod bottleneck;
pub mod common_io;
pub mod evaluator;
pub mod fit_interaction;
pub mod importance;
pub mod interaction;
pub mod model;
pub mod pair_data;
pub mod predictor;
pub mod stats_writer;
pub mod trainer;

pub use candle_util::{candle_core, candle_nn};
