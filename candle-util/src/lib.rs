pub mod candle_data_loader;
pub mod candle_data_loader_util;
pub mod candle_inference;
pub mod candle_loss_functions;
pub mod candle_model_traits;

pub use candle_core;
pub use candle_nn;
