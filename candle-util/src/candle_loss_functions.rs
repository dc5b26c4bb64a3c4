use candle_core::{Result, Tensor};

/// Mean squared error between predictions and targets (scalar)
///
/// * `yhat_n1` - prediction
/// * `y_n1` - observed target
///
pub fn mse_loss(yhat_n1: &Tensor, y_n1: &Tensor) -> Result<Tensor> {
    candle_nn::loss::mse(yhat_n1, y_n1)
}

/// Sum of squared errors, used to accumulate a dataset-level MSE
/// over minibatches of different sizes
pub fn sse(yhat_n1: &Tensor, y_n1: &Tensor) -> Result<Tensor> {
    yhat_n1.sub(y_n1)?.sqr()?.sum_all()
}

/// Sum of absolute errors
pub fn sae(yhat_n1: &Tensor, y_n1: &Tensor) -> Result<Tensor> {
    yhat_n1.sub(y_n1)?.abs()?.sum_all()
}
