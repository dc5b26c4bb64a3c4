use crate::candle_model_traits::SetPoolT;
use crate::candle_scatter::GraphMembership;

use candle_core::{Result, Tensor};
use candle_nn::rnn::{LSTMConfig, LSTM, RNN};
use candle_nn::VarBuilder;

/// Set2Set pooling (Vinyals et al. 2016)
///
/// ```text
/// q(t)    = LSTM(q*(t-1))
/// e[i]    = < x[i], q(t)[g(i)] >
/// a[i]    = softmax_{i in g} e[i]
/// r(t)[g] = sum_{i in g} a[i] x[i]
/// q*(t)   = [q(t), r(t)]
/// ```
///
/// Each graph of `d`-dimensional atoms is summarized into a `2d`
/// vector after `num_steps` attention rounds.
pub struct Set2Set {
    lstm: LSTM,
    dim_in: usize,
    num_steps: usize,
}

impl Set2Set {
    /// * `dim_in` - atom feature dimension `d`
    /// * `num_steps` - number of attention rounds
    /// * `vb` - the LSTM cell lives under `vb.pp("lstm")`
    pub fn new(dim_in: usize, num_steps: usize, vb: VarBuilder) -> Result<Self> {
        let lstm = candle_nn::lstm(2 * dim_in, dim_in, LSTMConfig::default(), vb.pp("lstm"))?;
        Ok(Self {
            lstm,
            dim_in,
            num_steps,
        })
    }

    pub fn num_steps(&self) -> usize {
        self.num_steps
    }
}

impl SetPoolT for Set2Set {
    fn pool(&self, x_nd: &Tensor, membership: &GraphMembership) -> Result<Tensor> {
        let ngraphs = membership.num_graphs();
        let mut state = self.lstm.zero_state(ngraphs)?;
        let mut q_star = Tensor::zeros((ngraphs, 2 * self.dim_in), x_nd.dtype(), x_nd.device())?;

        for _ in 0..self.num_steps {
            state = self.lstm.step(&q_star, &state)?;
            let q_gd = state.h().clone();
            let e_n1 = x_nd.mul(&membership.gather(&q_gd)?)?.sum_keepdim(1)?;
            let a_n1 = membership.softmax(&e_n1)?;
            let r_gd = membership.scatter_add(&x_nd.broadcast_mul(&a_n1)?)?;
            q_star = Tensor::cat(&[&q_gd, &r_gd], 1)?;
        }
        Ok(q_star)
    }

    fn dim_in(&self) -> usize {
        self.dim_in
    }

    fn dim_out(&self) -> usize {
        2 * self.dim_in
    }
}
