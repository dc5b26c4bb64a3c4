use candle_core::{DType, Result, Tensor};
use candle_nn::{ops, BatchNorm, Linear, Module, ModuleT, VarBuilder};
use candle_util::candle_aux_linear::xavier_linear;
use candle_util::candle_scatter::GraphMembership;

/// keeps the logistic noise away from `log(0)`
pub const GATE_NOISE_BIAS: f64 = 1e-4;
pub const GATE_TEMPERATURE: f64 = 1.0;
/// added to the per-graph standard deviation in the KL term
pub const KL_EPSILON: f64 = 1e-7;

/// Learns which atoms to keep.
///
/// Each atom feature `x[i,]` is scored by a small network,
/// `p[i] = W2 relu(BN(W1 x[i,]))`, and the hard keep/drop decision is
/// relaxed into a retention gate in (0, 1) by logistic noise. Dropped
/// atoms are replaced by noise drawn from their graph's statistics.
pub struct BottleneckCompressor {
    dim_in: usize,
    fc_in: Linear,
    bn: BatchNorm,
    fc_out: Linear,
}

/// Everything a compression pass produces for one molecule side
pub struct Compression {
    /// retention probability per atom (N x 1)
    pub gate: Tensor,
    /// raw compressor logits `p` (N x 1)
    pub logits: Tensor,
    /// noisy atom features fed to the set aggregator (N x d)
    pub noisy_features: Tensor,
    /// KL cost averaged over graphs (scalar)
    pub kl: Tensor,
    /// fraction of atoms with `sigmoid(p) > 0.5` (scalar, detached)
    pub preserve_rate: Tensor,
}

impl BottleneckCompressor {
    /// Will create `fc.in`, `bn`, `fc.out` under `vb`
    ///
    /// * `dim_in` - atom feature dimension
    /// * `dim_hidden` - width of the scoring network
    pub fn new(dim_in: usize, dim_hidden: usize, vb: VarBuilder) -> Result<Self> {
        let bn_config = candle_nn::BatchNormConfig {
            eps: 1e-5,
            remove_mean: true,
            affine: true,
            momentum: 0.1,
        };

        Ok(Self {
            dim_in,
            fc_in: xavier_linear(dim_in, dim_hidden, vb.pp("fc.in"))?,
            bn: candle_nn::batch_norm(dim_hidden, bn_config, vb.pp("bn"))?,
            fc_out: xavier_linear(dim_hidden, 1, vb.pp("fc.out"))?,
        })
    }

    pub fn dim_in(&self) -> usize {
        self.dim_in
    }

    pub fn dense_layers(&self) -> Vec<&Linear> {
        vec![&self.fc_in, &self.fc_out]
    }

    /// compressor logits `p` (N x 1)
    pub fn logits(&self, x_nd: &Tensor, train: bool) -> Result<Tensor> {
        let h_nh = self.fc_in.forward(x_nd)?;
        let h_nh = self.bn.forward_t(&h_nh, train)?.relu()?;
        self.fc_out.forward(&h_nh)
    }

    /// Run the whole bottleneck on atom features `x_nd`
    ///
    /// * `x_nd` - interacted atom features (N x d)
    /// * `membership` - graph membership of the atoms
    /// * `train` - batch statistics vs. running statistics
    pub fn compress(
        &self,
        x_nd: &Tensor,
        membership: &GraphMembership,
        train: bool,
    ) -> Result<Compression> {
        let logits = self.logits(x_nd, train)?;
        let gate = relaxed_bernoulli_gate(&logits, GATE_TEMPERATURE, GATE_NOISE_BIAS)?;
        let (noisy_features, kl) = inject_noise(x_nd, &gate, membership)?;
        let preserve_rate = preservation_rate(&logits)?;

        Ok(Compression {
            gate,
            logits,
            noisy_features,
            kl,
            preserve_rate,
        })
    }
}

/// Continuous relaxation of a Bernoulli keep/drop decision
///
/// ```text
/// eps  ~ U(bias, 1 - bias)
/// gate = sigmoid((log(eps) - log(1 - eps) + p) / temperature)
/// ```
pub fn relaxed_bernoulli_gate(p_n1: &Tensor, temperature: f64, bias: f64) -> Result<Tensor> {
    let eps = p_n1.rand_like(bias, 1. - bias)?;
    let logit_noise = eps.log()?.sub(&eps.affine(-1., 1.)?.log()?)?;
    ops::sigmoid(&((logit_noise + p_n1)? / temperature)?)
}

/// Replace each atom by a gate-weighted mix of itself and its graph's
/// statistics, and measure how far that moves from the statistics.
///
/// ```text
/// mean' = g x + (1 - g) mu[b]
/// std'  = (1 - g) sd[b]
/// x~    = mean' + std' * N(0, 1)
/// KL[b] = 0.5 sum_{i in b} mean_d (std' / (sd + eps))^2
///             + sum_{i in b} sum_d ((mean' - mu) / (sd + eps))^2
/// ```
///
/// `mu` and `sd` are computed on detached features.
///
/// # Returns `(x~, mean_b KL[b])`
pub fn inject_noise(
    x_nd: &Tensor,
    gate_n1: &Tensor,
    membership: &GraphMembership,
) -> Result<(Tensor, Tensor)> {
    let x_static = x_nd.detach();
    let mu_nd = membership.gather(&membership.scatter_mean(&x_static)?)?;
    let sd_nd = membership.gather(&membership.scatter_std(&x_static)?)?;

    let lambda_pos = gate_n1;
    let lambda_neg = gate_n1.affine(-1., 1.)?;

    let noisy_mean_nd = x_nd
        .broadcast_mul(lambda_pos)?
        .add(&mu_nd.broadcast_mul(&lambda_neg)?)?;
    let noisy_std_nd = sd_nd.broadcast_mul(&lambda_neg)?;

    let noise_nd = noisy_mean_nd.randn_like(0., 1.)?;
    let noisy_nd = noisy_mean_nd.add(&noisy_std_nd.mul(&noise_nd)?)?;

    let denom_nd = (&sd_nd + KL_EPSILON)?;
    let spread_n1 = noisy_std_nd.div(&denom_nd)?.sqr()?.mean_keepdim(1)?;
    let shift_n1 = noisy_mean_nd.sub(&mu_nd)?.div(&denom_nd)?.sqr()?.sum_keepdim(1)?;

    let kl_g1 = (membership.scatter_add(&spread_n1)? * 0.5)?.add(&membership.scatter_add(&shift_n1)?)?;

    Ok((noisy_nd, kl_g1.mean_all()?))
}

/// fraction of atoms with `sigmoid(p) > 0.5`, detached
pub fn preservation_rate(p_n1: &Tensor) -> Result<Tensor> {
    ops::sigmoid(&p_n1.detach())?
        .gt(0.5)?
        .to_dtype(DType::F32)?
        .mean_all()
}
