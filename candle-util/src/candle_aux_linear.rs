use candle_core::{Result, Tensor};
use candle_nn::Linear;

////////////////////////////////////////
// Dense layer with Xavier-uniform init //
////////////////////////////////////////

/// Xavier/Glorot uniform bound `sqrt(6 / (fan_in + fan_out))`
pub fn xavier_uniform_bound(fan_in: usize, fan_out: usize) -> f64 {
    (6.0 / (fan_in + fan_out) as f64).sqrt()
}

/// Dense layer `y = x W^T + b` where `W ~ U(-a, a)`,
/// `a = sqrt(6 / (in_dim + out_dim))`, and `b = 0`.
///
/// Creates `weight` (out x in) and `bias` (out) under `vb`.
pub fn xavier_linear(in_dim: usize, out_dim: usize, vb: candle_nn::VarBuilder) -> Result<Linear> {
    let bound = xavier_uniform_bound(in_dim, out_dim);
    let init_ws = candle_nn::Init::Uniform {
        lo: -bound,
        up: bound,
    };
    let ws = vb.get_with_hints((out_dim, in_dim), "weight", init_ws)?;
    let bs = vb.get_with_hints(out_dim, "bias", candle_nn::init::ZERO)?;
    Ok(Linear::new(ws, Some(bs)))
}

/// Row-wise L2 normalization, `x[i,] / max(|x[i,]|, 1e-12)`
///
/// The squared norm is clamped before the root, which keeps the
/// gradient of an all-zero row finite.
pub fn l2_normalize_rows(x_nd: &Tensor) -> Result<Tensor> {
    let norm_n1 = x_nd
        .sqr()?
        .sum_keepdim(x_nd.rank() - 1)?
        .maximum(1e-24)?
        .sqrt()?;
    x_nd.broadcast_div(&norm_n1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::{Module, VarBuilder, VarMap};

    #[test]
    fn xavier_weights_within_bound_and_zero_bias() -> Result<()> {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let layer = xavier_linear(20, 10, vb.pp("dense"))?;

        let bound = xavier_uniform_bound(20, 10) as f32;
        let max_abs = layer.weight().abs()?.max_all()?.to_scalar::<f32>()?;
        assert!(max_abs <= bound);

        let bias = layer.bias().expect("bias");
        assert_eq!(bias.abs()?.sum_all()?.to_scalar::<f32>()?, 0.0);

        let y = layer.forward(&Tensor::ones((3, 20), DType::F32, &dev)?)?;
        assert_eq!(y.dims(), &[3, 10]);
        Ok(())
    }

    #[test]
    fn normalized_rows_have_unit_length() -> Result<()> {
        let dev = Device::Cpu;
        let x = Tensor::new(&[[3f32, 4.], [0., 0.], [-1., 0.]], &dev)?;
        let norms: Vec<f32> = l2_normalize_rows(&x)?.sqr()?.sum(1)?.sqrt()?.to_vec1()?;
        approx::assert_abs_diff_eq!(norms[0], 1.0, epsilon = 1e-6);
        approx::assert_abs_diff_eq!(norms[1], 0.0, epsilon = 1e-6);
        approx::assert_abs_diff_eq!(norms[2], 1.0, epsilon = 1e-6);
        Ok(())
    }

    #[test]
    fn zero_rows_have_finite_gradient() -> Result<()> {
        let dev = Device::Cpu;
        let x = candle_core::Var::new(&[[0f32, 0.], [3., 4.]], &dev)?;
        let grads = l2_normalize_rows(x.as_tensor())?.sum_all()?.backward()?;
        let dx: Vec<Vec<f32>> = grads.get(&x).expect("gradient of x").to_vec2()?;

        assert!(dx.iter().flatten().all(|g| g.is_finite()));
        // d/dx sum(x / |x|) at (3, 4)
        approx::assert_abs_diff_eq!(dx[1][0], 4. / 125., epsilon = 1e-6);
        approx::assert_abs_diff_eq!(dx[1][1], -3. / 125., epsilon = 1e-6);
        Ok(())
    }
}
