use candle_core::{DType, Device, Result, Tensor};

/// Graph membership of atoms (rows) in a batch of graphs.
///
/// Scatter/gather operations are carried out by a dense one-hot
/// `G x N` matrix so that gradients flow through `matmul`.
#[derive(Clone, Debug)]
pub struct GraphMembership {
    index_n: Tensor,
    onehot_gn: Tensor,
    count_g1: Tensor,
    unbiased_denom_g1: Tensor,
    num_graphs: usize,
    num_atoms: usize,
}

impl GraphMembership {
    /// * `graph_of_atom` - graph id of each atom, `0 .. num_graphs`
    /// * `num_graphs` - number of graphs in the batch
    /// * `device` - target device
    pub fn new(graph_of_atom: &[u32], num_graphs: usize, device: &Device) -> Result<Self> {
        let num_atoms = graph_of_atom.len();

        let mut onehot = vec![0f32; num_graphs * num_atoms];
        let mut counts = vec![0f32; num_graphs];
        for (i, &g) in graph_of_atom.iter().enumerate() {
            let g = g as usize;
            if g >= num_graphs {
                candle_core::bail!("graph id {} out of range (# graphs = {})", g, num_graphs);
            }
            onehot[g * num_atoms + i] = 1.;
            counts[g] += 1.;
        }

        let unbiased: Vec<f32> = counts.iter().map(|&c| (c - 1.).max(1.) + 1e-6).collect();

        Ok(Self {
            index_n: Tensor::from_slice(graph_of_atom, num_atoms, device)?,
            onehot_gn: Tensor::from_vec(onehot, (num_graphs, num_atoms), device)?,
            count_g1: Tensor::from_vec(counts, (num_graphs, 1), device)?,
            unbiased_denom_g1: Tensor::from_vec(unbiased, (num_graphs, 1), device)?,
            num_graphs,
            num_atoms,
        })
    }

    pub fn num_graphs(&self) -> usize {
        self.num_graphs
    }

    pub fn num_atoms(&self) -> usize {
        self.num_atoms
    }

    /// graph id of each atom (U32, N)
    pub fn index(&self) -> &Tensor {
        &self.index_n
    }

    /// one-hot membership indicator (G x N)
    pub fn onehot(&self) -> &Tensor {
        &self.onehot_gn
    }

    /// number of atoms per graph (G x 1)
    pub fn counts(&self) -> &Tensor {
        &self.count_g1
    }

    /// `y[g,] = sum_{i in g} x[i,]`
    pub fn scatter_add(&self, x_nd: &Tensor) -> Result<Tensor> {
        self.onehot_gn.to_dtype(x_nd.dtype())?.matmul(x_nd)
    }

    /// `y[g,] = mean_{i in g} x[i,]`; empty graphs give zero
    pub fn scatter_mean(&self, x_nd: &Tensor) -> Result<Tensor> {
        let denom_g1 = self.count_g1.maximum(1.)?.to_dtype(x_nd.dtype())?;
        self.scatter_add(x_nd)?.broadcast_div(&denom_g1)
    }

    /// Unbiased per-graph standard deviation of each column,
    /// `sqrt( sum_{i in g} (x[i,] - mean[g,])^2 / (max(n_g - 1, 1) + 1e-6) )`.
    pub fn scatter_std(&self, x_nd: &Tensor) -> Result<Tensor> {
        let mean_nd = self.gather(&self.scatter_mean(x_nd)?)?;
        let ss_gd = self.scatter_add(&x_nd.sub(&mean_nd)?.sqr()?)?;
        let denom_g1 = self.unbiased_denom_g1.to_dtype(x_nd.dtype())?;
        ss_gd.broadcast_div(&denom_g1)?.sqrt()
    }

    /// broadcast graph-level rows back to atoms: `y[i,] = x[g(i),]`
    pub fn gather(&self, x_gd: &Tensor) -> Result<Tensor> {
        x_gd.index_select(&self.index_n, 0)
    }

    /// Softmax of atom scores `e_n1` (N x 1) within each graph
    pub fn softmax(&self, e_n1: &Tensor) -> Result<Tensor> {
        let (g, n) = (self.num_graphs, self.num_atoms);
        let neg_inf = Tensor::full(f32::NEG_INFINITY, (g, n), e_n1.device())?.to_dtype(e_n1.dtype())?;
        let e_gn = e_n1.t()?.broadcast_as((g, n))?.contiguous()?;
        let max_g1 = self
            .onehot_gn
            .gt(0.)?
            .where_cond(&e_gn, &neg_inf)?
            .max_keepdim(1)?
            .detach();
        let exp_n1 = e_n1.sub(&self.gather(&max_g1)?)?.exp()?;
        let denom_n1 = self.gather(&self.scatter_add(&exp_n1)?)?;
        exp_n1.div(&denom_n1)
    }
}

/// Graph membership from the number of atoms in each graph
pub fn membership_from_sizes(sizes: &[usize], device: &Device) -> Result<GraphMembership> {
    let index: Vec<u32> = sizes
        .iter()
        .enumerate()
        .flat_map(|(g, &n)| std::iter::repeat_n(g as u32, n))
        .collect();
    GraphMembership::new(&index, sizes.len(), device)
}

/// Outer product of two membership indicators through a graph-level
/// pairing matrix: `(N_left x N_right) = L^T * P * R`
///
/// * `left` - membership of the left atoms (G_left x N_left)
/// * `pair_lr` - graph pairing indicator (G_left x G_right)
/// * `right` - membership of the right atoms (G_right x N_right)
pub fn expand_pairing(
    left: &GraphMembership,
    pair_lr: &Tensor,
    right: &GraphMembership,
) -> Result<Tensor> {
    let dtype = pair_lr.dtype();
    left.onehot()
        .to_dtype(dtype)?
        .t()?
        .matmul(pair_lr)?
        .matmul(&right.onehot().to_dtype(dtype)?)
}

/// `k x k` identity pairing
pub fn identity_pairing(k: usize, device: &Device) -> Result<Tensor> {
    Tensor::eye(k, DType::F32, device)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scatter_mean_and_std_per_graph() -> Result<()> {
        let dev = Device::Cpu;
        let memb = membership_from_sizes(&[3, 1], &dev)?;
        let x = Tensor::new(&[[1f32, 2.], [2., 2.], [3., 2.], [5., 7.]], &dev)?;

        let mean: Vec<Vec<f32>> = memb.scatter_mean(&x)?.to_vec2()?;
        approx::assert_abs_diff_eq!(mean[0][0], 2.0, epsilon = 1e-6);
        approx::assert_abs_diff_eq!(mean[0][1], 2.0, epsilon = 1e-6);
        approx::assert_abs_diff_eq!(mean[1][0], 5.0, epsilon = 1e-6);

        let std: Vec<Vec<f32>> = memb.scatter_std(&x)?.to_vec2()?;
        approx::assert_abs_diff_eq!(std[0][0], 1.0, epsilon = 1e-4);
        approx::assert_abs_diff_eq!(std[0][1], 0.0, epsilon = 1e-6);
        // a single-atom graph has zero spread
        approx::assert_abs_diff_eq!(std[1][0], 0.0, epsilon = 1e-6);
        approx::assert_abs_diff_eq!(std[1][1], 0.0, epsilon = 1e-6);
        Ok(())
    }

    #[test]
    fn softmax_sums_to_one_within_graph() -> Result<()> {
        let dev = Device::Cpu;
        let memb = membership_from_sizes(&[2, 3], &dev)?;
        let e = Tensor::new(&[[100f32], [101.], [-3.], [0.], [2.]], &dev)?;
        let a = memb.softmax(&e)?;
        let sums: Vec<f32> = memb.scatter_add(&a)?.flatten_all()?.to_vec1()?;
        for s in sums {
            approx::assert_abs_diff_eq!(s, 1.0, epsilon = 1e-5);
        }
        Ok(())
    }

    #[test]
    fn expanded_pairing_blocks() -> Result<()> {
        let dev = Device::Cpu;
        let left = membership_from_sizes(&[2, 1], &dev)?;
        let right = membership_from_sizes(&[1, 2], &dev)?;
        let mask: Vec<Vec<f32>> =
            expand_pairing(&left, &identity_pairing(2, &dev)?, &right)?.to_vec2()?;
        assert_eq!(
            mask,
            vec![vec![1., 0., 0.], vec![1., 0., 0.], vec![0., 1., 1.]]
        );
        Ok(())
    }

    #[test]
    fn rejects_out_of_range_graph_id() {
        let dev = Device::Cpu;
        assert!(GraphMembership::new(&[0, 2], 2, &dev).is_err());
    }
}
