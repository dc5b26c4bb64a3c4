use candle_core::{Result, Tensor};
use candle_util::candle_aux_linear::l2_normalize_rows;

/// Output of the solute-solvent interaction phase
pub struct InteractionOutput {
    /// `[S, S']` (m x 2k)
    pub solute_features: Tensor,
    /// `[V, V']` (n x 2k)
    pub solvent_features: Tensor,
    /// masked affinity `A` (m x n), detached from the graph
    pub interaction_map: Tensor,
}

/// Masked affinity `A = (S V^T) ⊙ M`
///
/// * `solute_mk` - solute atom features (m x k)
/// * `solvent_nk` - solvent atom features (n x k)
/// * `mask_mn` - pairing mask expanded to atoms (m x n)
pub fn masked_affinity(solute_mk: &Tensor, solvent_nk: &Tensor, mask_mn: &Tensor) -> Result<Tensor> {
    solute_mk.matmul(&solvent_nk.t()?)?.mul(mask_mn)
}

/// Cross-molecule interaction of atom features.
///
/// Rows are L2-normalized before taking dot products, hence every
/// entry of the affinity lies in [-1, 1]. Solute atoms attend over
/// the solvent atoms of their paired graph, `S' = A V`, and vice versa,
/// `V' = A^T S`. Graph pairs without atoms give a zero map.
///
/// * `solute_mk` - encoded solute atoms (m x k)
/// * `solvent_nk` - encoded solvent atoms (n x k)
/// * `mask_mn` - pairing mask expanded to atoms (m x n)
pub fn interact(solute_mk: &Tensor, solvent_nk: &Tensor, mask_mn: &Tensor) -> Result<InteractionOutput> {
    let solute_mk = l2_normalize_rows(solute_mk)?;
    let solvent_nk = l2_normalize_rows(solvent_nk)?;

    let affinity_mn = masked_affinity(&solute_mk, &solvent_nk, mask_mn)?;

    let solute_prime_mk = affinity_mn.matmul(&solvent_nk)?;
    let solvent_prime_nk = affinity_mn.t()?.matmul(&solute_mk)?;

    Ok(InteractionOutput {
        solute_features: Tensor::cat(&[&solute_mk, &solute_prime_mk], 1)?,
        solvent_features: Tensor::cat(&[&solvent_nk, &solvent_prime_nk], 1)?,
        interaction_map: affinity_mn.detach(),
    })
}
